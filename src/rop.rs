//! Catalogue building: binary loading and ROP gadget search.
//!
//! Loads ELF or raw x86_64 images with goblin, scans executable
//! sections backwards from every RET for short instruction sequences,
//! and classifies each one into a catalogue [`Gadget`]. Also provides
//! the on-demand opcode and `jmp reg` searches.

use std::collections::BTreeMap;
use std::path::Path;

use goblin::elf::program_header::{PF_X, PT_LOAD};
use goblin::elf::section_header::{SHF_EXECINSTR, SHT_NOBITS};
use iced_x86::{Code, Decoder, DecoderOptions, FlowControl, Formatter, Instruction, IntelFormatter, OpKind};

use crate::catalogue::{Binary, CodeLocation, CodeSearch, Section};
use crate::classify::classify_insns;
use crate::error::{Error, Result};
use crate::gadget::Gadget;
use crate::types::X64Reg;

/// Default maximum number of instructions per gadget, RET included.
pub const DEFAULT_DEPTH: usize = 6;

/// How far back from a RET the scanner looks, in bytes.
const MAX_BACKWARD_BYTES: usize = 20;

/// Load a binary from disk and catalogue its gadgets.
///
/// With `raw` set the file is treated as a flat x86_64 code image
/// loaded at offset 0.
pub fn load_binary(path: &Path, raw: bool, max_depth: usize) -> Result<Binary> {
    let data = std::fs::read(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut binary = if raw {
        load_raw(&name, &data)
    } else {
        load_elf(&name, &data)?
    };
    catalogue_gadgets(&mut binary, max_depth);
    Ok(binary)
}

/// Treat `data` as one executable section at relative address 0.
pub fn load_raw(name: &str, data: &[u8]) -> Binary {
    Binary::new(name, 0).with_section(Section {
        name: ".text".into(),
        offset: 0,
        data: data.to_vec(),
        executable: true,
    })
}

/// Parse an ELF64 x86_64 image into a binary with its executable
/// sections and `.data`. Gadgets are not searched yet.
pub fn load_elf(name: &str, data: &[u8]) -> Result<Binary> {
    let elf = goblin::elf::Elf::parse(data)
        .map_err(|e| Error::Binary(format!("parse ELF '{}': {}", name, e)))?;
    if !elf.is_64 || elf.header.e_machine != goblin::elf::header::EM_X86_64 {
        return Err(Error::Binary(format!("'{}' is not an x86_64 ELF", name)));
    }

    let image_base = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .map(|ph| ph.p_vaddr)
        .min()
        .unwrap_or(0);

    let mut binary = Binary::new(name, image_base);

    for sh in &elf.section_headers {
        let section_name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("");
        let executable = sh.sh_flags & u64::from(SHF_EXECINSTR) != 0;
        if !executable && section_name != ".data" {
            continue;
        }
        let bytes = if sh.sh_type == SHT_NOBITS {
            Vec::new()
        } else {
            file_slice(data, sh.sh_offset, sh.sh_size).unwrap_or_default()
        };
        binary.sections.push(Section {
            name: section_name.to_string(),
            offset: sh.sh_addr.saturating_sub(image_base),
            data: bytes,
            executable,
        });
    }

    // Stripped section headers: fall back to executable segments.
    if binary.executable_sections().next().is_none() {
        for ph in &elf.program_headers {
            if ph.p_type != PT_LOAD || ph.p_flags & PF_X == 0 {
                continue;
            }
            if let Some(bytes) = file_slice(data, ph.p_offset, ph.p_filesz) {
                binary.sections.push(Section {
                    name: "LOAD".into(),
                    offset: ph.p_vaddr.saturating_sub(image_base),
                    data: bytes,
                    executable: true,
                });
            }
        }
    }

    Ok(binary)
}

fn file_slice(data: &[u8], offset: u64, size: u64) -> Option<Vec<u8>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(size).ok()?)?;
    data.get(start..end).map(<[u8]>::to_vec)
}

/// Search every executable section of `binary` and store the
/// classified gadgets in address order.
pub fn catalogue_gadgets(binary: &mut Binary, max_depth: usize) {
    let max_depth = if max_depth == 0 { DEFAULT_DEPTH } else { max_depth };
    let mut found: BTreeMap<u64, Gadget> = BTreeMap::new();

    for section in binary.executable_sections() {
        for (i, &byte) in section.data.iter().enumerate() {
            if byte != 0xC3 {
                continue;
            }
            find_gadgets_ending_at(&binary.name, section, i + 1, max_depth, &mut found);
        }
    }

    binary.gadgets = found.into_values().collect();
}

/// Backward-scan from a RET to find every classifiable gadget ending there.
fn find_gadgets_ending_at(
    binary: &str,
    section: &Section,
    end_pos: usize,
    max_depth: usize,
    found: &mut BTreeMap<u64, Gadget>,
) {
    let max_back = MAX_BACKWARD_BYTES.min(end_pos);

    for back in 1..=max_back {
        let start = end_pos - back;
        let vaddr = section.offset + start as u64;
        let Some(insns) = decode_to_ret(&section.data[start..end_pos], vaddr, max_depth) else {
            continue;
        };
        let Some((effect, quality)) = classify_insns(&insns) else {
            continue;
        };
        found
            .entry(vaddr)
            .or_insert_with(|| Gadget::new(binary, &section.name, format_lines(&insns), effect, quality));
    }
}

/// Decode `bytes` as a straight-line sequence that ends exactly on a RET.
fn decode_to_ret(bytes: &[u8], vaddr: u64, max_depth: usize) -> Option<Vec<Instruction>> {
    let mut decoder = Decoder::with_ip(64, bytes, vaddr, DecoderOptions::NONE);
    let mut insns = Vec::new();
    let mut total_len = 0;

    while decoder.can_decode() {
        let insn = decoder.decode();
        if insn.is_invalid() {
            return None;
        }
        total_len += insn.len();
        insns.push(insn);

        match insn.flow_control() {
            FlowControl::Return => {
                return (total_len == bytes.len() && insns.len() <= max_depth).then_some(insns);
            }
            FlowControl::Next => {}
            _ if insn.code() == Code::Syscall => {}
            _ => return None,
        }
        if insns.len() >= max_depth {
            return None;
        }
    }
    None
}

fn intel_formatter() -> IntelFormatter {
    let mut formatter = IntelFormatter::new();
    formatter.options_mut().set_space_after_operand_separator(true);
    formatter
}

fn format_lines(insns: &[Instruction]) -> Vec<(u64, String)> {
    let mut formatter = intel_formatter();
    insns
        .iter()
        .map(|insn| {
            let mut text = String::new();
            formatter.format(insn, &mut text);
            (insn.ip(), text)
        })
        .collect()
}

/// Parse a hex opcode string such as `"0f05"` or `"ff e4"`.
pub fn parse_opcode(opcode: &str) -> Result<Vec<u8>> {
    let digits: String = opcode.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(Error::InvalidOption(format!("invalid opcode: '{}'", opcode)));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| Error::InvalidOption(format!("invalid opcode: '{}'", opcode)))
        })
        .collect()
}

/// Offsets within `data` where `needle` starts.
fn scan_bytes(data: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > data.len() {
        return Vec::new();
    }
    data.windows(needle.len())
        .enumerate()
        .filter(|(_, w)| *w == needle)
        .map(|(i, _)| i)
        .collect()
}

/// Disassemble the instructions covering `len` bytes at `pos`.
fn describe(section: &Section, pos: usize, len: usize) -> Option<String> {
    let end = (pos + len.max(15)).min(section.data.len());
    let vaddr = section.offset + pos as u64;
    let mut decoder = Decoder::with_ip(64, &section.data[pos..end], vaddr, DecoderOptions::NONE);
    let mut formatter = intel_formatter();
    let mut parts = Vec::new();
    let mut covered = 0;

    while covered < len && decoder.can_decode() {
        let insn = decoder.decode();
        if insn.is_invalid() {
            return None;
        }
        covered += insn.len();
        let mut text = String::new();
        formatter.format(&insn, &mut text);
        parts.push(text);
    }
    (covered == len).then(|| parts.join("; "))
}

/// `jmp reg` encoding: FF /4 with mod=11, REX.B for r8-r15.
fn jmp_reg_bytes(reg: X64Reg) -> Vec<u8> {
    let n = reg.number();
    let modrm = 0xE0 | (n & 7);
    if n >= 8 {
        vec![0x41, 0xFF, modrm]
    } else {
        vec![0xFF, modrm]
    }
}

impl CodeSearch for Binary {
    fn search_opcode(&self, opcode: &str) -> Result<Vec<CodeLocation>> {
        let needle = parse_opcode(opcode)?;
        let mut locations = Vec::new();
        for section in self.executable_sections() {
            for pos in scan_bytes(&section.data, &needle) {
                if let Some(text) = describe(section, pos, needle.len()) {
                    locations.push(CodeLocation {
                        binary: self.name.clone(),
                        section: section.name.clone(),
                        addr: section.offset + pos as u64,
                        text,
                    });
                }
            }
        }
        Ok(locations)
    }

    fn search_jmp_reg(&self, reg: X64Reg) -> Vec<CodeLocation> {
        let needle = jmp_reg_bytes(reg);
        let mut locations = Vec::new();
        for section in self.executable_sections() {
            for pos in scan_bytes(&section.data, &needle) {
                let vaddr = section.offset + pos as u64;
                let mut decoder =
                    Decoder::with_ip(64, &section.data[pos..pos + needle.len()], vaddr, DecoderOptions::NONE);
                let insn = decoder.decode();
                let is_jmp = insn.flow_control() == FlowControl::IndirectBranch
                    && insn.op0_kind() == OpKind::Register
                    && X64Reg::from_iced(insn.op0_register()) == Some(reg);
                if !is_jmp {
                    continue;
                }
                let mut text = String::new();
                intel_formatter().format(&insn, &mut text);
                locations.push(CodeLocation {
                    binary: self.name.clone(),
                    section: section.name.clone(),
                    addr: vaddr,
                    text,
                });
            }
        }
        locations
    }
}
