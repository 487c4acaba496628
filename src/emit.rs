//! Chain emission.
//!
//! A finished chain renders as a standalone python3 script that packs
//! every word and writes the result to stdout, or directly as the raw
//! payload bytes using the recorded image bases.

use std::fmt::Write as _;

use crate::catalogue::Catalogue;
use crate::error::{Error, Result};
use crate::fragment::{ChainLine, Fragment, UsedBinaries, PADDING};
use crate::types::to_hex;

/// Load address recorded for one used (binary, section) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBase {
    pub binary: String,
    pub section: String,
    pub base: u64,
}

#[derive(Debug, Clone)]
pub struct Chain {
    /// Indexed by rebase index.
    pub bases: Vec<ImageBase>,
    pub body: Fragment,
    /// Bytes appended after the chain, e.g. shellcode reached by `jmp rsp`.
    pub shellcode: Option<Vec<u8>>,
    /// False when the solver could only fill some registers or a step
    /// was left as a placeholder.
    pub complete: bool,
}

impl Chain {
    /// Pair `body` with the image bases of every used binary.
    pub fn assemble(catalogue: &Catalogue, used: &UsedBinaries, body: Fragment) -> Result<Chain> {
        let bases = used
            .entries()
            .iter()
            .map(|(binary, section)| {
                let base = catalogue
                    .image_base(binary)
                    .ok_or_else(|| Error::Binary(format!("{binary} is not in the catalogue")))?;
                Ok(ImageBase {
                    binary: binary.clone(),
                    section: section.clone(),
                    base,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let complete = !body
            .lines()
            .iter()
            .any(|line| matches!(line, ChainLine::Placeholder(_)));
        Ok(Chain {
            bases,
            body,
            shellcode: None,
            complete,
        })
    }

    pub fn with_shellcode(mut self, shellcode: Vec<u8>) -> Self {
        self.shellcode = Some(shellcode);
        self
    }

    pub fn lines(&self) -> &[ChainLine] {
        self.body.lines()
    }

    /// Number of lines that are manual steps for the operator.
    pub fn placeholders(&self) -> usize {
        self.lines()
            .iter()
            .filter(|line| matches!(line, ChainLine::Placeholder(_)))
            .count()
    }

    fn base(&self, rebase: usize) -> Result<u64> {
        self.bases
            .get(rebase)
            .map(|b| b.base)
            .ok_or_else(|| Error::Other(format!("no image base for rebase index {rebase}")))
    }

    /// Render the chain as a python3 script.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("#!/usr/bin/env python3\n");
        out.push_str("import sys\n");
        out.push_str("from struct import pack\n\n");
        out.push_str("p = lambda x : pack('<Q', x)\n\n");

        for (i, base) in self.bases.iter().enumerate() {
            let _ = writeln!(
                out,
                "IMAGE_BASE_{i} = {} # {} ({})",
                to_hex(base.base),
                base.binary,
                base.section
            );
            let _ = writeln!(out, "rebase_{i} = lambda x : p(x + IMAGE_BASE_{i})");
        }
        if !self.bases.is_empty() {
            out.push('\n');
        }

        if let Some(shellcode) = &self.shellcode {
            let _ = writeln!(out, "shellcode = {}\n", shellcode_literal(shellcode));
        }

        out.push_str("rop = b''\n\n");
        for line in self.lines() {
            out.push_str(&render_line(line));
            out.push('\n');
        }
        if self.shellcode.is_some() {
            out.push_str("rop += shellcode\n");
        }
        out.push_str("\nsys.stdout.buffer.write(rop)\n");
        out
    }

    /// Raw payload bytes. Fails if the chain still needs a manual step.
    pub fn payload(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for line in self.lines() {
            match line {
                ChainLine::Gadget { rebase, addr, .. } | ChainLine::Rebased { rebase, addr } => {
                    let base = self.base(*rebase)?;
                    out.extend_from_slice(&base.wrapping_add(*addr).to_le_bytes());
                }
                ChainLine::Value(v) => out.extend_from_slice(&v.to_le_bytes()),
                ChainLine::Bytes(bytes) => out.extend_from_slice(bytes),
                ChainLine::Padding => out.extend_from_slice(&PADDING.to_le_bytes()),
                ChainLine::Comment(_) => {}
                ChainLine::Placeholder(text) => {
                    return Err(Error::chain(format!("chain needs a manual step: {text}")));
                }
            }
        }
        if let Some(shellcode) = &self.shellcode {
            out.extend_from_slice(shellcode);
        }
        Ok(out)
    }
}

fn render_line(line: &ChainLine) -> String {
    match line {
        ChainLine::Gadget { rebase, addr, text } => {
            format!("rop += rebase_{rebase}({}) # {text}", to_hex(*addr))
        }
        ChainLine::Rebased { rebase, addr } => format!("rop += rebase_{rebase}({})", to_hex(*addr)),
        ChainLine::Value(v) => format!("rop += p({})", to_hex(*v)),
        ChainLine::Bytes(bytes) => format!("rop += {}", bytes_literal(bytes)),
        ChainLine::Padding => format!("rop += p({}) # padding", to_hex(PADDING)),
        ChainLine::Comment(text) => format!("# {text}"),
        ChainLine::Placeholder(text) => format!("# !!! {text} !!!"),
    }
}

/// Python bytes literal.
pub fn bytes_literal(bytes: &[u8]) -> String {
    let mut s = String::from("b'");
    for &b in bytes {
        match b {
            b'\'' => s.push_str("\\'"),
            b'\\' => s.push_str("\\\\"),
            0x20..=0x7e => s.push(b as char),
            _ => {
                let _ = write!(s, "\\x{b:02x}");
            }
        }
    }
    s.push('\'');
    s
}

fn shellcode_literal(bytes: &[u8]) -> String {
    match bytes {
        [first, rest @ ..] if !rest.is_empty() && rest.iter().all(|b| b == first) => {
            format!("{}*{}", bytes_literal(&[*first]), bytes.len())
        }
        _ => bytes_literal(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::Binary;

    fn sample() -> (Catalogue, UsedBinaries, Fragment) {
        let cat = Catalogue::new(vec![
            Binary::new("vuln", 0x400000),
            Binary::new("libc.so.6", 0x7ffff7dc0000),
        ]);
        let mut used = UsedBinaries::new();
        used.index_of("libc.so.6", ".text");
        used.index_of("vuln", ".data");
        let mut body = Fragment::new();
        body.push(ChainLine::Gadget { rebase: 0, addr: 0x2a3e5, text: "pop rdi; ret".into() });
        body.push(ChainLine::Rebased { rebase: 1, addr: 0x4010 });
        body.push(ChainLine::Value(59));
        body.push(ChainLine::Bytes(b"/bin//sh".to_vec()));
        body.push(ChainLine::Padding);
        (cat, used, body)
    }

    #[test]
    fn render_script() {
        let (cat, used, body) = sample();
        let chain = Chain::assemble(&cat, &used, body).unwrap();
        let script = chain.render();
        assert!(script.contains("p = lambda x : pack('<Q', x)"));
        assert!(script.contains("IMAGE_BASE_0 = 0x00007ffff7dc0000 # libc.so.6 (.text)"));
        assert!(script.contains("rebase_1 = lambda x : p(x + IMAGE_BASE_1)"));
        assert!(script.contains("rop += rebase_0(0x000000000002a3e5) # pop rdi; ret\n"));
        assert!(script.contains("rop += rebase_1(0x0000000000004010)\n"));
        assert!(script.contains("rop += p(0x000000000000003b)\n"));
        assert!(script.contains("rop += b'/bin//sh'\n"));
        assert!(script.contains("rop += p(0xdeadbeefdeadbeef) # padding\n"));
        assert!(script.trim_end().ends_with("sys.stdout.buffer.write(rop)"));
        assert!(chain.complete);
    }

    #[test]
    fn payload_rebases_addresses() {
        let (cat, used, body) = sample();
        let chain = Chain::assemble(&cat, &used, body).unwrap();
        let payload = chain.payload().unwrap();
        assert_eq!(payload.len(), 40);
        assert_eq!(&payload[0..8], &(0x7ffff7dc0000u64 + 0x2a3e5).to_le_bytes());
        assert_eq!(&payload[8..16], &0x404010u64.to_le_bytes());
        assert_eq!(&payload[16..24], &59u64.to_le_bytes());
        assert_eq!(&payload[24..32], b"/bin//sh");
        assert_eq!(&payload[32..40], &PADDING.to_le_bytes());
    }

    #[test]
    fn placeholder_blocks_payload() {
        let (cat, used, mut body) = sample();
        body.push(ChainLine::Placeholder("INSERT SYSCALL GADGET HERE".into()));
        let chain = Chain::assemble(&cat, &used, body).unwrap();
        assert!(!chain.complete);
        assert_eq!(chain.placeholders(), 1);
        assert!(chain.render().contains("# !!! INSERT SYSCALL GADGET HERE !!!"));
        assert!(chain.payload().is_err());
    }

    #[test]
    fn unknown_binary_is_an_error() {
        let cat = Catalogue::new(vec![]);
        let mut used = UsedBinaries::new();
        used.index_of("ghost", ".text");
        assert!(Chain::assemble(&cat, &used, Fragment::new()).is_err());
    }

    #[test]
    fn shellcode_after_chain() {
        let (cat, used, body) = sample();
        let chain = Chain::assemble(&cat, &used, body).unwrap().with_shellcode(vec![0xcc; 100]);
        let script = chain.render();
        assert!(script.contains("shellcode = b'\\xcc'*100"));
        assert!(script.contains("rop += shellcode\n"));
        assert_eq!(chain.payload().unwrap().len(), 140);
    }

    #[test]
    fn bytes_literal_escapes() {
        assert_eq!(bytes_literal(b"a'b\\\x00"), "b'a\\'b\\\\\\x00'");
    }
}
