//! Classified gadgets as stored in a catalogue.
//!
//! A gadget keeps its disassembled lines for annotation and
//! pattern checks, plus a typed [`Effect`] describing what its
//! first instruction does and which registers play which role.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::types::{RegSet, X64Reg};

/// Effect category tag, used when asking the selector for a gadget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    LoadReg,
    WriteMem,
    LoadMem,
    XchgReg,
    AddReg,
    SubReg,
    ClearReg,
    IncReg,
    NegReg,
    Syscall,
}

/// Operand role inside an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Dst,
    Src,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Dst => Role::Src,
            Role::Src => Role::Dst,
        }
    }
}

/// What a gadget does, with the registers it does it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    /// `pop dst`
    LoadReg { dst: X64Reg },
    /// `mov [dst], src`
    WriteMem { dst: X64Reg, src: X64Reg },
    /// `mov dst, [src]`
    LoadMem { dst: X64Reg, src: X64Reg },
    /// `xchg dst, src`
    XchgReg { dst: X64Reg, src: X64Reg },
    /// `add dst, src`
    AddReg { dst: X64Reg, src: X64Reg },
    /// `sub dst, src`
    SubReg { dst: X64Reg, src: X64Reg },
    /// `xor dst, src`; only a clear when `dst == src`.
    ClearReg { dst: X64Reg, src: X64Reg },
    /// `inc dst`
    IncReg { dst: X64Reg },
    /// `neg dst`
    NegReg { dst: X64Reg },
    /// `syscall`
    Syscall,
}

impl Effect {
    pub fn category(&self) -> Category {
        match self {
            Effect::LoadReg { .. } => Category::LoadReg,
            Effect::WriteMem { .. } => Category::WriteMem,
            Effect::LoadMem { .. } => Category::LoadMem,
            Effect::XchgReg { .. } => Category::XchgReg,
            Effect::AddReg { .. } => Category::AddReg,
            Effect::SubReg { .. } => Category::SubReg,
            Effect::ClearReg { .. } => Category::ClearReg,
            Effect::IncReg { .. } => Category::IncReg,
            Effect::NegReg { .. } => Category::NegReg,
            Effect::Syscall => Category::Syscall,
        }
    }

    pub fn dst(&self) -> Option<X64Reg> {
        match *self {
            Effect::LoadReg { dst }
            | Effect::IncReg { dst }
            | Effect::NegReg { dst }
            | Effect::WriteMem { dst, .. }
            | Effect::LoadMem { dst, .. }
            | Effect::XchgReg { dst, .. }
            | Effect::AddReg { dst, .. }
            | Effect::SubReg { dst, .. }
            | Effect::ClearReg { dst, .. } => Some(dst),
            Effect::Syscall => None,
        }
    }

    pub fn src(&self) -> Option<X64Reg> {
        match *self {
            Effect::WriteMem { src, .. }
            | Effect::LoadMem { src, .. }
            | Effect::XchgReg { src, .. }
            | Effect::AddReg { src, .. }
            | Effect::SubReg { src, .. }
            | Effect::ClearReg { src, .. } => Some(src),
            _ => None,
        }
    }

    pub fn operand(&self, role: Role) -> Option<X64Reg> {
        match role {
            Role::Dst => self.dst(),
            Role::Src => self.src(),
        }
    }

    /// Whether this category defines both a destination and a source.
    pub fn has_src(&self) -> bool {
        self.src().is_some()
    }
}

/// A classified gadget. Read-only once catalogued.
#[derive(Debug, Clone)]
pub struct Gadget {
    /// Owning binary identifier (file name).
    pub binary: String,
    /// Owning section name.
    pub section: String,
    /// Disassembled lines as (image-relative address, text).
    pub lines: Vec<(u64, String)>,
    pub effect: Effect,
    /// Quality rank, 1 (best) to 7.
    pub quality: u8,
    /// Registers written after the first instruction.
    pub clobbers: RegSet,
}

impl Gadget {
    pub fn new(
        binary: impl Into<String>,
        section: impl Into<String>,
        lines: Vec<(u64, String)>,
        effect: Effect,
        quality: u8,
    ) -> Self {
        let clobbers = lines
            .iter()
            .skip(1)
            .fold(RegSet::empty(), |set, (_, text)| set.union(written_registers(text)));
        Self {
            binary: binary.into(),
            section: section.into(),
            lines,
            effect,
            quality,
            clobbers,
        }
    }

    /// Address of the first instruction.
    pub fn addr(&self) -> u64 {
        self.lines.first().map_or(0, |(addr, _)| *addr)
    }

    /// Instructions joined with `"; "`.
    pub fn simple_string(&self) -> String {
        self.lines
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// The last line is a plain `ret` and the stack pointer is neither
    /// named nor moved implicitly; anything else is never selectable.
    /// Extra `pop`s are fine, they become padding.
    pub fn ends_in_clean_ret(&self) -> bool {
        let Some((_, last)) = self.lines.last() else {
            return false;
        };
        if !last.trim().ends_with("ret") {
            return false;
        }
        let body = &self.lines[..self.lines.len() - 1];
        !body.iter().any(|(_, text)| {
            text.contains("rsp") || text.contains("esp") || moves_stack_pointer(text)
        })
    }

    /// Registers popped after the first instruction. Each one consumes
    /// a stack word that the chain must fill with padding.
    pub fn extra_pops(&self) -> Vec<X64Reg> {
        self.lines
            .iter()
            .skip(1)
            .filter_map(|(_, text)| {
                pop_pattern()
                    .captures(text.trim())
                    .and_then(|c| X64Reg::containing(&c[1]))
            })
            .collect()
    }

    /// True if any instruction after the first dereferences memory or
    /// writes a register in `dont_modify`.
    pub fn modifies_or_dereferences(&self, dont_modify: RegSet) -> bool {
        self.lines.iter().skip(1).any(|(_, text)| {
            text.contains('[')
                || written_registers(text).intersects(dont_modify)
        })
    }

    /// True if a later instruction overwrites the register the effect
    /// produces (both registers for an exchange).
    pub fn undoes_itself(&self) -> bool {
        match self.effect {
            Effect::WriteMem { .. } | Effect::Syscall => false,
            Effect::XchgReg { dst, src } => self.clobbers.contains(dst) || self.clobbers.contains(src),
            effect => effect.dst().is_some_and(|dst| self.clobbers.contains(dst)),
        }
    }
}

impl fmt::Display for Gadget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}", self.addr(), self.simple_string())
    }
}

fn pop_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^pop ([a-z0-9]+)$").expect("static regex"))
}

fn target_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z]+) ([a-z0-9]+)\s*(,|$)").expect("static regex"))
}

/// Mnemonics that push, pop flags or rebuild the frame.
const IMPLICIT_STACK_OPS: &[&str] = &[
    "push", "pushf", "pushfq", "popf", "popfq", "leave", "enter", "call", "ret",
];

fn moves_stack_pointer(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|mnemonic| IMPLICIT_STACK_OPS.contains(&mnemonic))
}

fn exchange_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(xchg|xadd) ([a-z0-9]+), ([a-z0-9]+)$").expect("static regex"))
}

/// Registers written by an instruction line, judged from its first
/// operand. Exchanges write both operands.
pub fn written_registers(line: &str) -> RegSet {
    let line = line.trim();
    if let Some(caps) = exchange_pattern().captures(line) {
        return [&caps[2], &caps[3]]
            .into_iter()
            .filter_map(X64Reg::containing)
            .collect();
    }
    let Some(caps) = target_pattern().captures(line) else {
        return RegSet::empty();
    };
    match &caps[1] {
        "push" | "cmp" | "test" | "jmp" | "call" => RegSet::empty(),
        _ => X64Reg::containing(&caps[2]).into_iter().collect(),
    }
}
