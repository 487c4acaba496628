use std::fmt;
use std::str::FromStr;

use iced_x86::Register;

use crate::error::{Error, Result};

/// General-purpose x86_64 register, full 64-bit width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum X64Reg {
    Rax, Rbx, Rcx, Rdx, Rsi, Rdi, Rbp, Rsp,
    R8, R9, R10, R11, R12, R13, R14, R15,
}

impl X64Reg {
    pub const ALL: [X64Reg; 16] = [
        X64Reg::Rax, X64Reg::Rbx, X64Reg::Rcx, X64Reg::Rdx,
        X64Reg::Rsi, X64Reg::Rdi, X64Reg::Rbp, X64Reg::Rsp,
        X64Reg::R8, X64Reg::R9, X64Reg::R10, X64Reg::R11,
        X64Reg::R12, X64Reg::R13, X64Reg::R14, X64Reg::R15,
    ];

    pub fn name(self) -> &'static str {
        match self {
            X64Reg::Rax => "rax", X64Reg::Rbx => "rbx",
            X64Reg::Rcx => "rcx", X64Reg::Rdx => "rdx",
            X64Reg::Rsi => "rsi", X64Reg::Rdi => "rdi",
            X64Reg::Rbp => "rbp", X64Reg::Rsp => "rsp",
            X64Reg::R8  => "r8",  X64Reg::R9  => "r9",
            X64Reg::R10 => "r10", X64Reg::R11 => "r11",
            X64Reg::R12 => "r12", X64Reg::R13 => "r13",
            X64Reg::R14 => "r14", X64Reg::R15 => "r15",
        }
    }

    /// Hardware register number (ModRM / opcode encoding).
    pub fn number(self) -> u8 {
        match self {
            X64Reg::Rax => 0, X64Reg::Rcx => 1, X64Reg::Rdx => 2, X64Reg::Rbx => 3,
            X64Reg::Rsp => 4, X64Reg::Rbp => 5, X64Reg::Rsi => 6, X64Reg::Rdi => 7,
            X64Reg::R8 => 8, X64Reg::R9 => 9, X64Reg::R10 => 10, X64Reg::R11 => 11,
            X64Reg::R12 => 12, X64Reg::R13 => 13, X64Reg::R14 => 14, X64Reg::R15 => 15,
        }
    }

    /// Parse a full 64-bit register name.
    ///
    /// Sub-register names (`eax`, `di`, `r8d`, ...) are rejected: only
    /// 64-bit names are valid selection targets.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.name() == name)
    }

    /// Map any register name, including 8/16/32-bit views, to the
    /// 64-bit register that contains it.
    pub fn containing(name: &str) -> Option<Self> {
        let name = name.trim();
        if let Some(reg) = Self::from_name(name) {
            return Some(reg);
        }
        let legacy = match name {
            "eax" | "ax" | "al" | "ah" => Some(X64Reg::Rax),
            "ebx" | "bx" | "bl" | "bh" => Some(X64Reg::Rbx),
            "ecx" | "cx" | "cl" | "ch" => Some(X64Reg::Rcx),
            "edx" | "dx" | "dl" | "dh" => Some(X64Reg::Rdx),
            "esi" | "si" | "sil" => Some(X64Reg::Rsi),
            "edi" | "di" | "dil" => Some(X64Reg::Rdi),
            "ebp" | "bp" | "bpl" => Some(X64Reg::Rbp),
            "esp" | "sp" | "spl" => Some(X64Reg::Rsp),
            _ => None,
        };
        if legacy.is_some() {
            return legacy;
        }
        // r8d, r8w, r8b, r8l
        let base = name.trim_end_matches(['d', 'w', 'b', 'l']);
        if base.len() < name.len() && base.starts_with('r') {
            return Self::from_name(base);
        }
        None
    }

    pub(crate) fn from_iced(reg: Register) -> Option<Self> {
        match reg.full_register() {
            Register::RAX => Some(X64Reg::Rax),
            Register::RBX => Some(X64Reg::Rbx),
            Register::RCX => Some(X64Reg::Rcx),
            Register::RDX => Some(X64Reg::Rdx),
            Register::RSI => Some(X64Reg::Rsi),
            Register::RDI => Some(X64Reg::Rdi),
            Register::RBP => Some(X64Reg::Rbp),
            Register::RSP => Some(X64Reg::Rsp),
            Register::R8 => Some(X64Reg::R8),
            Register::R9 => Some(X64Reg::R9),
            Register::R10 => Some(X64Reg::R10),
            Register::R11 => Some(X64Reg::R11),
            Register::R12 => Some(X64Reg::R12),
            Register::R13 => Some(X64Reg::R13),
            Register::R14 => Some(X64Reg::R14),
            Register::R15 => Some(X64Reg::R15),
            _ => None,
        }
    }
}

impl fmt::Display for X64Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for X64Reg {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(&s.to_ascii_lowercase())
            .ok_or_else(|| Error::InvalidOption(format!("not a 64-bit register: '{}'", s)))
    }
}

/// Set of 64-bit registers, one bit per register.
///
/// `Copy` so that exclusion snapshots can be extended per attempt
/// without sharing state between attempts.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegSet(u16);

impl RegSet {
    pub const fn empty() -> Self {
        RegSet(0)
    }

    pub fn of(regs: &[X64Reg]) -> Self {
        regs.iter().fold(Self::empty(), |set, &r| set.with(r))
    }

    #[must_use]
    pub fn with(self, reg: X64Reg) -> Self {
        RegSet(self.0 | 1 << reg.number())
    }

    pub fn insert(&mut self, reg: X64Reg) {
        *self = self.with(reg);
    }

    pub fn contains(self, reg: X64Reg) -> bool {
        self.0 & (1 << reg.number()) != 0
    }

    #[must_use]
    pub fn union(self, other: RegSet) -> Self {
        RegSet(self.0 | other.0)
    }

    pub fn intersects(self, other: RegSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = X64Reg> {
        X64Reg::ALL.into_iter().filter(move |&r| self.contains(r))
    }
}

impl FromIterator<X64Reg> for RegSet {
    fn from_iter<I: IntoIterator<Item = X64Reg>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |set, r| set.with(r))
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Byte values forbidden in any immediate emitted by a chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BadBytes([u64; 4]);

impl BadBytes {
    /// No byte is forbidden.
    pub const fn none() -> Self {
        BadBytes([0; 4])
    }

    pub fn new(bytes: &[u8]) -> Self {
        let mut set = Self::none();
        for &b in bytes {
            set.0[(b >> 6) as usize] |= 1 << (b & 63);
        }
        set
    }

    /// Parse a hex string such as `"000a0d"` into a bad-byte set.
    pub fn parse(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() % 2 != 0 || !hex.is_ascii() {
            return Err(Error::InvalidOption(format!(
                "bad bytes must be an even-length hex string: '{}'",
                hex
            )));
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&hex[i..i + 2], 16)
                    .map_err(|_| Error::InvalidOption(format!("invalid hex byte in '{}'", hex)))
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(Self::new(&bytes))
    }

    pub fn is_bad(&self, byte: u8) -> bool {
        self.0[(byte >> 6) as usize] & (1 << (byte & 63)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; 4]
    }

    /// True when any of the eight bytes of `value` is forbidden.
    pub fn contains(&self, value: u64) -> bool {
        self.contains_in(value, 8)
    }

    /// Check only the low `width` bytes of `value`.
    pub fn contains_in(&self, value: u64, width: usize) -> bool {
        value.to_le_bytes()[..width.min(8)].iter().any(|&b| self.is_bad(b))
    }

    pub fn contains_any(&self, data: &[u8]) -> bool {
        data.iter().any(|&b| self.is_bad(b))
    }

    pub fn bytes(&self) -> Vec<u8> {
        (0..=255u8).filter(|&b| self.is_bad(b)).collect()
    }
}

impl Default for BadBytes {
    /// The zero byte, which truncates C string copies.
    fn default() -> Self {
        BadBytes::new(&[0x00])
    }
}

impl fmt::Debug for BadBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BadBytes(")?;
        for b in self.bytes() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Render a 64-bit quantity as a zero-padded 16-digit hex literal.
pub fn to_hex(value: u64) -> String {
    format!("{:#018x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_names_round_trip() {
        for reg in X64Reg::ALL {
            assert_eq!(X64Reg::from_name(reg.name()), Some(reg));
        }
    }

    #[test]
    fn sub_registers_are_not_targets() {
        assert_eq!(X64Reg::from_name("eax"), None);
        assert_eq!(X64Reg::from_name("r8d"), None);
        assert!("edi".parse::<X64Reg>().is_err());
        assert_eq!("RDI".parse::<X64Reg>().unwrap(), X64Reg::Rdi);
    }

    #[test]
    fn containing_maps_views() {
        assert_eq!(X64Reg::containing("eax"), Some(X64Reg::Rax));
        assert_eq!(X64Reg::containing("dh"), Some(X64Reg::Rdx));
        assert_eq!(X64Reg::containing("sil"), Some(X64Reg::Rsi));
        assert_eq!(X64Reg::containing("r10d"), Some(X64Reg::R10));
        assert_eq!(X64Reg::containing("r15b"), Some(X64Reg::R15));
        assert_eq!(X64Reg::containing("r11"), Some(X64Reg::R11));
        assert_eq!(X64Reg::containing("xmm0"), None);
        assert_eq!(X64Reg::containing("rip"), None);
    }

    #[test]
    fn reg_set_operations() {
        let set = RegSet::of(&[X64Reg::Rdi, X64Reg::Rsi]);
        assert!(set.contains(X64Reg::Rdi));
        assert!(!set.contains(X64Reg::Rax));
        assert_eq!(set.len(), 2);

        let wider = set.with(X64Reg::Rax);
        assert_eq!(set.len(), 2); // snapshot untouched
        assert_eq!(wider.len(), 3);
        assert!(wider.intersects(RegSet::of(&[X64Reg::Rax])));
        assert!(!set.intersects(RegSet::of(&[X64Reg::R15])));
        assert_eq!(
            wider.iter().collect::<Vec<_>>(),
            vec![X64Reg::Rax, X64Reg::Rsi, X64Reg::Rdi]
        );
    }

    #[test]
    fn bad_bytes_default_is_zero() {
        let bad = BadBytes::default();
        assert!(bad.contains(59));
        assert!(!bad.contains(0x0101010101010101));
        assert!(!BadBytes::none().contains(0));
    }

    #[test]
    fn bad_bytes_parse() {
        let bad = BadBytes::parse("000a0d").unwrap();
        assert_eq!(bad.bytes(), vec![0x00, 0x0a, 0x0d]);
        assert!(bad.contains(0x4141414141410a41));
        assert!(!bad.contains_in(0x0000_0000_4141_4141, 4));
        assert!(BadBytes::parse("0a0").is_err());
        assert!(BadBytes::parse("zz").is_err());
    }

    #[test]
    fn hex_is_sixteen_digits() {
        assert_eq!(to_hex(0x3b), "0x000000000000003b");
        assert_eq!(to_hex(u64::MAX), "0xffffffffffffffff");
    }
}
