//! Memory-effect builders: write bytes or a register to an address,
//! and load a register from an address.

use tracing::debug;

use crate::builder::RopChainBuilder;
use crate::error::{Error, Result};
use crate::fragment::{ChainLine, Fragment};
use crate::gadget::{Category, Gadget};
use crate::materialize::Loaded;
use crate::select::{Constraints, Query};
use crate::types::{to_hex, RegSet, X64Reg};

/// An address a chain points a register at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Image-relative address inside a used (binary, section) pair.
    Rebased { rebase: usize, addr: u64 },
    /// Absolute address supplied by the operator.
    Absolute(u64),
}

impl Location {
    /// The location `offset` bytes further on.
    pub fn offset(self, offset: u64) -> Self {
        match self {
            Location::Rebased { rebase, addr } => Location::Rebased {
                rebase,
                addr: addr.wrapping_add(offset),
            },
            Location::Absolute(addr) => Location::Absolute(addr.wrapping_add(offset)),
        }
    }

    fn line(self) -> ChainLine {
        match self {
            Location::Rebased { rebase, addr } => ChainLine::Rebased { rebase, addr },
            Location::Absolute(addr) => ChainLine::Value(addr),
        }
    }
}

/// Pad `what` with spaces to a whole number of 8-byte words.
pub fn pad_words(what: &[u8]) -> Vec<u8> {
    let mut data = what.to_vec();
    let rem = data.len() % 8;
    if rem != 0 {
        data.resize(data.len() + 8 - rem, b' ');
    }
    data
}

/// Gadgets of one write-what-where primitive.
struct WritePrimitive<'a> {
    value: &'a Gadget,
    addr: &'a Gadget,
    write: &'a Gadget,
}

impl<'a> RopChainBuilder<'a> {
    /// Point `reg` at `location`.
    pub fn load_location(
        &mut self,
        reg: X64Reg,
        location: Location,
        bad: RegSet,
        dont_modify: RegSet,
    ) -> Result<Loaded> {
        match location {
            Location::Absolute(addr) => self.materialize(addr, Some(reg), bad, dont_modify),
            Location::Rebased { .. } => self.pop_word(
                location.line(),
                Some(reg),
                Constraints::dont_modify(dont_modify).with_bad(bad),
            ),
        }
    }

    fn check_address(&self, location: Location) -> Result<()> {
        match location {
            Location::Absolute(addr) if self.bad_bytes.contains(addr) => Err(Error::chain(format!(
                "address {} contains a bad byte",
                to_hex(addr)
            ))),
            _ => Ok(()),
        }
    }

    /// Find a pop for the value, a write consuming it and a pop for the
    /// write's address register. A value register that cannot be paired
    /// is excluded and the search repeated.
    fn write_primitive(&mut self, dont_modify: RegSet) -> Result<WritePrimitive<'a>> {
        let mut bad = dont_modify;
        loop {
            let value = self
                .find(
                    Query::new(Category::LoadReg),
                    Constraints::dont_modify(dont_modify).with_bad_dst(bad),
                )
                .ok_or_else(|| Error::chain("cannot build write-what-where gadget"))?;
            let Some(value_reg) = value.effect.dst() else {
                return Err(Error::chain("cannot build write-what-where gadget"));
            };
            if let Some((write, addr)) = self.write_for(value_reg, dont_modify) {
                return Ok(WritePrimitive { value, addr, write });
            }
            bad.insert(value_reg);
        }
    }

    /// A write taking `src` as its value plus a pop for its address register.
    fn write_for(&mut self, src: X64Reg, dont_modify: RegSet) -> Option<(&'a Gadget, &'a Gadget)> {
        let keep = dont_modify.with(src);
        let mut c = Constraints::dont_modify(keep).with_bad_dst(dont_modify);
        loop {
            let write = self.find(Query::new(Category::WriteMem).reg(src).src(), c)?;
            let dst = write.effect.dst()?;
            let addr = self.find(
                Query::new(Category::LoadReg).reg(dst),
                Constraints::dont_modify(keep),
            );
            if let Some(addr) = addr {
                return Some((write, addr));
            }
            c.bad_dst.insert(dst);
        }
    }

    /// Write `what`, space-padded to whole words, starting at `at`.
    pub fn write_string_where(&mut self, what: &[u8], at: Location, dont_modify: RegSet) -> Result<Fragment> {
        let data = pad_words(what);
        if let Some(chunk) = data.chunks(8).find(|c| self.bad_bytes.contains_any(c)) {
            return Err(Error::chain(format!(
                "{:?} contains a bad byte",
                String::from_utf8_lossy(chunk)
            )));
        }
        let p = self.write_primitive(dont_modify)?;
        debug!(value = %p.value, write = %p.write, "write-what-where");
        let mut fragment = Fragment::new();
        for (i, chunk) in data.chunks(8).enumerate() {
            let target = at.offset(i as u64 * 8);
            self.check_address(target)?;
            self.emit(&mut fragment, p.value, Some(ChainLine::Bytes(chunk.to_vec())));
            self.emit(&mut fragment, p.addr, Some(target.line()));
            self.emit(&mut fragment, p.write, None);
        }
        Ok(fragment)
    }

    /// Store the current value of `reg` at `at`.
    pub fn write_reg_value_where(&mut self, reg: X64Reg, at: Location, dont_modify: RegSet) -> Result<Fragment> {
        self.check_address(at)?;
        let (write, addr) = self
            .write_for(reg, dont_modify)
            .ok_or_else(|| Error::chain(format!("cannot write {reg} to memory")))?;
        let mut fragment = Fragment::new();
        self.emit(&mut fragment, addr, Some(at.line()));
        self.emit(&mut fragment, write, None);
        Ok(fragment)
    }

    /// Load the word stored at `from` into `reg`.
    ///
    /// A direct memory load is preferred; otherwise the word is loaded
    /// into another register and exchanged into `reg`.
    pub fn load_reg_value_from(&mut self, reg: X64Reg, from: Location, dont_modify: RegSet) -> Result<Fragment> {
        self.check_address(from)?;
        match self.load_via_mov(reg, from, dont_modify) {
            Err(e) if e.is_chain_failure() => {
                debug!(%reg, "no direct memory load: {}", e.reason());
                self.load_via_xchg(reg, from, dont_modify)
            }
            other => other,
        }
    }

    fn load_via_mov(&mut self, reg: X64Reg, from: Location, dont_modify: RegSet) -> Result<Fragment> {
        // the address register is popped, so it must not be a committed one
        let mut c = Constraints::dont_modify(dont_modify.with(reg)).with_bad_src(dont_modify);
        loop {
            let load = self
                .find(Query::new(Category::LoadMem).reg(reg), c)
                .ok_or_else(|| Error::chain(format!("cannot load {reg} from memory")))?;
            let Some(src) = load.effect.src() else {
                return Err(Error::chain(format!("cannot load {reg} from memory")));
            };
            if let Some(addr) = self.find(
                Query::new(Category::LoadReg).reg(src),
                Constraints::dont_modify(dont_modify),
            ) {
                let mut fragment = Fragment::new();
                self.emit(&mut fragment, addr, Some(from.line()));
                self.emit(&mut fragment, load, None);
                return Ok(fragment);
            }
            c.bad_src.insert(src);
        }
    }

    fn load_via_xchg(&mut self, reg: X64Reg, from: Location, dont_modify: RegSet) -> Result<Fragment> {
        let fail = || Error::chain(format!("cannot load {reg} from memory through an exchange"));
        let mut c = Constraints::dont_modify(dont_modify).with_bad(dont_modify);
        loop {
            let xchg = self
                .find(Query::new(Category::XchgReg).reg(reg).switch_roles(), c)
                .ok_or_else(fail)?;
            let (dst, src) = match (xchg.effect.dst(), xchg.effect.src()) {
                (Some(dst), Some(src)) => (dst, src),
                _ => return Err(fail()),
            };
            let other = if dst == reg { src } else { dst };
            if other != reg {
                if let Ok(mut fragment) = self.load_via_mov(other, from, dont_modify) {
                    self.emit(&mut fragment, xchg, None);
                    return Ok(fragment);
                }
            }
            if dst == reg {
                c.bad_src.insert(other);
            } else {
                c.bad_dst.insert(other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{Binary, Catalogue};
    use crate::gadget::Effect;
    use crate::types::BadBytes;

    use X64Reg::*;

    fn make_gadget(addr: u64, lines: &[&str], effect: Effect) -> Gadget {
        let quality = (lines.len() - 1) as u8;
        let lines = lines
            .iter()
            .enumerate()
            .map(|(i, t)| (addr + i as u64, t.to_string()))
            .collect();
        Gadget::new("vuln", ".text", lines, effect, quality)
    }

    fn pop(addr: u64, reg: X64Reg) -> Gadget {
        make_gadget(addr, &[&format!("pop {reg}"), "ret"], Effect::LoadReg { dst: reg })
    }

    fn catalogue(gadgets: Vec<Gadget>) -> Catalogue {
        Catalogue::new(vec![Binary::new("vuln", 0x400000).with_gadgets(gadgets)])
    }

    fn data_at(addr: u64) -> Location {
        Location::Rebased { rebase: 1, addr }
    }

    #[test]
    fn padding_to_words() {
        assert_eq!(pad_words(b"/bin/sh"), b"/bin/sh ".to_vec());
        assert_eq!(pad_words(b"12345678").len(), 8);
        assert!(pad_words(b"").is_empty());
    }

    #[test]
    fn write_string_in_words() {
        let cat = catalogue(vec![
            pop(0x1000, Rax),
            pop(0x1010, Rsi),
            pop(0x1020, Rdi),
            make_gadget(0x1100, &["mov qword ptr [rdi], rsi", "ret"], Effect::WriteMem { dst: Rdi, src: Rsi }),
        ]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::default());
        let frag = b.write_string_where(b"/bin//sh/bin/ls", data_at(0x4000), RegSet::empty()).unwrap();
        assert_eq!(
            frag.lines(),
            &[
                ChainLine::Gadget { rebase: 0, addr: 0x1010, text: "pop rsi; ret".into() },
                ChainLine::Bytes(b"/bin//sh".to_vec()),
                ChainLine::Gadget { rebase: 0, addr: 0x1020, text: "pop rdi; ret".into() },
                ChainLine::Rebased { rebase: 1, addr: 0x4000 },
                ChainLine::Gadget { rebase: 0, addr: 0x1100, text: "mov qword ptr [rdi], rsi; ret".into() },
                ChainLine::Gadget { rebase: 0, addr: 0x1010, text: "pop rsi; ret".into() },
                ChainLine::Bytes(b"/bin/ls ".to_vec()),
                ChainLine::Gadget { rebase: 0, addr: 0x1020, text: "pop rdi; ret".into() },
                ChainLine::Rebased { rebase: 1, addr: 0x4008 },
                ChainLine::Gadget { rebase: 0, addr: 0x1100, text: "mov qword ptr [rdi], rsi; ret".into() },
            ]
        );
    }

    #[test]
    fn write_pads_extra_pops() {
        let cat = catalogue(vec![
            make_gadget(0x1010, &["pop rsi", "pop r15", "ret"], Effect::LoadReg { dst: Rsi }),
            pop(0x1020, Rdi),
            make_gadget(0x1100, &["mov qword ptr [rdi], rsi", "ret"], Effect::WriteMem { dst: Rdi, src: Rsi }),
        ]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::default());
        let frag = b.write_string_where(b"AAAAAAAA", data_at(0), RegSet::empty()).unwrap();
        assert_eq!(frag.lines()[2], ChainLine::Padding);
        assert_eq!(frag.len(), 6);
    }

    #[test]
    fn no_write_gadget() {
        let cat = catalogue(vec![pop(0x1000, Rax), pop(0x1020, Rdi)]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::default());
        let err = b.write_string_where(b"/bin/sh", data_at(0), RegSet::empty()).unwrap_err();
        assert!(err.to_string().contains("write-what-where"));
    }

    #[test]
    fn bad_chunk_rejected() {
        let cat = catalogue(vec![]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::new(&[b'/']));
        assert!(b.write_string_where(b"/bin/sh", data_at(0), RegSet::empty()).is_err());
    }

    #[test]
    fn write_register_value() {
        let cat = catalogue(vec![
            pop(0x1020, Rdi),
            make_gadget(0x1100, &["mov qword ptr [rdi], rax", "ret"], Effect::WriteMem { dst: Rdi, src: Rax }),
        ]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::default());
        let frag = b.write_reg_value_where(Rax, data_at(0x4008), RegSet::empty()).unwrap();
        assert_eq!(frag.lines()[1], ChainLine::Rebased { rebase: 1, addr: 0x4008 });
        assert_eq!(frag.len(), 3);
        assert!(b.write_reg_value_where(Rbx, data_at(0), RegSet::empty()).is_err());
    }

    #[test]
    fn load_from_uses_the_given_address() {
        let cat = catalogue(vec![
            pop(0x1020, Rsi),
            make_gadget(0x1100, &["mov rax, qword ptr [rsi]", "ret"], Effect::LoadMem { dst: Rax, src: Rsi }),
        ]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::default());
        let from = Location::Rebased { rebase: 3, addr: 0x6010 };
        let frag = b.load_reg_value_from(Rax, from, RegSet::empty()).unwrap();
        assert_eq!(
            frag.lines(),
            &[
                ChainLine::Gadget { rebase: 0, addr: 0x1020, text: "pop rsi; ret".into() },
                ChainLine::Rebased { rebase: 3, addr: 0x6010 },
                ChainLine::Gadget { rebase: 0, addr: 0x1100, text: "mov rax, qword ptr [rsi]; ret".into() },
            ]
        );
    }

    #[test]
    fn load_from_falls_back_to_exchange() {
        let cat = catalogue(vec![
            pop(0x1020, Rsi),
            make_gadget(0x1100, &["mov rax, qword ptr [rsi]", "ret"], Effect::LoadMem { dst: Rax, src: Rsi }),
            make_gadget(0x1200, &["xchg rdx, rax", "ret"], Effect::XchgReg { dst: Rdx, src: Rax }),
        ]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::none());
        let frag = b.load_reg_value_from(Rdx, Location::Absolute(0x601010), RegSet::empty()).unwrap();
        assert_eq!(
            frag.gadget_texts().collect::<Vec<_>>(),
            vec!["pop rsi; ret", "mov rax, qword ptr [rsi]; ret", "xchg rdx, rax; ret"]
        );
        assert_eq!(frag.literals().collect::<Vec<_>>(), vec![0x601010]);
    }

    #[test]
    fn load_from_never_pops_a_committed_register() {
        let cat = catalogue(vec![
            pop(0x1020, Rsi),
            make_gadget(0x1100, &["mov rax, qword ptr [rsi]", "ret"], Effect::LoadMem { dst: Rax, src: Rsi }),
            make_gadget(0x1200, &["xchg rdx, rax", "ret"], Effect::XchgReg { dst: Rdx, src: Rax }),
        ]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::none());
        let from = Location::Absolute(0x601010);
        // rsi holds an earlier value
        let err = b.load_reg_value_from(Rax, from, RegSet::of(&[Rsi])).unwrap_err();
        assert!(err.is_chain_failure());
        // the exchange would route the word through a committed rax
        assert!(b.load_reg_value_from(Rdx, from, RegSet::of(&[Rax])).is_err());
        assert!(b.load_reg_value_from(Rdx, from, RegSet::of(&[Rdi])).is_ok());
    }

    #[test]
    fn absolute_address_checked_for_bad_bytes() {
        let cat = catalogue(vec![
            pop(0x1020, Rsi),
            make_gadget(0x1100, &["mov rax, qword ptr [rsi]", "ret"], Effect::LoadMem { dst: Rax, src: Rsi }),
        ]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::new(&[0x10]));
        assert!(b.load_reg_value_from(Rax, Location::Absolute(0x601010), RegSet::empty()).is_err());
    }
}
