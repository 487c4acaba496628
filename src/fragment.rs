//! Chain fragments and the used-binaries rebase table.

use crate::catalogue::CodeLocation;
use crate::gadget::Gadget;

/// Stack word used to fill slots consumed by extra pops.
pub const PADDING: u64 = 0xdead_beef_dead_beef;

/// One emitted line of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainLine {
    /// Rebased code address, annotated with its disassembly.
    Gadget { rebase: usize, addr: u64, text: String },
    /// Rebased data address.
    Rebased { rebase: usize, addr: u64 },
    /// Literal 64-bit value.
    Value(u64),
    /// Literal byte string.
    Bytes(Vec<u8>),
    /// Filler word for an extra pop.
    Padding,
    /// Informational comment.
    Comment(String),
    /// A step the operator has to complete by hand.
    Placeholder(String),
}

/// Ordered, append-only sequence of chain lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    lines: Vec<ChainLine>,
}

impl Fragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: ChainLine) {
        self.lines.push(line);
    }

    pub fn append(&mut self, other: Fragment) {
        self.lines.extend(other.lines);
    }

    /// Emit `gadget`, then the word it pops (if any), then one padding
    /// word per additional pop in its body.
    pub fn push_gadget(&mut self, rebase: usize, gadget: &Gadget, popped: Option<ChainLine>) {
        self.lines.push(ChainLine::Gadget {
            rebase,
            addr: gadget.addr(),
            text: gadget.simple_string(),
        });
        if let Some(word) = popped {
            self.lines.push(word);
        }
        for _ in gadget.extra_pops() {
            self.lines.push(ChainLine::Padding);
        }
    }

    pub fn push_location(&mut self, rebase: usize, location: &CodeLocation) {
        self.lines.push(ChainLine::Gadget {
            rebase,
            addr: location.addr,
            text: location.text.clone(),
        });
    }

    pub fn lines(&self) -> &[ChainLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Literal values carried by the fragment, in emission order.
    pub fn literals(&self) -> impl Iterator<Item = u64> + '_ {
        self.lines.iter().filter_map(|line| match line {
            ChainLine::Value(v) => Some(*v),
            _ => None,
        })
    }

    /// Annotated gadget lines, in emission order.
    pub fn gadget_texts(&self) -> impl Iterator<Item = &str> + '_ {
        self.lines.iter().filter_map(|line| match line {
            ChainLine::Gadget { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// First-use ordered, deduplicated (binary, section) pairs.
///
/// A pair's position is the rebase index referenced by emitted
/// address lines and never changes once assigned.
#[derive(Debug, Clone, Default)]
pub struct UsedBinaries {
    entries: Vec<(String, String)>,
}

impl UsedBinaries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the pair, registering it on first use.
    pub fn index_of(&mut self, binary: &str, section: &str) -> usize {
        if let Some(idx) = self.get(binary, section) {
            return idx;
        }
        self.entries.push((binary.to_string(), section.to_string()));
        self.entries.len() - 1
    }

    pub fn get(&self, binary: &str, section: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(b, s)| b == binary && s == section)
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::Effect;
    use crate::types::X64Reg;

    #[test]
    fn used_binaries_index_is_stable() {
        let mut used = UsedBinaries::new();
        assert_eq!(used.index_of("libc.so.6", ".text"), 0);
        assert_eq!(used.index_of("vuln", ".text"), 1);
        assert_eq!(used.index_of("libc.so.6", ".text"), 0);
        assert_eq!(used.index_of("vuln", ".data"), 2);
        assert_eq!(used.index_of("vuln", ".text"), 1);
        assert_eq!(used.len(), 3);
        assert_eq!(used.get("nothing", ".text"), None);
    }

    #[test]
    fn gadget_with_extra_pop_gets_padding() {
        let g = Gadget::new(
            "vuln",
            ".text",
            vec![
                (0x1000, "pop rsi".into()),
                (0x1001, "pop r15".into()),
                (0x1003, "ret".into()),
            ],
            Effect::LoadReg { dst: X64Reg::Rsi },
            2,
        );
        let mut frag = Fragment::new();
        frag.push_gadget(0, &g, Some(ChainLine::Value(0x41)));
        assert_eq!(
            frag.lines(),
            &[
                ChainLine::Gadget { rebase: 0, addr: 0x1000, text: "pop rsi; pop r15; ret".into() },
                ChainLine::Value(0x41),
                ChainLine::Padding,
            ]
        );
        assert_eq!(frag.literals().collect::<Vec<_>>(), vec![0x41]);
    }

    #[test]
    fn append_keeps_order() {
        let mut a = Fragment::new();
        a.push(ChainLine::Value(1));
        let mut b = Fragment::new();
        b.push(ChainLine::Value(2));
        b.push(ChainLine::Padding);
        a.append(b);
        assert_eq!(a.len(), 3);
        assert_eq!(a.literals().collect::<Vec<_>>(), vec![1, 2]);
    }
}
