//! Per-binary gadget catalogue.
//!
//! Produced once by the loader in [`crate::rop`] (or built by hand) and
//! read-only for the rest of a build.

use crate::error::Result;
use crate::gadget::Gadget;
use crate::types::X64Reg;

/// A section of a loaded binary.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    /// Address relative to the binary's image base.
    pub offset: u64,
    pub data: Vec<u8>,
    pub executable: bool,
}

/// One target binary and the gadgets found in it, in catalogue order.
#[derive(Debug, Clone)]
pub struct Binary {
    pub name: String,
    /// Load address added to every relative address at rebase time.
    pub image_base: u64,
    pub sections: Vec<Section>,
    pub gadgets: Vec<Gadget>,
}

impl Binary {
    pub fn new(name: impl Into<String>, image_base: u64) -> Self {
        Self {
            name: name.into(),
            image_base,
            sections: Vec::new(),
            gadgets: Vec::new(),
        }
    }

    pub fn with_gadgets(mut self, gadgets: Vec<Gadget>) -> Self {
        self.gadgets = gadgets;
        self
    }

    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn executable_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.executable)
    }
}

/// All binaries taking part in a build, in the order they were given.
#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    binaries: Vec<Binary>,
}

impl Catalogue {
    pub fn new(binaries: Vec<Binary>) -> Self {
        Self { binaries }
    }

    pub fn binaries(&self) -> &[Binary] {
        &self.binaries
    }

    /// The first binary; syscall opcode and jump searches run against it.
    pub fn primary(&self) -> Option<&Binary> {
        self.binaries.first()
    }

    pub fn binary(&self, name: &str) -> Option<&Binary> {
        self.binaries.iter().find(|b| b.name == name)
    }

    pub fn image_base(&self, name: &str) -> Option<u64> {
        self.binary(name).map(|b| b.image_base)
    }

    pub fn gadget_count(&self) -> usize {
        self.binaries.iter().map(|b| b.gadgets.len()).sum()
    }
}

/// A code address that is not a catalogued gadget, such as a bare
/// `syscall` opcode or a `jmp reg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLocation {
    pub binary: String,
    pub section: String,
    /// Address relative to the image base.
    pub addr: u64,
    /// Disassembly used to annotate the chain.
    pub text: String,
}

/// Disassembly-on-demand searches over a binary's executable code.
pub trait CodeSearch {
    /// Find every location whose bytes match `opcode`, a hex string
    /// such as `"0f05"`.
    fn search_opcode(&self, opcode: &str) -> Result<Vec<CodeLocation>>;

    /// Find `jmp reg` instructions.
    fn search_jmp_reg(&self, reg: X64Reg) -> Vec<CodeLocation>;
}
