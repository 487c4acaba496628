//! Chain builder state shared by every construction step.
//!
//! The builder borrows the read-only catalogue and owns the
//! used-binaries table for the duration of one build. Selection,
//! materialization, memory effects and the dependency solver are
//! implemented on it in their own modules.

use crate::catalogue::{Catalogue, CodeLocation};
use crate::emit::Chain;
use crate::error::Result;
use crate::fragment::{ChainLine, Fragment, UsedBinaries};
use crate::gadget::Gadget;
use crate::types::BadBytes;

/// Build-wide settings.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Bytes no emitted immediate may contain.
    pub bad_bytes: BadBytes,
    /// Fail instead of returning a partial chain when the solver
    /// cannot fill every register.
    pub strict: bool,
    /// Upper bound on sub-goal realizations tried by the solver.
    pub max_attempts: Option<usize>,
}

pub struct RopChainBuilder<'a> {
    pub(crate) catalogue: &'a Catalogue,
    pub(crate) bad_bytes: BadBytes,
    pub(crate) used: UsedBinaries,
}

impl<'a> RopChainBuilder<'a> {
    pub fn new(catalogue: &'a Catalogue, bad_bytes: BadBytes) -> Self {
        Self {
            catalogue,
            bad_bytes,
            used: UsedBinaries::new(),
        }
    }

    pub fn catalogue(&self) -> &'a Catalogue {
        self.catalogue
    }

    pub fn bad_bytes(&self) -> &BadBytes {
        &self.bad_bytes
    }

    pub fn used(&self) -> &UsedBinaries {
        &self.used
    }

    /// Rebase index for a (binary, section) pair.
    pub fn rebase_index(&mut self, binary: &str, section: &str) -> usize {
        self.used.index_of(binary, section)
    }

    /// Append `gadget` (and the word it pops) to `frag`.
    pub(crate) fn emit(&mut self, frag: &mut Fragment, gadget: &Gadget, popped: Option<ChainLine>) {
        let rebase = self.used.index_of(&gadget.binary, &gadget.section);
        frag.push_gadget(rebase, gadget, popped);
    }

    pub(crate) fn emit_location(&mut self, frag: &mut Fragment, location: &CodeLocation) {
        let rebase = self.used.index_of(&location.binary, &location.section);
        frag.push_location(rebase, location);
    }

    /// Close the build and hand the fragment to the emitter.
    pub fn into_chain(self, body: Fragment) -> Result<Chain> {
        Chain::assemble(self.catalogue, &self.used, body)
    }
}
