//! Gadget selection.
//!
//! Walks the catalogue rank by rank and returns the first gadget that
//! satisfies a [`Query`] under a set of [`Constraints`]. Ties inside a
//! rank are broken by catalogue order (binary order, then gadget order).

use tracing::debug;

use crate::builder::RopChainBuilder;
use crate::classify::MAX_QUALITY;
use crate::gadget::{Category, Gadget, Role};
use crate::types::{RegSet, X64Reg};

/// What kind of gadget is wanted, and for which register.
#[derive(Debug, Clone, Copy)]
pub struct Query {
    pub category: Category,
    pub reg: Option<X64Reg>,
    pub role: Role,
    pub src_eq_dst: bool,
    pub switch_roles: bool,
}

impl Query {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            reg: None,
            role: Role::Dst,
            src_eq_dst: false,
            switch_roles: false,
        }
    }

    pub fn reg(mut self, reg: X64Reg) -> Self {
        self.reg = Some(reg);
        self
    }

    pub fn maybe_reg(mut self, reg: Option<X64Reg>) -> Self {
        self.reg = reg;
        self
    }

    /// Match `reg` against the source operand instead of the destination.
    pub fn src(mut self) -> Self {
        self.role = Role::Src;
        self
    }

    pub fn src_eq_dst(mut self) -> Self {
        self.src_eq_dst = true;
        self
    }

    /// Also accept `reg` in the opposite role.
    pub fn switch_roles(mut self) -> Self {
        self.switch_roles = true;
        self
    }
}

/// Exclusions applied to one selection.
///
/// Plain `Copy` data: every retry builds a new snapshot with one more
/// exclusion instead of mutating a shared list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    /// Registers the destination operand must not be, nor clobber.
    pub bad_dst: RegSet,
    /// Registers the source operand must not be, nor clobber.
    pub bad_src: RegSet,
    /// Registers no instruction after the first may write.
    pub dont_modify: RegSet,
}

impl Constraints {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn dont_modify(dont_modify: RegSet) -> Self {
        Self { dont_modify, ..Self::default() }
    }

    pub fn with_bad_dst(mut self, bad: RegSet) -> Self {
        self.bad_dst = bad;
        self
    }

    pub fn with_bad_src(mut self, bad: RegSet) -> Self {
        self.bad_src = bad;
        self
    }

    /// Same set excluded from both roles.
    pub fn with_bad(self, bad: RegSet) -> Self {
        self.with_bad_dst(bad).with_bad_src(bad)
    }
}

/// Check every filter except the register match itself.
fn admissible(gadget: &Gadget, query: &Query, c: &Constraints) -> bool {
    let effect = &gadget.effect;

    if !c.bad_src.is_empty()
        && (effect.src().is_some_and(|r| c.bad_src.contains(r)) || gadget.clobbers.intersects(c.bad_src))
    {
        return false;
    }
    if !c.bad_dst.is_empty()
        && (effect.dst().is_some_and(|r| c.bad_dst.contains(r)) || gadget.clobbers.intersects(c.bad_dst))
    {
        return false;
    }
    if !gadget.ends_in_clean_ret() || gadget.undoes_itself() {
        return false;
    }
    if effect.has_src() {
        let same = effect.dst() == effect.src();
        if same != query.src_eq_dst {
            return false;
        }
    } else if query.src_eq_dst {
        return false;
    }
    !gadget.modifies_or_dereferences(c.dont_modify)
}

fn matches_reg(gadget: &Gadget, query: &Query) -> bool {
    let Some(reg) = query.reg else {
        return true;
    };
    gadget.effect.operand(query.role) == Some(reg)
        || (query.switch_roles && gadget.effect.operand(query.role.other()) == Some(reg))
}

impl<'a> RopChainBuilder<'a> {
    /// Best-ranked gadget for `query`, or `None`.
    ///
    /// A returned gadget's (binary, section) pair is registered in the
    /// used-binaries table.
    pub fn find(&mut self, query: Query, c: Constraints) -> Option<&'a Gadget> {
        let catalogue = self.catalogue;
        for quality in 1..=MAX_QUALITY {
            for binary in catalogue.binaries() {
                let hit = binary.gadgets.iter().find(|g| {
                    g.effect.category() == query.category
                        && g.quality == quality
                        && admissible(g, &query, &c)
                        && matches_reg(g, &query)
                });
                if let Some(gadget) = hit {
                    debug!(
                        category = ?query.category,
                        reg = ?query.reg,
                        quality,
                        "selected {}",
                        gadget
                    );
                    self.used.index_of(&gadget.binary, &gadget.section);
                    return Some(gadget);
                }
            }
        }
        debug!(category = ?query.category, reg = ?query.reg, ?c, "no gadget");
        None
    }
}
