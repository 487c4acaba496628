//! Dependency chain solver.
//!
//! Register goals are realized one after another, each constrained to
//! leave the registers set by earlier goals alone. The solver searches
//! orders depth-first in lexicographic order and remembers every
//! (earlier goals, next goal) combination that failed, so a failing
//! prefix is never realized twice.

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, warn};

use crate::builder::{BuildOptions, RopChainBuilder};
use crate::error::{Error, Result};
use crate::fragment::{ChainLine, Fragment};
use crate::memory::Location;
use crate::types::{to_hex, RegSet, X64Reg};

/// Largest number of goals one search accepts.
pub const MAX_GOALS: usize = 64;

/// What one sub-goal leaves in its register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegGoal {
    /// A literal value.
    Number { reg: X64Reg, value: u64 },
    /// The address of `at`.
    Address { reg: X64Reg, at: Location },
    /// The word stored at `from`.
    LoadFrom { reg: X64Reg, from: Location },
}

impl RegGoal {
    pub fn reg(&self) -> X64Reg {
        match *self {
            RegGoal::Number { reg, .. } | RegGoal::Address { reg, .. } | RegGoal::LoadFrom { reg, .. } => reg,
        }
    }
}

impl fmt::Display for RegGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegGoal::Number { reg, value } => write!(f, "{reg} = {}", to_hex(*value)),
            RegGoal::Address { reg, at } => write!(f, "{reg} = &{at:?}"),
            RegGoal::LoadFrom { reg, from } => write!(f, "{reg} = *{from:?}"),
        }
    }
}

/// A goal plus the registers later goals must not clobber once it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubGoal {
    pub goal: RegGoal,
    pub clobbers: RegSet,
}

impl SubGoal {
    /// Protects the goal's own register.
    pub fn new(goal: RegGoal) -> Self {
        Self {
            goal,
            clobbers: RegSet::of(&[goal.reg()]),
        }
    }

    pub fn number(reg: X64Reg, value: u64) -> Self {
        Self::new(RegGoal::Number { reg, value })
    }

    pub fn address(reg: X64Reg, at: Location) -> Self {
        Self::new(RegGoal::Address { reg, at })
    }

    pub fn load_from(reg: X64Reg, from: Location) -> Self {
        Self::new(RegGoal::LoadFrom { reg, from })
    }
}

#[derive(Debug, Clone)]
pub struct Solution {
    pub fragment: Fragment,
    /// Registers set by the fragment, in chain order.
    pub filled: Vec<X64Reg>,
    pub complete: bool,
    /// Orders tried: every failing prefix counts once, as does the final
    /// successful order.
    pub attempts: usize,
}

enum Outcome {
    Solved,
    Exhausted,
    OutOfBudget,
    Failed(Error),
}

struct Search<'g> {
    goals: &'g [SubGoal],
    failed: HashSet<(u64, usize)>,
    dead: HashSet<u64>,
    attempts: usize,
    max_attempts: Option<usize>,
    best: Vec<usize>,
    best_fragment: Fragment,
}

impl Search<'_> {
    fn budget_spent(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempts >= max)
    }

    fn note_progress(&mut self, path: &[(usize, Fragment)]) {
        if path.len() > self.best.len() {
            self.best = path.iter().map(|(i, _)| *i).collect();
            self.best_fragment = concat(path);
        }
    }
}

fn concat(path: &[(usize, Fragment)]) -> Fragment {
    let mut fragment = Fragment::new();
    for (_, frag) in path {
        fragment.append(frag.clone());
    }
    fragment
}

fn reg_names(regs: &[X64Reg]) -> String {
    regs.iter().map(|r| r.name()).collect::<Vec<_>>().join(", ")
}

impl<'a> RopChainBuilder<'a> {
    fn realize(&mut self, goal: &SubGoal, bad: RegSet, dont_modify: RegSet) -> Result<Fragment> {
        match goal.goal {
            RegGoal::Number { reg, value } => self
                .materialize(value, Some(reg), bad, dont_modify)
                .map(|loaded| loaded.fragment),
            RegGoal::Address { reg, at } => self
                .load_location(reg, at, bad, dont_modify)
                .map(|loaded| loaded.fragment),
            RegGoal::LoadFrom { reg, from } => self.load_reg_value_from(reg, from, dont_modify),
        }
    }

    /// Find an order in which every goal can be realized.
    ///
    /// Without `strict`, a search that fails (or runs out of attempts)
    /// returns the longest realizable prefix, headed by a comment naming
    /// the registers it fills.
    pub fn order(&mut self, goals: &[SubGoal], options: &BuildOptions) -> Result<Solution> {
        if goals.len() > MAX_GOALS {
            return Err(Error::Other(format!("too many goals: {}", goals.len())));
        }
        let mut search = Search {
            goals,
            failed: HashSet::new(),
            dead: HashSet::new(),
            attempts: 0,
            max_attempts: options.max_attempts,
            best: Vec::new(),
            best_fragment: Fragment::new(),
        };
        let mut path = Vec::with_capacity(goals.len());
        let outcome = self.descend(&mut search, &mut path, 0);

        match outcome {
            Outcome::Solved => {
                let filled = path.iter().map(|(i, _)| goals[*i].goal.reg()).collect();
                debug!(attempts = search.attempts, "all registers filled");
                return Ok(Solution {
                    fragment: concat(&path),
                    filled,
                    complete: true,
                    attempts: search.attempts,
                });
            }
            Outcome::Failed(e) => return Err(e),
            Outcome::OutOfBudget => warn!(attempts = search.attempts, "attempt budget exhausted"),
            Outcome::Exhausted => {}
        }

        let filled: Vec<X64Reg> = search.best.iter().map(|i| goals[*i].goal.reg()).collect();
        let missing: Vec<X64Reg> = goals
            .iter()
            .map(|g| g.goal.reg())
            .filter(|r| !filled.contains(r))
            .collect();
        if options.strict {
            return Err(Error::chain(format!(
                "cannot fill {} (filled: {})",
                reg_names(&missing),
                reg_names(&filled)
            )));
        }
        warn!(
            "cannot build a complete chain; filled registers: {}",
            reg_names(&filled)
        );
        let mut fragment = Fragment::new();
        fragment.push(ChainLine::Comment(format!("Filled registers: {}", reg_names(&filled))));
        fragment.append(search.best_fragment);
        Ok(Solution {
            fragment,
            filled,
            complete: false,
            attempts: search.attempts,
        })
    }

    fn descend(&mut self, s: &mut Search<'_>, path: &mut Vec<(usize, Fragment)>, mask: u64) -> Outcome {
        let n = s.goals.len();
        if path.len() == n {
            s.attempts += 1;
            return Outcome::Solved;
        }
        if s.dead.contains(&mask) {
            return Outcome::Exhausted;
        }
        let committed = path
            .iter()
            .map(|(i, _)| s.goals[*i].clobbers)
            .fold(RegSet::empty(), RegSet::union);

        for i in 0..n {
            if mask & (1 << i) != 0 || s.failed.contains(&(mask, i)) {
                continue;
            }
            if s.budget_spent() {
                return Outcome::OutOfBudget;
            }
            let goal = s.goals[i];
            match self.realize(&goal, committed, committed.union(goal.clobbers)) {
                Ok(fragment) => {
                    path.push((i, fragment));
                    s.note_progress(path);
                    match self.descend(s, path, mask | (1 << i)) {
                        Outcome::Exhausted => {
                            path.pop();
                        }
                        outcome => return outcome,
                    }
                }
                Err(e) if e.is_chain_failure() => {
                    s.attempts += 1;
                    s.failed.insert((mask, i));
                    debug!(
                        attempt = s.attempts,
                        goal = %goal.goal,
                        after = %reg_names(&path.iter().map(|(j, _)| s.goals[*j].goal.reg()).collect::<Vec<_>>()),
                        "{}",
                        e.reason()
                    );
                }
                Err(e) => return Outcome::Failed(e),
            }
        }
        s.dead.insert(mask);
        Outcome::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{Binary, Catalogue};
    use crate::gadget::{Effect, Gadget};
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

    fn options() -> BuildOptions {
        BuildOptions {
            bad_bytes: BadBytes::none(),
            ..BuildOptions::default()
        }
    }

    #[test]
    fn reorders_around_clobbers() {
        let cat = catalogue(vec![
            pop(0x1000, Rdi),
            make_gadget(0x1010, &["pop rsi", "pop rdi", "ret"], Effect::LoadReg { dst: Rsi }),
        ]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::none());
        let goals = [SubGoal::number(Rdi, 1), SubGoal::number(Rsi, 2)];
        let solution = b.order(&goals, &options()).unwrap();
        assert!(solution.complete);
        assert_eq!(solution.filled, vec![Rsi, Rdi]);
        assert_eq!(solution.attempts, 2);
        assert_eq!(
            solution.fragment.gadget_texts().collect::<Vec<_>>(),
            vec!["pop rsi; pop rdi; ret", "pop rdi; ret"]
        );
        assert_eq!(
            solution.fragment.lines()[1..3],
            [ChainLine::Value(2), ChainLine::Padding]
        );
    }

    #[test]
    fn first_order_wins_when_nothing_clobbers() {
        let cat = catalogue(vec![pop(0x1000, Rdi), pop(0x1010, Rsi), pop(0x1020, Rdx), pop(0x1030, Rax)]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::none());
        let goals = [
            SubGoal::number(Rdi, 1),
            SubGoal::number(Rsi, 2),
            SubGoal::number(Rdx, 3),
            SubGoal::number(Rax, 59),
        ];
        let solution = b.order(&goals, &options()).unwrap();
        assert_eq!(solution.filled, vec![Rdi, Rsi, Rdx, Rax]);
        assert_eq!(solution.attempts, 1);
    }

    #[test]
    fn partial_chain_names_filled_registers() {
        let cat = catalogue(vec![pop(0x1000, Rdi)]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::none());
        let goals = [SubGoal::number(Rdi, 1), SubGoal::number(Rsi, 2)];
        let solution = b.order(&goals, &options()).unwrap();
        assert!(!solution.complete);
        assert_eq!(solution.filled, vec![Rdi]);
        assert_eq!(
            solution.fragment.lines()[0],
            ChainLine::Comment("Filled registers: rdi".into())
        );
        assert_eq!(solution.fragment.literals().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn strict_mode_fails() {
        let cat = catalogue(vec![pop(0x1000, Rdi)]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::none());
        let goals = [SubGoal::number(Rdi, 1), SubGoal::number(Rsi, 2)];
        let opts = BuildOptions { strict: true, ..options() };
        let err = b.order(&goals, &opts).unwrap_err();
        assert!(err.is_chain_failure());
        assert!(err.to_string().contains("rsi"));
    }

    #[test]
    fn unsatisfiable_search_terminates_within_factorial() {
        let cat = catalogue(vec![]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::none());
        let goals = [
            SubGoal::number(Rdi, 1),
            SubGoal::number(Rsi, 2),
            SubGoal::number(Rdx, 3),
            SubGoal::number(Rax, 4),
        ];
        let solution = b.order(&goals, &options()).unwrap();
        assert!(!solution.complete);
        assert!(solution.filled.is_empty());
        // every first goal fails, and failures are never retried
        assert_eq!(solution.attempts, 4);
        assert!(solution.attempts <= 24);
    }

    #[test]
    fn attempt_budget_stops_search() {
        let cat = catalogue(vec![
            pop(0x1000, Rdi),
            make_gadget(0x1010, &["pop rsi", "pop rdi", "ret"], Effect::LoadReg { dst: Rsi }),
        ]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::none());
        let goals = [SubGoal::number(Rdi, 1), SubGoal::number(Rsi, 2)];
        let opts = BuildOptions { max_attempts: Some(1), ..options() };
        let solution = b.order(&goals, &opts).unwrap();
        assert!(!solution.complete);
        assert_eq!(solution.attempts, 1);
        assert_eq!(solution.filled, vec![Rdi]);
    }

    #[test]
    fn memory_load_goes_before_its_address_register_is_set() {
        let cat = catalogue(vec![
            pop(0x1000, Rsi),
            make_gadget(0x1100, &["mov rax, qword ptr [rsi]", "ret"], Effect::LoadMem { dst: Rax, src: Rsi }),
        ]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::none());
        let goals = [
            SubGoal::number(Rsi, 0x1111),
            SubGoal::load_from(Rax, Location::Absolute(0x601010)),
        ];
        let solution = b.order(&goals, &options()).unwrap();
        assert!(solution.complete);
        assert_eq!(solution.filled, vec![Rax, Rsi]);
        assert_eq!(
            solution.fragment.gadget_texts().collect::<Vec<_>>(),
            vec!["pop rsi; ret", "mov rax, qword ptr [rsi]; ret", "pop rsi; ret"]
        );
        assert_eq!(solution.fragment.literals().collect::<Vec<_>>(), vec![0x601010, 0x1111]);
    }

    #[test]
    fn address_goals_emit_rebased_lines() {
        let cat = catalogue(vec![pop(0x1000, Rdi)]);
        let mut b = RopChainBuilder::new(&cat, BadBytes::default());
        let data = b.rebase_index("vuln", ".data");
        let goals = [SubGoal::address(Rdi, Location::Rebased { rebase: data, addr: 0x10 })];
        let solution = b.order(&goals, &BuildOptions::default()).unwrap();
        assert!(solution.complete);
        assert_eq!(
            solution.fragment.lines()[1],
            ChainLine::Rebased { rebase: 0, addr: 0x10 }
        );
    }
}
