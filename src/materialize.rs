//! Value materialization.
//!
//! Gets an arbitrary 64-bit value into a register without ever placing
//! a bad byte on the stack. Strategies are tried in order; the first
//! one that succeeds wins and, when all of them fail, the error lists
//! every attempt.

use std::fmt;

use tracing::debug;

use crate::builder::RopChainBuilder;
use crate::error::{Error, Result};
use crate::fragment::{ChainLine, Fragment};
use crate::gadget::{Category, Gadget, Role};
use crate::select::{Constraints, Query};
use crate::types::{to_hex, BadBytes, RegSet, X64Reg};

/// Values below this are built by incrementing.
pub const SMALL_VALUE_LIMIT: u64 = 50;

/// Filler words for the arithmetic strategies come from this range.
pub const FILLER_START: u64 = 0x0101_0101_0101_0101;
pub const FILLER_END: u64 = 0x0202_0202_0202_0202;

const FILLER_PROBES: usize = 1 << 20;

/// How a value ended up in its register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Direct,
    Negate,
    ClearIncrement,
    MinusOneIncrement,
    Subtract,
    Add,
    Exchange,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Direct => "direct load",
            Method::Negate => "negation",
            Method::ClearIncrement => "clear and increment",
            Method::MinusOneIncrement => "minus one and increment",
            Method::Subtract => "subtraction",
            Method::Add => "addition",
            Method::Exchange => "exchange",
        };
        f.write_str(s)
    }
}

/// A fragment that leaves a value in `reg`.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub fragment: Fragment,
    pub reg: X64Reg,
    pub method: Method,
}

#[derive(Debug, Clone, Copy)]
struct Target {
    value: u64,
    reg: Option<X64Reg>,
    bad: RegSet,
    dont_modify: RegSet,
    exchange: bool,
}

impl Target {
    fn constraints(&self) -> Constraints {
        Constraints::dont_modify(self.dont_modify).with_bad(self.bad)
    }
}

type StrategyFn<'a> = fn(&mut RopChainBuilder<'a>, Target) -> Result<Loaded>;

fn describe(reg: Option<X64Reg>) -> String {
    reg.map_or_else(|| "any register".to_string(), |r| r.to_string())
}

fn dst_of(gadget: &Gadget) -> Result<X64Reg> {
    gadget
        .effect
        .dst()
        .ok_or_else(|| Error::chain(format!("{gadget} has no destination")))
}

fn pair_of(gadget: &Gadget) -> Result<(X64Reg, X64Reg)> {
    match (gadget.effect.dst(), gadget.effect.src()) {
        (Some(dst), Some(src)) => Ok((dst, src)),
        _ => Err(Error::chain(format!("{gadget} has no register pair"))),
    }
}

impl<'a> RopChainBuilder<'a> {
    /// Load `value` into `reg` (or any free register when `None`).
    ///
    /// `bad` lists registers that must not be chosen or clobbered;
    /// `dont_modify` lists registers no gadget side effect may write.
    pub fn materialize(
        &mut self,
        value: u64,
        reg: Option<X64Reg>,
        bad: RegSet,
        dont_modify: RegSet,
    ) -> Result<Loaded> {
        // A free choice must also stay clear of protected registers.
        let bad = if reg.is_none() { bad.union(dont_modify) } else { bad };
        self.materialize_target(Target {
            value,
            reg,
            bad,
            dont_modify,
            exchange: true,
        })
    }

    fn strategies() -> [(Method, StrategyFn<'a>); 7] {
        [
            (Method::Direct, direct),
            (Method::Negate, negate),
            (Method::ClearIncrement, clear_and_increment),
            (Method::MinusOneIncrement, minus_one_and_increment),
            (Method::Subtract, subtract),
            (Method::Add, add),
            (Method::Exchange, exchange),
        ]
    }

    fn materialize_target(&mut self, t: Target) -> Result<Loaded> {
        let mut failures = Vec::new();
        for (method, strategy) in Self::strategies() {
            if method == Method::Exchange && !t.exchange {
                continue;
            }
            match strategy(self, t) {
                Ok(loaded) => {
                    debug!(value = %to_hex(t.value), reg = %loaded.reg, %method, "materialized");
                    return Ok(loaded);
                }
                Err(e) if e.is_chain_failure() => failures.push(format!("{method}: {}", e.reason())),
                Err(e) => return Err(e),
            }
        }
        Err(Error::chain(format!(
            "cannot load {} into {} ({})",
            to_hex(t.value),
            describe(t.reg),
            failures.join("; ")
        )))
    }

    /// Pop `word` into `reg` with a single LOAD_REG gadget.
    pub(crate) fn pop_word(
        &mut self,
        word: ChainLine,
        reg: Option<X64Reg>,
        c: Constraints,
    ) -> Result<Loaded> {
        let gadget = self
            .find(Query::new(Category::LoadReg).maybe_reg(reg), c)
            .ok_or_else(|| Error::chain(format!("no pop gadget for {}", describe(reg))))?;
        let reg = dst_of(gadget)?;
        let mut fragment = Fragment::new();
        self.emit(&mut fragment, gadget, Some(word));
        Ok(Loaded { fragment, reg, method: Method::Direct })
    }

    /// Select gadgets for `query` until `finish` succeeds with one.
    ///
    /// After each failure the gadget's `exclude` operand is barred from
    /// the remaining attempts. The destination is only barred while the
    /// target register is free.
    fn select_retrying<F>(&mut self, query: Query, t: Target, exclude: Role, mut finish: F) -> Result<Loaded>
    where
        F: FnMut(&mut Self, &'a Gadget) -> Result<Loaded>,
    {
        let mut c = t.constraints();
        let mut last: Option<Error> = None;
        loop {
            let Some(gadget) = self.find(query, c) else {
                return Err(last.unwrap_or_else(|| {
                    Error::chain(format!("no {:?} gadget for {}", query.category, describe(t.reg)))
                }));
            };
            let err = match finish(self, gadget) {
                Ok(loaded) => return Ok(loaded),
                Err(e) if e.is_chain_failure() => e,
                Err(e) => return Err(e),
            };
            let barred = match exclude {
                Role::Dst if t.reg.is_none() => gadget.effect.dst(),
                Role::Src => gadget.effect.src(),
                Role::Dst => None,
            };
            let Some(reg) = barred else {
                return Err(err);
            };
            match exclude {
                Role::Dst => c.bad_dst.insert(reg),
                Role::Src => c.bad_src.insert(reg),
            }
            last = Some(err);
        }
    }

    fn increment(&mut self, frag: &mut Fragment, reg: X64Reg, times: u64, dont_modify: RegSet) -> Result<()> {
        if times == 0 {
            return Ok(());
        }
        let inc = self
            .find(Query::new(Category::IncReg).reg(reg), Constraints::dont_modify(dont_modify))
            .ok_or_else(|| Error::chain(format!("no inc gadget for {reg}")))?;
        for _ in 0..times {
            self.emit(frag, inc, None);
        }
        Ok(())
    }

    /// Pop `dst_value` into `dst` and `src_value` into `src`, then apply `gadget`.
    fn load_pair_and_apply(
        &mut self,
        gadget: &Gadget,
        (dst, dst_value): (X64Reg, u64),
        (src, src_value): (X64Reg, u64),
        t: Target,
        method: Method,
    ) -> Result<Loaded> {
        let first = self.pop_word(
            ChainLine::Value(dst_value),
            Some(dst),
            Constraints::dont_modify(t.dont_modify).with_bad_dst(t.bad),
        )?;
        let second = self.pop_word(
            ChainLine::Value(src_value),
            Some(src),
            Constraints::dont_modify(t.dont_modify.with(dst)).with_bad_dst(t.bad.with(dst)),
        )?;
        let mut fragment = first.fragment;
        fragment.append(second.fragment);
        self.emit(&mut fragment, gadget, None);
        Ok(Loaded { fragment, reg: dst, method })
    }
}

fn direct(b: &mut RopChainBuilder<'_>, t: Target) -> Result<Loaded> {
    if b.bad_bytes.contains(t.value) {
        return Err(Error::chain(format!("{} contains a bad byte", to_hex(t.value))));
    }
    b.pop_word(ChainLine::Value(t.value), t.reg, t.constraints())
}

fn negate(b: &mut RopChainBuilder<'_>, t: Target) -> Result<Loaded> {
    let negated = t.value.wrapping_neg();
    if t.value == 0 || b.bad_bytes.contains(negated) {
        return Err(Error::chain(format!("negation {} is not usable", to_hex(negated))));
    }
    b.select_retrying(Query::new(Category::NegReg).maybe_reg(t.reg), t, Role::Dst, |b, neg| {
        let reg = dst_of(neg)?;
        let mut loaded = b.pop_word(ChainLine::Value(negated), Some(reg), t.constraints())?;
        b.emit(&mut loaded.fragment, neg, None);
        loaded.method = Method::Negate;
        Ok(loaded)
    })
}

fn clear_and_increment(b: &mut RopChainBuilder<'_>, t: Target) -> Result<Loaded> {
    if t.value >= SMALL_VALUE_LIMIT {
        return Err(Error::chain(format!("{} is too large to increment", to_hex(t.value))));
    }
    let query = Query::new(Category::ClearReg).maybe_reg(t.reg).src_eq_dst();
    b.select_retrying(query, t, Role::Dst, |b, clear| {
        let reg = dst_of(clear)?;
        let mut fragment = Fragment::new();
        b.emit(&mut fragment, clear, None);
        b.increment(&mut fragment, reg, t.value, t.dont_modify)?;
        Ok(Loaded { fragment, reg, method: Method::ClearIncrement })
    })
}

fn minus_one_and_increment(b: &mut RopChainBuilder<'_>, t: Target) -> Result<Loaded> {
    if t.value >= SMALL_VALUE_LIMIT {
        return Err(Error::chain(format!("{} is too large to increment", to_hex(t.value))));
    }
    if b.bad_bytes.contains(u64::MAX) {
        return Err(Error::chain("all-ones word contains a bad byte"));
    }
    b.select_retrying(Query::new(Category::IncReg).maybe_reg(t.reg), t, Role::Dst, |b, inc| {
        let reg = dst_of(inc)?;
        let mut loaded = b.pop_word(ChainLine::Value(u64::MAX), Some(reg), t.constraints())?;
        for _ in 0..=t.value {
            b.emit(&mut loaded.fragment, inc, None);
        }
        loaded.method = Method::MinusOneIncrement;
        Ok(loaded)
    })
}

fn subtract(b: &mut RopChainBuilder<'_>, t: Target) -> Result<Loaded> {
    let filler = filler_for_sub(&b.bad_bytes, t.value)
        .ok_or_else(|| Error::chain(format!("no filler for subtracting to {}", to_hex(t.value))))?;
    b.select_retrying(Query::new(Category::SubReg).maybe_reg(t.reg), t, Role::Src, |b, sub| {
        let (dst, src) = pair_of(sub)?;
        // dst - src == value
        b.load_pair_and_apply(
            sub,
            (dst, filler.wrapping_add(t.value)),
            (src, filler),
            t,
            Method::Subtract,
        )
    })
}

fn add(b: &mut RopChainBuilder<'_>, t: Target) -> Result<Loaded> {
    let filler = filler_for_add(&b.bad_bytes, t.value)
        .ok_or_else(|| Error::chain(format!("no filler for adding to {}", to_hex(t.value))))?;
    b.select_retrying(Query::new(Category::AddReg).maybe_reg(t.reg), t, Role::Src, |b, add| {
        let (dst, src) = pair_of(add)?;
        b.load_pair_and_apply(
            add,
            (dst, t.value.wrapping_sub(filler)),
            (src, filler),
            t,
            Method::Add,
        )
    })
}

fn exchange(b: &mut RopChainBuilder<'_>, t: Target) -> Result<Loaded> {
    let Some(target) = t.reg else {
        return Err(Error::chain("exchange needs a target register"));
    };
    let query = Query::new(Category::XchgReg).reg(target).switch_roles();
    let mut c = t.constraints();
    let mut last: Option<Error> = None;
    loop {
        let Some(xchg) = b.find(query, c) else {
            return Err(last.unwrap_or_else(|| Error::chain(format!("no xchg gadget for {target}"))));
        };
        let (dst, src) = pair_of(xchg)?;
        let (other, role) = if dst == target { (src, Role::Src) } else { (dst, Role::Dst) };
        let result = if other == target {
            Err(Error::chain(format!("{xchg} exchanges {target} with itself")))
        } else {
            b.materialize_target(Target {
                reg: Some(other),
                exchange: false,
                ..t
            })
        };
        match result {
            Ok(mut loaded) => {
                b.emit(&mut loaded.fragment, xchg, None);
                loaded.reg = target;
                loaded.method = Method::Exchange;
                return Ok(loaded);
            }
            Err(e) if e.is_chain_failure() => last = Some(e),
            Err(e) => return Err(e),
        }
        match role {
            Role::Src => c.bad_src.insert(other),
            Role::Dst => c.bad_dst.insert(other),
        }
    }
}

/// Distance to the next `x` (counting up) whose highest bad byte changed.
fn skip_up(bad: &BadBytes, x: u64) -> Option<u64> {
    let i = (0..8).rev().find(|&i| bad.is_bad((x >> (8 * i)) as u8))?;
    let unit = 1u64 << (8 * i);
    Some(unit - (x & (unit - 1)))
}

/// Distance to the next `x` (counting down) whose highest bad byte changed.
fn skip_down(bad: &BadBytes, x: u64) -> Option<u64> {
    let i = (0..8).rev().find(|&i| bad.is_bad((x >> (8 * i)) as u8))?;
    let unit = 1u64 << (8 * i);
    Some((x & (unit - 1)) + 1)
}

/// First filler `f` in the filler range for which both `f` and
/// `partner(f, value)` are free of bad bytes. Candidates skipped are
/// exactly those that would still carry a bad byte.
fn filler_search(
    bad: &BadBytes,
    value: u64,
    partner: fn(u64, u64) -> u64,
    partner_skip: fn(&BadBytes, u64) -> Option<u64>,
) -> Option<u64> {
    let mut f = FILLER_START;
    for _ in 0..FILLER_PROBES {
        if f >= FILLER_END {
            return None;
        }
        let own = skip_up(bad, f);
        let other = partner_skip(bad, partner(f, value));
        match (own, other) {
            (None, None) => return Some(f),
            (a, b) => f = f.checked_add(a.unwrap_or(1).max(b.unwrap_or(1)))?,
        }
    }
    None
}

/// Filler for the subtraction strategy: `f` and `f + value` are clean.
pub fn filler_for_sub(bad: &BadBytes, value: u64) -> Option<u64> {
    filler_search(bad, value, |f, v| f.wrapping_add(v), skip_up)
}

/// Filler for the addition strategy: `f` and `value - f` are clean.
pub fn filler_for_add(bad: &BadBytes, value: u64) -> Option<u64> {
    filler_search(bad, value, |f, v| v.wrapping_sub(f), skip_down)
}
