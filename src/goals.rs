//! Goal generators: complete chains for `execve` and `mprotect`.
//!
//! Each generator turns its options into register goals, lets the
//! solver order them, then appends a syscall trigger. Missing trigger
//! pieces become placeholders the operator fills in by hand; malformed
//! options fail before any search.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use crate::builder::{BuildOptions, RopChainBuilder};
use crate::catalogue::{Catalogue, CodeSearch};
use crate::emit::Chain;
use crate::error::{Error, Result};
use crate::fragment::{ChainLine, Fragment};
use crate::gadget::Category;
use crate::memory::Location;
use crate::select::{Constraints, Query};
use crate::solver::SubGoal;
use crate::types::{to_hex, RegSet, X64Reg};

pub const EXECVE_SYSCALL: u64 = 59;
pub const MPROTECT_SYSCALL: u64 = 10;
/// PROT_READ | PROT_WRITE | PROT_EXEC
pub const PROT_RWX: u64 = 7;

/// Stand-in for a NUL-pointing address the operator did not supply.
pub const NULL_MARKER: u64 = 0x4242_4242_4242_4242;
pub const DEFAULT_CMD: &str = "/bin/sh";
pub const SYSCALL_OPCODE: &str = "0f05";

/// `int3` sled placed after an mprotect chain.
pub const SHELLCODE_LEN: usize = 100;
const SHELLCODE_BYTE: u8 = 0xcc;

pub const SYSCALL_PLACEHOLDER: &str = "INSERT SYSCALL GADGET HERE";
pub const JMP_RSP_PLACEHOLDER: &str = "ADD HERE JMP RSP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalName {
    Execve,
    Mprotect,
}

impl FromStr for GoalName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "execve" => Ok(GoalName::Execve),
            "mprotect" => Ok(GoalName::Mprotect),
            other => Err(Error::InvalidOption(format!(
                "unknown goal '{other}' (expected execve or mprotect)"
            ))),
        }
    }
}

impl fmt::Display for GoalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoalName::Execve => f.write_str("execve"),
            GoalName::Mprotect => f.write_str("mprotect"),
        }
    }
}

/// Raw option strings as given by the caller.
#[derive(Debug, Clone, Default)]
pub struct GoalOptions {
    pub cmd: Option<String>,
    pub address: Option<String>,
    pub nulladdress: Option<String>,
    pub size: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GoalRequest {
    pub goal: GoalName,
    pub options: GoalOptions,
}

/// Build the chain for `request` from `catalogue`.
pub fn build(catalogue: &Catalogue, request: &GoalRequest, options: &BuildOptions) -> Result<Chain> {
    match request.goal {
        GoalName::Execve => execve(catalogue, &request.options, options),
        GoalName::Mprotect => mprotect(catalogue, &request.options, options),
    }
}

fn address_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]{1,8}$").expect("static regex"))
}

fn size_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]+$").expect("static regex"))
}

/// Parse a hex option value, with or without a `0x` prefix.
pub fn parse_hex(name: &str, value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16)
        .map_err(|_| Error::InvalidOption(format!("{name} has to be a hex number: '{value}'")))
}

/// Prefix `cmd` with slashes up to a whole number of words.
pub fn pad_command(cmd: &str) -> Vec<u8> {
    let rem = cmd.len() % 8;
    let mut out = if rem == 0 { Vec::new() } else { vec![b'/'; 8 - rem] };
    out.extend_from_slice(cmd.as_bytes());
    out
}

fn execve(catalogue: &Catalogue, opts: &GoalOptions, options: &BuildOptions) -> Result<Chain> {
    let cmd = opts.cmd.as_deref().unwrap_or(DEFAULT_CMD);
    if cmd.contains(' ') {
        return Err(Error::InvalidOption(
            "no argument support for execve commands".into(),
        ));
    }
    let address = opts
        .address
        .as_deref()
        .map(|a| parse_hex("address", a))
        .transpose()?;
    let nulladdress = opts
        .nulladdress
        .as_deref()
        .map(|a| parse_hex("nulladdress", a))
        .transpose()?;
    let primary = catalogue
        .primary()
        .ok_or_else(|| Error::Binary("no binary loaded".into()))?;

    info!("building execve(\"{cmd}\"): rax = 59, rdi -> command, rsi and rdx -> null");
    let mut b = RopChainBuilder::new(catalogue, options.bad_bytes);
    let mut body = Fragment::new();

    let goals = match address {
        None => {
            let data = primary.section(".data").ok_or_else(|| {
                Error::chain("cannot build write-what-where gadget: no .data section and no address given")
            })?;
            let command = pad_command(cmd);
            let rebase = b.rebase_index(&primary.name, ".data");
            let cmd_at = Location::Rebased { rebase, addr: data.offset };
            let null_at = cmd_at.offset(command.len() as u64);

            info!("writing command into .data");
            let write = b
                .write_string_where(&command, cmd_at, RegSet::empty())
                .map_err(|e| Error::chain(format!("cannot build write-what-where gadget: {}", e.reason())))?;
            body.append(write);
            body.append(write_null_word(&mut b, null_at)?);

            vec![
                SubGoal::address(X64Reg::Rdi, cmd_at),
                SubGoal::address(X64Reg::Rsi, null_at),
                SubGoal::address(X64Reg::Rdx, null_at),
                SubGoal::number(X64Reg::Rax, EXECVE_SYSCALL),
            ]
        }
        Some(cmd_addr) => {
            let null = nulladdress.unwrap_or_else(|| {
                warn!(
                    "no address of a null word given, using {}; replace that value",
                    to_hex(NULL_MARKER)
                );
                NULL_MARKER
            });
            vec![
                SubGoal::number(X64Reg::Rdi, cmd_addr),
                SubGoal::number(X64Reg::Rsi, null),
                SubGoal::number(X64Reg::Rdx, null),
                SubGoal::number(X64Reg::Rax, EXECVE_SYSCALL),
            ]
        }
    };

    info!("filling registers without clobbering earlier ones");
    let solution = b.order(&goals, options)?;
    body.append(solution.fragment);
    syscall_trigger(&mut b, &mut body)?;

    let mut chain = b.into_chain(body)?;
    chain.complete &= solution.complete;
    Ok(chain)
}

/// Zero some register and store it at `at`. A register whose value
/// cannot be written out is excluded and another one tried.
fn write_null_word(b: &mut RopChainBuilder<'_>, at: Location) -> Result<Fragment> {
    let mut bad = RegSet::empty();
    loop {
        let zero = b
            .materialize(0, None, bad, RegSet::empty())
            .map_err(|e| Error::chain(format!("cannot write null word: {}", e.reason())))?;
        match b.write_reg_value_where(zero.reg, at, RegSet::empty()) {
            Ok(write) => {
                let mut fragment = zero.fragment;
                fragment.append(write);
                return Ok(fragment);
            }
            Err(e) if e.is_chain_failure() => bad.insert(zero.reg),
            Err(e) => return Err(e),
        }
    }
}

fn mprotect(catalogue: &Catalogue, opts: &GoalOptions, options: &BuildOptions) -> Result<Chain> {
    let address = opts
        .address
        .as_deref()
        .ok_or_else(|| Error::InvalidOption("missing parameter: address".into()))?;
    let size = opts
        .size
        .as_deref()
        .ok_or_else(|| Error::InvalidOption("missing parameter: size".into()))?;
    if !address_pattern().is_match(address) {
        return Err(Error::InvalidOption(format!(
            "address has to be a hex number of at most 8 digits: '{address}'"
        )));
    }
    if !size_pattern().is_match(size) {
        return Err(Error::InvalidOption(format!("size has to be a hex number: '{size}'")));
    }
    let address = parse_hex("address", address)?;
    let size = parse_hex("size", size)?;

    info!(
        "building mprotect({}, {}, rwx): rax = 10, rdi = address, rsi = size, rdx = 7",
        to_hex(address),
        to_hex(size)
    );
    let mut b = RopChainBuilder::new(catalogue, options.bad_bytes);
    let goals = [
        SubGoal::number(X64Reg::Rdi, address),
        SubGoal::number(X64Reg::Rsi, size),
        SubGoal::number(X64Reg::Rdx, PROT_RWX),
        SubGoal::number(X64Reg::Rax, MPROTECT_SYSCALL),
    ];
    let solution = b.order(&goals, options)?;
    let mut body = solution.fragment;
    syscall_trigger(&mut b, &mut body)?;

    info!("looking for jmp rsp");
    let jmp = catalogue
        .primary()
        .and_then(|p| p.search_jmp_reg(X64Reg::Rsp).into_iter().next());
    match jmp {
        Some(location) => {
            info!("jmp rsp found at {:#x}", location.addr);
            b.emit_location(&mut body, &location);
        }
        None => {
            warn!("no jmp rsp found; add one by hand");
            body.push(ChainLine::Placeholder(JMP_RSP_PLACEHOLDER.into()));
        }
    }

    let mut chain = b
        .into_chain(body)?
        .with_shellcode(vec![SHELLCODE_BYTE; SHELLCODE_LEN]);
    chain.complete &= solution.complete;
    Ok(chain)
}

/// Append the syscall: a catalogued gadget, else a bare `syscall`
/// opcode in the first binary, else a placeholder.
fn syscall_trigger(b: &mut RopChainBuilder<'_>, body: &mut Fragment) -> Result<()> {
    info!("looking for syscall gadget");
    if let Some(gadget) = b.find(Query::new(Category::Syscall), Constraints::none()) {
        info!("syscall gadget found");
        b.emit(body, gadget, None);
        return Ok(());
    }

    info!("no syscall gadget found, looking for syscall opcode");
    let location = match b.catalogue().primary() {
        Some(primary) => primary.search_opcode(SYSCALL_OPCODE)?.into_iter().next(),
        None => None,
    };
    match location {
        Some(location) => {
            info!("syscall opcode found at {:#x}", location.addr);
            b.emit_location(body, &location);
        }
        None => {
            warn!("syscall opcode not found; add a syscall by hand");
            body.push(ChainLine::Placeholder(SYSCALL_PLACEHOLDER.into()));
        }
    }
    Ok(())
}
