//! ropforge is an x86_64 ROP chain compiler written in Rust.
//!
//! Loads ELF or raw images, catalogues their `ret`-terminated gadgets
//! and synthesizes complete chains for a syscall goal, working around
//! bad bytes and register clobbers along the way. Chains are emitted as
//! standalone python3 scripts (with a rebasing helper per binary) or as
//! raw payload bytes.
//!
//! # Module overview
//!
//! ## Catalogue
//!
//! - [`error`]: Error types used throughout the crate.
//! - [`types`]: Registers, register sets, bad-byte sets.
//! - [`gadget`]: Classified gadgets and their typed effects.
//! - [`classify`]: Effect and quality classification of decoded instructions.
//! - [`rop`]: Binary loading, gadget scanning, opcode and `jmp reg` search.
//! - [`catalogue`]: Per-binary gadget catalogue.
//!
//! ## Chain construction
//!
//! - [`builder`]: Build state shared by all construction steps.
//! - [`select`]: Gadget selection under register constraints.
//! - [`fragment`]: Chain fragments and the used-binaries rebase table.
//! - [`materialize`]: Loading values while avoiding bad bytes.
//! - [`memory`]: Write-what-where and load-from-address primitives.
//! - [`solver`]: Clobber-aware ordering of register goals.
//! - [`emit`]: Script and payload rendering.
//! - [`goals`]: `execve` and `mprotect` chain generators.

pub mod error;
pub mod types;
pub mod gadget;
pub mod classify;
pub mod rop;
pub mod catalogue;

pub mod builder;
pub mod select;
pub mod fragment;
pub mod materialize;
pub mod memory;
pub mod solver;
pub mod emit;
pub mod goals;
