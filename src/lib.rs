//! **procsym** resolves sampled instruction pointer addresses of live
//! processes to symbols.
//!
//! The crate revolves around three types:
//! - [`SymCache`] is the process wide cache of parsed symbol tables,
//!   constructed once and shared by all views.
//! - [`ProcessSymbols`] is the per-process view: it tracks the
//!   process' memory mappings ([`ProcessSymbols::refresh`]) and
//!   resolves addresses against them ([`ProcessSymbols::resolve`]).
//! - [`Sym`] is the result of a successful resolution.
//!
//! Resolution never performs I/O for binaries whose tables are already
//! cached, and per-sample failures degrade to "unresolved" instead of
//! surfacing errors: one bad frame must not abort an entire stack's
//! symbolication.

#![doc = include_str!("../README.md")]

mod buildid;
mod cache;
mod demangle;
mod elf;
mod error;
mod gosym;
mod maps;
mod mmap;
mod pid;
mod process;
mod symtab;
#[cfg(test)]
mod test_helper;
mod util;

pub use crate::cache::Builder;
pub use crate::cache::SymCache;
pub use crate::error::Error;
pub use crate::error::ErrorExt;
pub use crate::error::ErrorKind;
pub use crate::error::Result;
pub use crate::pid::Pid;
pub use crate::process::ProcessSymbols;
pub use crate::process::Sym;

pub(crate) use crate::error::IntoError;


/// A type representing addresses, be they virtual addresses of a
/// process or virtual offsets within a binary.
pub type Addr = u64;
