// bog-vm - Bytecode compiler and virtual machine for the Bog scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Bytecode compiler and register-based virtual machine for Bog.
//!
//! This crate takes the AST produced by `bog-parser`, lowers it to a compact
//! byte-encoded [`module::Module`], and executes it on a register machine
//! with a mark-sweep garbage collector. Hosts embed the VM through
//! [`vm::Vm`] (or the higher-level `bog-embed` crate).

pub mod bytecode;
pub mod compiler;
pub mod gc;
pub mod module;
pub mod value;
pub mod vm;

use std::fmt;
use std::io;

pub use bytecode::Op;
pub use compiler::compile;
pub use gc::{Gc, Ref};
pub use module::Module;
pub use value::Value;
pub use vm::{NativeFn, Options, Vm};

/// Failure kinds surfaced to the host.
///
/// The kinds are disjoint; rendered messages live in the shared
/// [`bog_parser::Errors`] list the failing `Vm` owns.
#[derive(Debug)]
pub enum Error {
    /// Invalid source byte, escape or number.
    Tokenize,
    /// Unexpected token or missing production.
    Parse,
    /// Semantic lowering failure.
    Compile,
    /// VM semantic violation (type mismatch, bad arg count, ...).
    Runtime,
    /// Bytecode encoding invariants violated.
    MalformedByteCode,
    /// The value heap exceeded its limit.
    OutOfMemory,
    /// Operating system error while reading a module.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Tokenize => write!(f, "tokenize error"),
            Error::Parse => write!(f, "parse error"),
            Error::Compile => write!(f, "compile error"),
            Error::Runtime => write!(f, "runtime error"),
            Error::MalformedByteCode => write!(f, "malformed bytecode"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for VM operations.
pub type Result<T> = std::result::Result<T, Error>;
