// bog-embed - Embedding API for the Bog scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! # bog-embed
//!
//! A high-level embedding API for the Bog scripting language.
//!
//! This crate wraps the `bog-vm` pipeline behind a small, ergonomic
//! interface: evaluate source, register Rust functions, convert between
//! Rust values and Bog values, and call functions exported by scripts.
//!
//! ## Quick Start
//!
//! ```rust
//! use bog_embed::Engine;
//!
//! let mut engine = Engine::new();
//! let result = engine.eval("return 1 + 2").unwrap();
//! assert_eq!(result.to_string(), "3");
//! ```
//!
//! ## Registering Native Functions
//!
//! ```rust
//! use bog_embed::{BogValue, Engine};
//!
//! let mut engine = Engine::new();
//! engine.register_native("double", Some(1), |args| match args[0] {
//!     BogValue::Int(n) => Ok(BogValue::Int(n * 2)),
//!     _ => Err(bog_embed::Error::Runtime),
//! });
//! let result = engine.eval("return double(21)").unwrap();
//! assert_eq!(result, BogValue::Int(42));
//! ```

mod convert;
mod engine;

pub use convert::{snapshot, BogValue, FromBog, IntoBog};
pub use engine::Engine;

// Re-export the useful core surface.
pub use bog_parser::Errors;
pub use bog_vm::{Error, Options, Result};
