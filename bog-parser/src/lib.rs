// bog-parser - Tokenizer and parser for the Bog scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! # bog-parser
//!
//! Tokenizer and parser for the Bog scripting language.
//! Produces an arena-allocated [`ast::Tree`] from source code, recording
//! diagnostics into a shared [`errors::Errors`] list.

pub mod ast;
pub mod errors;
pub mod lexer;
pub mod parser;

pub use ast::{InfixOp, Node, NodeId, NodeKind, PrefixOp, Tree, TypeName};
pub use errors::{line_column, Diagnostic, ErrorKind, Errors};
pub use lexer::{tokenize, Token, TokenKind, Tokenizer, TokenizeFailed};
pub use parser::{parse, parse_tokens, ParseFailed};
