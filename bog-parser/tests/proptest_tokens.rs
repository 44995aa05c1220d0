// bog-parser - Property-based tests for the tokenizer
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Property-based tests for the tokenizer.
//!
//! Tests the following properties:
//! - Token spans slice the source exactly and in order, so concatenating
//!   slices plus the whitespace between them reconstructs the source
//! - Number and identifier literals round-trip
//! - The tokenizer never panics, whatever bytes it is fed

use bog_parser::{tokenize, Errors, TokenKind};
use proptest::prelude::*;

fn arb_ident() -> impl Strategy<Value = String> {
    "[a-zA-Z_][a-zA-Z0-9_]{0,10}".prop_filter("keywords tokenize differently", |s| {
        !matches!(
            s.as_str(),
            "not" | "and" | "or" | "let" | "continue" | "break" | "return" | "if" | "else"
                | "false" | "true" | "for" | "while" | "match" | "catch" | "try" | "error"
                | "import" | "is" | "as" | "in" | "fn" | "_"
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Joining fragments with spaces, every token's span slices its own
    /// fragment back out of the source.
    #[test]
    fn spans_reconstruct_the_source(fragments in prop::collection::vec(arb_ident(), 1..20)) {
        let source = fragments.join(" ");
        let mut errors = Errors::new();
        let tokens = tokenize(&source, &mut errors).unwrap();
        // All tokens except the trailing Eof.
        prop_assert_eq!(tokens.len(), fragments.len() + 1);
        for (token, fragment) in tokens.iter().zip(&fragments) {
            let slice = &source[token.start as usize..token.end as usize];
            prop_assert_eq!(slice, fragment.as_str());
        }
        // Spans are ordered and non-overlapping.
        for pair in tokens.windows(2) {
            prop_assert!(pair[0].end <= pair[1].start);
        }
    }

    /// Nonnegative decimal literals round-trip through the tokenizer.
    #[test]
    fn int_literals_roundtrip(value in 0i64..i64::MAX) {
        let source = value.to_string();
        let mut errors = Errors::new();
        let tokens = tokenize(&source, &mut errors).unwrap();
        prop_assert_eq!(&tokens[0].kind, &TokenKind::Int(value));
    }

    /// Hex, octal and binary renderings agree with the decimal value.
    #[test]
    fn radix_literals_agree(value in 0i64..=0xFF_FFFFi64) {
        for source in [format!("{:#x}", value), format!("{:#o}", value), format!("{:#b}", value)] {
            let mut errors = Errors::new();
            let tokens = tokenize(&source, &mut errors).unwrap();
            prop_assert_eq!(&tokens[0].kind, &TokenKind::Int(value));
        }
    }

    /// String literals preserve their (escape-free) content.
    #[test]
    fn plain_string_literals_roundtrip(content in "[a-zA-Z0-9 ,.:;!?+*-]{0,30}") {
        let source = format!("\"{}\"", content);
        let mut errors = Errors::new();
        let tokens = tokenize(&source, &mut errors).unwrap();
        prop_assert_eq!(&tokens[0].kind, &TokenKind::Str(content));
    }

    /// Arbitrary input never panics; it either tokenizes or reports one
    /// diagnostic.
    #[test]
    fn tokenizer_never_panics(source in ".{0,200}") {
        let mut errors = Errors::new();
        let result = tokenize(&source, &mut errors);
        if result.is_err() {
            prop_assert!(!errors.is_empty());
        }
    }
}
