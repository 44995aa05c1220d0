// bog-vm - Property-based tests for numeric semantics
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Property-based tests for arithmetic and promotion.
//!
//! Tests the following properties:
//! - `int op int` stays `int`; any `num` operand promotes the result to `num`
//! - `/` always yields `num`, `//` always yields `int` (floored)
//! - Integer overflow is a loud runtime error, never a silent wrap

use bog_vm::value::Value;
use bog_vm::{Error, Vm};
use proptest::prelude::*;

fn eval_value(src: &str) -> Result<Value, Error> {
    let mut vm = Vm::new();
    let result = vm.compile_and_run(src, "prop")?;
    Ok(vm.gc.get(result).clone())
}

/// Small integers that cannot overflow basic operations.
fn arb_small_int() -> impl Strategy<Value = i64> {
    -1_000_000i64..1_000_000i64
}

/// A literal like `123.25` that tokenizes as a `num`.
fn arb_num_literal() -> impl Strategy<Value = (f64, String)> {
    (-1_000_000i64..1_000_000i64, 0u32..100u32).prop_map(|(whole, frac)| {
        let text = format!(
            "{}{}.{:02}",
            if whole < 0 { "-" } else { "" },
            whole.unsigned_abs(),
            frac
        );
        let value: f64 = text.parse().unwrap();
        (value, text)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// int + int = int, and the value matches i64 arithmetic.
    #[test]
    fn int_plus_int_stays_int(a in arb_small_int(), b in arb_small_int()) {
        let src = format!("return ({}) + ({})", a, b);
        let value = eval_value(&src).unwrap();
        prop_assert!(
            matches!(value, Value::Int(v) if v == a + b),
            "got {:?} for {}",
            value,
            src
        );
    }

    /// A num operand promotes +, -, * to num.
    #[test]
    fn num_operand_promotes((a, text) in arb_num_literal(), b in arb_small_int()) {
        for op in ["+", "-", "*"] {
            let src = format!("return ({}) {} ({})", text, op, b);
            let value = eval_value(&src).unwrap();
            let expected = match op {
                "+" => a + b as f64,
                "-" => a - b as f64,
                _ => a * b as f64,
            };
            prop_assert!(
                matches!(value, Value::Num(v) if (v - expected).abs() < 1e-6),
                "got {:?} for {}",
                value,
                src
            );
        }
    }

    /// `/` yields num even for evenly dividing ints.
    #[test]
    fn division_always_yields_num(a in arb_small_int(), b in 1i64..1000i64) {
        let src = format!("return ({}) / ({})", a, b);
        let value = eval_value(&src).unwrap();
        prop_assert!(matches!(value, Value::Num(_)), "got {:?} for {}", value, src);
    }

    /// `//` yields int and agrees with f64 floor division.
    #[test]
    fn floor_division_yields_floored_int(a in arb_small_int(), b in arb_small_int()) {
        prop_assume!(b != 0);
        let src = format!("return ({}) // ({})", a, b);
        let value = eval_value(&src).unwrap();
        let expected = (a as f64 / b as f64).floor() as i64;
        prop_assert!(
            matches!(value, Value::Int(v) if v == expected),
            "got {:?} for {}, expected {}",
            value,
            src,
            expected
        );
    }

    /// Operations that would overflow i64 fail loudly.
    #[test]
    fn overflow_is_a_runtime_error(a in 2i64..1000i64) {
        let src = format!("return 9223372036854775807 + {}", a);
        prop_assert!(matches!(eval_value(&src), Err(Error::Runtime)));
        let src = format!("return -9223372036854775807 - {}", a);
        prop_assert!(matches!(eval_value(&src), Err(Error::Runtime)));
    }

    /// Comparison agrees across int/num representations of the same value.
    #[test]
    fn cross_representation_equality(a in arb_small_int()) {
        let src = format!("return {} == {}.0", a, a);
        let value = eval_value(&src).unwrap();
        prop_assert!(matches!(value, Value::Bool(true)), "got {:?} for {}", value, src);
    }
}
