// bog-vm - End-to-end execution tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use std::cell::Cell;
use std::rc::Rc;

use bog_vm::gc::Ref;
use bog_vm::value::{self, Value};
use bog_vm::{Error, Options, Vm};

fn run_vm(vm: &mut Vm, src: &str) -> Ref {
    match vm.compile_and_run(src, "test") {
        Ok(result) => result,
        Err(e) => panic!("{}: {:?}", e, vm.errors.last()),
    }
}

fn eval(src: &str) -> String {
    let mut vm = Vm::new();
    let result = run_vm(&mut vm, src);
    value::display(&vm.gc, result)
}

/// Run expecting a runtime failure; returns the recorded error message.
fn eval_runtime_err(src: &str) -> String {
    let mut vm = Vm::new();
    match vm.compile_and_run(src, "test") {
        Ok(result) => panic!(
            "expected runtime error, got {}",
            value::display(&vm.gc, result)
        ),
        Err(Error::Runtime) => {}
        Err(other) => panic!("expected runtime error, got {}", other),
    }
    let message = vm
        .errors
        .iter()
        .find(|d| d.kind == bog_parser::ErrorKind::Error)
        .map(|d| d.message.to_string())
        .unwrap_or_default();
    message
}

// ============================================================================
// Spec scenarios
// ============================================================================

#[test]
fn arithmetic_and_return() {
    assert_eq!(eval("let x = 1 + 2\nreturn x"), "3");
}

#[test]
fn for_loop_accumulates() {
    assert_eq!(
        eval("let xs = [1,2,3]\nlet s = 0\nfor (let v in xs) s += v\nreturn s"),
        "6"
    );
}

#[test]
fn nested_function_calls() {
    assert_eq!(eval("fn pow(x) x * x\nreturn pow(pow(2))"), "16");
}

#[test]
fn import_disabled_fails() {
    assert_eq!(eval_runtime_err("import(\"m.bog\")"), "import failed");
}

#[test]
fn module_level_error_value_is_the_result() {
    let mut vm = Vm::new();
    let result = run_vm(&mut vm, "error(\"oops\")");
    match vm.gc.get(result) {
        Value::Err(inner) => {
            assert!(matches!(vm.gc.get(*inner), Value::Str(s) if s == "oops"));
        }
        other => panic!("expected err, got {}", other.type_name()),
    }
}

#[test]
fn negative_shift_is_a_runtime_error() {
    assert_eq!(eval_runtime_err("1 << -1"), "shift by negative amount");
}

// ============================================================================
// Values and operators
// ============================================================================

#[test]
fn numeric_promotion() {
    assert_eq!(eval("return 1 + 2.0"), "3.0");
    assert_eq!(eval("return 1 / 2"), "0.5");
    assert_eq!(eval("return 7 // 2"), "3");
    assert_eq!(eval("return -7 // 2"), "-4");
    assert_eq!(eval("return 2 ** 10"), "1024");
    assert_eq!(eval("return 7 % 3"), "1");
}

#[test]
fn integer_overflow_is_loud() {
    assert_eq!(
        eval_runtime_err("return 9223372036854775807 + 1"),
        "integer overflow"
    );
    assert_eq!(eval_runtime_err("return 2 ** 65"), "integer overflow");
    assert_eq!(eval_runtime_err("return 2 ** -1"), "negative exponent");
}

#[test]
fn division_by_zero() {
    assert_eq!(eval_runtime_err("return 1 / 0"), "division by zero");
    assert_eq!(eval_runtime_err("return 1 // 0"), "division by zero");
    assert_eq!(eval_runtime_err("return 1 % 0"), "division by zero");
}

#[test]
fn shifts() {
    assert_eq!(eval("return 1 << 4"), "16");
    assert_eq!(eval("return 256 >> 4"), "16");
    assert_eq!(eval("return 1 << 80"), "0");
}

#[test]
fn bitwise_and_boolean() {
    assert_eq!(eval("return 6 & 3"), "2");
    assert_eq!(eval("return 6 | 3"), "7");
    assert_eq!(eval("return 6 ^ 3"), "5");
    assert_eq!(eval("return ~0"), "-1");
    assert_eq!(eval("return not false"), "true");
    assert_eq!(eval("return true and false"), "false");
    assert_eq!(eval("return false or true"), "true");
}

#[test]
fn boolean_operators_short_circuit() {
    assert_eq!(eval("fn boom() error(1)\nreturn false and boom()"), "false");
    assert_eq!(eval("fn boom() error(1)\nreturn true or boom()"), "true");
}

#[test]
fn comparisons_and_in() {
    assert_eq!(eval("return 1 < 2"), "true");
    assert_eq!(eval("return 2.5 >= 2"), "true");
    assert_eq!(eval("return 1 == 1.0"), "true");
    assert_eq!(eval("return \"ell\" in \"hello\""), "true");
    assert_eq!(eval("return 2 in [1, 2, 3]"), "true");
    assert_eq!(eval("return 4 in 0...4"), "false");
    assert_eq!(eval("return 3 in 0...4"), "true");
}

#[test]
fn strings_and_indexing() {
    assert_eq!(eval("return \"hello\"[1]"), "e");
    assert_eq!(eval("return \"hello\"[-1]"), "o");
    assert_eq!(eval("return [1,2,3][-1]"), "3");
    assert_eq!(
        eval_runtime_err("return [1][5]"),
        "index 5 out of bounds, length 1"
    );
}

#[test]
fn is_and_as() {
    assert_eq!(eval("return 1 is int"), "true");
    assert_eq!(eval("return 1 is num"), "false");
    assert_eq!(eval("return error(1) is err"), "true");
    assert_eq!(eval("return 2.9 as int"), "2");
    assert_eq!(eval("return \"42\" as int"), "42");
    assert_eq!(eval("return 3 as str"), "3");
    assert_eq!(eval("return (1, 2) as list"), "[1, 2]");
    assert_eq!(eval("return (0...3) as list"), "[0, 1, 2]");
    assert_eq!(eval_runtime_err("return [1] as int"), "cannot cast list to int");
}

// ============================================================================
// Bindings, destructuring, mutation
// ============================================================================

#[test]
fn destructuring_patterns() {
    assert_eq!(eval("let (a, b) = (1, 2)\nreturn a + b"), "3");
    assert_eq!(eval("let [x, _, z] = [1, 2, 3]\nreturn x + z"), "4");
    assert_eq!(eval("let {\"k\": v} = {\"k\": 5}\nreturn v"), "5");
    assert_eq!(eval("let {k} = {\"k\": 6}\nreturn k"), "6");
    assert_eq!(eval("let error(e) = error(9)\nreturn e"), "9");
}

#[test]
fn aggregate_mutation() {
    assert_eq!(eval("let xs = [1, 2]\nxs[0] = 10\nreturn xs[0] + xs[1]"), "12");
    assert_eq!(
        eval("let m = {\"a\": 1}\nm.b = 2\nreturn m.a + m.b"),
        "3"
    );
    assert_eq!(eval("let xs = [1, 2]\nxs[1] += 5\nreturn xs[1]"), "7");
    assert_eq!(eval_runtime_err("\"s\"[0] = \"x\""), "cannot assign into str");
}

#[test]
fn map_keys_compare_by_value() {
    assert_eq!(eval("let m = {1: \"a\"}\nm[1.0] = \"b\"\nreturn m[1]"), "b");
    assert_eq!(eval("return {\"a\": 1, \"b\": 2} == {\"b\": 2, \"a\": 1}"), "true");
}

#[test]
fn shadowing_sees_the_outer_binding() {
    assert_eq!(eval("let x = 1\nlet x = x + 1\nreturn x"), "2");
}

// ============================================================================
// Control flow
// ============================================================================

#[test]
fn if_else_and_if_let() {
    assert_eq!(eval("return if (1 < 2) \"yes\" else \"no\""), "yes");
    assert_eq!(eval("return if (1 > 2) \"yes\""), "none");
    assert_eq!(eval("return if (let (a, b) = (1, 2)) a + b"), "3");
    assert_eq!(eval("let v = none\nreturn if (let x = v) x else 9"), "9");
}

#[test]
fn while_loop() {
    assert_eq!(eval("let i = 0\nwhile (i < 5) i += 1\nreturn i"), "5");
}

#[test]
fn loops_break_and_continue() {
    let src = "let s = 0\nfor (let v in 1...10) {\nif (v == 3) continue\nif (v > 5) break\ns += v\n}\nreturn s";
    assert_eq!(eval(src), "12");
}

#[test]
fn break_with_value_is_the_loop_result() {
    let src = "let found = for (let v in 10...20) {\nif (v % 7 == 0) break v\n}\nreturn found";
    assert_eq!(eval(src), "14");
}

#[test]
fn match_cases() {
    let src = "fn name(n) match (n) {\n0, 1: \"small\"\n2: \"two\"\nlet other: other\n}\nreturn name(1)";
    assert_eq!(eval(src), "small");
    let src = "fn name(n) match (n) {\n0, 1: \"small\"\n2: \"two\"\nlet other: other\n}\nreturn name(9)";
    assert_eq!(eval(src), "9");
    let src = "return match (3) {\n1: \"one\"\n_: \"other\"\n}";
    assert_eq!(eval(src), "other");
    let src = "return match (99) {\n1: \"one\"\n}";
    assert_eq!(eval(src), "none");
}

#[test]
fn blocks_evaluate_to_none_and_scope_locals() {
    assert_eq!(eval("let x = {\nlet y = 1\ny + 1\n}\nreturn x"), "none");
    assert_eq!(eval("let x = 1\nif (true) {\nlet x = 2\n_ = x\n}\nreturn x"), "1");
}

// ============================================================================
// Functions and closures
// ============================================================================

#[test]
fn closures_capture_at_creation() {
    assert_eq!(
        eval("fn make(n) fn(x) x + n\nlet add2 = make(2)\nreturn add2(40)"),
        "42"
    );
}

#[test]
fn transitive_captures() {
    let src = "fn outer(a) fn() fn() a\nreturn outer(5)()()";
    assert_eq!(eval(src), "5");
}

#[test]
fn self_recursion() {
    let src = "fn fact(n) if (n < 2) 1 else n * fact(n - 1)\nreturn fact(5)";
    assert_eq!(eval(src), "120");
}

#[test]
fn wrong_arg_count() {
    assert_eq!(
        eval_runtime_err("fn f(a, b) a\nreturn f(1)"),
        "expected 2 arguments, got 1"
    );
}

#[test]
fn call_depth_is_bounded() {
    assert_eq!(
        eval_runtime_err("fn f() f()\nreturn f()"),
        "maximum call depth exceeded"
    );
}

#[test]
fn runtime_errors_carry_a_trace() {
    let mut vm = Vm::new();
    let err = vm
        .compile_and_run("fn inner() 1 + true\nfn outer() inner()\nreturn outer()", "t")
        .unwrap_err();
    assert!(matches!(err, Error::Runtime));
    let kinds: Vec<_> = vm.errors.iter().map(|d| d.kind).collect();
    assert!(kinds.contains(&bog_parser::ErrorKind::Error));
    assert!(kinds.contains(&bog_parser::ErrorKind::Trace));
}

#[test]
fn method_call_binds_this() {
    let src = "let m = {\"v\": 10}\nm.get = fn() this.v\nreturn m.get()";
    assert_eq!(eval(src), "10");
    assert_eq!(eval_runtime_err("return this"), "'this' has not been set");
}

// ============================================================================
// Errors as values
// ============================================================================

#[test]
fn catch_supplies_a_fallback() {
    assert_eq!(eval("return error(1) catch 5"), "5");
    assert_eq!(eval("return 2 catch 5"), "2");
    assert_eq!(eval("return error(3) catch let e: e + 1"), "4");
}

#[test]
fn try_propagates_through_the_caller() {
    let src = "fn f() {\nlet x = try error(\"bad\")\nreturn 1\n}\nreturn f() is err";
    assert_eq!(eval(src), "true");
}

#[test]
fn discarded_error_inside_a_function_fails() {
    assert_eq!(
        eval_runtime_err("fn f() {\nerror(1)\nreturn 2\n}\nreturn f()"),
        "error discarded"
    );
}

#[test]
fn explicitly_discarded_error_is_fine() {
    assert_eq!(eval("_ = error(1)\nreturn 7"), "7");
}

// ============================================================================
// Iteration
// ============================================================================

#[test]
fn iteration_over_every_container() {
    assert_eq!(eval("let s = 0\nfor (let v in 0...5) s += v\nreturn s"), "10");
    assert_eq!(eval("let s = 0\nfor (let v in (1, 2, 3)) s += v\nreturn s"), "6");
    let src = "let n = 0\nfor (let c in \"héllo\") n += 1\nreturn n";
    assert_eq!(eval(src), "5");
}

#[test]
fn empty_iteration_runs_zero_times() {
    assert_eq!(eval("let c = 0\nfor (let _ in []) c += 1\nreturn c"), "0");
}

#[test]
fn map_iteration_is_insertion_ordered() {
    let src = "let m = {\"b\": 1, \"a\": 2}\nlet out = 0\nfor (let (k, v) in m) out = out * 10 + v\nreturn out";
    assert_eq!(eval(src), "12");
}

// ============================================================================
// Natives
// ============================================================================

#[test]
fn natives_can_mutate_values() {
    let mut vm = Vm::new();
    vm.register_native("push", Some(2), |vm, args| {
        match vm.gc.get_mut(args[0]) {
            Value::List(items) => {
                items.push(args[1]);
                Ok(args[0])
            }
            _ => {
                vm.errors.push_error("push expects a list", 0);
                Err(Error::Runtime)
            }
        }
    });
    let result = run_vm(
        &mut vm,
        "let xs = []\nfor (let v in 0...3) push(xs, v * v)\nreturn xs",
    );
    assert_eq!(value::display(&vm.gc, result), "[0, 1, 4]");
}

#[test]
fn native_arity_mismatch_fails() {
    let mut vm = Vm::new();
    vm.register_native("one", Some(1), |_, args| Ok(args[0]));
    let err = vm.compile_and_run("return one()", "t").unwrap_err();
    assert!(matches!(err, Error::Runtime));
    assert_eq!(
        vm.errors.last().unwrap().message,
        "expected 1 arguments, got 0"
    );
}

// ============================================================================
// Imports
// ============================================================================

#[test]
fn imports_are_memoized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.bog");
    std::fs::write(&path, "tick()\nreturn 5").unwrap();
    let path = path.to_str().unwrap().to_string();

    let counter = Rc::new(Cell::new(0));
    let seen = counter.clone();
    let mut vm = Vm::with_options(Options {
        import_files: true,
        ..Options::default()
    });
    vm.register_native("tick", Some(0), move |_, _| {
        seen.set(seen.get() + 1);
        Ok(bog_vm::Gc::NONE)
    });

    let src = format!(
        "let a = import(\"{p}\")\nlet b = import(\"{p}\")\nreturn a + b",
        p = path
    );
    let result = run_vm(&mut vm, &src);
    assert_eq!(value::display(&vm.gc, result), "10");
    assert_eq!(counter.get(), 1);
}

#[test]
fn bogc_images_import_and_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.bogc");

    let mut vm = Vm::new();
    let module = vm.compile_source("return 6 * 7", "m").unwrap();
    let mut file = std::fs::File::create(&path).unwrap();
    module.write_to(&mut file).unwrap();
    drop(file);

    let mut vm = Vm::with_options(Options {
        import_files: true,
        ..Options::default()
    });
    let src = format!("return import(\"{}\")", path.to_str().unwrap());
    let result = run_vm(&mut vm, &src);
    assert_eq!(value::display(&vm.gc, result), "42");
}

#[test]
fn import_with_unknown_suffix_fails() {
    let mut vm = Vm::with_options(Options {
        import_files: true,
        ..Options::default()
    });
    let err = vm.compile_and_run("import(\"nope.txt\")", "t").unwrap_err();
    assert!(matches!(err, Error::Runtime));
    assert_eq!(vm.errors.last().unwrap().message, "import failed");
}

// ============================================================================
// VM invariants
// ============================================================================

#[test]
fn stack_balances_after_execution() {
    let mut vm = Vm::new();
    run_vm(&mut vm, "fn f(x) x + 1\nlet a = f(1)\nreturn f(a)");
    assert_eq!(vm.stack_len(), 0);
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn determinism_across_runs() {
    let src = "let m = {\"x\": 1, \"y\": 2}\nlet s = 0\nfor (let (k, v) in m) s = s * 100 + v\nreturn s";
    assert_eq!(eval(src), eval(src));
}

#[test]
fn garbage_is_collected_across_loops() {
    let mut vm = Vm::new();
    // Thousands of short-lived strings; heap must not retain them all.
    let result = run_vm(
        &mut vm,
        "let n = 0\nfor (let v in 0...10000) n += \"55\"[0] as int\nreturn n",
    );
    assert_eq!(value::display(&vm.gc, result), "50000");
    assert!(vm.heap_live() < 10_000, "heap kept {} values", vm.heap_live());
}

// ============================================================================
// Hand-assembled bytecode
// ============================================================================

fn exec_raw(build: impl FnOnce(&mut bog_vm::bytecode::CodeBuf)) -> Result<String, Error> {
    use bog_vm::bytecode::CodeBuf;
    let mut code = CodeBuf::new();
    build(&mut code);
    let module = bog_vm::Module {
        name: "raw".to_string(),
        code: code.into_bytes(),
        strings: Vec::new(),
        entry: 0,
    };
    let mut vm = Vm::new();
    let result = vm.exec(std::rc::Rc::new(module))?;
    Ok(value::display(&vm.gc, result))
}

#[test]
fn eager_boolean_opcodes() {
    use bog_vm::Op;
    let result = exec_raw(|code| {
        code.op(Op::ConstPrimitive);
        code.u8(0);
        code.u8(2); // true
        code.op(Op::ConstPrimitive);
        code.u8(1);
        code.u8(1); // false
        code.op(Op::BoolAnd);
        code.u8(2);
        code.u8(0);
        code.u8(1);
        code.op(Op::BoolOr);
        code.u8(3);
        code.u8(2);
        code.u8(0);
        code.op(Op::Return);
        code.u8(3);
    });
    assert_eq!(result.unwrap(), "true");
}

#[test]
fn iterator_stays_exhausted() {
    use bog_vm::Op;
    let result = exec_raw(|code| {
        code.op(Op::BuildList);
        code.u8(0);
        code.u8(1);
        code.u16(0); // r0 = []
        code.op(Op::IterInit);
        code.u8(1);
        code.u8(0);
        code.op(Op::IterNext);
        code.u8(2);
        code.u8(1);
        code.op(Op::IterNext);
        code.u8(2);
        code.u8(1);
        code.op(Op::Return);
        code.u8(2);
    });
    assert_eq!(result.unwrap(), "none");
}

#[test]
fn copy_duplicates_while_move_aliases() {
    use bog_vm::Op;
    let result = exec_raw(|code| {
        code.op(Op::ConstInt8);
        code.u8(0);
        code.i8(1);
        code.op(Op::BuildList);
        code.u8(1);
        code.u8(0);
        code.u16(1); // r1 = [1]
        code.op(Op::Copy);
        code.u8(2);
        code.u8(1); // r2 = copy of r1
        code.op(Op::ConstInt8);
        code.u8(3);
        code.i8(0); // r3 = index 0
        code.op(Op::ConstInt8);
        code.u8(4);
        code.i8(9); // r4 = 9
        code.op(Op::Set);
        code.u8(1);
        code.u8(3);
        code.u8(4); // r1[0] = 9
        code.op(Op::Get);
        code.u8(5);
        code.u8(2);
        code.u8(3); // r5 = r2[0]
        code.op(Op::Return);
        code.u8(5);
    });
    assert_eq!(result.unwrap(), "1");
}

#[test]
fn unknown_opcode_is_malformed_bytecode() {
    let result = exec_raw(|code| {
        code.u8(0xFF);
    });
    assert!(matches!(result, Err(Error::MalformedByteCode)));
}

#[test]
fn truncated_operands_are_malformed_bytecode() {
    use bog_vm::Op;
    let result = exec_raw(|code| {
        code.op(Op::ConstInt32);
        code.u8(0);
        code.u8(1); // i32 operand cut short
    });
    assert!(matches!(result, Err(Error::MalformedByteCode)));
}

#[test]
fn repl_mode_returns_discarded_values() {
    let mut vm = Vm::with_options(Options {
        repl: true,
        ..Options::default()
    });
    let result = run_vm(&mut vm, "1 + 2");
    assert_eq!(value::display(&vm.gc, result), "3");
}
