// bog-vm - Bytecode compiler and virtual machine for the Bog scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The register-based virtual machine.
//!
//! The VM owns the register stack, the call stack, the GC, the imported
//! modules cache and the native registry. Registers are indexed relative to
//! the current frame's stack pointer and hold GC handles only, so the whole
//! root set is a handful of flat slices.
//!
//! # Thread safety
//!
//! `Vm` is not thread-safe; run one instance per thread. Instances share no
//! mutable state.

use std::borrow::Cow;
use std::fs;
use std::io;
use std::rc::Rc;

use indexmap::IndexMap;

use bog_parser::{parse_tokens, tokenize, Errors};

use crate::bytecode::{self, Op, PRIMITIVE_FALSE, PRIMITIVE_NONE, PRIMITIVE_TRUE};
use crate::compiler::compile;
use crate::gc::{Gc, Ref};
use crate::module::Module;
use crate::value::{self, Func, Iter, Native, Type, Value};
use crate::{Error, Result};

/// Host function signature: `(vm, argument handles) -> value handle`.
pub type NativeFn = Rc<dyn Fn(&mut Vm, &[Ref]) -> Result<Ref>>;

/// Maximum call stack depth.
const MAX_CALL_DEPTH: usize = 512;

/// Heap slot cap; exceeding it is `OutOfMemory`.
const MAX_HEAP_SLOTS: usize = 1 << 24;

/// VM construction options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Allow `import` to load `.bog`/`.bogc` files from disk.
    pub import_files: bool,
    /// REPL mode: a top-level `Discard` returns its value as the module
    /// result so the REPL can echo it.
    pub repl: bool,
    /// Upper bound on imported source file size, in bytes.
    pub max_import_size: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            import_files: false,
            repl: false,
            max_import_size: 1024 * 1024,
        }
    }
}

/// The saved state enabling return from a call.
struct Frame {
    ret_ip: usize,
    caller_sp: usize,
    /// Stack length at frame entry; `Return` shrinks back to it.
    entry_sp: usize,
    line: u32,
    ret_reg: u8,
    /// The caller's module, restored on return.
    module: Rc<Module>,
    /// The function value being executed; roots its captures.
    func: Option<Ref>,
    this: Option<Ref>,
}

struct ImportEntry {
    #[allow(dead_code)]
    module: Rc<Module>,
    result: Ref,
}

struct NativeEntry {
    name: Rc<str>,
    arg_count: Option<u8>,
    func: NativeFn,
}

/// The Bog virtual machine.
pub struct Vm {
    pub gc: Gc,
    /// Accumulated diagnostics from every pipeline stage.
    pub errors: Errors,
    options: Options,
    stack: Vec<Ref>,
    frames: Vec<Frame>,
    ip: usize,
    sp: usize,
    line_loc: u32,
    module: Rc<Module>,
    /// `this` candidate recorded by `Get`, consumed by the next `Call`.
    last_get: Option<Ref>,
    /// Result of the most recent top-level execution, kept rooted for the
    /// host.
    result_root: Option<Ref>,
    imports: IndexMap<String, ImportEntry>,
    natives: IndexMap<String, NativeEntry>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Vm {
            gc: Gc::new(),
            errors: Errors::new(),
            options,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            ip: 0,
            sp: 0,
            line_loc: 0,
            module: Rc::new(Module {
                name: String::new(),
                code: Vec::new(),
                strings: Vec::new(),
                entry: 0,
            }),
            last_get: None,
            result_root: None,
            imports: IndexMap::new(),
            natives: IndexMap::new(),
        }
    }

    /// Register a host function under a name scripts can refer to.
    ///
    /// Must be called before execution starts; the registry is not mutated
    /// while bytecode runs. A declared `arg_count` is validated by `Call`.
    pub fn register_native<F>(&mut self, name: &str, arg_count: Option<u8>, func: F)
    where
        F: Fn(&mut Vm, &[Ref]) -> Result<Ref> + 'static,
    {
        self.natives.insert(
            name.to_string(),
            NativeEntry {
                name: Rc::from(name),
                arg_count,
                func: Rc::new(func),
            },
        );
    }

    /// Tokenize, parse and compile `source` into a module.
    pub fn compile_source(&mut self, source: &str, name: &str) -> Result<Module> {
        let tokens = tokenize(source, &mut self.errors).map_err(|_| Error::Tokenize)?;
        let tree =
            parse_tokens(source, tokens, &mut self.errors).map_err(|_| Error::Parse)?;
        compile(&tree, name, &mut self.errors).map_err(|_| Error::Compile)
    }

    /// Compile and execute `source`, returning the module's final value.
    ///
    /// The returned handle stays rooted until the next top-level execution;
    /// snapshot it before running more code.
    pub fn compile_and_run(&mut self, source: &str, name: &str) -> Result<Ref> {
        let module = self.compile_source(source, name)?;
        self.exec(Rc::new(module))
    }

    /// Execute a module re-entrantly: the current execution state is saved,
    /// the module runs on top of the stack, and the state is restored.
    pub fn exec(&mut self, module: Rc<Module>) -> Result<Ref> {
        let saved_ip = self.ip;
        let saved_sp = self.sp;
        let saved_line = self.line_loc;
        let saved_stack = self.stack.len();
        let base = self.frames.len();
        let saved_module = std::mem::replace(&mut self.module, module);

        self.sp = saved_stack;
        self.ip = self.module.entry as usize;
        let result = self.run(base);

        self.frames.truncate(base);
        self.stack.truncate(saved_stack);
        self.ip = saved_ip;
        self.sp = saved_sp;
        self.line_loc = saved_line;
        self.module = saved_module;
        if let Ok(value) = &result {
            self.result_root = Some(*value);
        }
        result
    }

    /// Call a named function member of a map-typed value.
    pub fn call_member(&mut self, target: Ref, name: &str, args: &[Ref]) -> Result<Ref> {
        // Plain gc allocation: a collection here could sweep caller-held
        // argument handles that are not yet rooted on the stack.
        let key = self.gc.alloc(Value::Str(name.to_string()));
        let func = match value::get(&mut self.gc, target, key) {
            Ok(func) => func,
            Err(message) => return Err(self.fatal(message)),
        };
        self.call_value(func, args, Some(target))
    }

    /// Call a function or native value directly from the host.
    pub fn call_value(&mut self, callee: Ref, args: &[Ref], this: Option<Ref>) -> Result<Ref> {
        enum Target {
            Script { entry: u32, module: Rc<Module> },
            Native { func: NativeFn },
        }

        let target = match self.gc.get(callee) {
            Value::Func(f) => {
                let expected = f.arg_count;
                let target = Target::Script {
                    entry: f.entry,
                    module: f.module.clone(),
                };
                if expected as usize != args.len() {
                    let message =
                        format!("expected {} arguments, got {}", expected, args.len());
                    return Err(self.fatal(message));
                }
                target
            }
            Value::Native(n) => {
                let expected = n.arg_count;
                let target = Target::Native {
                    func: n.func.clone(),
                };
                if let Some(expected) = expected {
                    if expected as usize != args.len() {
                        let message =
                            format!("expected {} arguments, got {}", expected, args.len());
                        return Err(self.fatal(message));
                    }
                }
                target
            }
            other => {
                let t = other.type_name();
                return Err(self.fatal(format!("cannot call {}", t)));
            }
        };

        match target {
            Target::Native { func } => {
                // Root the arguments for the duration of the native call.
                let saved_stack = self.stack.len();
                self.stack.extend_from_slice(args);
                let result = func(self, args);
                self.stack.truncate(saved_stack);
                result
            }
            Target::Script { entry, module } => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(self.fatal("maximum call depth exceeded"));
                }
                let saved_ip = self.ip;
                let saved_sp = self.sp;
                let saved_line = self.line_loc;
                let saved_stack = self.stack.len();
                let saved_module = std::mem::replace(&mut self.module, module);

                self.stack.extend_from_slice(args);
                self.frames.push(Frame {
                    ret_ip: 0,
                    caller_sp: saved_sp,
                    entry_sp: saved_stack,
                    line: saved_line,
                    ret_reg: 0,
                    module: saved_module.clone(),
                    func: Some(callee),
                    this,
                });
                let base = self.frames.len();
                self.sp = saved_stack;
                self.ip = entry as usize;

                let result = self.run(base);

                self.frames.truncate(base - 1);
                self.stack.truncate(saved_stack);
                self.ip = saved_ip;
                self.sp = saved_sp;
                self.line_loc = saved_line;
                self.module = saved_module;
                result
            }
        }
    }

    /// Render every accumulated diagnostic against `source`.
    pub fn render_errors(&self, source: &str, out: &mut impl io::Write) -> io::Result<()> {
        self.errors.render(source, out)
    }

    // ========================================================================
    // Register and heap access
    // ========================================================================

    fn reg(&self, index: u8) -> Ref {
        self.stack
            .get(self.sp + index as usize)
            .copied()
            .unwrap_or(Gc::NONE)
    }

    fn set_reg(&mut self, index: u8, value: Ref) {
        let at = self.sp + index as usize;
        if at >= self.stack.len() {
            self.stack.resize(at + 1, Gc::NONE);
        }
        self.stack[at] = value;
    }

    fn alloc(&mut self, value: Value) -> Result<Ref> {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
        if self.gc.heap_size() >= MAX_HEAP_SLOTS {
            return Err(Error::OutOfMemory);
        }
        Ok(self.gc.alloc(value))
    }

    fn collect_garbage(&mut self) {
        let mut roots: Vec<Ref> = Vec::with_capacity(self.stack.len() + self.frames.len() * 2 + 4);
        roots.extend_from_slice(&self.stack);
        for frame in &self.frames {
            if let Some(r) = frame.func {
                roots.push(r);
            }
            if let Some(r) = frame.this {
                roots.push(r);
            }
        }
        if let Some(r) = self.last_get {
            roots.push(r);
        }
        if let Some(r) = self.result_root {
            roots.push(r);
        }
        for entry in self.imports.values() {
            roots.push(entry.result);
        }
        self.gc.collect(roots);
    }

    // ========================================================================
    // Failure paths
    // ========================================================================

    /// Record a runtime error at the current location plus a stack trace of
    /// at most 32 entries, a note marking any truncation.
    fn fatal(&mut self, message: impl Into<Cow<'static, str>>) -> Error {
        self.errors.push_error(message, self.line_loc);
        let lines: Vec<u32> = self.frames.iter().rev().map(|f| f.line).collect();
        for (i, line) in lines.iter().enumerate() {
            if i == 32 {
                self.errors
                    .push_note(format!("{} more stack frames", lines.len() - 32), *line);
                break;
            }
            self.errors.push_trace("called from here", *line);
        }
        Error::Runtime
    }

    fn get_bool(&mut self, r: Ref) -> Result<bool> {
        if let Value::Bool(b) = self.gc.get(r) {
            return Ok(*b);
        }
        let t = self.gc.get(r).type_name();
        Err(self.fatal(format!("expected bool, got {}", t)))
    }

    fn get_int(&mut self, r: Ref) -> Result<i64> {
        if let Value::Int(v) = self.gc.get(r) {
            return Ok(*v);
        }
        let t = self.gc.get(r).type_name();
        Err(self.fatal(format!("expected int, got {}", t)))
    }

    fn numeric(&mut self, r: Ref) -> Result<Operand> {
        match self.gc.get(r) {
            Value::Int(v) => Ok(Operand::Int(*v)),
            Value::Num(v) => Ok(Operand::Num(*v)),
            other => {
                let t = other.type_name();
                Err(self.fatal(format!("expected a number, got {}", t)))
            }
        }
    }

    // ========================================================================
    // Operand decoding
    // ========================================================================

    fn read_u8(&mut self) -> Result<u8> {
        bytecode::read_u8(&self.module.code, &mut self.ip).ok_or(Error::MalformedByteCode)
    }

    fn read_u16(&mut self) -> Result<u16> {
        bytecode::read_u16(&self.module.code, &mut self.ip).ok_or(Error::MalformedByteCode)
    }

    fn read_u32(&mut self) -> Result<u32> {
        bytecode::read_u32(&self.module.code, &mut self.ip).ok_or(Error::MalformedByteCode)
    }

    fn read_i8(&mut self) -> Result<i8> {
        bytecode::read_i8(&self.module.code, &mut self.ip).ok_or(Error::MalformedByteCode)
    }

    fn read_i32(&mut self) -> Result<i32> {
        bytecode::read_i32(&self.module.code, &mut self.ip).ok_or(Error::MalformedByteCode)
    }

    fn read_i64(&mut self) -> Result<i64> {
        bytecode::read_i64(&self.module.code, &mut self.ip).ok_or(Error::MalformedByteCode)
    }

    fn read_f64(&mut self) -> Result<f64> {
        bytecode::read_f64(&self.module.code, &mut self.ip).ok_or(Error::MalformedByteCode)
    }

    fn string_operand(&mut self) -> Result<String> {
        let sref = self.read_u32()?;
        Ok(self.module.string_at(sref)?.to_string())
    }

    /// Relative forward jump by an unsigned offset.
    fn jump_forward(&mut self, offset: u32) -> Result<()> {
        let target = self.ip + offset as usize;
        if target > self.module.code.len() {
            return Err(Error::MalformedByteCode);
        }
        self.ip = target;
        Ok(())
    }

    // ========================================================================
    // Dispatch loop
    // ========================================================================

    /// Interpret until the frame stack shrinks back to `base`, then return
    /// the module-level result.
    fn run(&mut self, base: usize) -> Result<Ref> {
        loop {
            // `this` recorded by `Get` is valid only on the very next
            // instruction.
            let prev_get = self.last_get.take();

            let byte = self.read_u8()?;
            let op = Op::from_byte(byte).ok_or(Error::MalformedByteCode)?;
            match op {
                // Constants
                Op::ConstInt8 => {
                    let a = self.read_u8()?;
                    let v = self.read_i8()?;
                    let r = self.alloc(Value::Int(v as i64))?;
                    self.set_reg(a, r);
                }
                Op::ConstInt32 => {
                    let a = self.read_u8()?;
                    let v = self.read_i32()?;
                    let r = self.alloc(Value::Int(v as i64))?;
                    self.set_reg(a, r);
                }
                Op::ConstInt64 => {
                    let a = self.read_u8()?;
                    let v = self.read_i64()?;
                    let r = self.alloc(Value::Int(v))?;
                    self.set_reg(a, r);
                }
                Op::ConstNum => {
                    let a = self.read_u8()?;
                    let v = self.read_f64()?;
                    let r = self.alloc(Value::Num(v))?;
                    self.set_reg(a, r);
                }
                Op::ConstPrimitive => {
                    let a = self.read_u8()?;
                    let which = self.read_u8()?;
                    let r = match which {
                        PRIMITIVE_NONE => Gc::NONE,
                        PRIMITIVE_FALSE => Gc::FALSE,
                        PRIMITIVE_TRUE => Gc::TRUE,
                        _ => return Err(Error::MalformedByteCode),
                    };
                    self.set_reg(a, r);
                }
                Op::ConstString => {
                    let a = self.read_u8()?;
                    let text = self.string_operand()?;
                    let r = self.alloc(Value::Str(text))?;
                    self.set_reg(a, r);
                }

                // Arithmetic
                Op::Add | Op::Sub | Op::Mul | Op::Pow | Op::DivFloor | Op::Div | Op::Mod => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let c = self.read_u8()?;
                    let x = {
                        let r = self.reg(b);
                        self.numeric(r)?
                    };
                    let y = {
                        let r = self.reg(c);
                        self.numeric(r)?
                    };
                    let value = self.apply_arith(op, x, y)?;
                    let r = self.alloc(value)?;
                    self.set_reg(a, r);
                }

                // Bitwise
                Op::BitNot => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let v = {
                        let r = self.reg(b);
                        self.get_int(r)?
                    };
                    let r = self.alloc(Value::Int(!v))?;
                    self.set_reg(a, r);
                }
                Op::BitAnd | Op::BitOr | Op::BitXor => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let c = self.read_u8()?;
                    let x = {
                        let r = self.reg(b);
                        self.get_int(r)?
                    };
                    let y = {
                        let r = self.reg(c);
                        self.get_int(r)?
                    };
                    let v = match op {
                        Op::BitAnd => x & y,
                        Op::BitOr => x | y,
                        _ => x ^ y,
                    };
                    let r = self.alloc(Value::Int(v))?;
                    self.set_reg(a, r);
                }

                // Boolean
                Op::BoolNot => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let v = {
                        let r = self.reg(b);
                        self.get_bool(r)?
                    };
                    self.set_reg(a, Gc::bool_ref(!v));
                }
                Op::BoolAnd | Op::BoolOr => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let c = self.read_u8()?;
                    let x = {
                        let r = self.reg(b);
                        self.get_bool(r)?
                    };
                    let y = {
                        let r = self.reg(c);
                        self.get_bool(r)?
                    };
                    let v = if op == Op::BoolAnd { x && y } else { x || y };
                    self.set_reg(a, Gc::bool_ref(v));
                }

                // Shifts
                Op::LShift | Op::RShift => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let c = self.read_u8()?;
                    let x = {
                        let r = self.reg(b);
                        self.get_int(r)?
                    };
                    let amount = {
                        let r = self.reg(c);
                        self.get_int(r)?
                    };
                    if amount < 0 {
                        return Err(self.fatal("shift by negative amount"));
                    }
                    let v = if amount >= 64 {
                        0
                    } else if op == Op::LShift {
                        ((x as u64) << amount) as i64
                    } else {
                        x >> amount
                    };
                    let r = self.alloc(Value::Int(v))?;
                    self.set_reg(a, r);
                }

                // Comparison
                Op::Equal | Op::NotEqual => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let c = self.read_u8()?;
                    let eq = value::eql(&self.gc, self.reg(b), self.reg(c));
                    let v = if op == Op::Equal { eq } else { !eq };
                    self.set_reg(a, Gc::bool_ref(v));
                }
                Op::LessThan | Op::LessThanEqual | Op::GreaterThan | Op::GreaterThanEqual => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let c = self.read_u8()?;
                    let x = {
                        let r = self.reg(b);
                        self.numeric(r)?
                    };
                    let y = {
                        let r = self.reg(c);
                        self.numeric(r)?
                    };
                    let v = match (x, y) {
                        (Operand::Int(p), Operand::Int(q)) => match op {
                            Op::LessThan => p < q,
                            Op::LessThanEqual => p <= q,
                            Op::GreaterThan => p > q,
                            _ => p >= q,
                        },
                        _ => {
                            let p = x.as_num();
                            let q = y.as_num();
                            match op {
                                Op::LessThan => p < q,
                                Op::LessThanEqual => p <= q,
                                Op::GreaterThan => p > q,
                                _ => p >= q,
                            }
                        }
                    };
                    self.set_reg(a, Gc::bool_ref(v));
                }
                Op::In => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let c = self.read_u8()?;
                    match value::contains(&self.gc, self.reg(b), self.reg(c)) {
                        Ok(v) => self.set_reg(a, Gc::bool_ref(v)),
                        Err(message) => return Err(self.fatal(message)),
                    }
                }

                // Moves
                Op::Move => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let v = self.reg(b);
                    self.set_reg(a, v);
                }
                Op::Copy => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let v = self.gc.get(self.reg(b)).clone();
                    let r = self.alloc(v)?;
                    self.set_reg(a, r);
                }

                Op::Negate => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let x = {
                        let r = self.reg(b);
                        self.numeric(r)?
                    };
                    let value = match x {
                        Operand::Int(v) => Value::Int(
                            v.checked_neg()
                                .ok_or_else(|| self.fatal("integer overflow"))?,
                        ),
                        Operand::Num(v) => Value::Num(-v),
                    };
                    let r = self.alloc(value)?;
                    self.set_reg(a, r);
                }

                Op::Try => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let v = self.reg(b);
                    if matches!(self.gc.get(v), Value::Err(_)) {
                        if self.frames.len() == base {
                            return Ok(v);
                        }
                        self.pop_frame(v);
                    } else {
                        self.set_reg(a, v);
                    }
                }

                // Jumps
                Op::Jump => {
                    let offset = self.read_i32()?;
                    let target = self.ip as i64 + offset as i64;
                    if target < 0 || target as usize > self.module.code.len() {
                        return Err(Error::MalformedByteCode);
                    }
                    self.ip = target as usize;
                }
                Op::JumpTrue => {
                    let a = self.read_u8()?;
                    let offset = self.read_u32()?;
                    let cond = {
                        let r = self.reg(a);
                        self.get_bool(r)?
                    };
                    if cond {
                        self.jump_forward(offset)?;
                    }
                }
                Op::JumpFalse => {
                    let a = self.read_u8()?;
                    let offset = self.read_u32()?;
                    let cond = {
                        let r = self.reg(a);
                        self.get_bool(r)?
                    };
                    if !cond {
                        self.jump_forward(offset)?;
                    }
                }
                Op::JumpNone => {
                    let a = self.read_u8()?;
                    let offset = self.read_u32()?;
                    if matches!(self.gc.get(self.reg(a)), Value::None) {
                        self.jump_forward(offset)?;
                    }
                }
                Op::JumpNotError => {
                    let a = self.read_u8()?;
                    let offset = self.read_u32()?;
                    if !matches!(self.gc.get(self.reg(a)), Value::Err(_)) {
                        self.jump_forward(offset)?;
                    }
                }

                // Iteration
                Op::IterInit => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let over = self.reg(b);
                    if !matches!(
                        self.gc.get(over),
                        Value::Str(_)
                            | Value::Tuple(_)
                            | Value::List(_)
                            | Value::Map(_)
                            | Value::Range { .. }
                    ) {
                        let t = self.gc.get(over).type_name();
                        return Err(self.fatal(format!("cannot iterate {}", t)));
                    }
                    let r = self.alloc(Value::Iterator(Iter { over, index: 0 }))?;
                    self.set_reg(a, r);
                }
                Op::IterNext => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    self.iter_next(a, b)?;
                }

                // Error values
                Op::BuildError => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let inner = self.reg(b);
                    let r = self.alloc(Value::Err(inner))?;
                    self.set_reg(a, r);
                }
                Op::UnwrapError => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let v = self.reg(b);
                    match self.gc.get(v) {
                        Value::Err(inner) => {
                            let inner = *inner;
                            self.set_reg(a, inner);
                        }
                        other => {
                            let t = other.type_name();
                            return Err(self.fatal(format!("expected an error, got {}", t)));
                        }
                    }
                }

                // Imports and natives
                Op::Import => {
                    let a = self.read_u8()?;
                    let id = self.string_operand()?;
                    let result = self.import(&id)?;
                    self.set_reg(a, result);
                }
                Op::BuildNative => {
                    let a = self.read_u8()?;
                    let name = self.string_operand()?;
                    let Some(entry) = self.natives.get(&name) else {
                        return Err(self.fatal(format!("unknown native '{}'", name)));
                    };
                    let native = Native {
                        name: entry.name.clone(),
                        arg_count: entry.arg_count,
                        func: entry.func.clone(),
                    };
                    let r = self.alloc(Value::Native(native))?;
                    self.set_reg(a, r);
                }

                // Aggregates
                Op::BuildTuple | Op::BuildList | Op::BuildMap => {
                    let a = self.read_u8()?;
                    let first = self.read_u8()?;
                    let count = self.read_u16()?;
                    let items: Vec<Ref> =
                        (0..count).map(|i| self.reg_wide(first, i)).collect();
                    let value = match op {
                        Op::BuildTuple => Value::Tuple(items.into_boxed_slice()),
                        Op::BuildList => Value::List(items),
                        _ => {
                            if count % 2 != 0 {
                                return Err(Error::MalformedByteCode);
                            }
                            let mut entries = Vec::with_capacity(items.len() / 2);
                            for pair in items.chunks(2) {
                                value::map_insert(&self.gc, &mut entries, pair[0], pair[1]);
                            }
                            Value::Map(entries)
                        }
                    };
                    let r = self.alloc(value)?;
                    self.set_reg(a, r);
                }

                Op::BuildFn => {
                    let a = self.read_u8()?;
                    let arg_count = self.read_u8()?;
                    let capture_count = self.read_u8()?;
                    let entry = self.read_u32()?;
                    if entry as usize > self.module.code.len() {
                        return Err(Error::MalformedByteCode);
                    }
                    let func = Func {
                        arg_count,
                        entry,
                        module: self.module.clone(),
                        captures: vec![Gc::NONE; capture_count as usize],
                    };
                    let r = self.alloc(Value::Func(func))?;
                    self.set_reg(a, r);
                }

                // Captures
                Op::LoadCapture => {
                    let a = self.read_u8()?;
                    let n = self.read_u8()?;
                    let func = self.frames.last().and_then(|f| f.func);
                    let Some(func) = func else {
                        return Err(self.fatal("capture used outside a function"));
                    };
                    let capture = match self.gc.get(func) {
                        Value::Func(f) => f.captures.get(n as usize).copied(),
                        _ => None,
                    };
                    let capture = capture.ok_or(Error::MalformedByteCode)?;
                    self.set_reg(a, capture);
                }
                Op::StoreCapture => {
                    let target = self.read_u8()?;
                    let value_reg = self.read_u8()?;
                    let n = self.read_u8()?;
                    let value = self.reg(value_reg);
                    let target = self.reg(target);
                    match self.gc.get_mut(target) {
                        Value::Func(f) => {
                            let Some(slot) = f.captures.get_mut(n as usize) else {
                                return Err(Error::MalformedByteCode);
                            };
                            *slot = value;
                        }
                        _ => return Err(Error::MalformedByteCode),
                    }
                }

                // Member access
                Op::Get => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let c = self.read_u8()?;
                    let container = self.reg(b);
                    let key = self.reg(c);
                    match value::get(&mut self.gc, container, key) {
                        Ok(v) => {
                            self.set_reg(a, v);
                            self.last_get = Some(container);
                        }
                        Err(message) => return Err(self.fatal(message)),
                    }
                }
                Op::Set => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let c = self.read_u8()?;
                    let container = self.reg(a);
                    let key = self.reg(b);
                    let value = self.reg(c);
                    if let Err(message) = value::set(&mut self.gc, container, key, value) {
                        return Err(self.fatal(message));
                    }
                }

                // Type tests and conversions
                Op::As => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let ty =
                        Type::from_byte(self.read_u8()?).ok_or(Error::MalformedByteCode)?;
                    let v = self.reg(b);
                    match value::as_type(&mut self.gc, v, ty) {
                        Ok(r) => self.set_reg(a, r),
                        Err(message) => return Err(self.fatal(message)),
                    }
                }
                Op::Is => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let ty =
                        Type::from_byte(self.read_u8()?).ok_or(Error::MalformedByteCode)?;
                    let v = value::is_type(&self.gc, self.reg(b), ty);
                    self.set_reg(a, Gc::bool_ref(v));
                }

                // Calls and returns
                Op::Call => {
                    self.call(prev_get, base)?;
                }
                Op::Return => {
                    let a = self.read_u8()?;
                    let value = self.reg(a);
                    if self.frames.len() == base {
                        return Ok(value);
                    }
                    self.pop_frame(value);
                }
                Op::ReturnNone => {
                    if self.frames.len() == base {
                        return Ok(Gc::NONE);
                    }
                    self.pop_frame(Gc::NONE);
                }

                // Frame context
                Op::LoadThis => {
                    let a = self.read_u8()?;
                    let this = self.frames.last().and_then(|f| f.this);
                    let Some(this) = this else {
                        return Err(self.fatal("'this' has not been set"));
                    };
                    self.set_reg(a, this);
                }
                Op::Discard => {
                    let a = self.read_u8()?;
                    let v = self.reg(a);
                    if matches!(self.gc.get(v), Value::Err(_)) {
                        if self.frames.len() == base {
                            return Ok(v);
                        }
                        return Err(self.fatal("error discarded"));
                    }
                    if self.options.repl && self.frames.len() == base {
                        return Ok(v);
                    }
                }
                Op::LineInfo => {
                    self.line_loc = self.read_u32()?;
                }

                Op::BuildRange => {
                    let a = self.read_u8()?;
                    let b = self.read_u8()?;
                    let c = self.read_u8()?;
                    let start = {
                        let r = self.reg(b);
                        self.get_int(r)?
                    };
                    let end = {
                        let r = self.reg(c);
                        self.get_int(r)?
                    };
                    let r = self.alloc(Value::Range {
                        start,
                        end,
                        step: 1,
                    })?;
                    self.set_reg(a, r);
                }
            }
        }
    }

    /// Register index that may exceed the u8 operand range when added to the
    /// aggregate base.
    fn reg_wide(&self, base: u8, offset: u16) -> Ref {
        self.stack
            .get(self.sp + base as usize + offset as usize)
            .copied()
            .unwrap_or(Gc::NONE)
    }

    fn pop_frame(&mut self, value: Ref) {
        let frame = self.frames.pop().expect("pop on empty call stack");
        self.stack.truncate(frame.entry_sp);
        self.sp = frame.caller_sp;
        self.ip = frame.ret_ip;
        self.line_loc = frame.line;
        self.module = frame.module;
        self.set_reg(frame.ret_reg, value);
    }

    fn call(&mut self, this: Option<Ref>, _base: usize) -> Result<()> {
        let ret = self.read_u8()?;
        let func_reg = self.read_u8()?;
        let arg_base = self.read_u8()?;
        let arg_count = self.read_u16()?;
        let callee = self.reg(func_reg);

        enum Target {
            Script {
                arg_count: u8,
                entry: u32,
                module: Rc<Module>,
            },
            Native {
                arg_count: Option<u8>,
                func: NativeFn,
            },
        }

        let target = match self.gc.get(callee) {
            Value::Func(f) => Target::Script {
                arg_count: f.arg_count,
                entry: f.entry,
                module: f.module.clone(),
            },
            Value::Native(n) => Target::Native {
                arg_count: n.arg_count,
                func: n.func.clone(),
            },
            other => {
                let t = other.type_name();
                return Err(self.fatal(format!("cannot call {}", t)));
            }
        };

        match target {
            Target::Native {
                arg_count: expected,
                func,
            } => {
                if let Some(expected) = expected {
                    if expected as u16 != arg_count {
                        return Err(self.fatal(format!(
                            "expected {} arguments, got {}",
                            expected, arg_count
                        )));
                    }
                }
                let args: Vec<Ref> = (0..arg_count)
                    .map(|i| self.reg_wide(arg_base, i))
                    .collect();
                let result = func(self, &args)?;
                self.set_reg(ret, result);
            }
            Target::Script {
                arg_count: expected,
                entry,
                module,
            } => {
                if expected as u16 != arg_count {
                    return Err(self.fatal(format!(
                        "expected {} arguments, got {}",
                        expected, arg_count
                    )));
                }
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(self.fatal("maximum call depth exceeded"));
                }
                let entry_sp = self.sp + arg_base as usize;
                self.frames.push(Frame {
                    ret_ip: self.ip,
                    caller_sp: self.sp,
                    entry_sp,
                    line: self.line_loc,
                    ret_reg: ret,
                    module: std::mem::replace(&mut self.module, module),
                    func: Some(callee),
                    this,
                });
                self.sp = entry_sp;
                self.ip = entry as usize;
            }
        }
        Ok(())
    }

    fn iter_next(&mut self, a: u8, b: u8) -> Result<()> {
        let iter_ref = self.reg(b);
        let (over, index) = match self.gc.get(iter_ref) {
            Value::Iterator(iter) => (iter.over, iter.index),
            other => {
                let t = other.type_name();
                return Err(self.fatal(format!("expected iterator, got {}", t)));
            }
        };

        enum Step {
            Done,
            Have(Ref, usize),
            NewStr(String, usize),
            NewPair(Ref, Ref, usize),
            NewInt(i64, usize),
        }

        let step = match self.gc.get(over) {
            Value::Str(s) => match s[index.min(s.len())..].chars().next() {
                Some(c) => Step::NewStr(c.to_string(), index + c.len_utf8()),
                None => Step::Done,
            },
            Value::Tuple(items) => match items.get(index) {
                Some(&r) => Step::Have(r, index + 1),
                None => Step::Done,
            },
            Value::List(items) => match items.get(index) {
                Some(&r) => Step::Have(r, index + 1),
                None => Step::Done,
            },
            Value::Map(entries) => match entries.get(index) {
                Some(&(k, v)) => Step::NewPair(k, v, index + 1),
                None => Step::Done,
            },
            Value::Range { start, end, step } => {
                let current = start + (index as i64) * step;
                let in_range = if *step > 0 {
                    current < *end
                } else if *step < 0 {
                    current > *end
                } else {
                    false
                };
                if in_range {
                    Step::NewInt(current, index + 1)
                } else {
                    Step::Done
                }
            }
            other => {
                let t = other.type_name();
                return Err(self.fatal(format!("cannot iterate {}", t)));
            }
        };

        let (element, new_index) = match step {
            Step::Done => (Gc::NONE, index),
            Step::Have(r, i) => (r, i),
            Step::NewStr(s, i) => (self.alloc(Value::Str(s))?, i),
            Step::NewPair(k, v, i) => {
                (self.alloc(Value::Tuple(vec![k, v].into_boxed_slice()))?, i)
            }
            Step::NewInt(v, i) => (self.alloc(Value::Int(v))?, i),
        };

        if let Value::Iterator(iter) = self.gc.get_mut(iter_ref) {
            iter.index = new_index;
        }
        self.set_reg(a, element);
        Ok(())
    }

    // ========================================================================
    // Arithmetic
    // ========================================================================

    fn apply_arith(&mut self, op: Op, x: Operand, y: Operand) -> Result<Value> {
        use Operand::Int;

        // `/` always yields num, `//` always yields int.
        if op == Op::Div {
            let q = y.as_num();
            if q == 0.0 {
                return Err(self.fatal("division by zero"));
            }
            return Ok(Value::Num(x.as_num() / q));
        }
        if op == Op::DivFloor {
            return match (x, y) {
                (Int(p), Int(q)) => {
                    if q == 0 {
                        return Err(self.fatal("division by zero"));
                    }
                    let v = p
                        .checked_div(q)
                        .ok_or_else(|| self.fatal("integer overflow"))?;
                    let r = p % q;
                    let v = if r != 0 && (r < 0) != (q < 0) { v - 1 } else { v };
                    Ok(Value::Int(v))
                }
                _ => {
                    let q = y.as_num();
                    if q == 0.0 {
                        return Err(self.fatal("division by zero"));
                    }
                    let v = (x.as_num() / q).floor();
                    if !v.is_finite() || v < i64::MIN as f64 || v > i64::MAX as f64 {
                        return Err(self.fatal("integer overflow"));
                    }
                    Ok(Value::Int(v as i64))
                }
            };
        }

        match (x, y) {
            (Int(p), Int(q)) => {
                let v = match op {
                    Op::Add => p.checked_add(q),
                    Op::Sub => p.checked_sub(q),
                    Op::Mul => p.checked_mul(q),
                    Op::Mod => {
                        if q == 0 {
                            return Err(self.fatal("division by zero"));
                        }
                        p.checked_rem(q)
                    }
                    Op::Pow => {
                        if q < 0 {
                            return Err(self.fatal("negative exponent"));
                        }
                        u32::try_from(q).ok().and_then(|e| p.checked_pow(e))
                    }
                    _ => unreachable!("not an arithmetic opcode"),
                };
                let v = v.ok_or_else(|| self.fatal("integer overflow"))?;
                Ok(Value::Int(v))
            }
            _ => {
                let p = x.as_num();
                let q = y.as_num();
                let v = match op {
                    Op::Add => p + q,
                    Op::Sub => p - q,
                    Op::Mul => p * q,
                    Op::Mod => {
                        if q == 0.0 {
                            return Err(self.fatal("division by zero"));
                        }
                        p % q
                    }
                    Op::Pow => p.powf(q),
                    _ => unreachable!("not an arithmetic opcode"),
                };
                Ok(Value::Num(v))
            }
        }
    }

    // ========================================================================
    // Imports
    // ========================================================================

    /// Import by id: cache hit, `.bog` source (size-capped, compiled, cached)
    /// or `.bogc` image. The cache entry is created before execution, so a
    /// cyclic first touch observes the partial (none) result.
    fn import(&mut self, id: &str) -> Result<Ref> {
        if let Some(entry) = self.imports.get(id) {
            return Ok(entry.result);
        }
        if !self.options.import_files {
            return Err(self.fatal("import failed"));
        }

        let module = if id.ends_with(".bog") {
            let bytes = fs::read(id)?;
            if bytes.len() as u64 > self.options.max_import_size as u64 {
                return Err(self.fatal("import failed"));
            }
            let source = match String::from_utf8(bytes) {
                Ok(source) => source,
                Err(_) => {
                    self.errors.push_error("imported file is not UTF-8", self.line_loc);
                    return Err(Error::Tokenize);
                }
            };
            Rc::new(self.compile_source(&source, id)?)
        } else if id.ends_with(".bogc") {
            let bytes = fs::read(id)?;
            Rc::new(Module::read_bytes(id, &bytes)?)
        } else {
            return Err(self.fatal("import failed"));
        };

        self.imports.insert(
            id.to_string(),
            ImportEntry {
                module: module.clone(),
                result: Gc::NONE,
            },
        );
        let result = self.exec(module)?;
        if let Some(entry) = self.imports.get_mut(id) {
            entry.result = result;
        }
        Ok(result)
    }

    /// Number of live values in the heap, for tests and diagnostics.
    pub fn heap_live(&self) -> usize {
        self.gc.live()
    }

    /// Current register stack length, for tests and diagnostics.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Call stack depth, for tests and diagnostics.
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum Operand {
    Int(i64),
    Num(f64),
}

impl Operand {
    fn as_num(self) -> f64 {
        match self {
            Operand::Int(v) => v as f64,
            Operand::Num(v) => v,
        }
    }
}
