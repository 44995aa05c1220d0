// bog-vm - Bytecode compiler and virtual machine for the Bog scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Code generation: lowers a parsed [`Tree`] into a [`Module`].
//!
//! Registers are allocated with stack discipline relative to the frame:
//! locals pin a register for their scope, temporaries are released when the
//! expression that needed them ends. Function bodies compile into separate
//! buffers that are laid out after the module's top-level code; `BuildFn`
//! entry operands are patched once the final layout is known.

use std::collections::HashMap;
use std::fmt;

use bog_parser::{Errors, InfixOp, NodeId, NodeKind, PrefixOp, Tree, TypeName};

use crate::bytecode::{CodeBuf, Op, PRIMITIVE_FALSE, PRIMITIVE_NONE, PRIMITIVE_TRUE};
use crate::module::{push_string, Module};
use crate::value::Type;

/// Marker returned when compilation fails; the diagnostic is in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileFailed;

impl fmt::Display for CompileFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compile error")
    }
}

impl std::error::Error for CompileFailed {}

type Result<T> = std::result::Result<T, CompileFailed>;

/// Compile a parsed tree into a module named `name`.
pub fn compile(tree: &Tree, name: &str, errors: &mut Errors) -> Result<Module> {
    let mut compiler = Compiler {
        tree,
        errors,
        strings: Vec::new(),
        string_index: HashMap::new(),
        protos: Vec::new(),
        fixups: Vec::new(),
        fns: vec![FnScope::main()],
        last_offset: 0,
    };

    for &stmt in &tree.root {
        compiler.stmt(stmt)?;
    }
    compiler.code().op(Op::ReturnNone);

    Ok(compiler.assemble(name))
}

/// How a capture fetches its value from the enclosing scope at `BuildFn`.
#[derive(Debug, Clone, Copy)]
enum CaptureSrc {
    Local(u8),
    Capture(u8),
}

#[derive(Debug)]
struct Capture {
    name: String,
    src: CaptureSrc,
}

#[derive(Debug)]
struct Local {
    name: String,
    reg: u8,
}

struct LoopCtx {
    /// Jump target for `continue`.
    start: usize,
    /// Forward jump patch positions for `break`.
    breaks: Vec<usize>,
    /// The loop expression's destination register; `break value` writes it.
    dst: u8,
}

struct FnScope {
    /// Index into `protos`; `None` for the module's top-level code.
    proto_index: Option<usize>,
    code: CodeBuf,
    next_reg: u16,
    locals: Vec<Local>,
    captures: Vec<Capture>,
    loops: Vec<LoopCtx>,
}

impl FnScope {
    fn main() -> Self {
        FnScope {
            proto_index: None,
            code: CodeBuf::new(),
            next_reg: 0,
            locals: Vec::new(),
            captures: Vec::new(),
            loops: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Resolved {
    Local(u8),
    Capture(u8),
}

/// A `BuildFn` entry operand awaiting the final code layout.
struct EntryFixup {
    /// Which buffer the operand lives in; `None` is the top-level buffer.
    buf: Option<usize>,
    at: usize,
    proto: usize,
}

struct Compiler<'t, 'e> {
    tree: &'t Tree,
    errors: &'e mut Errors,
    strings: Vec<u8>,
    string_index: HashMap<String, u32>,
    protos: Vec<CodeBuf>,
    fixups: Vec<EntryFixup>,
    /// Stack of function scopes being compiled; index 0 is the module.
    fns: Vec<FnScope>,
    last_offset: u32,
}

impl<'t, 'e> Compiler<'t, 'e> {
    // ========================================================================
    // Scope and register helpers
    // ========================================================================

    fn scope(&mut self) -> &mut FnScope {
        self.fns.last_mut().unwrap()
    }

    fn code(&mut self) -> &mut CodeBuf {
        &mut self.fns.last_mut().unwrap().code
    }

    fn fail(&mut self, message: impl Into<String>) -> CompileFailed {
        self.errors.push_error(message.into(), self.last_offset);
        CompileFailed
    }

    fn alloc_reg(&mut self) -> Result<u8> {
        let scope = self.scope();
        if scope.next_reg > u8::MAX as u16 {
            return Err(self.fail("function uses too many registers"));
        }
        let reg = scope.next_reg as u8;
        scope.next_reg += 1;
        Ok(reg)
    }

    fn reg_mark(&mut self) -> u16 {
        self.scope().next_reg
    }

    fn reset_regs(&mut self, mark: u16) {
        self.scope().next_reg = mark;
    }

    fn declare_local(&mut self, name: &str) -> Result<u8> {
        let reg = self.alloc_reg()?;
        self.scope().locals.push(Local {
            name: name.to_string(),
            reg,
        });
        Ok(reg)
    }

    /// Scope snapshot for block-structured constructs: locals declared after
    /// the mark go out of scope when it is restored.
    fn scope_mark(&mut self) -> (usize, u16) {
        let scope = self.scope();
        (scope.locals.len(), scope.next_reg)
    }

    fn restore_scope(&mut self, mark: (usize, u16)) {
        let scope = self.scope();
        scope.locals.truncate(mark.0);
        scope.next_reg = mark.1;
    }

    fn str_ref(&mut self, text: &str) -> u32 {
        if let Some(&offset) = self.string_index.get(text) {
            return offset;
        }
        let offset = push_string(&mut self.strings, text);
        self.string_index.insert(text.to_string(), offset);
        offset
    }

    /// Resolve a name against the scope at `level`, adding capture links
    /// through intermediate functions as needed.
    fn resolve_at(&mut self, level: usize, name: &str) -> Result<Option<Resolved>> {
        if let Some(reg) = self.fns[level]
            .locals
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| l.reg)
        {
            return Ok(Some(Resolved::Local(reg)));
        }
        if let Some(i) = self.fns[level].captures.iter().position(|c| c.name == name) {
            return Ok(Some(Resolved::Capture(i as u8)));
        }
        if level == 0 {
            return Ok(None);
        }
        let parent = match self.resolve_at(level - 1, name)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let src = match parent {
            Resolved::Local(reg) => CaptureSrc::Local(reg),
            Resolved::Capture(i) => CaptureSrc::Capture(i),
        };
        let index = self.fns[level].captures.len();
        if index > u8::MAX as usize {
            return Err(self.fail("function captures too many values"));
        }
        self.fns[level].captures.push(Capture {
            name: name.to_string(),
            src,
        });
        Ok(Some(Resolved::Capture(index as u8)))
    }

    fn resolve(&mut self, name: &str) -> Result<Option<Resolved>> {
        self.resolve_at(self.fns.len() - 1, name)
    }

    // ========================================================================
    // Jump emission
    // ========================================================================

    /// Emit a conditional forward jump; returns the patch position.
    fn jump_forward(&mut self, op: Op, cond: Option<u8>) -> usize {
        self.code().op(op);
        if let Some(reg) = cond {
            self.code().u8(reg);
        }
        let at = self.code().pos();
        self.code().u32(0);
        at
    }

    fn patch_forward(&mut self, at: usize) {
        let target = self.code().pos();
        let offset = (target - (at + 4)) as u32;
        self.code().patch_u32(at, offset);
    }

    fn jump_back(&mut self, target: usize) {
        self.code().op(Op::Jump);
        let at = self.code().pos();
        let offset = target as i64 - (at as i64 + 4);
        self.code().i32(offset as i32);
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn stmt(&mut self, id: NodeId) -> Result<()> {
        let node = self.tree.node(id);
        self.last_offset = node.offset;
        self.code().op(Op::LineInfo);
        let offset = node.offset;
        self.code().u32(offset);

        if let NodeKind::Let { pattern, body } = node.kind {
            return self.compile_let(pattern, body);
        }

        let mark = self.reg_mark();
        let tmp = self.alloc_reg()?;
        self.expr(id, tmp)?;
        self.code().op(Op::Discard);
        self.code().u8(tmp);
        self.reset_regs(mark);
        Ok(())
    }

    fn compile_let(&mut self, pattern: NodeId, body: NodeId) -> Result<()> {
        if let NodeKind::Ident(name) = &self.tree.node(pattern).kind {
            let name = name.clone();
            // Binding a function declares the name first so the body can
            // capture it for self-recursion. Any other binding stays out of
            // scope while its own initializer runs.
            if matches!(self.tree.node(body).kind, NodeKind::Fn { .. }) {
                let reg = self.declare_local(&name)?;
                return self.expr(body, reg);
            }
            let reg = self.alloc_reg()?;
            self.expr(body, reg)?;
            self.scope().locals.push(Local { name, reg });
            return Ok(());
        }

        let tmp = self.alloc_reg()?;
        self.expr(body, tmp)?;
        self.destructure(pattern, tmp)
    }

    /// Bind a pattern against the value in `src`, declaring locals.
    fn destructure(&mut self, pattern: NodeId, src: u8) -> Result<()> {
        match &self.tree.node(pattern).kind {
            NodeKind::Ident(name) => {
                let name = name.clone();
                let reg = self.declare_local(&name)?;
                self.code().op(Op::Move);
                self.code().u8(reg);
                self.code().u8(src);
                Ok(())
            }
            NodeKind::Discard => Ok(()),
            NodeKind::UnwrapTuple(items) | NodeKind::UnwrapList(items) => {
                let items = items.clone();
                if items.len() > i8::MAX as usize {
                    return Err(self.fail("pattern has too many elements"));
                }
                for (i, item) in items.iter().enumerate() {
                    let key = self.alloc_reg()?;
                    self.code().op(Op::ConstInt8);
                    self.code().u8(key);
                    self.code().i8(i as i8);
                    let elem = self.alloc_reg()?;
                    self.code().op(Op::Get);
                    self.code().u8(elem);
                    self.code().u8(src);
                    self.code().u8(key);
                    self.destructure(*item, elem)?;
                }
                Ok(())
            }
            NodeKind::UnwrapMap(items) => {
                let items = items.clone();
                for item in items {
                    let NodeKind::MapItem { key, value } = self.tree.node(item).kind else {
                        return Err(self.fail("invalid map pattern"));
                    };
                    let key_reg = self.alloc_reg()?;
                    match key {
                        Some(key) => self.map_key(key, key_reg)?,
                        None => {
                            // `{x}` binds `x` from the key "x".
                            let NodeKind::Ident(name) = &self.tree.node(value).kind else {
                                return Err(
                                    self.fail("expected a key for this map pattern entry")
                                );
                            };
                            let sref = self.str_ref(&name.clone());
                            self.code().op(Op::ConstString);
                            self.code().u8(key_reg);
                            self.code().u32(sref);
                        }
                    }
                    let elem = self.alloc_reg()?;
                    self.code().op(Op::Get);
                    self.code().u8(elem);
                    self.code().u8(src);
                    self.code().u8(key_reg);
                    self.destructure(value, elem)?;
                }
                Ok(())
            }
            NodeKind::UnwrapError(inner) => {
                let inner = *inner;
                let payload = self.alloc_reg()?;
                self.code().op(Op::UnwrapError);
                self.code().u8(payload);
                self.code().u8(src);
                self.destructure(inner, payload)
            }
            _ => Err(self.fail("invalid pattern")),
        }
    }

    /// Compile a map key: a bare identifier means a string key.
    fn map_key(&mut self, key: NodeId, dst: u8) -> Result<()> {
        if let NodeKind::Ident(name) = &self.tree.node(key).kind {
            let sref = self.str_ref(&name.clone());
            self.code().op(Op::ConstString);
            self.code().u8(dst);
            self.code().u32(sref);
            return Ok(());
        }
        self.expr(key, dst)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    /// Compile `id`, leaving the result in `dst`.
    fn expr(&mut self, id: NodeId, dst: u8) -> Result<()> {
        let node = self.tree.node(id);
        self.last_offset = node.offset;
        match &node.kind {
            NodeKind::None => self.const_primitive(dst, PRIMITIVE_NONE),
            NodeKind::True => self.const_primitive(dst, PRIMITIVE_TRUE),
            NodeKind::False => self.const_primitive(dst, PRIMITIVE_FALSE),
            NodeKind::Int(v) => {
                let v = *v;
                self.const_int(dst, v);
            }
            NodeKind::Num(v) => {
                let v = *v;
                self.code().op(Op::ConstNum);
                self.code().u8(dst);
                self.code().f64(v);
            }
            NodeKind::Str(s) => {
                let sref = self.str_ref(&s.clone());
                self.code().op(Op::ConstString);
                self.code().u8(dst);
                self.code().u32(sref);
            }
            NodeKind::Ident(name) => {
                let name = name.clone();
                self.ident(&name, dst)?;
            }
            NodeKind::Discard => {
                return Err(self.fail("'_' is only valid in patterns and assignments"));
            }
            NodeKind::Prefix { op, rhs } => {
                let (op, rhs) = (*op, *rhs);
                self.prefix(op, rhs, dst)?;
            }
            NodeKind::Infix { op, lhs, rhs } => {
                let (op, lhs, rhs) = (*op, *lhs, *rhs);
                self.infix(op, lhs, rhs, dst)?;
            }
            NodeKind::Is { lhs, ty } => {
                let (lhs, ty) = (*lhs, *ty);
                let mark = self.reg_mark();
                let reg = self.expr_reg(lhs)?;
                self.code().op(Op::Is);
                self.code().u8(dst);
                self.code().u8(reg);
                self.code().u8(type_id(ty) as u8);
                self.reset_regs(mark);
            }
            NodeKind::As { lhs, ty } => {
                let (lhs, ty) = (*lhs, *ty);
                if matches!(ty, TypeName::Err | TypeName::Range | TypeName::Func) {
                    return Err(self.fail(format!("cannot cast to {}", ty)));
                }
                let mark = self.reg_mark();
                let reg = self.expr_reg(lhs)?;
                self.code().op(Op::As);
                self.code().u8(dst);
                self.code().u8(reg);
                self.code().u8(type_id(ty) as u8);
                self.reset_regs(mark);
            }
            NodeKind::Index { lhs, index } => {
                let (lhs, index) = (*lhs, *index);
                let mark = self.reg_mark();
                let container = self.expr_reg(lhs)?;
                let key = self.expr_reg(index)?;
                self.code().op(Op::Get);
                self.code().u8(dst);
                self.code().u8(container);
                self.code().u8(key);
                self.reset_regs(mark);
            }
            NodeKind::Member { lhs, name } => {
                let (lhs, name) = (*lhs, name.clone());
                let mark = self.reg_mark();
                let container = self.expr_reg(lhs)?;
                let key = self.alloc_reg()?;
                let sref = self.str_ref(&name);
                self.code().op(Op::ConstString);
                self.code().u8(key);
                self.code().u32(sref);
                self.code().op(Op::Get);
                self.code().u8(dst);
                self.code().u8(container);
                self.code().u8(key);
                self.reset_regs(mark);
            }
            NodeKind::Call { lhs, args } => {
                let (lhs, args) = (*lhs, args.clone());
                self.call(lhs, &args, dst)?;
            }
            NodeKind::Grouped(inner) => {
                let inner = *inner;
                self.expr(inner, dst)?;
            }
            NodeKind::List(items) => {
                let items = items.clone();
                self.aggregate(Op::BuildList, &items, dst)?;
            }
            NodeKind::Tuple(items) => {
                let items = items.clone();
                self.aggregate(Op::BuildTuple, &items, dst)?;
            }
            NodeKind::Map(items) => {
                let items = items.clone();
                self.map_literal(&items, dst)?;
            }
            NodeKind::Block(stmts) => {
                let stmts = stmts.clone();
                let mark = self.scope_mark();
                for stmt in stmts {
                    self.stmt(stmt)?;
                }
                self.restore_scope(mark);
                self.const_primitive(dst, PRIMITIVE_NONE);
            }
            NodeKind::MapItem { .. } => return Err(self.fail("map entry outside a map")),
            NodeKind::Let { pattern, body } => {
                let (pattern, body) = (*pattern, *body);
                self.compile_let(pattern, body)?;
                self.const_primitive(dst, PRIMITIVE_NONE);
            }
            NodeKind::Fn { params, body } => {
                let (params, body) = (params.clone(), *body);
                self.function(&params, body, dst)?;
            }
            NodeKind::If {
                pattern,
                cond,
                body,
                else_body,
            } => {
                let (pattern, cond, body, else_body) = (*pattern, *cond, *body, *else_body);
                self.if_expr(pattern, cond, body, else_body, dst)?;
            }
            NodeKind::While {
                pattern,
                cond,
                body,
            } => {
                let (pattern, cond, body) = (*pattern, *cond, *body);
                self.while_expr(pattern, cond, body, dst)?;
            }
            NodeKind::For {
                pattern,
                iterable,
                body,
            } => {
                let (pattern, iterable, body) = (*pattern, *iterable, *body);
                self.for_expr(pattern, iterable, body, dst)?;
            }
            NodeKind::Match { expr, cases } => {
                let (expr, cases) = (*expr, cases.clone());
                self.match_expr(expr, &cases, dst)?;
            }
            NodeKind::MatchCase { .. }
            | NodeKind::MatchLet { .. }
            | NodeKind::MatchCatchAll { .. } => {
                return Err(self.fail("match case outside a match"));
            }
            NodeKind::Catch { lhs, pattern, rhs } => {
                let (lhs, pattern, rhs) = (*lhs, *pattern, *rhs);
                self.catch_expr(lhs, pattern, rhs, dst)?;
            }
            NodeKind::Return(value) => {
                let value = *value;
                match value {
                    Some(value) => {
                        let mark = self.reg_mark();
                        let reg = self.expr_reg(value)?;
                        self.code().op(Op::Return);
                        self.code().u8(reg);
                        self.reset_regs(mark);
                    }
                    None => self.code().op(Op::ReturnNone),
                }
            }
            NodeKind::Break(value) => {
                let value = *value;
                let Some(ctx_dst) = self.scope().loops.last().map(|l| l.dst) else {
                    return Err(self.fail("'break' is not allowed outside of loops"));
                };
                match value {
                    Some(value) => self.expr(value, ctx_dst)?,
                    None => self.const_primitive(ctx_dst, PRIMITIVE_NONE),
                }
                let at = self.jump_forward(Op::Jump, None);
                self.scope().loops.last_mut().unwrap().breaks.push(at);
            }
            NodeKind::Continue => {
                let Some(start) = self.scope().loops.last().map(|l| l.start) else {
                    return Err(self.fail("'continue' is not allowed outside of loops"));
                };
                self.jump_back(start);
            }
            NodeKind::Import(name) => {
                let sref = self.str_ref(&name.clone());
                self.code().op(Op::Import);
                self.code().u8(dst);
                self.code().u32(sref);
            }
            NodeKind::Error(value) => {
                let value = *value;
                let mark = self.reg_mark();
                let reg = self.expr_reg(value)?;
                self.code().op(Op::BuildError);
                self.code().u8(dst);
                self.code().u8(reg);
                self.reset_regs(mark);
            }
            NodeKind::UnwrapTuple(_)
            | NodeKind::UnwrapList(_)
            | NodeKind::UnwrapMap(_)
            | NodeKind::UnwrapError(_) => {
                return Err(self.fail("pattern is not valid here"));
            }
        }
        Ok(())
    }

    /// Result register for an operand: locals are used in place, anything
    /// else evaluates into a fresh temporary.
    fn expr_reg(&mut self, id: NodeId) -> Result<u8> {
        if let NodeKind::Ident(name) = &self.tree.node(id).kind {
            if name != "this" {
                let name = name.clone();
                if let Some(Resolved::Local(reg)) = self.resolve(&name)? {
                    return Ok(reg);
                }
            }
        }
        let reg = self.alloc_reg()?;
        self.expr(id, reg)?;
        Ok(reg)
    }

    fn const_primitive(&mut self, dst: u8, which: u8) {
        self.code().op(Op::ConstPrimitive);
        self.code().u8(dst);
        self.code().u8(which);
    }

    fn const_int(&mut self, dst: u8, v: i64) {
        if let Ok(small) = i8::try_from(v) {
            self.code().op(Op::ConstInt8);
            self.code().u8(dst);
            self.code().i8(small);
        } else if let Ok(medium) = i32::try_from(v) {
            self.code().op(Op::ConstInt32);
            self.code().u8(dst);
            self.code().i32(medium);
        } else {
            self.code().op(Op::ConstInt64);
            self.code().u8(dst);
            self.code().i64(v);
        }
    }

    fn ident(&mut self, name: &str, dst: u8) -> Result<()> {
        if name == "this" {
            self.code().op(Op::LoadThis);
            self.code().u8(dst);
            return Ok(());
        }
        match self.resolve(name)? {
            Some(Resolved::Local(reg)) => {
                if reg != dst {
                    self.code().op(Op::Move);
                    self.code().u8(dst);
                    self.code().u8(reg);
                }
            }
            Some(Resolved::Capture(i)) => {
                self.code().op(Op::LoadCapture);
                self.code().u8(dst);
                self.code().u8(i);
            }
            // Names with no binding refer to host natives.
            None => {
                let sref = self.str_ref(name);
                self.code().op(Op::BuildNative);
                self.code().u8(dst);
                self.code().u32(sref);
            }
        }
        Ok(())
    }

    fn prefix(&mut self, op: PrefixOp, rhs: NodeId, dst: u8) -> Result<()> {
        match op {
            PrefixOp::Try => {
                self.expr(rhs, dst)?;
                self.code().op(Op::Try);
                self.code().u8(dst);
                self.code().u8(dst);
            }
            PrefixOp::Plus => {
                // Unary plus is the identity on numbers.
                self.expr(rhs, dst)?;
            }
            _ => {
                let mark = self.reg_mark();
                let reg = self.expr_reg(rhs)?;
                let opcode = match op {
                    PrefixOp::BoolNot => Op::BoolNot,
                    PrefixOp::BitNot => Op::BitNot,
                    PrefixOp::Minus => Op::Negate,
                    _ => unreachable!(),
                };
                self.code().op(opcode);
                self.code().u8(dst);
                self.code().u8(reg);
                self.reset_regs(mark);
            }
        }
        Ok(())
    }

    fn infix(&mut self, op: InfixOp, lhs: NodeId, rhs: NodeId, dst: u8) -> Result<()> {
        if op.is_assign() {
            return self.assign(op, lhs, rhs, dst);
        }
        match op {
            // Boolean operators short-circuit.
            InfixOp::BoolAnd => {
                self.expr(lhs, dst)?;
                let end = self.jump_forward(Op::JumpFalse, Some(dst));
                self.expr(rhs, dst)?;
                self.patch_forward(end);
            }
            InfixOp::BoolOr => {
                self.expr(lhs, dst)?;
                let end = self.jump_forward(Op::JumpTrue, Some(dst));
                self.expr(rhs, dst)?;
                self.patch_forward(end);
            }
            _ => {
                let opcode = match op {
                    InfixOp::Add => Op::Add,
                    InfixOp::Sub => Op::Sub,
                    InfixOp::Mul => Op::Mul,
                    InfixOp::Div => Op::Div,
                    InfixOp::DivFloor => Op::DivFloor,
                    InfixOp::Mod => Op::Mod,
                    InfixOp::Pow => Op::Pow,
                    InfixOp::BitAnd => Op::BitAnd,
                    InfixOp::BitOr => Op::BitOr,
                    InfixOp::BitXor => Op::BitXor,
                    InfixOp::LShift => Op::LShift,
                    InfixOp::RShift => Op::RShift,
                    InfixOp::Equal => Op::Equal,
                    InfixOp::NotEqual => Op::NotEqual,
                    InfixOp::LessThan => Op::LessThan,
                    InfixOp::LessThanEqual => Op::LessThanEqual,
                    InfixOp::GreaterThan => Op::GreaterThan,
                    InfixOp::GreaterThanEqual => Op::GreaterThanEqual,
                    InfixOp::In => Op::In,
                    InfixOp::Range => Op::BuildRange,
                    _ => unreachable!("assignments handled above"),
                };
                let mark = self.reg_mark();
                let a = self.expr_reg(lhs)?;
                let b = self.expr_reg(rhs)?;
                self.code().op(opcode);
                self.code().u8(dst);
                self.code().u8(a);
                self.code().u8(b);
                self.reset_regs(mark);
            }
        }
        Ok(())
    }

    fn assign(&mut self, op: InfixOp, lhs: NodeId, rhs: NodeId, dst: u8) -> Result<()> {
        let base = op.compound_base();
        match &self.tree.node(lhs).kind {
            NodeKind::Ident(name) => {
                let name = name.clone();
                let target = match self.resolve(&name)? {
                    Some(Resolved::Local(reg)) => reg,
                    Some(Resolved::Capture(_)) => {
                        return Err(self.fail(format!("cannot assign to captured '{}'", name)));
                    }
                    None => {
                        return Err(self.fail(format!("use of undeclared identifier '{}'", name)));
                    }
                };
                match base {
                    None => {
                        let mark = self.reg_mark();
                        let tmp = self.alloc_reg()?;
                        self.expr(rhs, tmp)?;
                        self.code().op(Op::Move);
                        self.code().u8(target);
                        self.code().u8(tmp);
                        self.reset_regs(mark);
                    }
                    Some(base) => {
                        let mark = self.reg_mark();
                        let value = self.expr_reg(rhs)?;
                        let opcode = arith_op(base);
                        self.code().op(opcode);
                        self.code().u8(target);
                        self.code().u8(target);
                        self.code().u8(value);
                        self.reset_regs(mark);
                    }
                }
            }
            NodeKind::Discard => {
                if base.is_some() {
                    return Err(self.fail("cannot use a compound assignment with '_'"));
                }
                let mark = self.reg_mark();
                let tmp = self.alloc_reg()?;
                self.expr(rhs, tmp)?;
                self.reset_regs(mark);
            }
            NodeKind::Index { lhs: container, index } => {
                let (container, index) = (*container, *index);
                let mark = self.reg_mark();
                let container = self.expr_reg(container)?;
                let key = self.expr_reg(index)?;
                self.assign_slot(container, key, rhs, base)?;
                self.reset_regs(mark);
            }
            NodeKind::Member { lhs: container, name } => {
                let (container, name) = (*container, name.clone());
                let mark = self.reg_mark();
                let container = self.expr_reg(container)?;
                let key = self.alloc_reg()?;
                let sref = self.str_ref(&name);
                self.code().op(Op::ConstString);
                self.code().u8(key);
                self.code().u32(sref);
                self.assign_slot(container, key, rhs, base)?;
                self.reset_regs(mark);
            }
            _ => return Err(self.fail("cannot assign to this expression")),
        }
        self.const_primitive(dst, PRIMITIVE_NONE);
        Ok(())
    }

    fn assign_slot(
        &mut self,
        container: u8,
        key: u8,
        rhs: NodeId,
        base: Option<InfixOp>,
    ) -> Result<()> {
        let value = match base {
            None => self.expr_reg(rhs)?,
            Some(base) => {
                let current = self.alloc_reg()?;
                self.code().op(Op::Get);
                self.code().u8(current);
                self.code().u8(container);
                self.code().u8(key);
                let rhs_reg = self.expr_reg(rhs)?;
                let opcode = arith_op(base);
                self.code().op(opcode);
                self.code().u8(current);
                self.code().u8(current);
                self.code().u8(rhs_reg);
                current
            }
        };
        self.code().op(Op::Set);
        self.code().u8(container);
        self.code().u8(key);
        self.code().u8(value);
        Ok(())
    }

    fn aggregate(&mut self, op: Op, items: &[NodeId], dst: u8) -> Result<()> {
        if items.len() > u16::MAX as usize {
            return Err(self.fail("too many elements in literal"));
        }
        let mark = self.reg_mark();
        let base = self.scope().next_reg as u8;
        for &item in items {
            let reg = self.alloc_reg()?;
            self.expr(item, reg)?;
        }
        self.code().op(op);
        self.code().u8(dst);
        self.code().u8(base);
        self.code().u16(items.len() as u16);
        self.reset_regs(mark);
        Ok(())
    }

    fn map_literal(&mut self, items: &[NodeId], dst: u8) -> Result<()> {
        let mark = self.reg_mark();
        let base = self.scope().next_reg as u8;
        for &item in items {
            let NodeKind::MapItem { key, value } = self.tree.node(item).kind else {
                return Err(self.fail("invalid map entry"));
            };
            let key_reg = self.alloc_reg()?;
            match key {
                Some(key) => self.map_key(key, key_reg)?,
                None => {
                    // `{x}` is shorthand for `{"x": x}`.
                    let NodeKind::Ident(name) = &self.tree.node(value).kind else {
                        return Err(self.fail("expected a key for this map entry"));
                    };
                    let sref = self.str_ref(&name.clone());
                    self.code().op(Op::ConstString);
                    self.code().u8(key_reg);
                    self.code().u32(sref);
                }
            }
            let value_reg = self.alloc_reg()?;
            self.expr(value, value_reg)?;
        }
        self.code().op(Op::BuildMap);
        self.code().u8(dst);
        self.code().u8(base);
        self.code().u16((items.len() * 2) as u16);
        self.reset_regs(mark);
        Ok(())
    }

    fn call(&mut self, callee: NodeId, args: &[NodeId], dst: u8) -> Result<()> {
        if args.len() > u8::MAX as usize {
            return Err(self.fail("too many call arguments"));
        }
        let mark = self.reg_mark();

        // Member calls evaluate arguments before the `Get` so the `this`
        // candidate it records is consumed by the very next instruction.
        if let NodeKind::Member { lhs, name } = &self.tree.node(callee).kind {
            let (obj, name) = (*lhs, name.clone());
            let obj_reg = self.expr_reg(obj)?;
            let base = self.scope().next_reg as u8;
            for &arg in args {
                let reg = self.alloc_reg()?;
                self.expr(arg, reg)?;
            }
            let key = self.alloc_reg()?;
            let sref = self.str_ref(&name);
            self.code().op(Op::ConstString);
            self.code().u8(key);
            self.code().u32(sref);
            let func = self.alloc_reg()?;
            self.code().op(Op::Get);
            self.code().u8(func);
            self.code().u8(obj_reg);
            self.code().u8(key);
            self.emit_call(dst, func, base, args.len() as u16);
            self.reset_regs(mark);
            return Ok(());
        }

        let func = self.expr_reg(callee)?;
        let base = self.scope().next_reg as u8;
        for &arg in args {
            let reg = self.alloc_reg()?;
            self.expr(arg, reg)?;
        }
        self.emit_call(dst, func, base, args.len() as u16);
        self.reset_regs(mark);
        Ok(())
    }

    fn emit_call(&mut self, dst: u8, func: u8, base: u8, count: u16) {
        self.code().op(Op::Call);
        self.code().u8(dst);
        self.code().u8(func);
        self.code().u8(base);
        self.code().u16(count);
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    fn if_expr(
        &mut self,
        pattern: Option<NodeId>,
        cond: NodeId,
        body: NodeId,
        else_body: Option<NodeId>,
        dst: u8,
    ) -> Result<()> {
        let mark = self.scope_mark();
        let cond_reg = self.alloc_reg()?;
        self.expr(cond, cond_reg)?;
        let to_else = match pattern {
            Some(pattern) => {
                // `if (let pattern = expr)` matches when the value is not none.
                let jump = self.jump_forward(Op::JumpNone, Some(cond_reg));
                self.destructure(pattern, cond_reg)?;
                jump
            }
            None => self.jump_forward(Op::JumpFalse, Some(cond_reg)),
        };
        self.expr(body, dst)?;
        self.restore_scope(mark);
        let to_end = self.jump_forward(Op::Jump, None);
        self.patch_forward(to_else);
        match else_body {
            Some(else_body) => self.expr(else_body, dst)?,
            None => self.const_primitive(dst, PRIMITIVE_NONE),
        }
        self.patch_forward(to_end);
        Ok(())
    }

    fn while_expr(
        &mut self,
        pattern: Option<NodeId>,
        cond: NodeId,
        body: NodeId,
        dst: u8,
    ) -> Result<()> {
        self.const_primitive(dst, PRIMITIVE_NONE);
        let mark = self.scope_mark();
        let cond_reg = self.alloc_reg()?;
        let start = self.code().pos();
        self.expr(cond, cond_reg)?;
        let body_mark = self.scope_mark();
        let to_exit = match pattern {
            Some(pattern) => {
                let jump = self.jump_forward(Op::JumpNone, Some(cond_reg));
                self.destructure(pattern, cond_reg)?;
                jump
            }
            None => self.jump_forward(Op::JumpFalse, Some(cond_reg)),
        };
        self.scope().loops.push(LoopCtx {
            start,
            breaks: Vec::new(),
            dst,
        });
        let body_tmp = self.alloc_reg()?;
        self.expr(body, body_tmp)?;
        self.code().op(Op::Discard);
        self.code().u8(body_tmp);
        self.restore_scope(body_mark);
        self.jump_back(start);
        self.patch_forward(to_exit);
        let ctx = self.scope().loops.pop().unwrap();
        for at in ctx.breaks {
            self.patch_forward(at);
        }
        self.restore_scope(mark);
        Ok(())
    }

    fn for_expr(
        &mut self,
        pattern: Option<NodeId>,
        iterable: NodeId,
        body: NodeId,
        dst: u8,
    ) -> Result<()> {
        self.const_primitive(dst, PRIMITIVE_NONE);
        let mark = self.scope_mark();
        let over = self.expr_reg(iterable)?;
        let iter = self.alloc_reg()?;
        self.code().op(Op::IterInit);
        self.code().u8(iter);
        self.code().u8(over);
        let elem = self.alloc_reg()?;

        let start = self.code().pos();
        self.code().op(Op::IterNext);
        self.code().u8(elem);
        self.code().u8(iter);
        let to_exit = self.jump_forward(Op::JumpNone, Some(elem));

        self.scope().loops.push(LoopCtx {
            start,
            breaks: Vec::new(),
            dst,
        });
        let body_mark = self.scope_mark();
        if let Some(pattern) = pattern {
            self.destructure(pattern, elem)?;
        }
        let body_tmp = self.alloc_reg()?;
        self.expr(body, body_tmp)?;
        self.code().op(Op::Discard);
        self.code().u8(body_tmp);
        self.restore_scope(body_mark);
        self.jump_back(start);
        self.patch_forward(to_exit);
        let ctx = self.scope().loops.pop().unwrap();
        for at in ctx.breaks {
            self.patch_forward(at);
        }
        self.restore_scope(mark);
        Ok(())
    }

    fn match_expr(&mut self, scrutinee: NodeId, cases: &[NodeId], dst: u8) -> Result<()> {
        let outer = self.scope_mark();
        let subject = self.alloc_reg()?;
        self.expr(scrutinee, subject)?;
        self.const_primitive(dst, PRIMITIVE_NONE);

        let mut to_end = Vec::new();
        for &case in cases {
            let case_mark = self.scope_mark();
            match &self.tree.node(case).kind {
                NodeKind::MatchCatchAll { body } => {
                    let body = *body;
                    self.expr(body, dst)?;
                    to_end.push(self.jump_forward(Op::Jump, None));
                }
                NodeKind::MatchLet { pattern, body } => {
                    let (pattern, body) = (*pattern, *body);
                    self.destructure(pattern, subject)?;
                    self.expr(body, dst)?;
                    to_end.push(self.jump_forward(Op::Jump, None));
                }
                NodeKind::MatchCase { items, body } => {
                    let (items, body) = (items.clone(), *body);
                    let mut to_body = Vec::new();
                    let item_mark = self.reg_mark();
                    for item in items {
                        let value = self.expr_reg(item)?;
                        let cmp = self.alloc_reg()?;
                        self.code().op(Op::Equal);
                        self.code().u8(cmp);
                        self.code().u8(subject);
                        self.code().u8(value);
                        to_body.push(self.jump_forward(Op::JumpTrue, Some(cmp)));
                        self.reset_regs(item_mark);
                    }
                    let to_next = self.jump_forward(Op::Jump, None);
                    for at in to_body {
                        self.patch_forward(at);
                    }
                    self.expr(body, dst)?;
                    to_end.push(self.jump_forward(Op::Jump, None));
                    self.patch_forward(to_next);
                }
                _ => return Err(self.fail("invalid match case")),
            }
            self.restore_scope(case_mark);
        }
        for at in to_end {
            self.patch_forward(at);
        }
        self.restore_scope(outer);
        Ok(())
    }

    fn catch_expr(
        &mut self,
        lhs: NodeId,
        pattern: Option<NodeId>,
        rhs: NodeId,
        dst: u8,
    ) -> Result<()> {
        self.expr(lhs, dst)?;
        let to_end = self.jump_forward(Op::JumpNotError, Some(dst));
        let mark = self.scope_mark();
        if let Some(pattern) = pattern {
            // The pattern binds the value the err wraps.
            let payload = self.alloc_reg()?;
            self.code().op(Op::UnwrapError);
            self.code().u8(payload);
            self.code().u8(dst);
            self.destructure(pattern, payload)?;
        }
        self.expr(rhs, dst)?;
        self.restore_scope(mark);
        self.patch_forward(to_end);
        Ok(())
    }

    // ========================================================================
    // Functions
    // ========================================================================

    fn function(&mut self, params: &[NodeId], body: NodeId, dst: u8) -> Result<()> {
        if params.len() > u8::MAX as usize {
            return Err(self.fail("function has too many parameters"));
        }

        let proto_index = self.protos.len();
        self.protos.push(CodeBuf::new());
        self.fns.push(FnScope {
            proto_index: Some(proto_index),
            code: CodeBuf::new(),
            next_reg: params.len() as u16,
            locals: Vec::new(),
            captures: Vec::new(),
            loops: Vec::new(),
        });

        // Arguments arrive in registers 0..arg_count.
        for (i, &param) in params.iter().enumerate() {
            match &self.tree.node(param).kind {
                NodeKind::Ident(name) => {
                    let name = name.clone();
                    self.scope().locals.push(Local {
                        name,
                        reg: i as u8,
                    });
                }
                NodeKind::Discard => {}
                _ => self.destructure(param, i as u8)?,
            }
        }

        let ret = self.alloc_reg()?;
        self.expr(body, ret)?;
        self.code().op(Op::Return);
        self.code().u8(ret);

        let scope = self.fns.pop().unwrap();
        self.protos[proto_index] = scope.code;
        let captures = scope.captures;

        self.code().op(Op::BuildFn);
        self.code().u8(dst);
        self.code().u8(params.len() as u8);
        self.code().u8(captures.len() as u8);
        let at = self.code().pos();
        self.code().u32(0);
        let buf = self.scope().proto_index;
        self.fixups.push(EntryFixup {
            buf,
            at,
            proto: proto_index,
        });

        let mark = self.reg_mark();
        for (i, capture) in captures.iter().enumerate() {
            match capture.src {
                CaptureSrc::Local(reg) => {
                    self.code().op(Op::StoreCapture);
                    self.code().u8(dst);
                    self.code().u8(reg);
                    self.code().u8(i as u8);
                }
                CaptureSrc::Capture(parent) => {
                    let tmp = self.alloc_reg()?;
                    self.code().op(Op::LoadCapture);
                    self.code().u8(tmp);
                    self.code().u8(parent);
                    self.code().op(Op::StoreCapture);
                    self.code().u8(dst);
                    self.code().u8(tmp);
                    self.code().u8(i as u8);
                }
            }
        }
        self.reset_regs(mark);
        Ok(())
    }

    // ========================================================================
    // Assembly
    // ========================================================================

    fn assemble(mut self, name: &str) -> Module {
        let main = self.fns.pop().unwrap().code;

        // Layout: top-level code first (entry 0), then every function body.
        let mut offsets = Vec::with_capacity(self.protos.len());
        let mut at = main.pos();
        for proto in &self.protos {
            offsets.push(at as u32);
            at += proto.pos();
        }

        let mut main = main;
        for fixup in &self.fixups {
            let entry = offsets[fixup.proto];
            match fixup.buf {
                None => main.patch_u32(fixup.at, entry),
                Some(i) => self.protos[i].patch_u32(fixup.at, entry),
            }
        }

        let mut code = main.into_bytes();
        for proto in self.protos {
            code.extend_from_slice(proto.as_bytes());
        }

        Module {
            name: name.to_string(),
            code,
            strings: self.strings,
            entry: 0,
        }
    }
}

fn arith_op(op: InfixOp) -> Op {
    match op {
        InfixOp::Add => Op::Add,
        InfixOp::Sub => Op::Sub,
        InfixOp::Mul => Op::Mul,
        InfixOp::Div => Op::Div,
        InfixOp::DivFloor => Op::DivFloor,
        InfixOp::Mod => Op::Mod,
        InfixOp::Pow => Op::Pow,
        InfixOp::LShift => Op::LShift,
        InfixOp::RShift => Op::RShift,
        InfixOp::BitAnd => Op::BitAnd,
        InfixOp::BitOr => Op::BitOr,
        InfixOp::BitXor => Op::BitXor,
        _ => unreachable!("not an arithmetic operator"),
    }
}

fn type_id(ty: TypeName) -> Type {
    match ty {
        TypeName::None => Type::None,
        TypeName::Int => Type::Int,
        TypeName::Num => Type::Num,
        TypeName::Bool => Type::Bool,
        TypeName::Str => Type::Str,
        TypeName::Tuple => Type::Tuple,
        TypeName::Map => Type::Map,
        TypeName::List => Type::List,
        TypeName::Err => Type::Err,
        TypeName::Range => Type::Range,
        TypeName::Func => Type::Func,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bog_parser::parse;

    fn compile_src(source: &str) -> Module {
        let mut errors = Errors::new();
        let tree = parse(source, &mut errors).expect("parse failed");
        match compile(&tree, "test", &mut errors) {
            Ok(module) => module,
            Err(_) => panic!("compile failed: {:?}", errors.last()),
        }
    }

    fn compile_err(source: &str) -> String {
        let mut errors = Errors::new();
        let tree = parse(source, &mut errors).expect("parse failed");
        assert!(compile(&tree, "test", &mut errors).is_err());
        errors.last().unwrap().message.to_string()
    }

    #[test]
    fn entry_is_module_code() {
        let module = compile_src("let x = 1");
        assert_eq!(module.entry, 0);
        assert!(!module.code.is_empty());
    }

    #[test]
    fn string_pool_deduplicates() {
        let module = compile_src("let a = \"hi\"\nlet b = \"hi\"\nlet c = \"ho\"");
        // Two distinct payloads only: "hi" and "ho".
        assert_eq!(module.strings.len(), (4 + 2) * 2);
    }

    #[test]
    fn undeclared_assignment_is_an_error() {
        assert_eq!(
            compile_err("x = 1"),
            "use of undeclared identifier 'x'"
        );
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        assert_eq!(
            compile_err("break"),
            "'break' is not allowed outside of loops"
        );
        assert_eq!(
            compile_err("continue"),
            "'continue' is not allowed outside of loops"
        );
    }

    #[test]
    fn cast_to_err_is_rejected() {
        assert_eq!(compile_err("1 as err"), "cannot cast to err");
        assert_eq!(compile_err("1 as func"), "cannot cast to func");
    }

    #[test]
    fn discard_only_valid_in_patterns() {
        assert_eq!(
            compile_err("1 + _"),
            "'_' is only valid in patterns and assignments"
        );
    }

    #[test]
    fn functions_are_laid_out_after_main() {
        let module = compile_src("let f = fn() 1\nreturn f()");
        // The BuildFn entry operand must point inside the code blob.
        assert_eq!(module.entry, 0);
        let code_len = module.code.len() as u32;
        // Find the BuildFn opcode and check its entry operand.
        let mut i = 0usize;
        let mut found = false;
        while i < module.code.len() {
            if module.code[i] == Op::BuildFn as u8 {
                let entry = u32::from_le_bytes(module.code[i + 4..i + 8].try_into().unwrap());
                assert!(entry < code_len);
                assert!(entry > 0);
                found = true;
                break;
            }
            i += 1;
        }
        assert!(found, "no BuildFn emitted");
    }
}
