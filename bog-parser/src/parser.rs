// bog-parser - Parser for the Bog scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Recursive descent parser for Bog source code.
//!
//! Builds a [`Tree`] from the token stream with a strict precedence climb.
//! Newlines terminate statements except inside bracketed contexts, where the
//! parser consumes them as insignificant. The parser is non-recovering: the
//! first error is recorded in the shared [`Errors`] sink and parsing stops.

use std::fmt;

use crate::ast::{InfixOp, Node, NodeId, NodeKind, PrefixOp, Tree, TypeName};
use crate::errors::Errors;
use crate::lexer::{tokenize, Token, TokenKind, TokenizeFailed};

/// Marker returned when parsing fails; the diagnostic is in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseFailed;

impl fmt::Display for ParseFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error")
    }
}

impl std::error::Error for ParseFailed {}

impl From<TokenizeFailed> for ParseFailed {
    fn from(_: TokenizeFailed) -> Self {
        ParseFailed
    }
}

/// Parse a whole program: `(stmt NL)* EOF`.
pub fn parse(source: &str, errors: &mut Errors) -> std::result::Result<Tree, ParseFailed> {
    let tokens = tokenize(source, errors)?;
    parse_tokens(source, tokens, errors)
}

/// Parse an already-tokenized program. `tokens` must end with `Eof`.
pub fn parse_tokens(
    source: &str,
    tokens: Vec<Token>,
    errors: &mut Errors,
) -> std::result::Result<Tree, ParseFailed> {
    let parser = Parser {
        source,
        tokens,
        index: 0,
        no_nl_depth: 0,
        tree: Tree::new(),
        errors,
    };
    parser.program()
}

type Result<T> = std::result::Result<T, ParseFailed>;

struct Parser<'s, 'e> {
    source: &'s str,
    tokens: Vec<Token>,
    index: usize,
    /// When nonzero the parser is inside a bracketed context and newlines
    /// are consumed as insignificant.
    no_nl_depth: u32,
    tree: Tree,
    errors: &'e mut Errors,
}

impl<'s, 'e> Parser<'s, 'e> {
    // ========================================================================
    // Token navigation
    // ========================================================================

    /// The current token kind; inside bracketed contexts any newlines in
    /// front of it are consumed first.
    fn peek(&mut self) -> &TokenKind {
        if self.no_nl_depth > 0 {
            while self.tokens[self.index].kind == TokenKind::Nl {
                self.index += 1;
            }
        }
        &self.tokens[self.index].kind
    }

    /// Look one token past the current one, with the same newline handling.
    fn peek_second(&mut self) -> &TokenKind {
        self.peek();
        let mut i = (self.index + 1).min(self.tokens.len() - 1);
        if self.no_nl_depth > 0 {
            while self.tokens[i].kind == TokenKind::Nl {
                i += 1;
            }
        }
        &self.tokens[i].kind
    }

    /// The raw current token kind, newlines included.
    fn peek_raw(&self) -> &TokenKind {
        &self.tokens[self.index].kind
    }

    fn offset(&mut self) -> u32 {
        self.peek();
        self.tokens[self.index].start
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.index].clone();
        if token.kind != TokenKind::Eof {
            self.index += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if *self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        if *self.peek() == kind {
            Ok(self.advance())
        } else {
            Err(self.fail_expected(what))
        }
    }

    fn token_text(&self, token: &Token) -> &'s str {
        &self.source[token.start as usize..token.end as usize]
    }

    fn skip_nls(&mut self) {
        while *self.peek_raw() == TokenKind::Nl {
            self.index += 1;
        }
    }

    fn push(&mut self, offset: u32, kind: NodeKind) -> NodeId {
        self.tree.push(Node { offset, kind })
    }

    fn fail(&mut self, message: String) -> ParseFailed {
        let offset = self.tokens[self.index].start;
        self.errors.push_error(message, offset);
        ParseFailed
    }

    fn fail_expected(&mut self, what: &str) -> ParseFailed {
        let found = self.peek().clone();
        self.fail(format!("expected {}, found '{}'", what, found))
    }

    // ========================================================================
    // Program and statements
    // ========================================================================

    fn program(mut self) -> Result<Tree> {
        loop {
            self.skip_nls();
            if *self.peek_raw() == TokenKind::Eof {
                return Ok(self.tree);
            }
            let stmt = self.stmt()?;
            self.tree.root.push(stmt);
            self.end_stmt()?;
        }
    }

    /// A statement ends at a newline or the end of its enclosing block.
    fn end_stmt(&mut self) -> Result<()> {
        match self.peek_raw() {
            TokenKind::Nl => {
                self.index += 1;
                Ok(())
            }
            TokenKind::Eof | TokenKind::RBrace => Ok(()),
            _ => Err(self.fail_expected("a newline")),
        }
    }

    fn stmt(&mut self) -> Result<NodeId> {
        if *self.peek() == TokenKind::Let {
            self.let_expr()
        } else {
            self.expr()
        }
    }

    fn let_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        self.advance();
        let pattern = self.unwrap_pattern()?;
        self.expect(TokenKind::Eq, "'='")?;
        let body = self.expr()?;
        Ok(self.push(offset, NodeKind::Let { pattern, body }))
    }

    // ========================================================================
    // Expressions, lowest precedence first
    // ========================================================================

    fn expr(&mut self) -> Result<NodeId> {
        match self.peek() {
            TokenKind::Fn => self.fn_expr(),
            TokenKind::Return | TokenKind::Break | TokenKind::Continue => self.jump_expr(),
            _ => self.assign_expr(),
        }
    }

    /// `fn (params) body`, or the named form `fn name(params) body` which is
    /// sugar for `let name = fn (params) body`.
    fn fn_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        self.advance();
        let name = if *self.peek() == TokenKind::Ident {
            let token = self.advance();
            Some(self.token_text(&token).to_string())
        } else {
            None
        };
        self.expect(TokenKind::LParen, "'('")?;
        self.no_nl_depth += 1;
        let mut params = Vec::new();
        while *self.peek() != TokenKind::RParen {
            params.push(self.unwrap_pattern()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        self.no_nl_depth -= 1;
        let body = self.expr()?;
        let func = self.push(offset, NodeKind::Fn { params, body });
        match name {
            Some(name) => {
                let pattern = self.push(offset, NodeKind::Ident(name));
                Ok(self.push(offset, NodeKind::Let { pattern, body: func }))
            }
            None => Ok(func),
        }
    }

    fn jump_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let token = self.advance();
        let kind = match token.kind {
            TokenKind::Return => {
                let value = if self.starts_expr() {
                    Some(self.expr()?)
                } else {
                    None
                };
                NodeKind::Return(value)
            }
            TokenKind::Break => {
                let value = if self.starts_expr() {
                    Some(self.expr()?)
                } else {
                    None
                };
                NodeKind::Break(value)
            }
            _ => NodeKind::Continue,
        };
        Ok(self.push(offset, kind))
    }

    /// True if the current token can begin an expression operand.
    fn starts_expr(&mut self) -> bool {
        if self.no_nl_depth == 0 && *self.peek_raw() == TokenKind::Nl {
            return false;
        }
        !matches!(
            self.peek(),
            TokenKind::Eof
                | TokenKind::Nl
                | TokenKind::RParen
                | TokenKind::RBrace
                | TokenKind::RBracket
                | TokenKind::Comma
                | TokenKind::Colon
                | TokenKind::Else
        )
    }

    fn assign_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let lhs = self.bool_expr()?;
        let op = match self.peek() {
            TokenKind::Eq => InfixOp::Assign,
            TokenKind::PlusEq => InfixOp::AddAssign,
            TokenKind::MinusEq => InfixOp::SubAssign,
            TokenKind::AsteriskEq => InfixOp::MulAssign,
            TokenKind::AsteriskAsteriskEq => InfixOp::PowAssign,
            TokenKind::SlashEq => InfixOp::DivAssign,
            TokenKind::SlashSlashEq => InfixOp::DivFloorAssign,
            TokenKind::PercentEq => InfixOp::ModAssign,
            TokenKind::LShiftEq => InfixOp::LShiftAssign,
            TokenKind::RShiftEq => InfixOp::RShiftAssign,
            TokenKind::AmpersandEq => InfixOp::BitAndAssign,
            TokenKind::PipeEq => InfixOp::BitOrAssign,
            TokenKind::CaretEq => InfixOp::BitXorAssign,
            _ => return Ok(lhs),
        };
        if self.no_nl_depth > 0 {
            return Err(self.fail("assignment is not allowed inside an expression".to_string()));
        }
        self.advance();
        let rhs = if op == InfixOp::Assign {
            self.expr()?
        } else {
            self.bit_expr()?
        };
        Ok(self.push(offset, NodeKind::Infix { op, lhs, rhs }))
    }

    fn bool_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        if self.eat(TokenKind::Not) {
            let rhs = self.comparison_expr()?;
            return Ok(self.push(
                offset,
                NodeKind::Prefix {
                    op: PrefixOp::BoolNot,
                    rhs,
                },
            ));
        }

        let mut lhs = self.comparison_expr()?;
        // A chain uses a single operator class; `a and b or c` does not parse.
        if *self.peek() == TokenKind::And {
            while self.eat(TokenKind::And) {
                let rhs = self.comparison_expr()?;
                lhs = self.push(
                    offset,
                    NodeKind::Infix {
                        op: InfixOp::BoolAnd,
                        lhs,
                        rhs,
                    },
                );
            }
        } else if *self.peek() == TokenKind::Or {
            while self.eat(TokenKind::Or) {
                let rhs = self.comparison_expr()?;
                lhs = self.push(
                    offset,
                    NodeKind::Infix {
                        op: InfixOp::BoolOr,
                        lhs,
                        rhs,
                    },
                );
            }
        }
        Ok(lhs)
    }

    fn comparison_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let lhs = self.range_expr()?;
        let op = match self.peek() {
            TokenKind::Lt => InfixOp::LessThan,
            TokenKind::LtEq => InfixOp::LessThanEqual,
            TokenKind::Gt => InfixOp::GreaterThan,
            TokenKind::GtEq => InfixOp::GreaterThanEqual,
            TokenKind::EqEq => InfixOp::Equal,
            TokenKind::BangEq => InfixOp::NotEqual,
            TokenKind::In => InfixOp::In,
            TokenKind::Is => {
                self.advance();
                let ty = self.type_name()?;
                return Ok(self.push(offset, NodeKind::Is { lhs, ty }));
            }
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.range_expr()?;
        Ok(self.push(offset, NodeKind::Infix { op, lhs, rhs }))
    }

    fn type_name(&mut self) -> Result<TypeName> {
        if let TokenKind::Ident = self.peek() {
            let token = self.advance();
            let ty = match self.token_text(&token) {
                "none" => TypeName::None,
                "int" => TypeName::Int,
                "num" => TypeName::Num,
                "bool" => TypeName::Bool,
                "str" => TypeName::Str,
                "tuple" => TypeName::Tuple,
                "map" => TypeName::Map,
                "list" => TypeName::List,
                "err" => TypeName::Err,
                "range" => TypeName::Range,
                "func" => TypeName::Func,
                other => return Err(self.fail(format!("expected a type name, found '{}'", other))),
            };
            Ok(ty)
        } else {
            Err(self.fail_expected("a type name"))
        }
    }

    fn range_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let lhs = self.bit_expr()?;
        if self.eat(TokenKind::Ellipsis) {
            let rhs = self.bit_expr()?;
            return Ok(self.push(
                offset,
                NodeKind::Infix {
                    op: InfixOp::Range,
                    lhs,
                    rhs,
                },
            ));
        }
        Ok(lhs)
    }

    fn bit_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let mut lhs = self.shift_expr()?;
        match self.peek() {
            TokenKind::Ampersand => {
                while self.eat(TokenKind::Ampersand) {
                    let rhs = self.shift_expr()?;
                    lhs = self.push(
                        offset,
                        NodeKind::Infix {
                            op: InfixOp::BitAnd,
                            lhs,
                            rhs,
                        },
                    );
                }
            }
            TokenKind::Pipe => {
                while self.eat(TokenKind::Pipe) {
                    let rhs = self.shift_expr()?;
                    lhs = self.push(
                        offset,
                        NodeKind::Infix {
                            op: InfixOp::BitOr,
                            lhs,
                            rhs,
                        },
                    );
                }
            }
            TokenKind::Caret => {
                while self.eat(TokenKind::Caret) {
                    let rhs = self.shift_expr()?;
                    lhs = self.push(
                        offset,
                        NodeKind::Infix {
                            op: InfixOp::BitXor,
                            lhs,
                            rhs,
                        },
                    );
                }
            }
            TokenKind::Catch => {
                self.advance();
                let pattern = if self.eat(TokenKind::Let) {
                    let pattern = self.unwrap_pattern()?;
                    self.expect(TokenKind::Colon, "':'")?;
                    Some(pattern)
                } else {
                    None
                };
                let rhs = self.expr()?;
                lhs = self.push(offset, NodeKind::Catch { lhs, pattern, rhs });
            }
            _ => {}
        }
        Ok(lhs)
    }

    fn shift_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let lhs = self.add_expr()?;
        let op = match self.peek() {
            TokenKind::LShift => InfixOp::LShift,
            TokenKind::RShift => InfixOp::RShift,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.add_expr()?;
        Ok(self.push(offset, NodeKind::Infix { op, lhs, rhs }))
    }

    fn add_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => InfixOp::Add,
                TokenKind::Minus => InfixOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.mul_expr()?;
            lhs = self.push(offset, NodeKind::Infix { op, lhs, rhs });
        }
    }

    fn mul_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let mut lhs = self.cast_expr()?;
        loop {
            let op = match self.peek() {
                TokenKind::Asterisk => InfixOp::Mul,
                TokenKind::Slash => InfixOp::Div,
                TokenKind::SlashSlash => InfixOp::DivFloor,
                TokenKind::Percent => InfixOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.cast_expr()?;
            lhs = self.push(offset, NodeKind::Infix { op, lhs, rhs });
        }
    }

    fn cast_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let lhs = self.prefix_expr()?;
        if self.eat(TokenKind::As) {
            let ty = self.type_name()?;
            return Ok(self.push(offset, NodeKind::As { lhs, ty }));
        }
        Ok(lhs)
    }

    fn prefix_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let op = match self.peek() {
            TokenKind::Try => PrefixOp::Try,
            TokenKind::Minus => PrefixOp::Minus,
            TokenKind::Plus => PrefixOp::Plus,
            TokenKind::Tilde => PrefixOp::BitNot,
            _ => return self.power_expr(),
        };
        self.advance();
        let rhs = self.power_expr()?;
        Ok(self.push(offset, NodeKind::Prefix { op, rhs }))
    }

    fn power_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let lhs = self.suffix_expr()?;
        if self.eat(TokenKind::AsteriskAsterisk) {
            // Right-associative.
            let rhs = self.power_expr()?;
            return Ok(self.push(
                offset,
                NodeKind::Infix {
                    op: InfixOp::Pow,
                    lhs,
                    rhs,
                },
            ));
        }
        Ok(lhs)
    }

    fn suffix_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let mut lhs = self.primary_expr()?;
        loop {
            match self.peek() {
                TokenKind::LBracket => {
                    self.advance();
                    self.no_nl_depth += 1;
                    let index = self.expr()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    self.no_nl_depth -= 1;
                    lhs = self.push(offset, NodeKind::Index { lhs, index });
                }
                TokenKind::LParen => {
                    self.advance();
                    self.no_nl_depth += 1;
                    let mut args = Vec::new();
                    while *self.peek() != TokenKind::RParen {
                        args.push(self.expr()?);
                        if !self.eat(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                    self.no_nl_depth -= 1;
                    lhs = self.push(offset, NodeKind::Call { lhs, args });
                }
                TokenKind::Period => {
                    self.advance();
                    let name = self.expect(TokenKind::Ident, "a member name")?;
                    let name = self.token_text(&name).to_string();
                    lhs = self.push(offset, NodeKind::Member { lhs, name });
                }
                _ => return Ok(lhs),
            }
        }
    }

    // ========================================================================
    // Primary expressions
    // ========================================================================

    fn primary_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        match self.peek().clone() {
            TokenKind::Int(v) => {
                self.advance();
                Ok(self.push(offset, NodeKind::Int(v)))
            }
            TokenKind::Num(v) => {
                self.advance();
                Ok(self.push(offset, NodeKind::Num(v)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(self.push(offset, NodeKind::Str(s)))
            }
            TokenKind::True => {
                self.advance();
                Ok(self.push(offset, NodeKind::True))
            }
            TokenKind::False => {
                self.advance();
                Ok(self.push(offset, NodeKind::False))
            }
            TokenKind::Ident => {
                let token = self.advance();
                let text = self.token_text(&token);
                let kind = if text == "none" {
                    NodeKind::None
                } else {
                    NodeKind::Ident(text.to_string())
                };
                Ok(self.push(offset, kind))
            }
            TokenKind::Underscore => {
                // Valid only as an assignment target; the compiler rejects
                // other uses.
                self.advance();
                Ok(self.push(offset, NodeKind::Discard))
            }
            TokenKind::LParen => self.paren_expr(),
            TokenKind::LBracket => self.list_expr(),
            TokenKind::LBrace => self.map_or_block_expr(),
            TokenKind::Error => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                self.no_nl_depth += 1;
                let value = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                self.no_nl_depth -= 1;
                Ok(self.push(offset, NodeKind::Error(value)))
            }
            TokenKind::Import => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                self.no_nl_depth += 1;
                let name = match self.peek() {
                    TokenKind::Str(s) => {
                        let s = s.clone();
                        self.advance();
                        s
                    }
                    _ => return Err(self.fail_expected("a string literal")),
                };
                self.expect(TokenKind::RParen, "')'")?;
                self.no_nl_depth -= 1;
                Ok(self.push(offset, NodeKind::Import(name)))
            }
            TokenKind::If => self.if_expr(),
            TokenKind::While => self.while_expr(),
            TokenKind::For => self.for_expr(),
            TokenKind::Match => self.match_expr(),
            _ => Err(self.fail_expected("an expression")),
        }
    }

    /// `(expr)` grouping or `(a, b, ...)` tuple literal.
    fn paren_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        self.advance();
        self.no_nl_depth += 1;
        if self.eat(TokenKind::RParen) {
            self.no_nl_depth -= 1;
            return Ok(self.push(offset, NodeKind::Tuple(Vec::new())));
        }
        let first = self.expr()?;
        if self.eat(TokenKind::Comma) {
            let mut items = vec![first];
            while *self.peek() != TokenKind::RParen {
                items.push(self.expr()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen, "')'")?;
            self.no_nl_depth -= 1;
            return Ok(self.push(offset, NodeKind::Tuple(items)));
        }
        self.expect(TokenKind::RParen, "')'")?;
        self.no_nl_depth -= 1;
        Ok(self.push(offset, NodeKind::Grouped(first)))
    }

    fn list_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        self.advance();
        self.no_nl_depth += 1;
        let mut items = Vec::new();
        while *self.peek() != TokenKind::RBracket {
            items.push(self.expr()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBracket, "']'")?;
        self.no_nl_depth -= 1;
        Ok(self.push(offset, NodeKind::List(items)))
    }

    /// `{ NL ... }` is a block; any other `{...}` is a map literal.
    fn map_or_block_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        self.advance();
        if *self.peek_raw() == TokenKind::Nl {
            return self.block_expr(offset);
        }

        self.no_nl_depth += 1;
        let mut items = Vec::new();
        while *self.peek() != TokenKind::RBrace {
            items.push(self.map_item()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        self.no_nl_depth -= 1;
        Ok(self.push(offset, NodeKind::Map(items)))
    }

    fn map_item(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let value = self.expr()?;
        if self.eat(TokenKind::Colon) {
            let key = Some(value);
            let value = self.expr()?;
            return Ok(self.push(offset, NodeKind::MapItem { key, value }));
        }
        Ok(self.push(offset, NodeKind::MapItem { key: None, value }))
    }

    fn block_expr(&mut self, offset: u32) -> Result<NodeId> {
        // Newlines are significant again inside a block body.
        let saved = std::mem::replace(&mut self.no_nl_depth, 0);
        let mut stmts = Vec::new();
        loop {
            self.skip_nls();
            if self.eat(TokenKind::RBrace) {
                break;
            }
            if *self.peek_raw() == TokenKind::Eof {
                return Err(self.fail_expected("'}'"));
            }
            stmts.push(self.stmt()?);
            match self.peek_raw() {
                TokenKind::Nl => {
                    self.index += 1;
                }
                TokenKind::RBrace => {}
                _ => return Err(self.fail_expected("a newline")),
            }
        }
        self.no_nl_depth = saved;
        Ok(self.push(offset, NodeKind::Block(stmts)))
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    fn if_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        self.advance();
        let (pattern, cond) = self.cond_header()?;
        let body = self.expr()?;
        let else_body = if self.eat(TokenKind::Else) {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(self.push(
            offset,
            NodeKind::If {
                pattern,
                cond,
                body,
                else_body,
            },
        ))
    }

    fn while_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        self.advance();
        let (pattern, cond) = self.cond_header()?;
        let body = self.expr()?;
        Ok(self.push(
            offset,
            NodeKind::While {
                pattern,
                cond,
                body,
            },
        ))
    }

    /// `"(" ("let" pattern "=")? bool_expr ")"`, shared by `if` and `while`.
    fn cond_header(&mut self) -> Result<(Option<NodeId>, NodeId)> {
        self.expect(TokenKind::LParen, "'('")?;
        self.no_nl_depth += 1;
        let pattern = if self.eat(TokenKind::Let) {
            let pattern = self.unwrap_pattern()?;
            self.expect(TokenKind::Eq, "'='")?;
            Some(pattern)
        } else {
            None
        };
        let cond = self.bool_expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        self.no_nl_depth -= 1;
        Ok((pattern, cond))
    }

    /// `"(" "let" pattern "in" range_expr ")"`; unlike `if` and `while` the
    /// binding is not optional.
    fn for_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        self.advance();
        self.expect(TokenKind::LParen, "'('")?;
        self.no_nl_depth += 1;
        self.expect(TokenKind::Let, "'let'")?;
        let pattern = self.unwrap_pattern()?;
        self.expect(TokenKind::In, "'in'")?;
        let iterable = self.range_expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        self.no_nl_depth -= 1;
        let body = self.expr()?;
        Ok(self.push(
            offset,
            NodeKind::For {
                pattern: Some(pattern),
                iterable,
                body,
            },
        ))
    }

    fn match_expr(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        self.advance();
        self.expect(TokenKind::LParen, "'('")?;
        self.no_nl_depth += 1;
        let expr = self.expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        self.no_nl_depth -= 1;

        self.expect(TokenKind::LBrace, "'{'")?;
        let saved = std::mem::replace(&mut self.no_nl_depth, 0);
        if *self.peek_raw() != TokenKind::Nl {
            return Err(self.fail_expected("a newline"));
        }
        let mut cases = Vec::new();
        loop {
            self.skip_nls();
            if self.eat(TokenKind::RBrace) {
                break;
            }
            if *self.peek_raw() == TokenKind::Eof {
                return Err(self.fail_expected("'}'"));
            }
            cases.push(self.match_case()?);
            match self.peek_raw() {
                TokenKind::Nl => {
                    self.index += 1;
                }
                TokenKind::RBrace => {}
                _ => return Err(self.fail_expected("a newline")),
            }
        }
        self.no_nl_depth = saved;
        if cases.is_empty() {
            return Err(self.fail("match body must have at least one case".to_string()));
        }
        Ok(self.push(offset, NodeKind::Match { expr, cases }))
    }

    fn match_case(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        match self.peek() {
            TokenKind::Underscore => {
                self.advance();
                self.expect(TokenKind::Colon, "':'")?;
                let body = self.expr()?;
                Ok(self.push(offset, NodeKind::MatchCatchAll { body }))
            }
            TokenKind::Let => {
                self.advance();
                let pattern = self.unwrap_pattern()?;
                self.expect(TokenKind::Colon, "':'")?;
                let body = self.expr()?;
                Ok(self.push(offset, NodeKind::MatchLet { pattern, body }))
            }
            _ => {
                let mut items = vec![self.expr()?];
                while self.eat(TokenKind::Comma) {
                    if *self.peek() == TokenKind::Colon {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect(TokenKind::Colon, "':'")?;
                let body = self.expr()?;
                Ok(self.push(offset, NodeKind::MatchCase { items, body }))
            }
        }
    }

    // ========================================================================
    // Patterns
    // ========================================================================

    /// `identifier | (p,...) | [p,...] | {(key:)? p,...} | error(p) | _`
    fn unwrap_pattern(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        match self.peek() {
            TokenKind::Ident => {
                let token = self.advance();
                let text = self.token_text(&token);
                if text == "none" {
                    return Err(self.fail("cannot bind to 'none'".to_string()));
                }
                Ok(self.push(offset, NodeKind::Ident(text.to_string())))
            }
            TokenKind::Underscore => {
                self.advance();
                Ok(self.push(offset, NodeKind::Discard))
            }
            TokenKind::LParen => {
                self.advance();
                self.no_nl_depth += 1;
                let mut items = Vec::new();
                while *self.peek() != TokenKind::RParen {
                    items.push(self.unwrap_pattern()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen, "')'")?;
                self.no_nl_depth -= 1;
                Ok(self.push(offset, NodeKind::UnwrapTuple(items)))
            }
            TokenKind::LBracket => {
                self.advance();
                self.no_nl_depth += 1;
                let mut items = Vec::new();
                while *self.peek() != TokenKind::RBracket {
                    items.push(self.unwrap_pattern()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "']'")?;
                self.no_nl_depth -= 1;
                Ok(self.push(offset, NodeKind::UnwrapList(items)))
            }
            TokenKind::LBrace => {
                self.advance();
                self.no_nl_depth += 1;
                let mut items = Vec::new();
                while *self.peek() != TokenKind::RBrace {
                    items.push(self.map_pattern_item()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace, "'}'")?;
                self.no_nl_depth -= 1;
                Ok(self.push(offset, NodeKind::UnwrapMap(items)))
            }
            TokenKind::Error => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                self.no_nl_depth += 1;
                let inner = self.unwrap_pattern()?;
                self.expect(TokenKind::RParen, "')'")?;
                self.no_nl_depth -= 1;
                Ok(self.push(offset, NodeKind::UnwrapError(inner)))
            }
            _ => Err(self.fail_expected("a pattern")),
        }
    }

    fn map_pattern_item(&mut self) -> Result<NodeId> {
        let offset = self.offset();
        let has_key = matches!(
            self.peek(),
            TokenKind::Str(_) | TokenKind::Int(_) | TokenKind::Ident
        ) && *self.peek_second() == TokenKind::Colon;
        let key = if has_key {
            let key = self.primary_expr()?;
            self.expect(TokenKind::Colon, "':'")?;
            Some(key)
        } else {
            None
        };
        let value = self.unwrap_pattern()?;
        Ok(self.push(offset, NodeKind::MapItem { key, value }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeKind;

    fn parse_ok(source: &str) -> Tree {
        let mut errors = Errors::new();
        match parse(source, &mut errors) {
            Ok(tree) => tree,
            Err(_) => panic!("parse failed: {:?}", errors.last()),
        }
    }

    fn parse_err(source: &str) -> String {
        let mut errors = Errors::new();
        assert!(parse(source, &mut errors).is_err(), "expected parse failure");
        errors.last().unwrap().message.to_string()
    }

    fn root_kind(tree: &Tree) -> &NodeKind {
        &tree.node(tree.root[0]).kind
    }

    #[test]
    fn precedence_add_mul() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let tree = parse_ok("1 + 2 * 3");
        match root_kind(&tree) {
            NodeKind::Infix {
                op: InfixOp::Add,
                rhs,
                ..
            } => match &tree.node(*rhs).kind {
                NodeKind::Infix {
                    op: InfixOp::Mul, ..
                } => {}
                other => panic!("expected mul on rhs, got {:?}", other),
            },
            other => panic!("expected add at root, got {:?}", other),
        }
    }

    #[test]
    fn power_is_right_associative() {
        let tree = parse_ok("2 ** 3 ** 2");
        match root_kind(&tree) {
            NodeKind::Infix {
                op: InfixOp::Pow,
                lhs,
                rhs,
            } => {
                assert!(matches!(tree.node(*lhs).kind, NodeKind::Int(2)));
                assert!(matches!(
                    tree.node(*rhs).kind,
                    NodeKind::Infix {
                        op: InfixOp::Pow,
                        ..
                    }
                ));
            }
            other => panic!("expected pow at root, got {:?}", other),
        }
    }

    #[test]
    fn and_or_do_not_mix() {
        parse_ok("a and b and c");
        parse_ok("a or b or c");
        parse_err("a and b or c");
        parse_ok("(a and b) or c");
    }

    #[test]
    fn comparison_is_non_associative() {
        parse_ok("1 < 2");
        parse_err("1 < 2 < 3");
    }

    #[test]
    fn newline_terminates_statement() {
        let tree = parse_ok("let x = 1\nlet y = 2\n");
        assert_eq!(tree.root.len(), 2);
        parse_err("let x = 1 let y = 2");
    }

    #[test]
    fn newlines_insignificant_inside_brackets() {
        parse_ok("[1,\n2,\n3]");
        parse_ok("f(\n1,\n2\n)");
        parse_ok("(1 +\n2)");
    }

    #[test]
    fn assignment_rejected_inside_brackets() {
        assert_eq!(
            parse_err("f(a = 1)"),
            "assignment is not allowed inside an expression"
        );
    }

    #[test]
    fn let_with_patterns() {
        parse_ok("let x = 1");
        parse_ok("let (a, b) = x");
        parse_ok("let [a, _, c] = xs");
        parse_ok("let {x, \"y\": z} = m");
        parse_ok("let error(e) = failing");
        assert_eq!(
            parse_err("let 1 = 2"),
            "expected a pattern, found 'number literal'"
        );
    }

    #[test]
    fn fn_literal_and_call_chain() {
        let tree = parse_ok("fn (x) x * x");
        assert!(matches!(root_kind(&tree), NodeKind::Fn { params, .. } if params.len() == 1));
        parse_ok("f(1)(2)[3].member");
    }

    #[test]
    fn named_fn_desugars_to_let() {
        let tree = parse_ok("fn pow(x) x * x");
        match root_kind(&tree) {
            NodeKind::Let { pattern, body } => {
                assert!(matches!(&tree.node(*pattern).kind, NodeKind::Ident(n) if n == "pow"));
                assert!(matches!(tree.node(*body).kind, NodeKind::Fn { .. }));
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn map_vs_block() {
        let tree = parse_ok("{1: 2, three: 4}");
        assert!(matches!(root_kind(&tree), NodeKind::Map(items) if items.len() == 2));
        let tree = parse_ok("{\nlet x = 1\nx\n}");
        assert!(matches!(root_kind(&tree), NodeKind::Block(stmts) if stmts.len() == 2));
    }

    #[test]
    fn control_flow_headers() {
        parse_ok("if (x) 1 else 2");
        parse_ok("if (let (a, b) = pair) a");
        parse_ok("while (let x = next()) x");
        parse_ok("for (let v in 0...10) v");
        parse_ok("for (let _ in xs) 1");
        assert_eq!(parse_err("for (xs) 1"), "expected 'let', found 'identifier'");
    }

    #[test]
    fn match_cases() {
        let tree = parse_ok("match (x) {\n1, 2: \"low\"\nlet y: y\n_: \"other\"\n}");
        match root_kind(&tree) {
            NodeKind::Match { cases, .. } => {
                assert_eq!(cases.len(), 3);
                assert!(matches!(
                    tree.node(cases[0]).kind,
                    NodeKind::MatchCase { ref items, .. } if items.len() == 2
                ));
                assert!(matches!(tree.node(cases[1]).kind, NodeKind::MatchLet { .. }));
                assert!(matches!(
                    tree.node(cases[2]).kind,
                    NodeKind::MatchCatchAll { .. }
                ));
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn catch_with_binding() {
        let tree = parse_ok("risky() catch let e: default");
        assert!(matches!(
            root_kind(&tree),
            NodeKind::Catch {
                pattern: Some(_),
                ..
            }
        ));
        parse_ok("risky() catch fallback");
    }

    #[test]
    fn jump_expressions() {
        parse_ok("return");
        parse_ok("return 1 + 2");
        parse_ok("break");
        parse_ok("continue");
        let tree = parse_ok("if (x) return else 2");
        assert!(matches!(root_kind(&tree), NodeKind::If { .. }));
    }

    #[test]
    fn import_and_error_primaries() {
        let tree = parse_ok("import(\"foo.bog\")");
        assert!(matches!(root_kind(&tree), NodeKind::Import(name) if name == "foo.bog"));
        parse_ok("error(\"oops\")");
        parse_err("import(foo)");
    }

    #[test]
    fn is_and_as() {
        parse_ok("x is int");
        parse_ok("x as str");
        assert_eq!(
            parse_err("x is banana"),
            "expected a type name, found 'banana'"
        );
    }

    #[test]
    fn none_literal() {
        let tree = parse_ok("none");
        assert!(matches!(root_kind(&tree), NodeKind::None));
    }

    #[test]
    fn discard_as_assign_target_parses() {
        let tree = parse_ok("_ = f()");
        assert!(matches!(
            root_kind(&tree),
            NodeKind::Infix {
                op: InfixOp::Assign,
                ..
            }
        ));
    }

    #[test]
    fn range_expression() {
        let tree = parse_ok("0...10");
        assert!(matches!(
            root_kind(&tree),
            NodeKind::Infix {
                op: InfixOp::Range,
                ..
            }
        ));
        parse_err("0...1...2");
    }
}
