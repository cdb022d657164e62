// File: src/compiler.rs
//
// Single-pass recursive-descent compiler (spec §4.2): tokens go straight to bytecode,
// with no intermediate AST. Scopes/locals/upvalue resolution follow the classic
// closure-compiler pattern (also visible in the resolver-pass shape under
// `examples/other_examples/.../src-resolver.rs.rs`, here folded into inline
// compile-time resolution instead of a separate tree-walking pass), adapted onto the
// teacher's `Compiler` struct shape (`scope_depth`, `locals`, jump-patch helpers) from
// `rufflang-ruff/src/compiler.rs`.
//
// Assignment convention: every `Set*` opcode leaves the stored value on top of the
// stack (assignment is an expression); statement-level callers emit a trailing `Pop`.
//
// Top-level scoping: the outermost prototype's depth-0 bindings compile to
// `Get/Set/DefineGlobal` against the running environment rather than stack slots. This
// is what lets a module's top-level bindings be "addressable via `import`" (see
// GLOSSARY) and what lets the REPL persist `var` bindings across separate compiled
// buffers sharing one root environment (spec §4.9) — both would be impossible if
// top-level `var` were an ordinary, frame-local stack slot. Only nested blocks and
// function/closure bodies get true local slots.

use std::rc::Rc;

use crate::bytecode::{Constant, FunctionPrototype, OpCode, UpvalueDesc};
use crate::error::SkiffError;
use crate::lexer::{Keyword, Lexer, StringPart, Token, TokenKind};

struct Local {
    name: Rc<str>,
    depth: i32,
    is_captured: bool,
}

struct LoopCtx {
    loop_start: usize,
    break_jumps: Vec<usize>,
    scope_depth: i32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FuncKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct FuncState {
    proto: FunctionPrototype,
    locals: Vec<Local>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    kind: FuncKind,
}

impl FuncState {
    fn new(name: Rc<str>, kind: FuncKind, class_name: Option<Rc<str>>) -> Self {
        let mut locals = Vec::new();
        if matches!(kind, FuncKind::Method | FuncKind::Initializer) {
            locals.push(Local { name: "this".into(), depth: 0, is_captured: false });
        }
        FuncState {
            proto: FunctionPrototype {
                name,
                class_name,
                arity: 0,
                has_rest_param: false,
                code: Vec::new(),
                constants: Vec::new(),
                lines: Vec::new(),
                upvalues: Vec::new(),
                local_names: Vec::new(),
                exports: None,
                is_initializer: matches!(kind, FuncKind::Initializer),
            },
            locals,
            scope_depth: 0,
            loops: Vec::new(),
            kind,
        }
    }
}

struct ClassState {
    name: Rc<str>,
    has_superclass: bool,
}

pub struct Compiler {
    tokens: Vec<Token>,
    pos: usize,
    funcs: Vec<FuncState>,
    classes: Vec<ClassState>,
    module_exports: Vec<Rc<str>>,
    collecting_exports: bool,
}

type R<T> = Result<T, SkiffError>;

impl Compiler {
    fn new(source: &str, entry_name: &str) -> R<Self> {
        let raw = Lexer::tokenize(source).map_err(|e| {
            SkiffError::lex(e.message, crate::error::SourceLocation::new(e.line, e.column))
        })?;
        let tokens: Vec<Token> = raw.into_iter().filter(|t| t.kind != TokenKind::Newline).collect();
        Ok(Compiler {
            tokens,
            pos: 0,
            funcs: vec![FuncState::new(entry_name.into(), FuncKind::Script, None)],
            classes: Vec::new(),
            module_exports: Vec::new(),
            collecting_exports: false,
        })
    }

    /// Compile a whole script/program. The resulting prototype has no export filter.
    pub fn compile_script(source: &str) -> R<FunctionPrototype> {
        let mut c = Compiler::new(source, "<script>")?;
        c.run_top_level()?;
        Ok(c.finish())
    }

    /// Compile a module body: identical to a script, but `export` statements are
    /// tracked and recorded as the prototype's export filter.
    pub fn compile_module(source: &str) -> R<FunctionPrototype> {
        let mut c = Compiler::new(source, "<module>")?;
        c.collecting_exports = true;
        c.run_top_level()?;
        let mut proto = c.finish();
        proto.exports = Some(c.module_exports);
        Ok(proto)
    }

    /// Compile a single expression for `Host::eval`, wrapped as an implicit `return`.
    pub fn compile_eval_expr(source: &str) -> R<FunctionPrototype> {
        let mut c = Compiler::new(source, "<eval>")?;
        c.expression()?;
        let line = c.previous().line;
        c.emit_op(OpCode::Return, line);
        Ok(c.finish())
    }

    fn finish(&mut self) -> FunctionPrototype {
        let line = self.tokens.last().map(|t| t.line).unwrap_or(1);
        // Trailing implicit return, so a script/module/function falling off the end
        // behaves like `return null` (or `return this` for an initializer).
        let is_initializer = self.func().proto.is_initializer;
        if is_initializer {
            self.emit_op(OpCode::GetLocal, line);
            self.emit_u8(0, line);
        } else {
            self.emit_op(OpCode::Null, line);
        }
        self.emit_op(OpCode::Return, line);
        self.funcs.pop().unwrap().proto
    }

    fn run_top_level(&mut self) -> R<()> {
        while !self.check(&TokenKind::Eof) {
            self.declaration()?;
        }
        Ok(())
    }

    // ---- token stream helpers ----

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos - 1]
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn advance(&mut self) -> &Token {
        if !self.check(&TokenKind::Eof) {
            self.pos += 1;
        }
        self.previous()
    }

    fn match_tok(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, msg: &str) -> R<&Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.err_here(msg))
        }
    }

    fn err_here(&self, msg: &str) -> SkiffError {
        let tok = self.peek();
        SkiffError::compile(msg.to_string(), crate::error::SourceLocation::new(tok.line, tok.column))
    }

    fn expect_identifier(&mut self, msg: &str) -> R<Rc<str>> {
        if let TokenKind::Identifier(name) = &self.peek().kind {
            let name: Rc<str> = name.as_str().into();
            self.advance();
            Ok(name)
        } else {
            Err(self.err_here(msg))
        }
    }

    // ---- bytecode emission ----

    fn func(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        let f = self.func();
        f.proto.code.push(byte);
        f.proto.lines.push(line as u16);
    }

    fn emit_op(&mut self, op: OpCode, line: u32) {
        self.emit_byte(op as u8, line);
    }

    fn emit_u8(&mut self, v: u8, line: u32) {
        self.emit_byte(v, line);
    }

    fn emit_u16(&mut self, v: u16, line: u32) {
        self.emit_byte((v >> 8) as u8, line);
        self.emit_byte((v & 0xff) as u8, line);
    }

    fn code_len(&mut self) -> usize {
        self.func().proto.code.len()
    }

    /// Emit a jump opcode with placeholder operand; returns the position right *after*
    /// the operand (the `next_ip` the VM would compute with a zero offset).
    fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.emit_op(op, line);
        self.emit_u16(0, line);
        self.code_len()
    }

    fn patch_jump_to_here(&mut self, next_ip_pos: usize) -> R<()> {
        let here = self.code_len();
        let offset = here as i64 - next_ip_pos as i64;
        if !(i16::MIN as i64..=i16::MAX as i64).contains(&offset) {
            return Err(self.err_here("jump offset overflow (>32767 bytes)"));
        }
        let bytes = (offset as i16).to_be_bytes();
        let f = self.func();
        let operand_pos = next_ip_pos - 2;
        f.proto.code[operand_pos] = bytes[0];
        f.proto.code[operand_pos + 1] = bytes[1];
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32) -> R<()> {
        let op_start = self.code_len();
        let next_ip = op_start + 3;
        if next_ip < loop_start {
            return Err(self.err_here("internal error: loop target after loop body"));
        }
        let distance = next_ip - loop_start;
        if distance > u16::MAX as usize {
            return Err(self.err_here("loop body too large (>65535 bytes)"));
        }
        self.emit_op(OpCode::Loop, line);
        self.emit_u16(distance as u16, line);
        Ok(())
    }

    /// Emits `ForIterLocal(u8,u16)`/`ForIterKVLocal(u8,u16)` with a placeholder forward
    /// exit offset (patched the same way as a `Jump`, via `patch_jump_to_here`),
    /// pointing past the loop body to where the loop's cleanup (`CloseIter`) begins.
    /// On the non-exhausted path the opcode pushes one value (plain form) or two
    /// values, key then value with value on top (KV form), for the compiler to bind
    /// with `SetLocal`: the first `SetLocal`/`Pop` pair below consumes the top
    /// (value) into `value_slot`, the second consumes what's left (key) into
    /// `key_slot`.
    fn emit_for_iter(&mut self, iter_slot: u8, kv: bool, line: u32) -> usize {
        self.emit_op(if kv { OpCode::ForIterKVLocal } else { OpCode::ForIterLocal }, line);
        self.emit_u8(iter_slot, line);
        self.emit_u16(0, line);
        self.code_len()
    }

    fn add_constant(&mut self, c: Constant) -> u16 {
        self.func().proto.add_constant(c)
    }

    fn string_constant(&mut self, s: &str) -> u16 {
        self.add_constant(Constant::Str(s.into()))
    }

    fn emit_const(&mut self, c: Constant, line: u32) {
        let idx = self.add_constant(c);
        self.emit_op(OpCode::Const, line);
        self.emit_u16(idx, line);
    }

    // ---- scope handling ----

    fn begin_scope(&mut self) {
        self.func().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        self.func().scope_depth -= 1;
        let depth = self.func().scope_depth;
        while let Some(local) = self.func().locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = local.is_captured;
            self.func().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
        }
    }

    fn is_top_level_scope(&self) -> bool {
        self.funcs.len() == 1 && self.funcs[0].scope_depth == 0
    }

    fn declare_local(&mut self, name: Rc<str>) -> u8 {
        let depth = self.func().scope_depth;
        self.func().locals.push(Local { name, depth, is_captured: false });
        (self.func().locals.len() - 1) as u8
    }

    fn resolve_local(func: &FuncState, name: &str) -> Option<u8> {
        func.locals.iter().rposition(|l| l.name.as_ref() == name).map(|i| i as u8)
    }

    fn resolve_upvalue(funcs: &mut [FuncState], idx: usize, name: &str) -> Option<u16> {
        if idx == 0 {
            return None;
        }
        let enclosing_idx = idx - 1;
        if let Some(local_slot) = Self::resolve_local(&funcs[enclosing_idx], name) {
            funcs[enclosing_idx].locals[local_slot as usize].is_captured = true;
            return Some(Self::add_upvalue(funcs, idx, local_slot as u16, true));
        }
        if let Some(up) = Self::resolve_upvalue(funcs, enclosing_idx, name) {
            return Some(Self::add_upvalue(funcs, idx, up, false));
        }
        None
    }

    fn add_upvalue(funcs: &mut [FuncState], idx: usize, index: u16, is_local: bool) -> u16 {
        let upvalues = &mut funcs[idx].proto.upvalues;
        if let Some(pos) = upvalues.iter().position(|u| u.index == index && u.is_local == is_local) {
            return pos as u16;
        }
        upvalues.push(UpvalueDesc { is_local, index });
        (upvalues.len() - 1) as u16
    }

    // ---- declarations & statements ----

    fn declaration(&mut self) -> R<()> {
        if self.match_tok(&TokenKind::Keyword(Keyword::Export)) {
            return self.export_declaration();
        }
        self.declaration_inner(false)
    }

    fn export_declaration(&mut self) -> R<()> {
        if !self.collecting_exports {
            return Err(self.err_here("'export' is only valid at the top level of a module"));
        }
        if !self.is_top_level_scope() {
            return Err(self.err_here("'export' is only valid at module top level"));
        }
        self.declaration_inner(true)
    }

    fn declaration_inner(&mut self, exported: bool) -> R<()> {
        if self.match_tok(&TokenKind::Keyword(Keyword::Var)) {
            self.var_declaration(exported)
        } else if self.match_tok(&TokenKind::Keyword(Keyword::Global)) {
            self.global_declaration()
        } else if self.match_tok(&TokenKind::Keyword(Keyword::Func)) {
            self.func_declaration(exported)
        } else if self.match_tok(&TokenKind::Keyword(Keyword::Class)) {
            self.class_declaration(exported)
        } else if self.match_tok(&TokenKind::Keyword(Keyword::Enum)) {
            self.enum_declaration(exported)
        } else {
            self.statement()
        }
    }

    /// Bind `name` after its value is on top of the stack. Handles the top-level
    /// (environment-backed global) vs. nested (local slot) distinction uniformly.
    fn define_binding(&mut self, name: Rc<str>, line: u32, exported: bool) {
        if exported {
            self.module_exports.push(name.clone());
        }
        if self.is_top_level_scope() {
            let idx = self.string_constant(&name);
            self.emit_op(OpCode::DefineGlobal, line);
            self.emit_u16(idx, line);
        } else {
            self.declare_local(name);
            // Local slot already holds the value (it's just been pushed); nothing
            // further to emit — the value's stack position *is* the binding.
        }
    }

    fn var_declaration(&mut self, exported: bool) -> R<()> {
        let name = self.expect_identifier("expected variable name")?;
        let line = self.previous().line;
        if self.match_tok(&TokenKind::Eq) {
            self.expression()?;
        } else {
            self.emit_op(OpCode::Null, line);
        }
        self.consume_statement_end()?;
        self.define_binding(name, line, exported);
        Ok(())
    }

    fn global_declaration(&mut self) -> R<()> {
        let name = self.expect_identifier("expected global name")?;
        let line = self.previous().line;
        if self.match_tok(&TokenKind::Eq) {
            self.expression()?;
        } else {
            self.emit_op(OpCode::Null, line);
        }
        self.consume_statement_end()?;
        let idx = self.string_constant(&name);
        self.emit_op(OpCode::DefineRootGlobal, line);
        self.emit_u16(idx, line);
        Ok(())
    }

    fn func_declaration(&mut self, exported: bool) -> R<()> {
        let name = self.expect_identifier("expected function name")?;
        let line = self.previous().line;
        self.compile_function(name.clone(), FuncKind::Function, None, line)?;
        self.define_binding(name, line, exported);
        Ok(())
    }

    fn class_declaration(&mut self, exported: bool) -> R<()> {
        let name = self.expect_identifier("expected class name")?;
        let line = self.previous().line;
        let name_const = self.string_constant(&name);
        self.emit_op(OpCode::Class, line);
        self.emit_u16(name_const, line);

        let has_superclass = self.match_tok(&TokenKind::Colon);
        if has_superclass {
            self.variable_reference(&self.expect_identifier("expected superclass name")?.clone(), line)?;
            self.emit_op(OpCode::Inherit, line);
        }

        self.classes.push(ClassState { name: name.clone(), has_superclass });
        self.expect(&TokenKind::LBrace, "expected '{' before class body")?;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.class_member(&name)?;
        }
        self.expect(&TokenKind::RBrace, "expected '}' after class body")?;
        self.classes.pop();

        self.define_binding(name, line, exported);
        Ok(())
    }

    fn class_member(&mut self, class_name: &Rc<str>) -> R<()> {
        let is_static = self.match_tok(&TokenKind::Keyword(Keyword::Static));
        let member_name = self.expect_identifier("expected member name")?;
        let line = self.previous().line;

        if self.check(&TokenKind::LParen) {
            let kind = if is_static {
                FuncKind::Function
            } else if member_name == *class_name {
                FuncKind::Initializer
            } else {
                FuncKind::Method
            };
            self.compile_function(member_name.clone(), kind, Some(class_name.clone()), line)?;
            let name_const = self.string_constant(&member_name);
            self.emit_op(if is_static { OpCode::StaticMethod } else { OpCode::Method }, line);
            self.emit_u16(name_const, line);
        } else {
            self.expect(&TokenKind::Eq, "expected '=' or '(' after member name")?;
            self.expression()?;
            self.consume_statement_end()?;
            if !is_static {
                return Err(self.err_here("instance fields must be assigned in a constructor"));
            }
            let name_const = self.string_constant(&member_name);
            self.emit_op(OpCode::StaticField, line);
            self.emit_u16(name_const, line);
        }
        Ok(())
    }

    fn enum_declaration(&mut self, exported: bool) -> R<()> {
        let name = self.expect_identifier("expected enum name")?;
        let line = self.previous().line;
        self.expect(&TokenKind::LBrace, "expected '{' after enum name")?;
        self.emit_op(OpCode::NewObject, line);
        let mut i = 0f64;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            let member = self.expect_identifier("expected enum member name")?;
            let member_line = self.previous().line;
            self.emit_op(OpCode::Dup, member_line);
            self.emit_const(Constant::Str(member.as_ref().into()), member_line);
            self.emit_const(Constant::Number(i), member_line);
            self.emit_op(OpCode::SetIndex, member_line);
            self.emit_op(OpCode::Pop, member_line);
            i += 1.0;
            if !self.match_tok(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "expected '}' after enum body")?;
        self.define_binding(name, line, exported);
        Ok(())
    }

    fn statement(&mut self) -> R<()> {
        let tok = &self.peek().kind;
        match tok {
            TokenKind::LBrace => self.block_statement(),
            TokenKind::Keyword(Keyword::If) => self.if_statement(),
            TokenKind::Keyword(Keyword::While) => self.while_statement(),
            TokenKind::Keyword(Keyword::For) => self.for_statement(),
            TokenKind::Keyword(Keyword::Return) => self.return_statement(),
            TokenKind::Keyword(Keyword::Break) => self.break_statement(),
            TokenKind::Keyword(Keyword::Continue) => self.continue_statement(),
            TokenKind::Keyword(Keyword::Import) => self.import_statement(),
            TokenKind::Keyword(Keyword::Throw) => self.throw_statement(),
            TokenKind::Keyword(Keyword::Try) => self.try_statement(),
            TokenKind::Semicolon => {
                self.advance();
                Ok(())
            }
            _ => self.expression_statement(),
        }
    }

    fn block_statement(&mut self) -> R<()> {
        let line = self.peek().line;
        self.expect(&TokenKind::LBrace, "expected '{'")?;
        self.begin_scope();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration()?;
        }
        self.expect(&TokenKind::RBrace, "expected '}' after block")?;
        self.end_scope(line);
        Ok(())
    }

    fn if_statement(&mut self) -> R<()> {
        let line = self.advance().line; // consume 'if'
        self.expect(&TokenKind::LParen, "expected '(' after 'if'")?;
        self.expression()?;
        self.expect(&TokenKind::RParen, "expected ')' after condition")?;
        let then_jump = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit_op(OpCode::Pop, line);
        self.statement()?;
        let else_jump = self.emit_jump(OpCode::Jump, line);
        self.patch_jump_to_here(then_jump)?;
        self.emit_op(OpCode::Pop, line);
        if self.match_tok(&TokenKind::Keyword(Keyword::Else)) {
            self.statement()?;
        }
        self.patch_jump_to_here(else_jump)?;
        Ok(())
    }

    fn while_statement(&mut self) -> R<()> {
        let line = self.advance().line; // 'while'
        let loop_start = self.code_len();
        self.expect(&TokenKind::LParen, "expected '(' after 'while'")?;
        self.expression()?;
        self.expect(&TokenKind::RParen, "expected ')' after condition")?;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit_op(OpCode::Pop, line);
        self.func().loops.push(LoopCtx { loop_start, break_jumps: Vec::new(), scope_depth: self.func().scope_depth });
        self.statement()?;
        self.emit_loop(loop_start, line)?;
        self.patch_jump_to_here(exit_jump)?;
        self.emit_op(OpCode::Pop, line);
        let loop_ctx = self.func().loops.pop().unwrap();
        for jump in loop_ctx.break_jumps {
            self.patch_jump_to_here(jump)?;
        }
        Ok(())
    }

    fn for_statement(&mut self) -> R<()> {
        let line = self.advance().line; // 'for'
        let first_name = self.expect_identifier("expected loop variable name")?;
        let second_name = if self.match_tok(&TokenKind::Comma) {
            Some(self.expect_identifier("expected second loop variable name")?)
        } else {
            None
        };
        self.expect(&TokenKind::Keyword(Keyword::In), "expected 'in' in for-loop")?;
        self.expression()?;
        self.expect(&TokenKind::LBrace, "expected '{' to start for-loop body")?;

        self.begin_scope();
        self.emit_op(OpCode::GetIter, line);
        let iter_slot = self.declare_local("<iter>".into());

        self.emit_op(OpCode::Null, line);
        let key_slot = self.declare_local(first_name.clone());
        let value_slot = if let Some(second) = &second_name {
            self.emit_op(OpCode::Null, line);
            Some(self.declare_local(second.clone()))
        } else {
            None
        };

        let loop_start = self.code_len();
        // `ForIter[KV]Local` pushes one (or two) fresh values per spec §6's
        // `ForIterLocal(u8,u16)` / `ForIterKVLocal(u8,u16)` shape — the bound
        // variable's slot is implied by compile-time position, not a runtime operand
        // — so the compiler binds them immediately with `SetLocal`/`Pop`.
        let exit_jump = self.emit_for_iter(iter_slot, value_slot.is_some(), line);
        if let Some(value_slot) = value_slot {
            self.emit_op(OpCode::SetLocal, line);
            self.emit_u8(value_slot, line);
            self.emit_op(OpCode::Pop, line);
        }
        self.emit_op(OpCode::SetLocal, line);
        self.emit_u8(key_slot, line);
        self.emit_op(OpCode::Pop, line);

        self.func().loops.push(LoopCtx { loop_start, break_jumps: Vec::new(), scope_depth: self.func().scope_depth });

        // Body.
        self.begin_scope();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration()?;
        }
        self.expect(&TokenKind::RBrace, "expected '}' after for-loop body")?;
        self.end_scope(line);

        self.emit_loop(loop_start, line)?;
        self.patch_jump_to_here(exit_jump)?;
        let loop_ctx = self.func().loops.pop().unwrap();
        for jump in loop_ctx.break_jumps {
            self.patch_jump_to_here(jump)?;
        }
        self.emit_op(OpCode::CloseIter, line);
        self.emit_u8(iter_slot, line);
        self.end_scope(line);
        Ok(())
    }

    fn return_statement(&mut self) -> R<()> {
        let line = self.advance().line; // 'return'
        if self.funcs.len() == 1 {
            return Err(self.err_here("cannot return from top-level script"));
        }
        let is_initializer = self.func().kind == FuncKind::Initializer;
        if self.check(&TokenKind::Semicolon) || self.check(&TokenKind::RBrace) {
            if is_initializer {
                self.emit_op(OpCode::GetLocal, line);
                self.emit_u8(0, line);
            } else {
                self.emit_op(OpCode::Null, line);
            }
        } else if is_initializer {
            return Err(self.err_here("cannot return a value from a constructor"));
        } else {
            self.expression()?;
        }
        self.consume_statement_end_optional();
        self.emit_op(OpCode::Return, line);
        Ok(())
    }

    fn break_statement(&mut self) -> R<()> {
        let line = self.advance().line;
        self.consume_statement_end_optional();
        let jump = self.emit_jump(OpCode::Jump, line);
        match self.func().loops.last_mut() {
            Some(loop_ctx) => loop_ctx.break_jumps.push(jump),
            None => return Err(self.err_here("'break' outside of a loop")),
        }
        Ok(())
    }

    fn continue_statement(&mut self) -> R<()> {
        let line = self.advance().line;
        self.consume_statement_end_optional();
        let loop_start = match self.func().loops.last() {
            Some(loop_ctx) => loop_ctx.loop_start,
            None => return Err(self.err_here("'continue' outside of a loop")),
        };
        self.emit_loop(loop_start, line)?;
        Ok(())
    }

    fn import_statement(&mut self) -> R<()> {
        let line = self.advance().line; // 'import'
        let path_tok = self.peek().clone();
        let path = match &path_tok.kind {
            TokenKind::StringLit(parts) if parts.len() == 1 => match &parts[0] {
                StringPart::Literal(s) => s.clone(),
                _ => return Err(self.err_here("import path must be a plain string literal")),
            },
            _ => return Err(self.err_here("expected a string literal module path")),
        };
        self.advance();
        self.expect(&TokenKind::Keyword(Keyword::As), "expected 'as' after import path")?;
        let alias = self.expect_identifier("expected module alias name")?;
        self.consume_statement_end()?;

        let path_const = self.string_constant(&path);
        let alias_const = self.string_constant(&alias);
        self.emit_op(OpCode::Import, line);
        self.emit_u16(path_const, line);
        self.emit_u16(alias_const, line);
        self.define_binding(alias, line, false);
        Ok(())
    }

    fn throw_statement(&mut self) -> R<()> {
        let line = self.advance().line;
        self.expression()?;
        self.consume_statement_end()?;
        self.emit_op(OpCode::Throw, line);
        Ok(())
    }

    fn try_statement(&mut self) -> R<()> {
        let line = self.advance().line; // 'try'
        let setup_pos = self.code_len();
        self.emit_op(OpCode::SetupTry, line);
        self.emit_u16(0, line); // catch offset placeholder
        self.emit_u16(0, line); // finally offset placeholder
        self.emit_u8(0, line); // catch var slot placeholder

        self.statement()?;
        self.emit_op(OpCode::EndTry, line);
        let after_try_jump = self.emit_jump(OpCode::Jump, line);

        let catch_offset_pos = setup_pos + 1;
        let finally_offset_pos = setup_pos + 3;
        let catch_var_pos = setup_pos + 5;

        let has_catch = self.match_tok(&TokenKind::Keyword(Keyword::Catch));
        let mut catch_var_slot: u8 = 0;
        if has_catch {
            let catch_start = self.code_len();
            self.patch_u16_at(catch_offset_pos, (catch_start - (setup_pos + 6)) as u16)?;
            self.begin_scope();
            let name = if self.match_tok(&TokenKind::LParen) {
                let n = self.expect_identifier("expected exception variable name")?;
                self.expect(&TokenKind::RParen, "expected ')' after exception variable")?;
                n
            } else {
                self.expect_identifier("expected exception variable name")?
            };
            catch_var_slot = self.declare_local(name);
            self.block_statement()?;
            self.end_scope(line);
        } else {
            // No catch clause: offset 0xFFFF signals "none" to the VM, same convention
            // as the finally offset below.
            self.patch_u16_at(catch_offset_pos, 0xFFFF)?;
        }
        let catch_var_pos_final = catch_var_pos;
        self.patch_u8_at(catch_var_pos_final, catch_var_slot);
        self.patch_jump_to_here(after_try_jump)?;

        if self.match_tok(&TokenKind::Keyword(Keyword::Finally)) {
            let finally_start = self.code_len();
            self.patch_u16_at(finally_offset_pos, (finally_start - (setup_pos + 6)) as u16)?;
            self.block_statement()?;
            self.emit_op(OpCode::EndFinally, line);
        } else {
            // No finally clause: offset 0xFFFF signals "none" to the VM.
            self.patch_u16_at(finally_offset_pos, 0xFFFF)?;
        }
        Ok(())
    }

    fn patch_u16_at(&mut self, pos: usize, value: u16) -> R<()> {
        let bytes = value.to_be_bytes();
        let f = self.func();
        f.proto.code[pos] = bytes[0];
        f.proto.code[pos + 1] = bytes[1];
        Ok(())
    }

    fn patch_u8_at(&mut self, pos: usize, value: u8) {
        self.func().proto.code[pos] = value;
    }

    fn expression_statement(&mut self) -> R<()> {
        let line = self.peek().line;
        self.expression()?;
        self.consume_statement_end()?;
        self.emit_op(OpCode::Pop, line);
        Ok(())
    }

    fn consume_statement_end(&mut self) -> R<()> {
        if self.check(&TokenKind::Semicolon) {
            self.advance();
        }
        Ok(())
    }

    fn consume_statement_end_optional(&mut self) {
        if self.check(&TokenKind::Semicolon) {
            self.advance();
        }
    }

    // ---- expressions ----

    fn expression(&mut self) -> R<()> {
        self.assignment()
    }

    fn assignment(&mut self) -> R<()> {
        self.logic_or(true)?;
        Ok(())
    }

    fn logic_or(&mut self, can_assign: bool) -> R<()> {
        self.logic_and(can_assign)?;
        while self.check(&TokenKind::PipePipe) {
            let line = self.advance().line;
            let jump = self.emit_jump(OpCode::JumpIfTrue, line);
            self.emit_op(OpCode::Pop, line);
            self.logic_and(false)?;
            self.patch_jump_to_here(jump)?;
        }
        Ok(())
    }

    fn logic_and(&mut self, can_assign: bool) -> R<()> {
        self.null_coalesce(can_assign)?;
        while self.check(&TokenKind::AmpAmp) {
            let line = self.advance().line;
            let jump = self.emit_jump(OpCode::JumpIfFalse, line);
            self.emit_op(OpCode::Pop, line);
            self.null_coalesce(false)?;
            self.patch_jump_to_here(jump)?;
        }
        Ok(())
    }

    fn null_coalesce(&mut self, can_assign: bool) -> R<()> {
        self.equality(can_assign)?;
        while self.check(&TokenKind::QuestionQuestion) {
            let line = self.advance().line;
            let jump = self.emit_jump(OpCode::JumpIfNotNull, line);
            self.emit_op(OpCode::Pop, line);
            self.equality(false)?;
            self.patch_jump_to_here(jump)?;
        }
        Ok(())
    }

    fn equality(&mut self, can_assign: bool) -> R<()> {
        self.comparison(can_assign)?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::EqEq => OpCode::Eq,
                TokenKind::BangEq => OpCode::Ne,
                _ => break,
            };
            let line = self.advance().line;
            self.comparison(false)?;
            self.emit_op(op, line);
        }
        Ok(())
    }

    fn comparison(&mut self, can_assign: bool) -> R<()> {
        self.bitor(can_assign)?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Lt => OpCode::Lt,
                TokenKind::LtEq => OpCode::Le,
                TokenKind::Gt => OpCode::Gt,
                TokenKind::GtEq => OpCode::Ge,
                _ => break,
            };
            let line = self.advance().line;
            self.bitor(false)?;
            self.emit_op(op, line);
        }
        Ok(())
    }

    fn bitor(&mut self, can_assign: bool) -> R<()> {
        self.bitxor(can_assign)?;
        while self.check(&TokenKind::Pipe) {
            let line = self.advance().line;
            self.bitxor(false)?;
            self.emit_op(OpCode::BitOr, line);
        }
        Ok(())
    }

    fn bitxor(&mut self, can_assign: bool) -> R<()> {
        self.bitand(can_assign)?;
        while self.check(&TokenKind::Caret) {
            let line = self.advance().line;
            self.bitand(false)?;
            self.emit_op(OpCode::BitXor, line);
        }
        Ok(())
    }

    fn bitand(&mut self, can_assign: bool) -> R<()> {
        self.shift(can_assign)?;
        while self.check(&TokenKind::Amp) {
            let line = self.advance().line;
            self.shift(false)?;
            self.emit_op(OpCode::BitAnd, line);
        }
        Ok(())
    }

    fn shift(&mut self, can_assign: bool) -> R<()> {
        self.term(can_assign)?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Shl => OpCode::Shl,
                TokenKind::Shr => OpCode::Shr,
                _ => break,
            };
            let line = self.advance().line;
            self.term(false)?;
            self.emit_op(op, line);
        }
        Ok(())
    }

    fn term(&mut self, can_assign: bool) -> R<()> {
        self.factor(can_assign)?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Plus => OpCode::Add,
                TokenKind::Minus => OpCode::Sub,
                _ => break,
            };
            let line = self.advance().line;
            self.factor(false)?;
            self.emit_op(op, line);
        }
        Ok(())
    }

    fn factor(&mut self, can_assign: bool) -> R<()> {
        self.unary(can_assign)?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Star => OpCode::Mul,
                TokenKind::Slash => OpCode::Div,
                TokenKind::Percent => OpCode::Mod,
                _ => break,
            };
            let line = self.advance().line;
            self.unary(false)?;
            self.emit_op(op, line);
        }
        Ok(())
    }

    fn unary(&mut self, can_assign: bool) -> R<()> {
        let op = match &self.peek().kind {
            TokenKind::Bang => Some(OpCode::Not),
            TokenKind::Minus => Some(OpCode::Neg),
            TokenKind::Tilde => Some(OpCode::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let line = self.advance().line;
            self.unary(false)?;
            self.emit_op(op, line);
            Ok(())
        } else {
            self.postfix(can_assign)
        }
    }

    /// Parses a primary expression followed by any chain of `.name`, `[index]`,
    /// `(args)`, postfix `++`/`--`, and — only at the chain's tail, when `can_assign`
    /// — a trailing assignment form.
    fn postfix(&mut self, can_assign: bool) -> R<()> {
        self.primary(can_assign)?;
        loop {
            match &self.peek().kind {
                TokenKind::Dot => {
                    let line = self.advance().line;
                    let name = self.expect_identifier("expected property name after '.'")?;
                    let name_const = self.string_constant(&name);
                    if self.check(&TokenKind::LParen) {
                        let argc = self.call_arguments()?;
                        self.emit_op(OpCode::Invoke, line);
                        self.emit_u16(name_const, line);
                        self.emit_u8(argc, line);
                    } else if can_assign && self.compound_assign_op().is_some() {
                        self.compile_compound_field_assign(name_const, line)?;
                        return Ok(());
                    } else if can_assign && self.match_tok(&TokenKind::Eq) {
                        self.expression()?;
                        self.emit_op(OpCode::SetProperty, line);
                        self.emit_u16(name_const, line);
                        return Ok(());
                    } else {
                        self.emit_op(OpCode::GetProperty, line);
                        self.emit_u16(name_const, line);
                    }
                }
                TokenKind::LBracket => {
                    let line = self.advance().line;
                    self.expression()?;
                    self.expect(&TokenKind::RBracket, "expected ']' after index expression")?;
                    if can_assign && self.match_tok(&TokenKind::Eq) {
                        self.expression()?;
                        self.emit_op(OpCode::SetIndex, line);
                        return Ok(());
                    } else {
                        self.emit_op(OpCode::GetIndex, line);
                    }
                }
                TokenKind::LParen => {
                    let line = self.peek().line;
                    let argc = self.call_arguments()?;
                    self.emit_op(OpCode::Call, line);
                    self.emit_u8(argc, line);
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn compound_assign_op(&self) -> Option<OpCode> {
        match &self.peek().kind {
            TokenKind::PlusEq => Some(OpCode::Add),
            TokenKind::MinusEq => Some(OpCode::Sub),
            TokenKind::StarEq => Some(OpCode::Mul),
            TokenKind::SlashEq => Some(OpCode::Div),
            TokenKind::PercentEq => Some(OpCode::Mod),
            _ => None,
        }
    }

    fn compile_compound_field_assign(&mut self, name_const: u16, line: u32) -> R<()> {
        let op = self.compound_assign_op().unwrap();
        self.advance();
        // Stack before: [object]. Duplicate so we can read then write the field.
        self.emit_op(OpCode::Dup, line);
        self.emit_op(OpCode::GetProperty, line);
        self.emit_u16(name_const, line);
        self.expression()?;
        self.emit_op(op, line);
        self.emit_op(OpCode::SetProperty, line);
        self.emit_u16(name_const, line);
        Ok(())
    }

    fn call_arguments(&mut self) -> R<u8> {
        self.expect(&TokenKind::LParen, "expected '('")?;
        let mut argc: u16 = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                self.expression()?;
                argc += 1;
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "expected ')' after arguments")?;
        if argc > 255 {
            return Err(self.err_here("too many call arguments (>255)"));
        }
        Ok(argc as u8)
    }

    fn variable_reference(&mut self, name: &str, line: u32) -> R<()> {
        let func_idx = self.funcs.len() - 1;
        if let Some(slot) = Self::resolve_local(&self.funcs[func_idx], name) {
            self.emit_op(OpCode::GetLocal, line);
            self.emit_u8(slot, line);
        } else if let Some(up) = Self::resolve_upvalue(&mut self.funcs, func_idx, name) {
            self.emit_op(OpCode::GetUpvalue, line);
            self.emit_u8(up as u8, line);
        } else {
            let idx = self.string_constant(name);
            self.emit_op(OpCode::GetGlobal, line);
            self.emit_u16(idx, line);
        }
        Ok(())
    }

    fn primary(&mut self, can_assign: bool) -> R<()> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Number(n) => {
                self.advance();
                self.emit_const(Constant::Number(n), tok.line);
                Ok(())
            }
            TokenKind::StringLit(parts) => {
                self.advance();
                self.compile_string_literal(&parts, tok.line)
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                self.emit_op(OpCode::True, tok.line);
                Ok(())
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                self.emit_op(OpCode::False, tok.line);
                Ok(())
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                self.emit_op(OpCode::Null, tok.line);
                Ok(())
            }
            TokenKind::Keyword(Keyword::This) => {
                if !self.funcs.iter().any(|f| matches!(f.kind, FuncKind::Method | FuncKind::Initializer)) {
                    return Err(self.err_here("'this' used outside of a method"));
                }
                self.advance();
                self.emit_op(OpCode::This, tok.line);
                Ok(())
            }
            TokenKind::Keyword(Keyword::Super) => {
                match self.classes.last() {
                    Some(c) if c.has_superclass => {}
                    Some(_) => return Err(self.err_here("'super' used in a class with no superclass")),
                    None => return Err(self.err_here("'super' used outside of a class")),
                }
                self.advance();
                self.expect(&TokenKind::Dot, "expected '.' after 'super'")?;
                let name = self.expect_identifier("expected superclass member name")?;
                let name_const = self.string_constant(&name);
                if self.check(&TokenKind::LParen) {
                    let argc = self.call_arguments()?;
                    self.emit_op(OpCode::SuperInvoke, tok.line);
                    self.emit_u16(name_const, tok.line);
                    self.emit_u8(argc, tok.line);
                } else {
                    self.emit_op(OpCode::GetSuper, tok.line);
                    self.emit_u16(name_const, tok.line);
                }
                Ok(())
            }
            TokenKind::Identifier(name) => {
                self.advance();
                self.compile_identifier_use(&name, tok.line, can_assign)
            }
            TokenKind::LParen => {
                if self.is_arrow_params_ahead() {
                    self.function_literal(FuncKind::Function, None, tok.line)
                } else {
                    self.advance();
                    self.expression()?;
                    self.expect(&TokenKind::RParen, "expected ')' after expression")?;
                    Ok(())
                }
            }
            TokenKind::Keyword(Keyword::Func) => {
                self.advance();
                self.function_literal(FuncKind::Function, None, tok.line)
            }
            TokenKind::LBracket => {
                self.advance();
                self.array_literal(tok.line)
            }
            TokenKind::LBrace => {
                self.advance();
                self.object_literal(tok.line)
            }
            TokenKind::Minus | TokenKind::Bang | TokenKind::Tilde => {
                // Reached only if unary() delegated without consuming — shouldn't
                // happen, but keep compilation total.
                self.unary(false)
            }
            _ => Err(self.err_here("expected expression")),
        }
    }

    fn compile_identifier_use(&mut self, name: &str, line: u32, can_assign: bool) -> R<()> {
        let func_idx = self.funcs.len() - 1;
        let local = Self::resolve_local(&self.funcs[func_idx], name);
        let upvalue = if local.is_none() { Self::resolve_upvalue(&mut self.funcs, func_idx, name) } else { None };

        if can_assign && self.match_tok(&TokenKind::Eq) {
            self.expression()?;
            self.emit_set(local, upvalue, name, line);
            return Ok(());
        }
        if can_assign {
            if let Some(op) = self.compound_assign_op() {
                self.advance();
                self.emit_get(local, upvalue, name, line);
                self.expression()?;
                self.emit_op(op, line);
                self.emit_set(local, upvalue, name, line);
                return Ok(());
            }
            if matches!(self.peek().kind, TokenKind::PlusPlus | TokenKind::MinusMinus) {
                let is_inc = matches!(self.peek().kind, TokenKind::PlusPlus);
                self.advance();
                self.emit_get(local, upvalue, name, line);
                self.emit_const(Constant::Number(1.0), line);
                self.emit_op(if is_inc { OpCode::Add } else { OpCode::Sub }, line);
                self.emit_set(local, upvalue, name, line);
                self.emit_op(OpCode::Pop, line);
                self.emit_get(local, upvalue, name, line);
                return Ok(());
            }
        }
        self.emit_get(local, upvalue, name, line);
        Ok(())
    }

    fn emit_get(&mut self, local: Option<u8>, upvalue: Option<u16>, name: &str, line: u32) {
        if let Some(slot) = local {
            self.emit_op(OpCode::GetLocal, line);
            self.emit_u8(slot, line);
        } else if let Some(up) = upvalue {
            self.emit_op(OpCode::GetUpvalue, line);
            self.emit_u8(up as u8, line);
        } else {
            let idx = self.string_constant(name);
            self.emit_op(OpCode::GetGlobal, line);
            self.emit_u16(idx, line);
        }
    }

    fn emit_set(&mut self, local: Option<u8>, upvalue: Option<u16>, name: &str, line: u32) {
        if let Some(slot) = local {
            self.emit_op(OpCode::SetLocal, line);
            self.emit_u8(slot, line);
        } else if let Some(up) = upvalue {
            self.emit_op(OpCode::SetUpvalue, line);
            self.emit_u8(up as u8, line);
        } else {
            let idx = self.string_constant(name);
            self.emit_op(OpCode::SetGlobal, line);
            self.emit_u16(idx, line);
        }
    }

    fn compile_string_literal(&mut self, parts: &[StringPart], line: u32) -> R<()> {
        if parts.len() == 1 {
            if let StringPart::Literal(s) = &parts[0] {
                self.emit_const(Constant::Str(s.as_str().into()), line);
                return Ok(());
            }
        }
        for part in parts {
            match part {
                StringPart::Literal(s) => self.emit_const(Constant::Str(s.as_str().into()), line),
                StringPart::Interpolation(src) => self.compile_nested_expr(src, line)?,
            }
        }
        self.emit_op(OpCode::BuildString, line);
        self.emit_u16(parts.len() as u16, line);
        Ok(())
    }

    /// Compile an embedded `{EXPR}` fragment by temporarily swapping in its own token
    /// stream, sharing this compiler's live `funcs`/`classes` state so the fragment can
    /// reference enclosing locals and upvalues exactly like any other sub-expression.
    fn compile_nested_expr(&mut self, src: &str, line: u32) -> R<()> {
        let raw = Lexer::tokenize(src)
            .map_err(|e| SkiffError::lex(e.message, crate::error::SourceLocation::new(line, e.column)))?;
        let mut nested_tokens: Vec<Token> = raw.into_iter().filter(|t| t.kind != TokenKind::Newline).collect();
        if nested_tokens.last().map(|t| t.kind != TokenKind::Eof).unwrap_or(true) {
            nested_tokens.push(Token { kind: TokenKind::Eof, line, column: 1 });
        }
        let saved_tokens = std::mem::replace(&mut self.tokens, nested_tokens);
        let saved_pos = self.pos;
        self.pos = 0;
        let result = self.expression();
        self.tokens = saved_tokens;
        self.pos = saved_pos;
        result
    }

    fn array_literal(&mut self, line: u32) -> R<()> {
        let mut count: u16 = 0;
        if !self.check(&TokenKind::RBracket) {
            loop {
                self.expression()?;
                count += 1;
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RBracket, "expected ']' after array elements")?;
        self.emit_op(OpCode::NewArray, line);
        self.emit_u16(count, line);
        Ok(())
    }

    fn object_literal(&mut self, line: u32) -> R<()> {
        self.emit_op(OpCode::NewObject, line);
        if !self.check(&TokenKind::RBrace) {
            loop {
                let key = self.object_key()?;
                self.expect(&TokenKind::Colon, "expected ':' after object key")?;
                self.emit_op(OpCode::Dup, line);
                self.emit_const(Constant::Str(key), line);
                self.expression()?;
                self.emit_op(OpCode::SetIndex, line);
                self.emit_op(OpCode::Pop, line);
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
                if self.check(&TokenKind::RBrace) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RBrace, "expected '}' after object literal")?;
        Ok(())
    }

    fn object_key(&mut self) -> R<Rc<str>> {
        match self.peek().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name.as_str().into())
            }
            TokenKind::StringLit(parts) if parts.len() == 1 => {
                self.advance();
                match &parts[0] {
                    StringPart::Literal(s) => Ok(s.as_str().into()),
                    _ => Err(self.err_here("object key must not be an interpolated string")),
                }
            }
            _ => Err(self.err_here("expected object key")),
        }
    }

    /// Looks ahead from the current `(` to see whether this is `(params) =>` rather
    /// than a parenthesized expression. Pure lookahead: does not consume tokens.
    fn is_arrow_params_ahead(&self) -> bool {
        let mut i = self.pos;
        if !matches!(self.tokens[i].kind, TokenKind::LParen) {
            return false;
        }
        let mut depth = 0i32;
        loop {
            match &self.tokens[i].kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                TokenKind::Eof => return false,
                _ => {}
            }
            i += 1;
        }
        matches!(self.tokens.get(i + 1).map(|t| &t.kind), Some(TokenKind::FatArrow))
    }

    fn function_literal(&mut self, kind: FuncKind, class_name: Option<Rc<str>>, line: u32) -> R<()> {
        self.compile_function("<anonymous>".into(), kind, class_name, line)
    }

    /// Parses `(params) { body }` or `(params) => expr` / `(params) => { body }`,
    /// leaving one `Closure` instruction emitted into the *enclosing* function.
    fn compile_function(&mut self, name: Rc<str>, kind: FuncKind, class_name: Option<Rc<str>>, line: u32) -> R<()> {
        self.funcs.push(FuncState::new(name, kind, class_name));
        self.expect(&TokenKind::LParen, "expected '(' to start parameter list")?;

        let mut arity: u16 = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.match_tok(&TokenKind::DotDotDot) {
                    let rest_name = self.expect_identifier("expected rest parameter name")?;
                    self.declare_local(rest_name);
                    self.func().proto.has_rest_param = true;
                    break;
                }
                let param_name = self.expect_identifier("expected parameter name")?;
                let param_line = self.previous().line;
                let slot = self.declare_local(param_name);
                arity += 1;
                if self.match_tok(&TokenKind::Eq) {
                    self.compile_default_param(slot, param_line)?;
                }
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "expected ')' after parameters")?;
        if arity > 255 {
            return Err(self.err_here("too many parameters (>255)"));
        }
        self.func().proto.arity = arity as u8;

        if self.match_tok(&TokenKind::FatArrow) {
            if self.check(&TokenKind::LBrace) {
                self.block_no_scope()?;
            } else {
                self.expression()?;
                let ret_line = self.previous().line;
                self.emit_op(OpCode::Return, ret_line);
            }
        } else {
            self.expect(&TokenKind::LBrace, "expected '{' to start function body")?;
            self.block_no_scope()?;
        }

        let proto = self.finish();
        let proto_const = self.add_constant_in_enclosing(Constant::Function(Rc::new(proto.clone())));
        let upvalues = proto.upvalues.clone();
        self.emit_op(OpCode::Closure, line);
        self.emit_u16(proto_const, line);
        self.emit_u8(upvalues.len() as u8, line);
        for up in &upvalues {
            self.emit_u8(if up.is_local { 1 } else { 0 }, line);
            self.emit_u16(up.index, line);
        }
        Ok(())
    }

    fn add_constant_in_enclosing(&mut self, c: Constant) -> u16 {
        self.func().proto.add_constant(c)
    }

    /// Like `block_statement` but without its own scope: the function body's top
    /// scope *is* the parameter scope (depth 0 of the new `FuncState`).
    fn block_no_scope(&mut self) -> R<()> {
        self.expect(&TokenKind::LBrace, "expected '{'")?;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration()?;
        }
        self.expect(&TokenKind::RBrace, "expected '}' after function body")?;
        Ok(())
    }

    fn compile_default_param(&mut self, slot: u8, line: u32) -> R<()> {
        self.emit_op(OpCode::GetLocal, line);
        self.emit_u8(slot, line);
        let not_null_jump = self.emit_jump(OpCode::JumpIfNotNull, line);
        self.emit_op(OpCode::Pop, line);
        self.expression()?;
        self.emit_op(OpCode::SetLocal, line);
        self.emit_u8(slot, line);
        self.emit_op(OpCode::Pop, line);
        let end_jump = self.emit_jump(OpCode::Jump, line);
        self.patch_jump_to_here(not_null_jump)?;
        self.emit_op(OpCode::Pop, line);
        self.patch_jump_to_here(end_jump)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> FunctionPrototype {
        Compiler::compile_script(src).expect("should compile")
    }

    #[test]
    fn simple_arithmetic_compiles_without_error() {
        let proto = compile("var x = 1 + 2 * 3;");
        assert!(proto.code.contains(&(OpCode::Add as u8)));
        assert!(proto.code.contains(&(OpCode::Mul as u8)));
    }

    #[test]
    fn top_level_var_uses_global_opcodes() {
        let proto = compile("var x = 1;");
        assert!(proto.code.contains(&(OpCode::DefineGlobal as u8)));
        assert!(!proto.code.contains(&(OpCode::SetLocal as u8)));
    }

    #[test]
    fn function_body_var_uses_local_slots() {
        let proto = compile("func f() { var x = 1; return x; }");
        let nested = proto.constants.iter().find_map(|c| match c {
            Constant::Function(p) => Some(p.clone()),
            _ => None,
        });
        let nested = nested.expect("nested function constant");
        assert!(nested.code.contains(&(OpCode::GetLocal as u8)));
    }

    #[test]
    fn if_statement_emits_conditional_jumps() {
        let proto = compile("if (true) { var x = 1; } else { var y = 2; }");
        assert!(proto.code.contains(&(OpCode::JumpIfFalse as u8)));
        assert!(proto.code.contains(&(OpCode::Jump as u8)));
    }

    #[test]
    fn class_declaration_emits_class_and_method_opcodes() {
        let proto = compile("class A { A(x) { this.x = x; } }");
        assert!(proto.code.contains(&(OpCode::Class as u8)));
        assert!(proto.code.contains(&(OpCode::Method as u8)));
    }

    #[test]
    fn string_interpolation_emits_build_string() {
        let proto = compile(r#"var x = "a{1+1}b";"#);
        assert!(proto.code.contains(&(OpCode::BuildString as u8)));
    }

    #[test]
    fn try_catch_finally_emits_handler_opcodes() {
        let proto = compile(r#"try { throw "e"; } catch e { } finally { }"#);
        assert!(proto.code.contains(&(OpCode::SetupTry as u8)));
        assert!(proto.code.contains(&(OpCode::EndTry as u8)));
        assert!(proto.code.contains(&(OpCode::EndFinally as u8)));
    }

    #[test]
    fn arrow_function_compiles_as_closure() {
        let proto = compile("var f = () => 42;");
        assert!(proto.code.contains(&(OpCode::Closure as u8)));
    }

    #[test]
    fn module_export_is_recorded() {
        let proto = Compiler::compile_module("export var x = 1;").unwrap();
        let exports = proto.exports.expect("module has exports");
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].as_ref(), "x");
    }
}
