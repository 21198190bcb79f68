// File: src/compiler.rs
//
// Single-pass bytecode compiler for Lume. A Pratt precedence-climbing
// parser that emits into a Chunk as it goes: no AST. Lexical
// resolution, upvalue capture, scope management, and jump patching all
// happen inline during the one pass over the token stream.

use std::rc::Rc;
use std::sync::OnceLock;

use crate::chunk::{Chunk, OpCode};
use crate::errors::Diagnostic;
use crate::heap::Heap;
use crate::object::{Obj, ObjFunction, ObjRef};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

static PRINT_CODE: OnceLock<bool> = OnceLock::new();

fn print_code_enabled() -> bool {
    *PRINT_CODE.get_or_init(|| std::env::var("LUME_PRINT_CODE").is_ok())
}

/// Compile source text to a top-level function object. All diagnostics
/// are collected; any error means no function is returned.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.states.push(FnState::new(FunctionKind::Script, None));

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }

    let (function, _) = compiler.end_function();
    if compiler.had_error {
        Err(compiler.diagnostics)
    } else {
        Ok(function)
    }
}

/// Expression precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / % & | ^
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Function,
    Initializer,
    Method,
    Script,
}

struct Local<'src> {
    name: &'src str,
    /// -1 while declared but not yet initialized.
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

struct LoopState {
    start: usize,
    breaks: Vec<usize>,
}

/// Per-function compilation state. The stack of these mirrors the
/// lexical nesting of function declarations.
struct FnState<'src> {
    kind: FunctionKind,
    name: Option<ObjRef>,
    arity: usize,
    upvalue_count: usize,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
    current_loop: Option<LoopState>,
}

impl<'src> FnState<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> FnState<'src> {
        // Slot 0 belongs to the callee; in methods and initializers it
        // is the receiver, addressable as `this`.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        FnState {
            kind,
            name,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            locals: vec![Local { name: slot_zero, depth: 0, captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
            current_loop: None,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    heap: &'h mut Heap,
    states: Vec<FnState<'src>>,
    classes: Vec<ClassState>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Compiler<'src, 'h> {
        Compiler {
            scanner: Scanner::new(source),
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            heap,
            states: Vec::new(),
            classes: Vec::new(),
        }
    }

    // Token plumbing

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // Error reporting

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let lexeme = match token.kind {
            TokenKind::Eof | TokenKind::Error => None,
            _ => Some(token.lexeme.to_string()),
        };
        self.diagnostics.push(Diagnostic { line: token.line, lexeme, message: message.to_string() });
    }

    /// Skip tokens until a statement boundary so one mistake does not
    /// cascade into a wall of errors.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Let
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Dump
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // State accessors

    fn state(&self) -> &FnState<'src> {
        self.states.last().expect("compiler state stack is never empty")
    }

    fn state_mut(&mut self) -> &mut FnState<'src> {
        self.states.last_mut().expect("compiler state stack is never empty")
    }

    fn chunk_len(&self) -> usize {
        self.state().chunk.code.len()
    }

    // Bytecode emission

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.state_mut().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);

        let offset = self.chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Emit a jump with a placeholder operand; returns the offset to
    /// patch once the target is known.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to adjust for the jump operand itself.
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        let chunk = &mut self.state_mut().chunk;
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let constant = self.state_mut().chunk.add_constant(value);
        if constant > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        self.make_constant(Value::Obj(interned))
    }

    /// Finish the innermost function: emit the implicit return, build
    /// the function object, and hand back the upvalue descriptors the
    /// caller needs for the CLOSURE operand bytes.
    fn end_function(&mut self) -> (ObjRef, Vec<CompilerUpvalue>) {
        self.emit_return();

        let state = self.states.pop().expect("compiler state stack is never empty");
        let function = ObjFunction {
            arity: state.arity,
            upvalue_count: state.upvalue_count,
            chunk: Rc::new(state.chunk),
            name: state.name,
        };
        let upvalues = state.upvalues;
        let r = self.heap.alloc(Obj::Function(function));

        if print_code_enabled() && !self.had_error {
            let function = self.heap.function(r);
            let chunk = Rc::clone(&function.chunk);
            let name = match function.name {
                Some(name) => self.heap.string(name).to_string(),
                None => "<script>".to_string(),
            };
            crate::debug::disassemble_chunk(self.heap, &chunk, &name);
        }

        (r, upvalues)
    }

    // Scope management

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;

        loop {
            let state = self.state();
            let Some(local) = state.locals.last() else { break };
            if local.depth <= state.scope_depth {
                break;
            }
            let op = if local.captured { OpCode::CloseUpvalue } else { OpCode::Pop };
            self.emit_op(op);
            self.state_mut().locals.pop();
        }
    }

    // Variable resolution

    fn add_local(&mut self, name: &'src str) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local { name, depth: -1, captured: false });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme;
        let state = self.state();
        let mut shadowed = false;
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                shadowed = true;
                break;
            }
        }
        if shadowed {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }

        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, level: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (i, local) in self.states[level].locals.iter().enumerate().rev() {
            if local.name == name {
                uninitialized = local.depth == -1;
                found = Some(i as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let candidate = CompilerUpvalue { index, is_local };
        let state = &mut self.states[level];

        for (i, existing) in state.upvalues.iter().enumerate() {
            if *existing == candidate {
                return i as u8;
            }
        }

        if state.upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }

        let state = &mut self.states[level];
        state.upvalues.push(candidate);
        state.upvalue_count = state.upvalues.len();
        (state.upvalues.len() - 1) as u8
    }

    /// Resolve a name against the enclosing function, capturing it as
    /// an upvalue chain if found.
    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        let enclosing = level - 1;

        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local as usize].captured = true;
            return Some(self.add_upvalue(level, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(level, upvalue, false));
        }

        None
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let level = self.states.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(level, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(upvalue) = self.resolve_upvalue(level, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
            return;
        }

        // Compound assignments load the variable, evaluate the operand,
        // apply the operator, and store back.
        let compound = [
            (TokenKind::PlusEqual, OpCode::Add),
            (TokenKind::MinusEqual, OpCode::Subtract),
            (TokenKind::StarEqual, OpCode::Multiply),
            (TokenKind::SlashEqual, OpCode::Divide),
        ];
        if can_assign {
            for (token, op) in compound {
                if self.match_token(token) {
                    self.emit_op_byte(get_op, arg);
                    self.expression();
                    self.emit_op(op);
                    self.emit_op_byte(set_op, arg);
                    return;
                }
            }
        }

        self.emit_op_byte(get_op, arg);
    }

    // Expressions

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            let infix = Self::rule(self.previous.kind)
                .infix
                .expect("a token with a precedence always has an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src, 'h> {
        use TokenKind::*;

        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'h>>,
            Option<ParseFn<'src, 'h>>,
            Precedence,
        ) = match kind {
            LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            LeftBracket => (Some(Self::array_literal), Some(Self::index), Precedence::Call),
            LeftBrace => (Some(Self::table_literal), None, Precedence::None),
            Dot => (None, Some(Self::dot), Precedence::Call),
            Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => (None, Some(Self::binary), Precedence::Term),
            Slash | Star | Percent | Ampersand | Pipe | Caret => {
                (None, Some(Self::binary), Precedence::Factor)
            }
            Bang => (Some(Self::unary), None, Precedence::None),
            BangEqual | EqualEqual => (None, Some(Self::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            Identifier => (Some(Self::variable), None, Precedence::None),
            String => (Some(Self::string), None, Precedence::None),
            Number => (Some(Self::number), None, Precedence::None),
            And => (None, Some(Self::and_), Precedence::And),
            Or => (None, Some(Self::or_), Precedence::Or),
            False | Nil | True => (Some(Self::literal), None, Precedence::None),
            Super => (Some(Self::super_), None, Precedence::None),
            This => (Some(Self::this_), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };

        ParseRule { prefix, infix, precedence }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;

        let value = if let Some(digits) = lexeme.strip_prefix("0x") {
            i64::from_str_radix(digits, 16).ok().map(|v| v as f64)
        } else if let Some(digits) = lexeme.strip_prefix("0b") {
            i64::from_str_radix(digits, 2).ok().map(|v| v as f64)
        } else if let Some(digits) = lexeme.strip_prefix("0o") {
            i64::from_str_radix(digits, 8).ok().map(|v| v as f64)
        } else {
            lexeme.parse::<f64>().ok()
        };

        match value {
            Some(number) => self.emit_constant(Value::Number(number)),
            None => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let interior = &lexeme[1..lexeme.len() - 1];
        let interned = self.heap.intern(interior);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.lexeme, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = Self::rule(operator);
        self.parse_precedence(rule.precedence.next());

        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::Ampersand => self.emit_op(OpCode::BitwiseAnd),
            TokenKind::Pipe => self.emit_op(OpCode::BitwiseOr),
            TokenKind::Caret => self.emit_op(OpCode::BitwiseXor),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::Index);
        }
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            // Fused property call: skips the intermediate bound method.
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 elements in an array literal.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) || self.check(TokenKind::RightBracket) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
        self.emit_op_byte(OpCode::SetArray, count as u8);
    }

    fn table_literal(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                // A bare identifier key is shorthand for a string key;
                // anything else is an expression (group computed keys).
                if self.match_token(TokenKind::Identifier) {
                    let interned = self.heap.intern(self.previous.lexeme);
                    self.emit_constant(Value::Obj(interned));
                } else {
                    self.expression();
                }
                self.consume(TokenKind::Colon, "Expect ':' after table key.");
                self.expression();

                if count == 255 {
                    self.error("Can't have more than 255 entries in a table literal.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) || self.check(TokenKind::RightBrace) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after table entries.");
        self.emit_op_byte(OpCode::SetTable, count as u8);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    // Declarations and statements

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Let) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Dump) {
            self.dump_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme);
        self.states.push(FnState::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.state_mut().arity += 1;
                if self.state().arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_byte(OpCode::Closure, constant);

        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);

        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);

        self.emit_op_byte(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;

        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);

            if class_name == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // Bind the superclass value to a scoped synthetic `super`
            // local so methods can capture it.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().expect("class state just pushed").has_superclass = true;
        }

        self.named_variable(class_name, false);

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().expect("class state still pushed").has_superclass {
            self.end_scope();
        }

        self.classes.pop();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn dump_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Dump);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }

            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        let enclosing =
            self.state_mut().current_loop.replace(LoopState { start: loop_start, breaks: Vec::new() });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        self.finish_loop(enclosing);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Let) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let enclosing =
            self.state_mut().current_loop.replace(LoopState { start: loop_start, breaks: Vec::new() });

        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop); // Condition.
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.state_mut().current_loop.as_mut().expect("loop state just set").start =
                increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop); // Condition.
        }

        self.finish_loop(enclosing);
        self.end_scope();
    }

    /// Patch this loop's pending breaks and restore the enclosing
    /// loop's context.
    fn finish_loop(&mut self, enclosing: Option<LoopState>) {
        let finished = self.state_mut().current_loop.take().expect("loop state still set");
        for jump in finished.breaks {
            self.patch_jump(jump);
        }
        self.state_mut().current_loop = enclosing;
    }

    fn break_statement(&mut self) {
        if self.state().current_loop.is_none() {
            self.error("Can't use 'break' outside of a loop.");
        } else {
            let jump = self.emit_jump(OpCode::Jump);
            self.state_mut().current_loop.as_mut().expect("checked above").breaks.push(jump);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
    }

    fn continue_statement(&mut self) {
        match self.state().current_loop.as_ref().map(|l| l.start) {
            Some(start) => self.emit_loop(start),
            None => self.error("Can't use 'continue' outside of a loop."),
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }

    /// Cases compare against a duplicated scrutinee and jump to a
    /// shared exit; there is no fall-through between cases.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch condition.");
        self.consume(TokenKind::LeftBrace, "Expect '{' after switch condition.");

        let mut exit_jumps = Vec::new();

        while self.match_token(TokenKind::Case) {
            self.emit_op(OpCode::Dup);
            self.expression();
            self.consume(TokenKind::Colon, "Expect ':' after case expression.");
            self.emit_op(OpCode::Equal);

            let skip = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop); // comparison result
            self.emit_op(OpCode::Pop); // scrutinee, on a match

            while !self.check(TokenKind::RightBrace)
                && !self.check(TokenKind::Case)
                && !self.check(TokenKind::Default)
                && !self.check(TokenKind::Eof)
            {
                self.statement();
            }

            exit_jumps.push(self.emit_jump(OpCode::Jump));

            self.patch_jump(skip);
            self.emit_op(OpCode::Pop); // comparison result, on a skip
        }

        if self.match_token(TokenKind::Default) {
            self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
            while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
                self.statement();
            }
        }

        self.emit_op(OpCode::Pop); // scrutinee, when no case matched
        self.consume(TokenKind::RightBrace, "Expect '}' after switch cases.");

        for jump in exit_jumps {
            self.patch_jump(jump);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("program should compile");
        (heap, function)
    }

    fn compile_err(source: &str) -> Vec<Diagnostic> {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("program should not compile")
    }

    #[test]
    fn script_ends_with_implicit_nil_return() {
        let (heap, function) = compile_ok("let a = 1;");
        let chunk = &heap.function(function).chunk;
        let tail = &chunk.code[chunk.code.len() - 2..];
        assert_eq!(tail, &[OpCode::Nil as u8, OpCode::Return as u8]);
        assert_eq!(chunk.code.len(), chunk.lines.len());
    }

    #[test]
    fn jump_offsets_are_forward_and_well_formed() {
        let (heap, function) = compile_ok("if (true) { dump 1; } else { dump 2; }");
        let chunk = &heap.function(function).chunk;
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::try_from(chunk.code[offset]).expect("valid opcode");
            match op {
                OpCode::Jump | OpCode::JumpIfFalse => {
                    let target = offset + 3 + chunk.read_short(offset + 1) as usize;
                    assert!(target <= chunk.code.len());
                    offset += 3;
                }
                OpCode::Loop => {
                    let back = chunk.read_short(offset + 1) as usize;
                    assert!(back <= offset + 3);
                    offset += 3;
                }
                OpCode::Constant | OpCode::GetLocal | OpCode::Call => offset += 2,
                OpCode::Dump | OpCode::Pop | OpCode::Nil | OpCode::True | OpCode::Return => {
                    offset += 1
                }
                other => panic!("unexpected opcode in test chunk: {:?}", other),
            }
        }
    }

    #[test]
    fn reading_local_in_own_initializer_is_an_error() {
        let diagnostics = compile_err("{ let a = 1; { let a = a; } }");
        assert!(diagnostics
            .iter()
            .any(|d| d.message == "Can't read local variable in its own initializer."));
    }

    #[test]
    fn redeclaring_a_local_in_the_same_scope_is_an_error() {
        let diagnostics = compile_err("{ let a = 1; let a = 2; }");
        assert!(diagnostics
            .iter()
            .any(|d| d.message == "Already a variable with this name in this scope."));
    }

    #[test]
    fn invalid_assignment_target_is_reported() {
        let diagnostics = compile_err("1 + 2 = 3;");
        assert!(diagnostics.iter().any(|d| d.message == "Invalid assignment target."));
    }

    #[test]
    fn returning_a_value_from_an_initializer_is_an_error() {
        let diagnostics = compile_err("class A { init() { return 1; } }");
        assert!(diagnostics
            .iter()
            .any(|d| d.message == "Can't return a value from an initializer."));
    }

    #[test]
    fn break_outside_a_loop_is_an_error() {
        let diagnostics = compile_err("break;");
        assert!(diagnostics.iter().any(|d| d.message == "Can't use 'break' outside of a loop."));
    }

    #[test]
    fn synchronize_surfaces_multiple_errors() {
        let diagnostics = compile_err("let = 1; let y 2;");
        assert!(diagnostics.len() >= 2);
    }

    #[test]
    fn this_outside_a_class_is_an_error() {
        let diagnostics = compile_err("dump this;");
        assert!(diagnostics.iter().any(|d| d.message == "Can't use 'this' outside of a class."));
    }

    #[test]
    fn closures_record_their_upvalue_counts() {
        let (heap, script) = compile_ok(
            "fun outer() { let n = 0; fun inner() { return n; } return inner; }",
        );
        // The outer function is the script's first function constant.
        let chunk = &heap.function(script).chunk;
        let outer = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) => match heap.get(*r) {
                    Obj::Function(f) if f.name.is_some() => Some(r),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function constant");
        let inner = heap
            .function(*outer)
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) => match heap.get(*r) {
                    Obj::Function(f) if f.upvalue_count > 0 => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(heap.function(inner).upvalue_count, 1);
    }
}
