/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Parser for the textual L2 form.
//!
//! Instructions are not delimited: each one is recognised from its first
//! couple of tokens.  Tokens need no whitespace between them when the
//! boundary is unambiguous, so `%x++` and `rax<-5` are both fine.

use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::iter::Peekable;
use std::path::Path;
use std::str::CharIndices;

use l2regalloc::data_structures::ItemIx;
use l2regalloc::ir::{
  ArithOp, Callee, CmpOp, Comparison, Function, Inst, Operand, ShiftOp,
};
use l2regalloc::machine::{PhysReg, RuntimeFn};

use crate::test_framework::Program;

#[derive(Debug)]
pub enum ParseError {
  IoError(io::Error),
  Parse(String),
}

impl From<io::Error> for ParseError {
  fn from(err: io::Error) -> ParseError {
    ParseError::IoError(err)
  }
}

impl ToString for ParseError {
  fn to_string(&self) -> String {
    match self {
      ParseError::IoError(err) => format!("i/o error: {}", err),
      ParseError::Parse(msg) => msg.clone(),
    }
  }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// A function together with the variable to spill and the prefix for the
/// temporaries.  Both names are without the leading '%'.
pub struct SpillRequest {
  pub func: Function,
  pub var: String,
  pub prefix: String,
}

pub fn read_file(path: &Path) -> ParseResult<String> {
  let mut file = File::open(path)?;
  let mut content = String::new();
  file.read_to_string(&mut content)?;
  Ok(content)
}

pub fn parse_file(path: &Path) -> ParseResult<Program> {
  parse_program(&read_file(path)?)
}

// Longest first, so that a prefix never shadows a longer operator.
const OPERATORS: [&str; 13] =
  ["<<=", ">>=", "<-", "<=", "+=", "-=", "*=", "&=", "++", "--", "<", "=", "@"];

struct Parser<'str> {
  source: &'str str,
  iter: Peekable<CharIndices<'str>>,
  line: usize,
  lookahead: Option<String>,
}

impl<'str> Parser<'str> {
  fn new(source: &'str str) -> Self {
    Self {
      source,
      iter: source.char_indices().peekable(),
      line: 1,
      lookahead: None,
    }
  }

  // Characters.
  fn peek(&mut self) -> Option<char> {
    self.iter.peek().map(|(_, c)| *c)
  }

  fn peek_next(&self) -> Option<char> {
    let mut clone = self.iter.clone();
    clone.next();
    clone.peek().map(|(_, c)| *c)
  }

  fn advance(&mut self) -> Option<char> {
    let c = self.iter.next().map(|(_, c)| c);
    if c == Some('\n') {
      self.line += 1;
    }
    c
  }

  fn pos(&mut self) -> usize {
    let len = self.source.len();
    self.iter.peek().map_or(len, |(i, _)| *i)
  }

  fn skip_whitespace_and_comments(&mut self) {
    while let Some(c) = self.peek() {
      if c.is_whitespace() {
        self.advance();
      } else if c == '/' && self.peek_next() == Some('/') {
        // A comment runs to the end of the line.
        while let Some(c) = self.advance() {
          if c == '\n' {
            break;
          }
        }
      } else {
        break;
      }
    }
  }

  // Tokens.
  fn lex(&mut self) -> Option<String> {
    self.skip_whitespace_and_comments();
    let c = self.peek()?;
    let start = self.pos();

    if c == '%' || c == ':' {
      self.advance();
      while self.peek().map_or(false, is_name_char) {
        self.advance();
      }
    } else if is_alpha(c) {
      // Bare words may contain inner dashes: stack-arg, tensor-error.
      self.advance();
      loop {
        match self.peek() {
          Some(c) if is_name_char(c) => {
            self.advance();
          }
          Some('-') if self.peek_next().map_or(false, is_alpha) => {
            self.advance();
          }
          _ => break,
        }
      }
    } else if c.is_ascii_digit()
      || ((c == '-' || c == '+')
        && self.peek_next().map_or(false, |d| d.is_ascii_digit()))
    {
      self.advance();
      while self.peek().map_or(false, |d| d.is_ascii_digit()) {
        self.advance();
      }
    } else if let Some(op) =
      OPERATORS.iter().find(|op| self.source[start..].starts_with(**op))
    {
      for _ in 0..op.len() {
        self.advance();
      }
    } else {
      self.advance();
    }

    let end = self.pos();
    Some(self.source[start..end].to_string())
  }

  fn peek_token(&mut self) -> Option<&str> {
    if self.lookahead.is_none() {
      self.lookahead = self.lex();
    }
    self.lookahead.as_deref()
  }

  fn next_token(&mut self) -> Option<String> {
    match self.lookahead.take() {
      Some(tok) => Some(tok),
      None => self.lex(),
    }
  }

  fn read_token(&mut self, what: &str) -> ParseResult<String> {
    match self.next_token() {
      Some(tok) => Ok(tok),
      None => self.error(&format!("expected {}, found end of input", what)),
    }
  }

  fn expect(&mut self, expected: &str) -> ParseResult<()> {
    let tok = self.read_token(expected)?;
    if tok != expected {
      self.error(&format!("expected '{}', found '{}'", expected, tok))
    } else {
      Ok(())
    }
  }

  fn is_done(&mut self) -> bool {
    self.peek_token().is_none()
  }

  fn error<T>(&self, msg: &str) -> ParseResult<T> {
    Err(ParseError::Parse(format!("error at line {}: {}", self.line, msg)))
  }

  // Items and operands.
  fn number(&self, tok: &str) -> ParseResult<i64> {
    match tok.parse::<i64>() {
      Ok(n) if is_number(tok) => Ok(n),
      _ => self.error(&format!("expected a number, found '{}'", tok)),
    }
  }

  fn read_number(&mut self) -> ParseResult<i64> {
    let tok = self.read_token("a number")?;
    self.number(&tok)
  }

  fn try_read_number(&mut self) -> ParseResult<Option<i64>> {
    if self.peek_token().map_or(false, is_number) {
      Ok(Some(self.read_number()?))
    } else {
      Ok(None)
    }
  }

  fn label(&self, func: &mut Function, tok: &str) -> ParseResult<ItemIx> {
    match sigiled_name(tok, ':') {
      Some(name) => Ok(func.declare_label(name)),
      None => self.error(&format!("expected a label, found '{}'", tok)),
    }
  }

  fn read_label(&mut self, func: &mut Function) -> ParseResult<ItemIx> {
    let tok = self.read_token("a label")?;
    self.label(func, &tok)
  }

  // x: any register, including rsp, or a variable.
  fn x(&self, func: &mut Function, tok: &str) -> Option<ItemIx> {
    if let Some(name) = sigiled_name(tok, '%') {
      Some(func.declare_var(name))
    } else {
      PhysReg::from_name(tok).map(|r| func.reg(r))
    }
  }

  // w: like x, but never the stack pointer.
  fn w(&self, func: &mut Function, tok: &str) -> ParseResult<Operand> {
    match self.x(func, tok) {
      Some(ix) if func.phys_reg(ix) != Some(PhysReg::Rsp) => Ok(Operand::Item(ix)),
      _ => self.error(&format!("expected a register or variable, found '{}'", tok)),
    }
  }

  fn read_w(&mut self, func: &mut Function) -> ParseResult<Operand> {
    let tok = self.read_token("a register or variable")?;
    self.w(func, &tok)
  }

  // t: x or a number.
  fn t(&self, func: &mut Function, tok: &str) -> ParseResult<Operand> {
    if is_number(tok) {
      return Ok(Operand::Const(self.number(tok)?));
    }
    match self.x(func, tok) {
      Some(ix) => Ok(Operand::Item(ix)),
      None => self.error(&format!("expected a value, found '{}'", tok)),
    }
  }

  fn read_t(&mut self, func: &mut Function) -> ParseResult<Operand> {
    let tok = self.read_token("a value")?;
    self.t(func, &tok)
  }

  // s: t or a label.
  fn s(&self, func: &mut Function, tok: &str) -> ParseResult<Operand> {
    if tok.starts_with(':') {
      Ok(Operand::Item(self.label(func, tok)?))
    } else {
      self.t(func, tok)
    }
  }

  // The rest of `mem x M`, after the `mem`.
  fn read_mem(&mut self, func: &mut Function) -> ParseResult<Operand> {
    let tok = self.read_token("a base register")?;
    let base = match self.x(func, &tok) {
      Some(ix) => ix,
      None => return self.error(&format!("bad memory base '{}'", tok)),
    };
    let offset = self.read_number()?;
    Ok(Operand::Mem { base, offset })
  }

  fn try_read_cmp_op(&mut self) -> Option<CmpOp> {
    let op = match self.peek_token() {
      Some("<") => CmpOp::Lt,
      Some("<=") => CmpOp::Le,
      Some("=") => CmpOp::Eq,
      _ => return None,
    };
    self.next_token();
    Some(op)
  }

  fn read_cmp(&mut self, func: &mut Function) -> ParseResult<Comparison> {
    let lhs = self.read_t(func)?;
    match self.try_read_cmp_op() {
      Some(op) => {
        let rhs = self.read_t(func)?;
        Ok(Comparison { op, lhs, rhs })
      }
      None => self.error("expected a comparison operator"),
    }
  }

  // Instructions.
  fn inst(&mut self, func: &mut Function, tok: String) -> ParseResult<Inst> {
    match tok.as_str() {
      "return" => Ok(Inst::Return { value: None }),
      "goto" => Ok(Inst::Goto { target: self.read_label(func)? }),
      "cjump" => {
        let cond = self.read_cmp(func)?;
        let target = self.read_label(func)?;
        Ok(Inst::CJump { cond, target })
      }
      "call" => {
        let tok = self.read_token("a callee")?;
        let callee = match RuntimeFn::from_name(&tok) {
          Some(rt) => Callee::Runtime(rt),
          None if tok.starts_with(':') => {
            Callee::User(Operand::Item(self.label(func, &tok)?))
          }
          None => Callee::User(self.w(func, &tok)?),
        };
        let num_args = self.read_number()?;
        Ok(Inst::Call { callee, num_args })
      }
      "mem" => {
        let dst = self.read_mem(func)?;
        let op = self.read_token("an operator")?;
        match op.as_str() {
          "<-" => {
            let tok = self.read_token("a value")?;
            let src = self.s(func, &tok)?;
            Ok(Inst::Assign { dst, src })
          }
          "+=" | "-=" => {
            let src = self.read_t(func)?;
            Ok(Inst::Arith { op: arith_op(&op), dst, src })
          }
          _ => self.error(&format!("unexpected '{}' after memory operand", op)),
        }
      }
      _ if tok.starts_with(':') => Ok(Inst::Label { label: self.label(func, &tok)? }),
      _ => {
        let dst = self.w(func, &tok)?;
        let op = self.read_token("an operator")?;
        match op.as_str() {
          "<-" => self.assignment(func, dst),
          "+=" | "-=" | "*=" | "&=" => {
            let tok = self.read_token("a value")?;
            let src = if tok == "mem" && (op == "+=" || op == "-=") {
              self.read_mem(func)?
            } else {
              self.t(func, &tok)?
            };
            Ok(Inst::Arith { op: arith_op(&op), dst, src })
          }
          "<<=" | ">>=" => {
            let tok = self.read_token("a shift amount")?;
            let amount = if is_number(&tok) {
              Operand::Const(self.number(&tok)?)
            } else {
              match self.x(func, &tok) {
                Some(ix) if func.is_var(ix) || func.phys_reg(ix) == Some(PhysReg::Rcx) => {
                  Operand::Item(ix)
                }
                _ => return self.error(&format!("bad shift amount '{}'", tok)),
              }
            };
            let op = if op == "<<=" { ShiftOp::Left } else { ShiftOp::Right };
            Ok(Inst::Shift { op, dst, amount })
          }
          "@" => {
            let base = self.read_w(func)?;
            let index = self.read_w(func)?;
            let scale = self.read_number()?;
            match scale {
              1 | 2 | 4 | 8 => Ok(Inst::Lea { dst, base, index, scale }),
              _ => self.error(&format!("bad scale {}", scale)),
            }
          }
          "++" => Ok(Inst::Inc { dst }),
          "--" => Ok(Inst::Dec { dst }),
          _ => self.error(&format!("unexpected '{}' after '{}'", op, tok)),
        }
      }
    }
  }

  fn assignment(&mut self, func: &mut Function, dst: Operand) -> ParseResult<Inst> {
    let tok = self.read_token("a value")?;
    let src = match tok.as_str() {
      "mem" => self.read_mem(func)?,
      "stack-arg" => Operand::StackArg(self.read_number()?),
      _ if tok.starts_with(':') => self.s(func, &tok)?,
      _ => {
        let lhs = self.t(func, &tok)?;
        match self.try_read_cmp_op() {
          Some(op) => {
            let rhs = self.read_t(func)?;
            Operand::Cmp(Box::new(Comparison { op, lhs, rhs }))
          }
          None => lhs,
        }
      }
    };
    Ok(Inst::Assign { dst, src })
  }

  fn function(&mut self) -> ParseResult<Function> {
    self.expect("(")?;
    let tok = self.read_token("a function name")?;
    let name = match sigiled_name(&tok, ':') {
      Some(name) => name.to_string(),
      None => return self.error(&format!("bad function name '{}'", tok)),
    };
    let num_args = self.read_number()?;
    let mut func = Function::new(&name, num_args);
    // Dumps of allocated code carry the local count as well.
    if let Some(locals) = self.try_read_number()? {
      func.num_locals = locals;
    }
    loop {
      let tok = self.read_token("an instruction or ')'")?;
      if tok == ")" {
        break;
      }
      let inst = self.inst(&mut func, tok)?;
      func.push(inst);
    }
    Ok(func)
  }

  fn program(&mut self) -> ParseResult<Program> {
    self.expect("(")?;
    let tok = self.read_token("the entry label")?;
    let entry = match sigiled_name(&tok, ':') {
      Some(name) => name,
      None => return self.error(&format!("bad entry label '{}'", tok)),
    };
    let mut prog = Program::new(entry);
    while self.peek_token() == Some("(") {
      prog.functions.push(self.function()?);
    }
    self.expect(")")?;
    if prog.functions.is_empty() {
      return self.error("a program needs at least one function");
    }
    Ok(prog)
  }

  fn finish(&mut self) -> ParseResult<()> {
    if self.is_done() {
      Ok(())
    } else {
      let tok = self.next_token().unwrap_or_default();
      self.error(&format!("unexpected '{}' after the end", tok))
    }
  }
}

pub fn parse_program(content: &str) -> ParseResult<Program> {
  let mut parser = Parser::new(content);
  let prog = parser.program()?;
  parser.finish()?;
  Ok(prog)
}

pub fn parse_function(content: &str) -> ParseResult<Function> {
  let mut parser = Parser::new(content);
  let func = parser.function()?;
  parser.finish()?;
  Ok(func)
}

pub fn parse_spill(content: &str) -> ParseResult<SpillRequest> {
  let mut parser = Parser::new(content);
  let func = parser.function()?;
  let mut names = Vec::new();
  for what in &["the variable to spill", "the spill prefix"] {
    let tok = parser.read_token(what)?;
    match sigiled_name(&tok, '%') {
      Some(name) => names.push(name.to_string()),
      None => return parser.error(&format!("expected {}, found '{}'", what, tok)),
    }
  }
  parser.finish()?;
  let prefix = names.pop().unwrap_or_default();
  let var = names.pop().unwrap_or_default();
  Ok(SpillRequest { func, var, prefix })
}

fn arith_op(tok: &str) -> ArithOp {
  match tok {
    "+=" => ArithOp::Add,
    "-=" => ArithOp::Sub,
    "*=" => ArithOp::Mul,
    "&=" => ArithOp::And,
    _ => panic!("arith_op: not an arithmetic operator: {}", tok),
  }
}

// `%name` or `:name`, with a well-formed name.
fn sigiled_name(tok: &str, sigil: char) -> Option<&str> {
  let name = tok.strip_prefix(sigil)?;
  let mut chars = name.chars();
  match chars.next() {
    Some(c) if is_alpha(c) && chars.all(is_name_char) => Some(name),
    _ => None,
  }
}

fn is_number(tok: &str) -> bool {
  let digits = tok.strip_prefix(|c: char| c == '-' || c == '+').unwrap_or(tok);
  !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_alpha(c: char) -> bool {
  c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
  is_alpha(c) || c.is_ascii_digit()
}
