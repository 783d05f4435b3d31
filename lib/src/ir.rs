/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The L2 intermediate representation as seen by the allocator.
//!
//! Registers, variables and labels live in a per-function arena of `Item`s
//! and are referred to everywhere by `ItemIx` handle.  There is exactly one
//! item per name, so comparing handles is the same as comparing the things
//! they name.  Constants, memory references, comparisons and stack arguments
//! are plain values carried inline in `Operand`.

use std::fmt;

use crate::data_structures::{InstIx, ItemIx, Map, TypedIxVec};
use crate::machine::{PhysReg, RuntimeFn, NUM_PHYS_REGS};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Items

#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Item {
  Reg(PhysReg),
  Var(String),
  Label(String),
}

//=============================================================================
// Operands

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum CmpOp {
  Lt,
  Le,
  Eq,
}

impl CmpOp {
  pub fn name(self) -> &'static str {
    match self {
      CmpOp::Lt => "<",
      CmpOp::Le => "<=",
      CmpOp::Eq => "=",
    }
  }
  pub fn eval(self, a: i64, b: i64) -> bool {
    match self {
      CmpOp::Lt => a < b,
      CmpOp::Le => a <= b,
      CmpOp::Eq => a == b,
    }
  }
}

#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Comparison {
  pub op: CmpOp,
  pub lhs: Operand,
  pub rhs: Operand,
}

#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Operand {
  /// A register, variable or label.
  Item(ItemIx),
  Const(i64),
  /// `mem base offset`
  Mem { base: ItemIx, offset: i64 },
  Cmp(Box<Comparison>),
  /// `stack-arg offset`: an incoming argument passed on the stack.
  StackArg(i64),
}

impl Operand {
  pub fn as_item(&self) -> Option<ItemIx> {
    match self {
      Operand::Item(ix) => Some(*ix),
      _ => None,
    }
  }

  pub fn is_mem(&self) -> bool {
    match self {
      Operand::Mem { .. } => true,
      _ => false,
    }
  }

  /// Visit every item handle in this operand, looking through memory
  /// references and comparisons.
  pub fn for_each_item<F: FnMut(ItemIx)>(&self, f: &mut F) {
    match self {
      Operand::Item(ix) => f(*ix),
      Operand::Mem { base, .. } => f(*base),
      Operand::Cmp(cmp) => {
        cmp.lhs.for_each_item(f);
        cmp.rhs.for_each_item(f);
      }
      Operand::Const(_) | Operand::StackArg(_) => {}
    }
  }

  pub fn mentions(&self, target: ItemIx) -> bool {
    let mut found = false;
    self.for_each_item(&mut |ix| found |= ix == target);
    found
  }

  /// Rebuild this operand with every item handle passed through `f`.
  pub fn map_items<F: Fn(ItemIx) -> ItemIx>(&self, f: &F) -> Operand {
    match self {
      Operand::Item(ix) => Operand::Item(f(*ix)),
      Operand::Mem { base, offset } => {
        Operand::Mem { base: f(*base), offset: *offset }
      }
      Operand::Cmp(cmp) => Operand::Cmp(Box::new(cmp.map_items(f))),
      Operand::Const(_) | Operand::StackArg(_) => self.clone(),
    }
  }
}

impl Comparison {
  pub fn map_items<F: Fn(ItemIx) -> ItemIx>(&self, f: &F) -> Comparison {
    Comparison {
      op: self.op,
      lhs: self.lhs.map_items(f),
      rhs: self.rhs.map_items(f),
    }
  }

  pub fn for_each_item<F: FnMut(ItemIx)>(&self, f: &mut F) {
    self.lhs.for_each_item(f);
    self.rhs.for_each_item(f);
  }
}

//=============================================================================
// Instructions

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ArithOp {
  Add,
  Sub,
  Mul,
  And,
}

impl ArithOp {
  pub fn name(self) -> &'static str {
    match self {
      ArithOp::Add => "+=",
      ArithOp::Sub => "-=",
      ArithOp::Mul => "*=",
      ArithOp::And => "&=",
    }
  }
  pub fn eval(self, a: i64, b: i64) -> i64 {
    match self {
      ArithOp::Add => a.wrapping_add(b),
      ArithOp::Sub => a.wrapping_sub(b),
      ArithOp::Mul => a.wrapping_mul(b),
      ArithOp::And => a & b,
    }
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ShiftOp {
  Left,
  Right,
}

impl ShiftOp {
  pub fn name(self) -> &'static str {
    match self {
      ShiftOp::Left => "<<=",
      ShiftOp::Right => ">>=",
    }
  }
  pub fn eval(self, a: i64, amount: i64) -> i64 {
    let amount = (amount & 63) as u32;
    match self {
      ShiftOp::Left => a.wrapping_shl(amount),
      ShiftOp::Right => a.wrapping_shr(amount),
    }
  }
}

#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Callee {
  Runtime(RuntimeFn),
  /// A label, or a register/variable holding one.
  User(Operand),
}

#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Inst {
  /// Without a value the result is whatever is in the return register.
  Return { value: Option<Operand> },
  Label { label: ItemIx },
  Assign { dst: Operand, src: Operand },
  /// `dst` is both read and written.
  Arith { op: ArithOp, dst: Operand, src: Operand },
  Shift { op: ShiftOp, dst: Operand, amount: Operand },
  /// `dst @ base index scale`, i.e. dst = base + index * scale.
  Lea { dst: Operand, base: Operand, index: Operand, scale: i64 },
  Goto { target: ItemIx },
  /// Jumps to `target` if `cond` holds, otherwise falls through.
  CJump { cond: Comparison, target: ItemIx },
  Inc { dst: Operand },
  Dec { dst: Operand },
  Call { callee: Callee, num_args: i64 },
}

impl Inst {
  /// Visit every item handle mentioned anywhere in this instruction,
  /// including label operands.
  pub fn for_each_item<F: FnMut(ItemIx)>(&self, f: &mut F) {
    match self {
      Inst::Return { value } => {
        if let Some(v) = value {
          v.for_each_item(f);
        }
      }
      Inst::Label { label } => f(*label),
      Inst::Assign { dst, src } | Inst::Arith { dst, src, .. } => {
        dst.for_each_item(f);
        src.for_each_item(f);
      }
      Inst::Shift { dst, amount, .. } => {
        dst.for_each_item(f);
        amount.for_each_item(f);
      }
      Inst::Lea { dst, base, index, .. } => {
        dst.for_each_item(f);
        base.for_each_item(f);
        index.for_each_item(f);
      }
      Inst::Goto { target } => f(*target),
      Inst::CJump { cond, target } => {
        cond.for_each_item(f);
        f(*target);
      }
      Inst::Inc { dst } | Inst::Dec { dst } => dst.for_each_item(f),
      Inst::Call { callee, .. } => {
        if let Callee::User(op) = callee {
          op.for_each_item(f);
        }
      }
    }
  }

  pub fn mentions(&self, target: ItemIx) -> bool {
    let mut found = false;
    self.for_each_item(&mut |ix| found |= ix == target);
    found
  }

  /// Rebuild this instruction with every item handle passed through `f`.
  /// Label targets of jumps are left alone.
  pub fn map_items<F: Fn(ItemIx) -> ItemIx>(&self, f: &F) -> Inst {
    match self {
      Inst::Return { value } => {
        Inst::Return { value: value.as_ref().map(|v| v.map_items(f)) }
      }
      Inst::Label { label } => Inst::Label { label: *label },
      Inst::Assign { dst, src } => {
        Inst::Assign { dst: dst.map_items(f), src: src.map_items(f) }
      }
      Inst::Arith { op, dst, src } => Inst::Arith {
        op: *op,
        dst: dst.map_items(f),
        src: src.map_items(f),
      },
      Inst::Shift { op, dst, amount } => Inst::Shift {
        op: *op,
        dst: dst.map_items(f),
        amount: amount.map_items(f),
      },
      Inst::Lea { dst, base, index, scale } => Inst::Lea {
        dst: dst.map_items(f),
        base: base.map_items(f),
        index: index.map_items(f),
        scale: *scale,
      },
      Inst::Goto { target } => Inst::Goto { target: *target },
      Inst::CJump { cond, target } => {
        Inst::CJump { cond: cond.map_items(f), target: *target }
      }
      Inst::Inc { dst } => Inst::Inc { dst: dst.map_items(f) },
      Inst::Dec { dst } => Inst::Dec { dst: dst.map_items(f) },
      Inst::Call { callee, num_args } => Inst::Call {
        callee: match callee {
          Callee::Runtime(rt) => Callee::Runtime(*rt),
          Callee::User(op) => Callee::User(op.map_items(f)),
        },
        num_args: *num_args,
      },
    }
  }
}

//=============================================================================
// Functions

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Function {
  pub name: String,
  pub num_args: i64,
  /// Number of 8-byte stack slots the function needs; grows with spilling.
  pub num_locals: i64,
  pub insns: TypedIxVec<InstIx, Inst>,

  // The arena.  The first NUM_PHYS_REGS entries are the machine registers,
  // in PhysReg order.
  items: TypedIxVec<ItemIx, Item>,
  var_table: Map<String, ItemIx>,
  label_table: Map<String, ItemIx>,
}

impl Function {
  pub fn new(name: &str, num_args: i64) -> Self {
    let mut items = TypedIxVec::new();
    for r in PhysReg::ALL.iter() {
      items.push(Item::Reg(*r));
    }
    Function {
      name: name.to_string(),
      num_args,
      num_locals: 0,
      insns: TypedIxVec::new(),
      items,
      var_table: Map::default(),
      label_table: Map::default(),
    }
  }

  pub fn reg(&self, r: PhysReg) -> ItemIx {
    ItemIx::new(r.get_index() as u32)
  }

  /// Get the canonical item for variable `name`, creating it if needed.
  pub fn declare_var(&mut self, name: &str) -> ItemIx {
    if let Some(ix) = self.var_table.get(name) {
      return *ix;
    }
    let ix = self.items.push(Item::Var(name.to_string()));
    self.var_table.insert(name.to_string(), ix);
    ix
  }

  /// Create a variable that must not already exist.
  pub fn fresh_var(&mut self, name: String) -> ItemIx {
    if self.var_table.contains_key(&name) {
      panic!("Function::fresh_var: variable '%{}' already exists", name);
    }
    let ix = self.items.push(Item::Var(name.clone()));
    self.var_table.insert(name, ix);
    ix
  }

  pub fn lookup_var(&self, name: &str) -> Option<ItemIx> {
    self.var_table.get(name).copied()
  }

  pub fn declare_label(&mut self, name: &str) -> ItemIx {
    if let Some(ix) = self.label_table.get(name) {
      return *ix;
    }
    let ix = self.items.push(Item::Label(name.to_string()));
    self.label_table.insert(name.to_string(), ix);
    ix
  }

  pub fn lookup_label(&self, name: &str) -> Option<ItemIx> {
    self.label_table.get(name).copied()
  }

  pub fn item(&self, ix: ItemIx) -> &Item {
    &self.items[ix]
  }

  pub fn num_items(&self) -> u32 {
    self.items.len()
  }

  pub fn phys_reg(&self, ix: ItemIx) -> Option<PhysReg> {
    if (ix.get() as usize) < NUM_PHYS_REGS {
      Some(PhysReg::ALL[ix.get() as usize])
    } else {
      None
    }
  }

  pub fn is_var(&self, ix: ItemIx) -> bool {
    match self.items.get(ix) {
      Some(Item::Var(_)) => true,
      _ => false,
    }
  }

  pub fn is_label(&self, ix: ItemIx) -> bool {
    match self.items.get(ix) {
      Some(Item::Label(_)) => true,
      _ => false,
    }
  }

  /// Every declared variable, in creation order.
  pub fn variables(&self) -> Vec<ItemIx> {
    let mut vars: Vec<ItemIx> = self.var_table.values().copied().collect();
    vars.sort_unstable();
    vars
  }

  pub fn push(&mut self, inst: Inst) -> InstIx {
    self.insns.push(inst)
  }

  pub fn item_name(&self, ix: ItemIx) -> String {
    match self.item(ix) {
      Item::Reg(r) => r.name().to_string(),
      Item::Var(name) => format!("%{}", name),
      Item::Label(name) => format!(":{}", name),
    }
  }

  pub fn show_operand(&self, op: &Operand) -> String {
    match op {
      Operand::Item(ix) => self.item_name(*ix),
      Operand::Const(n) => n.to_string(),
      Operand::Mem { base, offset } => {
        format!("mem {} {}", self.item_name(*base), offset)
      }
      Operand::Cmp(cmp) => self.show_cmp(cmp),
      Operand::StackArg(offset) => format!("stack-arg {}", offset),
    }
  }

  fn show_cmp(&self, cmp: &Comparison) -> String {
    format!(
      "{} {} {}",
      self.show_operand(&cmp.lhs),
      cmp.op.name(),
      self.show_operand(&cmp.rhs)
    )
  }

  pub fn show_inst(&self, inst: &Inst) -> String {
    let o = |op: &Operand| self.show_operand(op);
    match inst {
      Inst::Return { value: None } => "return".to_string(),
      Inst::Return { value: Some(v) } => format!("return {}", o(v)),
      Inst::Label { label } => self.item_name(*label),
      Inst::Assign { dst, src } => format!("{} <- {}", o(dst), o(src)),
      Inst::Arith { op, dst, src } => {
        format!("{} {} {}", o(dst), op.name(), o(src))
      }
      Inst::Shift { op, dst, amount } => {
        format!("{} {} {}", o(dst), op.name(), o(amount))
      }
      Inst::Lea { dst, base, index, scale } => {
        format!("{} @ {} {} {}", o(dst), o(base), o(index), scale)
      }
      Inst::Goto { target } => format!("goto {}", self.item_name(*target)),
      Inst::CJump { cond, target } => {
        format!("cjump {} {}", self.show_cmp(cond), self.item_name(*target))
      }
      Inst::Inc { dst } => format!("{}++", o(dst)),
      Inst::Dec { dst } => format!("{}--", o(dst)),
      Inst::Call { callee: Callee::Runtime(rt), num_args } => {
        format!("call {} {}", rt.name(), num_args)
      }
      Inst::Call { callee: Callee::User(op), num_args } => {
        format!("call {} {}", o(op), num_args)
      }
    }
  }
}

impl fmt::Display for Function {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    writeln!(fmt, "(:{}", self.name)?;
    writeln!(fmt, "\t{} {}", self.num_args, self.num_locals)?;
    for inst in self.insns.iter() {
      writeln!(fmt, "\t{}", self.show_inst(inst))?;
    }
    writeln!(fmt, ")")
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn registers_have_fixed_handles() {
    let f = Function::new("f", 0);
    for r in PhysReg::ALL.iter() {
      let ix = f.reg(*r);
      assert_eq!(f.item(ix), &Item::Reg(*r));
      assert_eq!(f.phys_reg(ix), Some(*r));
    }
  }

  #[test]
  fn names_are_canonical() {
    let mut f = Function::new("f", 0);
    let a = f.declare_var("a");
    let b = f.declare_var("b");
    assert_ne!(a, b);
    assert_eq!(f.declare_var("a"), a);
    let l = f.declare_label("top");
    assert_eq!(f.declare_label("top"), l);
    assert!(f.is_var(a) && !f.is_var(l) && f.is_label(l));
    assert_eq!(f.phys_reg(a), None);
    assert_eq!(f.variables(), vec![a, b]);
  }

  #[test]
  #[should_panic]
  fn fresh_var_rejects_existing_name() {
    let mut f = Function::new("f", 0);
    f.declare_var("x");
    f.fresh_var("x".to_string());
  }

  #[test]
  fn map_items_looks_through_memory_and_comparisons() {
    let mut f = Function::new("f", 0);
    let x = f.declare_var("x");
    let y = f.declare_var("y");
    let rax = f.reg(PhysReg::Rax);
    let inst = Inst::Assign {
      dst: Operand::Mem { base: x, offset: 8 },
      src: Operand::Cmp(Box::new(Comparison {
        op: CmpOp::Lt,
        lhs: Operand::Item(x),
        rhs: Operand::Const(3),
      })),
    };
    assert!(inst.mentions(x));
    assert!(!inst.mentions(y));
    let mapped = inst.map_items(&|ix| if ix == x { rax } else { ix });
    assert!(!mapped.mentions(x));
    assert_eq!(f.show_inst(&mapped), "mem rax 8 <- rax < 3");
  }

  #[test]
  fn dump_format() {
    let mut f = Function::new("go", 1);
    let x = f.declare_var("x");
    let top = f.declare_label("top");
    f.push(Inst::Label { label: top });
    f.push(Inst::Assign { dst: Operand::Item(x), src: Operand::StackArg(0) });
    f.push(Inst::Inc { dst: Operand::Item(x) });
    f.push(Inst::Call { callee: Callee::Runtime(RuntimeFn::Print), num_args: 1 });
    f.push(Inst::Return { value: None });
    assert_eq!(
      f.to_string(),
      "(:go\n\t1 0\n\t:top\n\t%x <- stack-arg 0\n\t%x++\n\tcall print 1\n\treturn\n)\n"
    );
  }
}
