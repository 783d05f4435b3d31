/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

// Helpers for building small functions in unit tests without going through
// the text front end.

use crate::data_structures::{InstIx, ItemIx};
use crate::ir::{
  ArithOp, Callee, CmpOp, Comparison, Function, Inst, Operand, ShiftOp,
};
use crate::machine::{PhysReg, RuntimeFn};

pub struct Builder {
  pub f: Function,
}

impl Builder {
  pub fn new(name: &str, num_args: i64) -> Self {
    let _ = pretty_env_logger::try_init();
    Builder { f: Function::new(name, num_args) }
  }

  pub fn var(&mut self, name: &str) -> Operand {
    Operand::Item(self.f.declare_var(name))
  }

  pub fn var_ix(&mut self, name: &str) -> ItemIx {
    self.f.declare_var(name)
  }

  pub fn reg(&self, r: PhysReg) -> Operand {
    Operand::Item(self.f.reg(r))
  }

  pub fn mem(&self, base: &Operand, offset: i64) -> Operand {
    let base = base.as_item().expect("mem base must be a register or variable");
    Operand::Mem { base, offset }
  }

  pub fn cmp(&self, lhs: Operand, op: CmpOp, rhs: Operand) -> Comparison {
    Comparison { op, lhs, rhs }
  }

  pub fn assign(&mut self, dst: Operand, src: Operand) -> InstIx {
    self.f.push(Inst::Assign { dst, src })
  }

  pub fn arith(&mut self, dst: Operand, op: ArithOp, src: Operand) -> InstIx {
    self.f.push(Inst::Arith { op, dst, src })
  }

  pub fn shift(&mut self, dst: Operand, op: ShiftOp, amount: Operand) -> InstIx {
    self.f.push(Inst::Shift { op, dst, amount })
  }

  pub fn inc(&mut self, dst: Operand) -> InstIx {
    self.f.push(Inst::Inc { dst })
  }

  pub fn label(&mut self, name: &str) -> InstIx {
    let label = self.f.declare_label(name);
    self.f.push(Inst::Label { label })
  }

  pub fn goto(&mut self, name: &str) -> InstIx {
    let target = self.f.declare_label(name);
    self.f.push(Inst::Goto { target })
  }

  pub fn cjump(&mut self, cond: Comparison, name: &str) -> InstIx {
    let target = self.f.declare_label(name);
    self.f.push(Inst::CJump { cond, target })
  }

  pub fn call_rt(&mut self, rt: RuntimeFn, num_args: i64) -> InstIx {
    self.f.push(Inst::Call { callee: Callee::Runtime(rt), num_args })
  }

  pub fn call_user(&mut self, callee: Operand, num_args: i64) -> InstIx {
    self.f.push(Inst::Call { callee: Callee::User(callee), num_args })
  }

  pub fn ret(&mut self) -> InstIx {
    self.f.push(Inst::Return { value: None })
  }

  pub fn finish(self) -> Function {
    self.f
  }
}

pub fn c(n: i64) -> Operand {
  Operand::Const(n)
}
