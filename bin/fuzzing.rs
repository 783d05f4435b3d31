/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Random well-formed L2 programs for the fuzz targets.
//!
//! Every generated program defines all of its variables up front, only
//! jumps forwards and touches memory only inside one array it allocates
//! itself, so it always terminates and never reads garbage.  That keeps
//! the before/after interpreter comparison meaningful.

use arbitrary::{Arbitrary, Result, Unstructured};

use l2regalloc::data_structures::ItemIx;
use l2regalloc::ir::{
  ArithOp, Callee, CmpOp, Comparison, Function, Inst, Operand, ShiftOp,
};
use l2regalloc::machine::{PhysReg, RuntimeFn};

use crate::test_framework::Program;

const MAX_VARS: u8 = 24;
const MAX_ARRAY_LEN: u8 = 8;
const MAX_BODY_INSTS: u8 = 64;
const MAX_JUMP_DISTANCE: u8 = 8;

struct FuzzingEnv {
  func: Function,
  vars: Vec<ItemIx>,
  array: ItemIx,
  array_len: i64,
  /// Forward jump targets not yet placed, with how many more emissions to
  /// wait before placing them.
  pending: Vec<(ItemIx, u8)>,
  num_labels: u32,
}

impl FuzzingEnv {
  fn var(&self, u: &mut Unstructured) -> Result<ItemIx> {
    Ok(self.vars[usize::arbitrary(u)? % self.vars.len()])
  }

  fn var_op(&self, u: &mut Unstructured) -> Result<Operand> {
    Ok(Operand::Item(self.var(u)?))
  }

  fn constant(&self, u: &mut Unstructured) -> Result<i64> {
    Ok(if u8::arbitrary(u)? % 8 == 0 {
      i64::arbitrary(u)?
    } else {
      i16::arbitrary(u)? as i64
    })
  }

  // A variable or a constant.
  fn t(&self, u: &mut Unstructured) -> Result<Operand> {
    Ok(if bool::arbitrary(u)? {
      self.var_op(u)?
    } else {
      Operand::Const(self.constant(u)?)
    })
  }

  fn cmp(&self, u: &mut Unstructured) -> Result<Comparison> {
    let op = match u8::arbitrary(u)? % 3 {
      0 => CmpOp::Lt,
      1 => CmpOp::Le,
      _ => CmpOp::Eq,
    };
    Ok(Comparison { op, lhs: self.t(u)?, rhs: self.t(u)? })
  }

  // An element of the array, always in bounds.
  fn element(&self, u: &mut Unstructured) -> Result<Operand> {
    let k = i64::from(u8::arbitrary(u)?) % self.array_len;
    Ok(Operand::Mem { base: self.array, offset: 8 * (k + 1) })
  }

  fn new_label(&mut self, prefix: &str) -> ItemIx {
    let name = format!("{}{}", prefix, self.num_labels);
    self.num_labels += 1;
    self.func.declare_label(&name)
  }

  fn push(&mut self, inst: Inst) {
    self.func.push(inst);
  }

  fn reg(&self, r: PhysReg) -> Operand {
    Operand::Item(self.func.reg(r))
  }

  fn print(&mut self, value: Operand) {
    let rdi = self.reg(PhysReg::Rdi);
    self.push(Inst::Assign { dst: rdi.clone(), src: value });
    self.push(Inst::Shift {
      op: ShiftOp::Left,
      dst: rdi.clone(),
      amount: Operand::Const(1),
    });
    self.push(Inst::Inc { dst: rdi });
    self.push(Inst::Call { callee: Callee::Runtime(RuntimeFn::Print), num_args: 1 });
  }

  fn call_helper(&mut self, u: &mut Unstructured) -> Result<()> {
    let a = self.t(u)?;
    let b = self.t(u)?;
    let dst = self.var_op(u)?;
    let helper = self.func.declare_label("helper");
    let ret = self.new_label("ret");
    let rsp = self.func.reg(PhysReg::Rsp);
    let (rdi, rsi, rax) =
      (self.reg(PhysReg::Rdi), self.reg(PhysReg::Rsi), self.reg(PhysReg::Rax));

    self.push(Inst::Assign { dst: rdi, src: a });
    self.push(Inst::Assign { dst: rsi, src: b });
    self.push(Inst::Assign {
      dst: Operand::Mem { base: rsp, offset: -8 },
      src: Operand::Item(ret),
    });
    self.push(Inst::Call {
      callee: Callee::User(Operand::Item(helper)),
      num_args: 2,
    });
    self.push(Inst::Label { label: ret });
    self.push(Inst::Assign { dst, src: rax });
    Ok(())
  }

  /// Emit one instruction, or a short canned sequence for prints and calls.
  fn emit(&mut self, u: &mut Unstructured) -> Result<()> {
    const NUM_VARIANTS: u8 = 15;

    match u8::arbitrary(u)? % NUM_VARIANTS {
      0 => {
        let dst = self.var_op(u)?;
        let src = Operand::Const(self.constant(u)?);
        self.push(Inst::Assign { dst, src });
      }
      1 => {
        let dst = self.var_op(u)?;
        let src = self.var_op(u)?;
        self.push(Inst::Assign { dst, src });
      }
      2 => {
        let op = match u8::arbitrary(u)? % 4 {
          0 => ArithOp::Add,
          1 => ArithOp::Sub,
          2 => ArithOp::Mul,
          _ => ArithOp::And,
        };
        let dst = self.var_op(u)?;
        let src = self.t(u)?;
        self.push(Inst::Arith { op, dst, src });
      }
      3 => {
        let op = if bool::arbitrary(u)? { ShiftOp::Left } else { ShiftOp::Right };
        let dst = self.var_op(u)?;
        let amount = if bool::arbitrary(u)? {
          self.var_op(u)?
        } else {
          Operand::Const(i64::from(u8::arbitrary(u)? % 64))
        };
        self.push(Inst::Shift { op, dst, amount });
      }
      4 => {
        let dst = self.var_op(u)?;
        let src = Operand::Cmp(Box::new(self.cmp(u)?));
        self.push(Inst::Assign { dst, src });
      }
      5 => {
        let scale = [1, 2, 4, 8][usize::arbitrary(u)? % 4];
        let dst = self.var_op(u)?;
        let base = self.var_op(u)?;
        let index = self.var_op(u)?;
        self.push(Inst::Lea { dst, base, index, scale });
      }
      6 => {
        let dst = self.var_op(u)?;
        if bool::arbitrary(u)? {
          self.push(Inst::Inc { dst });
        } else {
          self.push(Inst::Dec { dst });
        }
      }
      7 => {
        let dst = self.var_op(u)?;
        let src = self.element(u)?;
        self.push(Inst::Assign { dst, src });
      }
      8 => {
        let dst = self.element(u)?;
        let src = self.t(u)?;
        self.push(Inst::Assign { dst, src });
      }
      9 => {
        let op = if bool::arbitrary(u)? { ArithOp::Add } else { ArithOp::Sub };
        if bool::arbitrary(u)? {
          let dst = self.element(u)?;
          let src = self.t(u)?;
          self.push(Inst::Arith { op, dst, src });
        } else {
          let dst = self.var_op(u)?;
          let src = self.element(u)?;
          self.push(Inst::Arith { op, dst, src });
        }
      }
      10 => {
        let v = self.var_op(u)?;
        self.print(v);
      }
      11 => self.call_helper(u)?,
      12 | 13 => {
        let target = self.new_label("l");
        let distance = 1 + u8::arbitrary(u)? % MAX_JUMP_DISTANCE;
        if bool::arbitrary(u)? {
          let cond = self.cmp(u)?;
          self.push(Inst::CJump { cond, target });
        } else {
          self.push(Inst::Goto { target });
        }
        self.pending.push((target, distance));
      }
      14 => {
        let dst = self.var_op(u)?;
        let src = Operand::Item(self.array);
        self.push(Inst::Assign { dst, src });
      }
      x => {
        debug_assert!(x < NUM_VARIANTS, "update NUM_VARIANTS above");
        unreachable!()
      }
    }

    // Place the labels whose time has come.
    let mut due = Vec::new();
    for (label, wait) in self.pending.iter_mut() {
      *wait -= 1;
      if *wait == 0 {
        due.push(*label);
      }
    }
    self.pending.retain(|(_, wait)| *wait > 0);
    for label in due {
      self.push(Inst::Label { label });
    }
    Ok(())
  }
}

// (:helper 2  %p <- rdi  %p += rsi  rax <- %p  return)
fn helper() -> Function {
  let mut f = Function::new("helper", 2);
  let p = Operand::Item(f.declare_var("p"));
  let rdi = Operand::Item(f.reg(PhysReg::Rdi));
  let rsi = Operand::Item(f.reg(PhysReg::Rsi));
  let rax = Operand::Item(f.reg(PhysReg::Rax));
  f.push(Inst::Assign { dst: p.clone(), src: rdi });
  f.push(Inst::Arith { op: ArithOp::Add, dst: p.clone(), src: rsi });
  f.push(Inst::Assign { dst: rax, src: p });
  f.push(Inst::Return { value: None });
  f
}

impl<'a> Arbitrary<'a> for Program {
  fn arbitrary(u: &mut Unstructured<'a>) -> Result<Program> {
    let num_vars = 1 + u8::arbitrary(u)? % MAX_VARS;
    let array_len = 1 + u8::arbitrary(u)? % MAX_ARRAY_LEN;
    let num_insts = 1 + u8::arbitrary(u)? % MAX_BODY_INSTS;

    let mut func = Function::new("main", 0);
    let vars: Vec<ItemIx> =
      (0..num_vars).map(|i| func.declare_var(&format!("v{}", i))).collect();
    let array = func.declare_var("arr");
    let mut env = FuzzingEnv {
      func,
      vars,
      array,
      array_len: i64::from(array_len),
      pending: Vec::new(),
      num_labels: 0,
    };

    // Prologue: an array of encoded zeroes, then every variable.
    let rdi = env.reg(PhysReg::Rdi);
    let rsi = env.reg(PhysReg::Rsi);
    let rax = env.reg(PhysReg::Rax);
    env.push(Inst::Assign {
      dst: rdi,
      src: Operand::Const(2 * i64::from(array_len) + 1),
    });
    env.push(Inst::Assign { dst: rsi, src: Operand::Const(1) });
    env.push(Inst::Call {
      callee: Callee::Runtime(RuntimeFn::Allocate),
      num_args: 2,
    });
    env.push(Inst::Assign { dst: Operand::Item(array), src: rax.clone() });
    for i in 0..env.vars.len() {
      let dst = Operand::Item(env.vars[i]);
      let src = Operand::Const(env.constant(u)?);
      env.push(Inst::Assign { dst, src });
    }

    for _ in 0..num_insts {
      env.emit(u)?;
    }

    // Epilogue.
    for (label, _) in std::mem::replace(&mut env.pending, Vec::new()) {
      env.push(Inst::Label { label });
    }
    let last = env.var_op(u)?;
    env.print(last.clone());
    env.push(Inst::Assign { dst: rax, src: last });
    env.push(Inst::Return { value: None });

    let mut prog = Program::new("main");
    prog.functions.push(env.func);
    if prog.functions[0].lookup_label("helper").is_some() {
      prog.functions.push(helper());
    }
    Ok(prog)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_framework::{run_program, DEFAULT_STEP_BUDGET};
  use crate::validator::validate;
  use l2regalloc::machine::RegUniverse;

  // A cheap deterministic byte stream.
  fn bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut x = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..len)
      .map(|_| {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (x >> 33) as u8
      })
      .collect()
  }

  #[test]
  fn generated_programs_are_valid_and_terminate() {
    let _ = pretty_env_logger::try_init();
    let univ = RegUniverse::x86_64();
    for seed in 0..64 {
      let data = bytes(seed, 4096);
      let mut u = Unstructured::new(&data);
      let prog = match Program::arbitrary(&mut u) {
        Ok(p) => p,
        Err(_) => continue,
      };
      assert_eq!(validate(&prog, &univ), Ok(()), "seed {}:\n{}", seed, prog);
      let result = run_program(&prog, &univ, &[], DEFAULT_STEP_BUDGET);
      assert!(result.outcome.is_ok(), "seed {}: {:?}\n{}", seed, result.outcome, prog);
      assert!(!result.output.is_empty());
    }
  }
}
