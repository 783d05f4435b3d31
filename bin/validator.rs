/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Structural checks on a program before it is handed to the allocator.
//! The parser already rejects most of these; programs built in memory (by
//! the fuzzer, say) have no such guarantee.

use rustc_hash::FxHashSet;

use l2regalloc::analysis::calc_successors;
use l2regalloc::data_structures::ItemIx;
use l2regalloc::ir::{Callee, Function, Inst, Item, Operand};
use l2regalloc::machine::RegUniverse;

use crate::test_framework::Program;

struct Context<'a> {
  func: &'a Function,
  univ: &'a RegUniverse,
  functions: &'a FxHashSet<&'a str>,
}

impl<'a> Context<'a> {
  fn is_item(&self, ix: ItemIx) -> bool {
    ix.get() < self.func.num_items()
  }

  // A register other than the stack pointer, or a variable.
  fn is_w(&self, op: &Operand) -> bool {
    match op {
      Operand::Item(ix) if self.is_item(*ix) => match self.func.item(*ix) {
        Item::Reg(r) => *r != self.univ.stack_ptr,
        Item::Var(_) => true,
        Item::Label(_) => false,
      },
      _ => false,
    }
  }

  fn is_x(&self, ix: ItemIx) -> bool {
    self.is_item(ix) && !self.func.is_label(ix)
  }

  fn is_t(&self, op: &Operand) -> bool {
    match op {
      Operand::Item(ix) => self.is_x(*ix),
      Operand::Const(_) => true,
      _ => false,
    }
  }

  fn is_s(&self, op: &Operand) -> bool {
    match op {
      Operand::Item(ix) => self.is_item(*ix),
      _ => self.is_t(op),
    }
  }

  fn is_mem(&self, op: &Operand) -> bool {
    match op {
      Operand::Mem { base, .. } => self.is_x(*base),
      _ => false,
    }
  }

  fn is_cmp(&self, op: &Operand) -> bool {
    match op {
      Operand::Cmp(cmp) => self.is_t(&cmp.lhs) && self.is_t(&cmp.rhs),
      _ => false,
    }
  }

  fn callee_ok(&self, op: &Operand) -> bool {
    match op {
      Operand::Item(ix) if self.is_item(*ix) => match self.func.item(*ix) {
        Item::Label(name) => self.functions.contains(name.as_str()),
        _ => self.is_w(op),
      },
      _ => false,
    }
  }

  fn inst_ok(&self, inst: &Inst) -> bool {
    match inst {
      Inst::Return { value } => value.as_ref().map_or(true, |v| self.is_t(v)),
      Inst::Label { label } => self.is_item(*label) && self.func.is_label(*label),
      Inst::Assign { dst, src } => {
        if self.is_mem(dst) {
          self.is_s(src) && !self.is_mem(src)
        } else {
          self.is_w(dst)
            && (self.is_s(src)
              || self.is_mem(src)
              || self.is_cmp(src)
              || matches!(src, Operand::StackArg(_)))
        }
      }
      Inst::Arith { dst, src, .. } => {
        (self.is_w(dst) && (self.is_t(src) || self.is_mem(src)))
          || (self.is_mem(dst) && self.is_t(src))
      }
      Inst::Shift { dst, amount, .. } => {
        self.is_w(dst)
          && match amount {
            Operand::Const(_) => true,
            Operand::Item(ix) => {
              self.is_item(*ix)
                && (self.func.is_var(*ix)
                  || self.func.phys_reg(*ix) == Some(self.univ.shift_count_reg))
            }
            _ => false,
          }
      }
      Inst::Lea { dst, base, index, scale } => {
        self.is_w(dst)
          && self.is_w(base)
          && self.is_w(index)
          && [1, 2, 4, 8].contains(scale)
      }
      Inst::Goto { target } => self.is_item(*target) && self.func.is_label(*target),
      Inst::CJump { cond, target } => {
        self.is_t(&cond.lhs)
          && self.is_t(&cond.rhs)
          && self.is_item(*target)
          && self.func.is_label(*target)
      }
      Inst::Inc { dst } | Inst::Dec { dst } => self.is_w(dst),
      Inst::Call { callee, num_args } => {
        *num_args >= 0
          && match callee {
            Callee::Runtime(_) => true,
            Callee::User(op) => self.callee_ok(op),
          }
      }
    }
  }
}

pub fn validate(prog: &Program, univ: &RegUniverse) -> Result<(), String> {
  if prog.functions.is_empty() {
    return Err("program has no functions".into());
  }
  if prog.find(&prog.entry).is_none() {
    return Err(format!("entry function ':{}' is not defined", prog.entry));
  }

  let mut functions = FxHashSet::default();
  for func in &prog.functions {
    if !functions.insert(func.name.as_str()) {
      return Err(format!("function ':{}' is defined twice", func.name));
    }
  }

  for func in &prog.functions {
    if func.num_args < 0 || func.num_locals < 0 {
      return Err(format!("function ':{}' has a negative count", func.name));
    }
    let cx = Context { func, univ, functions: &functions };
    for iix in func.insns.range() {
      let inst = &func.insns[iix];
      if !cx.inst_ok(inst) {
        return Err(format!(
          "inst {:?} `{}` in ':{}' is malformed",
          iix,
          func.show_inst(inst),
          func.name
        ));
      }
    }
    // Every jump target is defined exactly once.
    calc_successors(func)
      .map_err(|e| format!("in ':{}': {}", func.name, e.to_string()))?;
  }

  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::parser::parse_program;
  use l2regalloc::machine::PhysReg;

  #[test]
  fn accepts_parsed_programs() {
    let prog = parse_program(
      "(:main
        (:main 0 mem rsp -8 <- :r call :f 0 :r rax <- 1 return)
        (:f 0 %x <- 2 %x <<= %x return))",
    )
    .unwrap();
    assert_eq!(validate(&prog, &RegUniverse::x86_64()), Ok(()));
  }

  #[test]
  fn rejects_bad_programs() {
    let univ = RegUniverse::x86_64();

    let prog = parse_program("(:main (:f 0 return))").unwrap();
    assert!(validate(&prog, &univ).unwrap_err().contains("entry"));

    let prog = parse_program("(:main (:main 0 return) (:main 0 return))").unwrap();
    assert!(validate(&prog, &univ).unwrap_err().contains("twice"));

    let prog = parse_program("(:main (:main 0 call :nowhere 0 return))").unwrap();
    assert!(validate(&prog, &univ).unwrap_err().contains("malformed"));

    let prog = parse_program("(:main (:main 0 goto :l return))").unwrap();
    assert!(validate(&prog, &univ).unwrap_err().contains("undefined label"));

    // Something only an in-memory builder can produce.
    let mut prog = parse_program("(:main (:main 0 return))").unwrap();
    let f = &mut prog.functions[0];
    let rdx = f.reg(PhysReg::Rdx);
    let rax = f.reg(PhysReg::Rax);
    f.insns[l2regalloc::data_structures::InstIx::new(0)] = Inst::Shift {
      op: l2regalloc::ir::ShiftOp::Left,
      dst: Operand::Item(rax),
      amount: Operand::Item(rdx),
    };
    assert!(validate(&prog, &univ).is_err());
  }
}
