/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Rewriting a variable into explicit stack traffic.

use log::{debug, trace};

use crate::data_structures::{InstIx, ItemIx, TypedIxVec};
use crate::ir::{Callee, Function, Inst, Operand};
use crate::machine::RegUniverse;

/// How one instruction touches a particular variable.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SpillUse {
  pub reads: bool,
  pub writes: bool,
}

impl SpillUse {
  const NONE: SpillUse = SpillUse { reads: false, writes: false };
}

// A destination that is exactly |var| is a write.  Any other destination
// that mentions it (as a memory base) is a read.
fn dst_use(dst: &Operand, var: ItemIx) -> SpillUse {
  if dst.as_item() == Some(var) {
    SpillUse { reads: false, writes: true }
  } else {
    SpillUse { reads: dst.mentions(var), writes: false }
  }
}

pub fn spill_use(inst: &Inst, var: ItemIx) -> SpillUse {
  match inst {
    Inst::Return { value: Some(v) } => {
      SpillUse { reads: v.mentions(var), writes: false }
    }
    Inst::Return { value: None }
    | Inst::Label { .. }
    | Inst::Goto { .. }
    | Inst::Call { callee: Callee::Runtime(_), .. } => SpillUse::NONE,
    Inst::Assign { dst, src } => {
      let d = dst_use(dst, var);
      SpillUse { reads: d.reads || src.mentions(var), writes: d.writes }
    }
    Inst::Lea { dst, base, index, .. } => {
      let d = dst_use(dst, var);
      SpillUse {
        reads: d.reads || base.mentions(var) || index.mentions(var),
        writes: d.writes,
      }
    }
    // The destination of these is also an input.
    Inst::Arith { dst, src: other, .. }
    | Inst::Shift { dst, amount: other, .. } => SpillUse {
      reads: dst.mentions(var) || other.mentions(var),
      writes: dst.as_item() == Some(var),
    },
    Inst::Inc { dst } | Inst::Dec { dst } => SpillUse {
      reads: dst.mentions(var),
      writes: dst.as_item() == Some(var),
    },
    Inst::CJump { cond, .. } => SpillUse {
      reads: cond.lhs.mentions(var) || cond.rhs.mentions(var),
      writes: false,
    },
    Inst::Call { callee: Callee::User(op), .. } => {
      SpillUse { reads: op.mentions(var), writes: false }
    }
  }
}

/// Move `var` into a fresh stack slot.  Every instruction touching it is
/// rewritten to use a new temporary named `prefix` followed by a counter,
/// loaded from the slot just before and/or stored to it just after.
/// Returns the temporaries, in order of creation.
#[inline(never)]
pub fn spill_variable(
  func: &mut Function, var: ItemIx, prefix: &str, univ: &RegUniverse,
) -> Vec<ItemIx> {
  if !func.is_var(var) {
    panic!("spill_variable: {:?} is not a variable of '{}'", var, func.name);
  }

  let slot = Operand::Mem {
    base: func.reg(univ.stack_ptr),
    offset: func.num_locals * univ.word_size,
  };
  func.num_locals += 1;
  debug!(
    "spill_variable: {} -> {} in '{}'",
    func.item_name(var),
    func.show_operand(&slot),
    func.name
  );

  let old_insns = std::mem::replace(&mut func.insns, TypedIxVec::new());
  let mut new_insns = TypedIxVec::<InstIx, Inst>::new();
  let mut temps = Vec::<ItemIx>::new();

  for inst in old_insns.into_vec() {
    let u = spill_use(&inst, var);
    if !u.reads && !u.writes {
      debug_assert!(!inst.mentions(var));
      new_insns.push(inst);
      continue;
    }

    // One temporary serves both the read and the write of a single
    // instruction.
    let tmp = func.fresh_var(format!("{}{}", prefix, temps.len()));
    temps.push(tmp);
    if u.reads {
      new_insns.push(Inst::Assign { dst: Operand::Item(tmp), src: slot.clone() });
    }
    new_insns.push(inst.map_items(&|ix| if ix == var { tmp } else { ix }));
    if u.writes {
      new_insns.push(Inst::Assign { dst: slot.clone(), src: Operand::Item(tmp) });
    }
    trace!(
      "spill_variable:   {} (reads {}, writes {})",
      func.item_name(tmp),
      u.reads,
      u.writes
    );
  }

  func.insns = new_insns;
  temps
}
