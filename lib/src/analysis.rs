/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

use log::{debug, trace};
use smallvec::SmallVec;
use std::fmt::Write;

use crate::data_structures::{InstIx, ItemIx, Map, Set, TypedIxVec};
use crate::ir::{Callee, Function, Inst, Operand};
use crate::machine::RegUniverse;

#[derive(Clone, Debug, PartialEq)]
pub enum AnalysisError {
  /// A goto or cjump names a label that never appears as an instruction.
  UndefinedLabel(String),

  /// The same label appears as an instruction more than once.
  DuplicateLabel(String),

  /// An operand refers to an item that isn't registered in the function.
  UnregisteredItem { inst: InstIx, item: ItemIx },
}

impl ToString for AnalysisError {
  fn to_string(&self) -> String {
    match self {
      AnalysisError::UndefinedLabel(name) => {
        format!("jump to undefined label '{}'", name)
      }
      AnalysisError::DuplicateLabel(name) => {
        format!("label '{}' is defined more than once", name)
      }
      AnalysisError::UnregisteredItem { inst, item } => {
        format!("instruction {:?} mentions unregistered item {:?}", inst, item)
      }
    }
  }
}

/// One set of items per instruction.
pub type LiveSet = TypedIxVec<InstIx, Set<ItemIx>>;

/// Control successors of each instruction.  There are never more than two.
pub type SuccMap = TypedIxVec<InstIx, SmallVec<[InstIx; 2]>>;

//=============================================================================
// Successor resolution

#[inline(never)]
pub fn calc_successors(func: &Function) -> Result<SuccMap, AnalysisError> {
  let nInsns = func.insns.len();

  // Where each label is defined.
  let mut label_map = Map::<ItemIx, InstIx>::default();
  for iix in func.insns.range() {
    if let Inst::Label { label } = &func.insns[iix] {
      if label_map.insert(*label, iix).is_some() {
        return Err(AnalysisError::DuplicateLabel(func.item_name(*label)));
      }
    }
  }

  // Control goes to the instruction following the label.  A label at the
  // very end leads nowhere.
  let resolve = |target: ItemIx| -> Result<Option<InstIx>, AnalysisError> {
    match label_map.get(&target) {
      Some(iix) if iix.get() + 1 < nInsns => Ok(Some(iix.plus(1))),
      Some(_) => Ok(None),
      None => Err(AnalysisError::UndefinedLabel(func.item_name(target))),
    }
  };

  let mut succ_map = SuccMap::new();
  for iix in func.insns.range() {
    let next = if iix.get() + 1 < nInsns { Some(iix.plus(1)) } else { None };
    let mut succs = SmallVec::<[InstIx; 2]>::new();
    match &func.insns[iix] {
      Inst::Return { .. } => {}
      Inst::Goto { target } => succs.extend(resolve(*target)?),
      Inst::CJump { target, .. } => {
        succs.extend(next);
        if let Some(t) = resolve(*target)? {
          if !succs.contains(&t) {
            succs.push(t);
          }
        }
      }
      Inst::Call { callee: Callee::Runtime(rt), .. } if rt.never_returns() => {}
      _ => succs.extend(next),
    }
    succ_map.push(succs);
  }

  debug_assert!(succ_map.len() == nInsns);
  Ok(succ_map)
}

//=============================================================================
// GEN and KILL

// Does this item take part in liveness?  Labels don't, nor does the stack
// pointer.
#[inline(always)]
fn is_tracked(func: &Function, univ: &RegUniverse, ix: ItemIx) -> bool {
  match func.phys_reg(ix) {
    Some(r) => r != univ.stack_ptr,
    None => func.is_var(ix),
  }
}

fn add_operand(
  func: &Function, univ: &RegUniverse, op: &Operand, set: &mut Set<ItemIx>,
) {
  op.for_each_item(&mut |ix| {
    if is_tracked(func, univ, ix) {
      set.insert(ix);
    }
  });
}

// Only a bare register or variable is killed by being written.  Writing
// through a memory reference kills nothing.
fn add_written(
  func: &Function, univ: &RegUniverse, op: &Operand, set: &mut Set<ItemIx>,
) {
  if let Operand::Item(ix) = op {
    if is_tracked(func, univ, *ix) {
      set.insert(*ix);
    }
  }
}

/// Compute the items read (GEN) and written (KILL) by a single instruction.
pub fn get_gen_kill_for_inst(
  func: &Function, univ: &RegUniverse, inst: &Inst,
) -> (Set<ItemIx>, Set<ItemIx>) {
  let mut gen = Set::<ItemIx>::empty();
  let mut kill = Set::<ItemIx>::empty();
  match inst {
    Inst::Return { value: None } => {
      gen.insert(func.reg(univ.return_reg));
      for r in &univ.callee_saved {
        gen.insert(func.reg(*r));
      }
    }
    Inst::Return { value: Some(v) } => add_operand(func, univ, v, &mut gen),
    Inst::Label { .. } | Inst::Goto { .. } => {}
    Inst::Assign { dst, src } => {
      add_operand(func, univ, src, &mut gen);
      if dst.is_mem() {
        add_operand(func, univ, dst, &mut gen);
      }
      add_written(func, univ, dst, &mut kill);
    }
    Inst::Arith { dst, src, .. } => {
      add_operand(func, univ, dst, &mut gen);
      add_operand(func, univ, src, &mut gen);
      add_written(func, univ, dst, &mut kill);
    }
    Inst::Shift { dst, amount, .. } => {
      add_operand(func, univ, dst, &mut gen);
      add_operand(func, univ, amount, &mut gen);
      add_written(func, univ, dst, &mut kill);
    }
    Inst::Lea { dst, base, index, .. } => {
      add_operand(func, univ, base, &mut gen);
      add_operand(func, univ, index, &mut gen);
      add_written(func, univ, dst, &mut kill);
    }
    Inst::Inc { dst } | Inst::Dec { dst } => {
      add_operand(func, univ, dst, &mut gen);
      add_written(func, univ, dst, &mut kill);
    }
    Inst::CJump { cond, .. } => {
      add_operand(func, univ, &cond.lhs, &mut gen);
      add_operand(func, univ, &cond.rhs, &mut gen);
    }
    Inst::Call { callee, num_args } => {
      if let Callee::User(op) = callee {
        add_operand(func, univ, op, &mut gen);
      }
      for r in univ.arg_regs_for(*num_args) {
        gen.insert(func.reg(*r));
      }
      for r in &univ.caller_saved {
        kill.insert(func.reg(*r));
      }
    }
  }
  (gen, kill)
}

#[inline(never)]
pub fn get_gen_kill(
  func: &Function, univ: &RegUniverse,
) -> Result<(LiveSet, LiveSet), AnalysisError> {
  let nItems = func.num_items();
  let mut gen_map = LiveSet::new();
  let mut kill_map = LiveSet::new();
  for iix in func.insns.range() {
    let inst = &func.insns[iix];
    let mut bad = None;
    inst.for_each_item(&mut |ix| {
      if ix.get() >= nItems {
        bad = Some(ix);
      }
    });
    if let Some(item) = bad {
      return Err(AnalysisError::UnregisteredItem { inst: iix, item });
    }
    let (gen, kill) = get_gen_kill_for_inst(func, univ, inst);
    gen_map.push(gen);
    kill_map.push(kill);
  }
  Ok((gen_map, kill_map))
}

//=============================================================================
// Fixed point

// Performs one backwards pass over the instructions, refining |live_in| and
// |live_out| in place.  Returns whether any IN set changed.
#[inline(never)]
pub fn liveness_pass(
  succ_map: &SuccMap, gen_map: &LiveSet, kill_map: &LiveSet,
  live_in: &mut LiveSet, live_out: &mut LiveSet,
) -> bool {
  let mut changed = false;
  let nInsns = succ_map.len();
  for i in (0..nInsns).rev() {
    let iix = InstIx::new(i);
    let mut out = Set::<ItemIx>::empty();
    for succ in succ_map[iix].iter() {
      out.union(&live_in[*succ]);
    }
    let mut new_in = out.clone();
    new_in.remove(&kill_map[iix]);
    new_in.union(&gen_map[iix]);
    if !new_in.equals(&live_in[iix]) {
      changed = true;
      live_in[iix] = new_in;
    }
    live_out[iix] = out;
  }
  changed
}

/// The complete liveness picture of a function.
pub struct Liveness {
  pub succ_map: SuccMap,
  pub gen: LiveSet,
  pub kill: LiveSet,
  pub live_in: LiveSet,
  pub live_out: LiveSet,
  /// How many passes it took to converge, counting the final one that
  /// changed nothing.
  pub passes: u32,
}

#[inline(never)]
pub fn run_liveness(
  func: &Function, univ: &RegUniverse,
) -> Result<Liveness, AnalysisError> {
  debug!("run_liveness: begin, {} insns", func.insns.len());
  let succ_map = calc_successors(func)?;
  let (gen, kill) = get_gen_kill(func, univ)?;

  let nInsns = func.insns.len();
  let mut live_in = LiveSet::new();
  let mut live_out = LiveSet::new();
  live_in.resize(nInsns, Set::empty());
  live_out.resize(nInsns, Set::empty());

  let mut passes = 0;
  loop {
    passes += 1;
    let changed =
      liveness_pass(&succ_map, &gen, &kill, &mut live_in, &mut live_out);
    trace!("run_liveness:   pass {}, changed = {}", passes, changed);
    if !changed {
      break;
    }
  }
  debug!("run_liveness: end, {} passes", passes);

  Ok(Liveness { succ_map, gen, kill, live_in, live_out, passes })
}

impl Liveness {
  /// Run one more pass over the already-solved sets.  Returns whether
  /// anything changed, which for a converged solution is never.
  pub fn repass(&mut self) -> bool {
    liveness_pass(
      &self.succ_map,
      &self.gen,
      &self.kill,
      &mut self.live_in,
      &mut self.live_out,
    )
  }

  /// Textual dump: the IN sets then the OUT sets, one parenthesised line
  /// per instruction, items sorted by name.
  pub fn render(&self, func: &Function) -> String {
    let line = |set: &Set<ItemIx>| -> String {
      let mut names: Vec<String> =
        set.iter().map(|ix| func.item_name(*ix)).collect();
      names.sort();
      format!("({})\n", names.join(" "))
    };
    let mut s = String::new();
    s.push_str("(\n(in\n");
    for set in self.live_in.iter() {
      s.push_str(&line(set));
    }
    s.push_str(")\n\n(out\n");
    for set in self.live_out.iter() {
      s.push_str(&line(set));
    }
    let _ = write!(s, ")\n\n)\n");
    s
  }
}
