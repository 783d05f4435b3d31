/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Checker: verifies the result of allocation.
//!
//! Two independent things are checked:
//!
//!   - the colouring: no edge of the interference graph joins two nodes of
//!     the same colour, and every variable that is a node got a colour;
//!
//!   - the rewritten function: no variable survives, and every shift whose
//!     amount is a register uses the shift count register, since that is
//!     the only form the target accepts.
//!
//! Neither check looks at whether spill code preserves values; the reference
//! interpreter in the test harness covers that.

use crate::coloring::Coloring;
use crate::data_structures::InstIx;
use crate::interference::InterferenceGraph;
use crate::ir::{Function, Inst, Operand};
use crate::machine::{PhysReg, RegUniverse};

#[derive(Clone, Debug, PartialEq)]
pub enum CheckerError {
  SameColor { a: String, b: String, reg: PhysReg },
  MissingColor { var: String },
  SurvivingVariable { inst: InstIx, var: String },
  BadShiftAmount { inst: InstIx, reg: PhysReg },
}

#[derive(Clone, Debug)]
pub struct CheckerErrors {
  pub errors: Vec<CheckerError>,
}

impl ToString for CheckerError {
  fn to_string(&self) -> String {
    match self {
      CheckerError::SameColor { a, b, reg } => {
        format!("{} and {} interfere but both got {}", a, b, reg)
      }
      CheckerError::MissingColor { var } => format!("{} got no colour", var),
      CheckerError::SurvivingVariable { inst, var } => {
        format!("{} survives allocation at {:?}", var, inst)
      }
      CheckerError::BadShiftAmount { inst, reg } => {
        format!("shift at {:?} takes its amount from {}, not rcx", inst, reg)
      }
    }
  }
}

impl ToString for CheckerErrors {
  fn to_string(&self) -> String {
    let msgs: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
    msgs.join("; ")
  }
}

impl CheckerErrors {
  fn into_result(self) -> Result<(), CheckerErrors> {
    if self.errors.is_empty() {
      Ok(())
    } else {
      Err(self)
    }
  }
}

pub fn check_coloring(
  graph: &InterferenceGraph, coloring: &Coloring, func: &Function,
  univ: &RegUniverse,
) -> Result<(), CheckerErrors> {
  let mut errors = Vec::new();
  for n in graph.nodes() {
    let cn = match coloring.color_of(n) {
      Some(c) => c,
      None => {
        if func.is_var(n) {
          errors.push(CheckerError::MissingColor { var: func.item_name(n) });
        }
        continue;
      }
    };
    for m in graph.neighbours(n).to_vec() {
      // Each edge once.
      if m < n {
        continue;
      }
      if coloring.color_of(m) == Some(cn) {
        errors.push(CheckerError::SameColor {
          a: func.item_name(n),
          b: func.item_name(m),
          reg: univ.reg_of(cn),
        });
      }
    }
  }
  CheckerErrors { errors }.into_result()
}

pub fn check_allocated(
  func: &Function, univ: &RegUniverse,
) -> Result<(), CheckerErrors> {
  let mut errors = Vec::new();
  for iix in func.insns.range() {
    let inst = &func.insns[iix];
    inst.for_each_item(&mut |ix| {
      if func.is_var(ix) {
        errors.push(CheckerError::SurvivingVariable {
          inst: iix,
          var: func.item_name(ix),
        });
      }
    });
    if let Inst::Shift { amount: Operand::Item(ix), .. } = inst {
      if let Some(reg) = func.phys_reg(*ix) {
        if reg != univ.shift_count_reg {
          errors.push(CheckerError::BadShiftAmount { inst: iix, reg });
        }
      }
    }
  }
  CheckerErrors { errors }.into_result()
}
