/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the L2 register allocator.
//!
//! Allocation of a function repeats analyse, colour and spill until every
//! variable has a register.  If a round leaves only spill temporaries
//! uncoloured there is nothing left worth spilling, and the allocator starts
//! again from the untouched function with every variable in memory.

// The individual stages are only public for the harness and the fuzzers.
#[cfg(feature = "fuzzing")]
pub mod analysis;
#[cfg(not(feature = "fuzzing"))]
mod analysis;
#[cfg(feature = "fuzzing")]
pub mod checker;
#[cfg(not(feature = "fuzzing"))]
mod checker;
#[cfg(feature = "fuzzing")]
pub mod coloring;
#[cfg(not(feature = "fuzzing"))]
mod coloring;
pub mod data_structures;
#[cfg(feature = "fuzzing")]
pub mod interference;
#[cfg(not(feature = "fuzzing"))]
mod interference;
pub mod ir;
pub mod machine;
#[cfg(feature = "fuzzing")]
pub mod spill;
#[cfg(not(feature = "fuzzing"))]
mod spill;

#[cfg(test)]
mod test_utils;

use log::{debug, info};

pub use crate::analysis::AnalysisError;
use crate::analysis::{run_liveness, Liveness};
pub use crate::checker::{CheckerError, CheckerErrors};
use crate::coloring::color_graph;
pub use crate::coloring::Coloring;
use crate::data_structures::{ItemIx, Map, Set};
use crate::interference::{build_interference_graph, InterferenceGraph};
pub use crate::ir::{Function, Inst, Item, Operand};
pub use crate::machine::{PhysReg, RegUniverse, RuntimeFn};
use crate::spill::spill_variable;

#[derive(Clone, Debug)]
pub enum RegAllocError {
  /// The function is malformed.
  Analysis(AnalysisError),

  /// Even with every variable in memory some temporaries could not be
  /// coloured.  This happens when the input itself keeps too many registers
  /// live.
  FallbackFailed { function: String, uncolorable: Vec<String> },

  /// The result failed verification.
  RegChecker(CheckerErrors),
}

impl ToString for RegAllocError {
  fn to_string(&self) -> String {
    match self {
      RegAllocError::Analysis(err) => {
        format!("analysis error: {}", err.to_string())
      }
      RegAllocError::FallbackFailed { function, uncolorable } => format!(
        "cannot allocate '{}' even with everything spilled: {}",
        function,
        uncolorable.join(" ")
      ),
      RegAllocError::RegChecker(errs) => {
        format!("checker error: {}", errs.to_string())
      }
    }
  }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
  /// Verify the colouring and the rewritten function.
  pub run_checker: bool,
}

/// What happened while allocating one function.
#[derive(Clone, Debug, Default)]
pub struct AllocStats {
  /// Rounds that ended by spilling something.
  pub spill_rounds: u32,
  /// Spilled variables, in spill order.
  pub spilled: Vec<String>,
  /// Whether the spill-everything fallback produced the result.
  pub fell_back: bool,
}

// The state of one round.
enum Round {
  AllAssigned(InterferenceGraph, Coloring),
  NeedsSpill(Vec<ItemIx>),
  Stuck,
}

struct Allocator<'a> {
  univ: &'a RegUniverse,
  opts: Options,
  // Temporaries created by earlier rounds.  They are never spilled again.
  spill_temps: Set<ItemIx>,
  stats: AllocStats,
}

impl<'a> Allocator<'a> {
  fn new(univ: &'a RegUniverse, opts: Options) -> Self {
    Allocator {
      univ,
      opts,
      spill_temps: Set::empty(),
      stats: AllocStats::default(),
    }
  }

  fn analyze_and_color(
    &self, func: &Function,
  ) -> Result<(InterferenceGraph, Coloring), RegAllocError> {
    let liveness: Liveness =
      run_liveness(func, self.univ).map_err(RegAllocError::Analysis)?;
    let graph = build_interference_graph(func, &liveness, self.univ);
    let coloring = color_graph(&graph, func, self.univ);
    Ok((graph, coloring))
  }

  fn next_round(&self, func: &Function) -> Result<Round, RegAllocError> {
    let (graph, coloring) = self.analyze_and_color(func)?;
    if coloring.is_complete() {
      return Ok(Round::AllAssigned(graph, coloring));
    }
    let mut to_spill = coloring.uncolorable.clone();
    to_spill.remove(&self.spill_temps);
    if to_spill.is_empty() {
      Ok(Round::Stuck)
    } else {
      Ok(Round::NeedsSpill(to_spill.to_vec()))
    }
  }

  fn run(&mut self, func: &mut Function) -> Result<AllocStats, RegAllocError> {
    info!("alloc_main: begin '{}'", func.name);
    let original = func.clone();
    let max_rounds = original.variables().len() as u32;
    let mut round: u32 = 0;

    loop {
      match self.next_round(func)? {
        Round::AllAssigned(graph, coloring) => {
          self.finish(func, &graph, &coloring)?;
          break;
        }
        Round::NeedsSpill(vars) => {
          // Every round spills at least one variable that existed before
          // allocation, and there are only so many of those.
          assert!(round < max_rounds, "alloc_main: spill loop did not converge");
          for (j, var) in vars.iter().enumerate() {
            let prefix =
              fresh_prefix(func, format!("SPILL_VAR_SYMBOL_{}_{}_", round, j));
            self.stats.spilled.push(func.item_name(*var));
            let temps = spill_variable(func, *var, &prefix, self.univ);
            for t in temps {
              self.spill_temps.insert(t);
            }
          }
          debug!("alloc_main: round {} spilled {} variables", round, vars.len());
          round += 1;
          self.stats.spill_rounds += 1;
        }
        Round::Stuck => {
          info!("alloc_main: stuck after {} rounds, spilling everything", round);
          *func = self.spill_everything(&original)?;
          self.stats.fell_back = true;
          break;
        }
      }
    }

    info!(
      "alloc_main: end '{}', {} spill rounds, {} locals",
      func.name, self.stats.spill_rounds, func.num_locals
    );
    Ok(std::mem::take(&mut self.stats))
  }

  fn spill_everything(
    &self, original: &Function,
  ) -> Result<Function, RegAllocError> {
    let mut copy = original.clone();
    for (it, var) in original.variables().iter().enumerate() {
      let prefix =
        fresh_prefix(&copy, format!("SPILLALL_VAR_SYMBOL_{}_", it));
      spill_variable(&mut copy, *var, &prefix, self.univ);
    }
    let (graph, coloring) = self.analyze_and_color(&copy)?;
    if !coloring.is_complete() {
      return Err(RegAllocError::FallbackFailed {
        function: copy.name.clone(),
        uncolorable: coloring
          .uncolorable
          .to_vec()
          .iter()
          .map(|ix| copy.item_name(*ix))
          .collect(),
      });
    }
    self.finish(&mut copy, &graph, &coloring)?;
    Ok(copy)
  }

  fn finish(
    &self, func: &mut Function, graph: &InterferenceGraph, coloring: &Coloring,
  ) -> Result<(), RegAllocError> {
    if self.opts.run_checker {
      checker::check_coloring(graph, coloring, func, self.univ)
        .map_err(RegAllocError::RegChecker)?;
    }
    apply_coloring(func, coloring, self.univ);
    if self.opts.run_checker {
      checker::check_allocated(func, self.univ)
        .map_err(RegAllocError::RegChecker)?;
    }
    Ok(())
  }
}

// A spill prefix that no existing variable name starts with, so the
// temporaries it generates cannot collide.
fn fresh_prefix(func: &Function, base: String) -> String {
  let names: Vec<String> =
    func.variables().iter().map(|ix| func.item_name(*ix)).collect();
  let mut prefix = base;
  while names.iter().any(|n| n[1..].starts_with(prefix.as_str())) {
    prefix.push('_');
  }
  prefix
}

/// Replace every coloured variable with its register.
pub fn apply_coloring(
  func: &mut Function, coloring: &Coloring, univ: &RegUniverse,
) {
  let mut subst = Map::<ItemIx, ItemIx>::default();
  for (ix, color) in coloring.assignment.iter() {
    if func.is_var(*ix) {
      subst.insert(*ix, func.reg(univ.reg_of(*color)));
    }
  }
  for inst in func.insns.iter_mut() {
    *inst = inst.map_items(&|ix| subst.get(&ix).copied().unwrap_or(ix));
  }
}

/// Allocate registers for `func` in place, with default options.
pub fn allocate_registers(
  func: &mut Function, univ: &RegUniverse,
) -> Result<AllocStats, RegAllocError> {
  allocate_registers_with_opts(func, univ, Options::default())
}

/// Allocate registers for `func` in place.  On success no variable is
/// mentioned by any instruction, and `func.num_locals` covers every spill
/// slot.  On failure `func` may have been partially rewritten.
pub fn allocate_registers_with_opts(
  func: &mut Function, univ: &RegUniverse, opts: Options,
) -> Result<AllocStats, RegAllocError> {
  Allocator::new(univ, opts).run(func)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::ir::{ArithOp, CmpOp};
  use crate::test_utils::{c, Builder};

  fn checked() -> Options {
    Options { run_checker: true }
  }

  fn no_vars_left(f: &Function) -> bool {
    f.insns.iter().all(|inst| {
      let mut ok = true;
      inst.for_each_item(&mut |ix| ok &= !f.is_var(ix));
      ok
    })
  }

  // Twenty variables all live at once, summed into rax.
  fn twenty_live() -> Function {
    let mut b = Builder::new("wide", 0);
    let vars: Vec<Operand> = (0..20).map(|i| b.var(&format!("v{}", i))).collect();
    for (i, v) in vars.iter().enumerate() {
      b.assign(v.clone(), c(i as i64));
    }
    let rax = b.reg(PhysReg::Rax);
    b.assign(rax.clone(), c(0));
    for v in &vars {
      b.arith(rax.clone(), ArithOp::Add, v.clone());
    }
    b.ret();
    b.finish()
  }

  #[test]
  fn no_variables_means_one_round() {
    let univ = RegUniverse::x86_64();
    let mut b = Builder::new("f", 0);
    let rax = b.reg(PhysReg::Rax);
    let rdi = b.reg(PhysReg::Rdi);
    b.assign(rax.clone(), c(5));
    b.assign(rdi, rax);
    b.call_rt(RuntimeFn::Print, 1);
    b.ret();
    let mut f = b.finish();
    let before = f.to_string();
    let stats = allocate_registers_with_opts(&mut f, &univ, checked()).unwrap();
    assert_eq!(stats.spill_rounds, 0);
    assert!(stats.spilled.is_empty());
    assert!(!stats.fell_back);
    assert_eq!(f.to_string(), before);
  }

  #[test]
  fn simple_loop_allocates_without_spilling() {
    let univ = RegUniverse::x86_64();
    let mut b = Builder::new("f", 1);
    let i = b.var("i");
    let acc = b.var("acc");
    let rdi = b.reg(PhysReg::Rdi);
    let rax = b.reg(PhysReg::Rax);
    b.assign(acc.clone(), c(0));
    b.assign(i.clone(), rdi);
    b.label("loop");
    b.arith(acc.clone(), ArithOp::Add, i.clone());
    b.arith(i.clone(), ArithOp::Sub, c(1));
    let cond = b.cmp(c(0), CmpOp::Lt, i);
    b.cjump(cond, "loop");
    b.assign(rax, acc);
    b.ret();
    let mut f = b.finish();
    let stats = allocate_registers_with_opts(&mut f, &univ, checked()).unwrap();
    assert_eq!(stats.spill_rounds, 0);
    assert_eq!(f.num_locals, 0);
    assert!(no_vars_left(&f));
  }

  #[test]
  fn pressure_forces_spilling() {
    let univ = RegUniverse::x86_64();
    let mut f = twenty_live();
    let stats = allocate_registers_with_opts(&mut f, &univ, checked()).unwrap();
    assert!(stats.spill_rounds >= 1);
    assert!(!stats.spilled.is_empty());
    assert!(f.num_locals >= 1);
    assert!(no_vars_left(&f));
  }

  #[test]
  fn stuck_falls_back_to_spilling_everything() {
    let univ = RegUniverse::x86_64();
    let mut f = twenty_live();
    let mut alloc = Allocator::new(&univ, checked());
    // Pretend every variable came from an earlier round, so nothing is
    // eligible for spilling.
    alloc.spill_temps = Set::from_vec(f.variables());
    let stats = alloc.run(&mut f).unwrap();
    assert!(stats.fell_back);
    assert_eq!(stats.spill_rounds, 0);
    assert_eq!(f.num_locals, 20);
    assert!(no_vars_left(&f));
    assert!(f
      .variables()
      .iter()
      .any(|v| f.item_name(*v).starts_with("%SPILLALL_VAR_SYMBOL_19_")));
  }

  #[test]
  fn fallback_can_fail_on_impossible_input() {
    let univ = RegUniverse::x86_64();
    let mut b = Builder::new("f", 0);
    let x = b.var("x");
    // Every caller-saved register holds a value that is needed after %x
    // is used, and the callee-saved ones are always live.
    let live: Vec<Operand> = univ.caller_saved.iter().map(|r| b.reg(*r)).collect();
    for (i, r) in live.iter().enumerate() {
      b.assign(r.clone(), c(i as i64));
    }
    b.assign(x.clone(), c(7));
    b.arith(x, ArithOp::Add, c(1));
    for r in &live {
      b.arith(r.clone(), ArithOp::Add, c(1));
    }
    b.ret();
    let mut f = b.finish();
    match allocate_registers(&mut f, &univ) {
      Err(RegAllocError::FallbackFailed { uncolorable, .. }) => {
        assert!(!uncolorable.is_empty());
      }
      other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
  }

  #[test]
  fn malformed_input_is_an_error() {
    let univ = RegUniverse::x86_64();
    let mut b = Builder::new("f", 0);
    b.goto("missing");
    let mut f = b.finish();
    match allocate_registers(&mut f, &univ) {
      Err(RegAllocError::Analysis(AnalysisError::UndefinedLabel(l))) => {
        assert_eq!(l, ":missing")
      }
      other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
  }

  #[test]
  fn spill_prefix_avoids_existing_names() {
    let mut b = Builder::new("f", 0);
    b.var("SPILL_VAR_SYMBOL_0_0_0");
    let f = b.finish();
    assert_eq!(
      fresh_prefix(&f, "SPILL_VAR_SYMBOL_0_0_".to_string()),
      "SPILL_VAR_SYMBOL_0_0__"
    );
    assert_eq!(fresh_prefix(&f, "OTHER_".to_string()), "OTHER_");
  }

  #[test]
  fn checker_errors_read_as_prose() {
    let err = RegAllocError::RegChecker(CheckerErrors {
      errors: vec![
        CheckerError::MissingColor { var: "%a".to_string() },
        CheckerError::SameColor {
          a: "%b".to_string(),
          b: "%c".to_string(),
          reg: PhysReg::Rdi,
        },
      ],
    });
    assert_eq!(
      err.to_string(),
      "checker error: %a got no colour; %b and %c interfere but both got rdi"
    );
  }
}
