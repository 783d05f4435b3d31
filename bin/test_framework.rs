/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Whole programs, their L1 rendering, and a reference interpreter used to
//! check that allocation preserves behaviour.

use std::collections::VecDeque;
use std::fmt;

use log::{debug, info};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use l2regalloc::data_structures::{InstIx, ItemIx};
use l2regalloc::ir::{Callee, Function, Inst, Item, Operand};
use l2regalloc::machine::{PhysReg, RegUniverse, RuntimeFn, NUM_PHYS_REGS};
use l2regalloc::{allocate_registers_with_opts, AllocStats, Options, RegAllocError};

//=============================================================================
// Programs

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Program {
  /// Name of the entry function, without the leading ':'.
  pub entry: String,
  pub functions: Vec<Function>,
}

impl Program {
  pub fn new(entry: &str) -> Self {
    Program { entry: entry.to_string(), functions: Vec::new() }
  }

  pub fn find(&self, name: &str) -> Option<&Function> {
    self.functions.iter().find(|f| f.name == name)
  }

  /// Allocate every function in turn.  Stops at the first failure, naming
  /// the function that failed.
  pub fn allocate(
    &mut self, univ: &RegUniverse, opts: Options,
  ) -> Result<Vec<AllocStats>, (String, RegAllocError)> {
    let mut stats = Vec::new();
    for func in self.functions.iter_mut() {
      match allocate_registers_with_opts(func, univ, opts) {
        Ok(s) => stats.push(s),
        Err(e) => return Err((func.name.clone(), e)),
      }
    }
    Ok(stats)
  }

  /// The L1 rendering of an allocated program.  The only difference from
  /// the L2 dump is that stack arguments become explicit stack accesses.
  pub fn emit_l1(&self, univ: &RegUniverse) -> String {
    let mut s = format!("(:{}\n", self.entry);
    for func in &self.functions {
      s.push_str(&lower_stack_args(func, univ).to_string());
    }
    s.push_str(")\n");
    s
  }
}

impl fmt::Display for Program {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    writeln!(fmt, "(:{}", self.entry)?;
    for func in &self.functions {
      write!(fmt, "{}", func)?;
    }
    writeln!(fmt, ")")
  }
}

/// `stack-arg M` is `mem rsp (locals * 8 + M)` once the frame is laid out.
pub fn lower_stack_args(func: &Function, univ: &RegUniverse) -> Function {
  let mut lowered = func.clone();
  let rsp = lowered.reg(univ.stack_ptr);
  let frame = func.num_locals * univ.word_size;
  for inst in lowered.insns.iter_mut() {
    if let Inst::Assign { src, .. } = inst {
      if let Operand::StackArg(m) = *src {
        *src = Operand::Mem { base: rsp, offset: frame + m };
      }
    }
  }
  lowered
}

//=============================================================================
// The interpreter

pub const STACK_TOP: i64 = 1 << 40;
pub const HEAP_BASE: i64 = 1 << 20;
pub const DEFAULT_STEP_BUDGET: usize = 1_000_000;

const LABEL_BASE: i64 = 1 << 50;
const MAX_CALL_DEPTH: usize = 512;
const MAX_ARRAY_LEN: i64 = 1 << 16;
const MAX_PRINT_DEPTH: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub enum RunError {
  UnknownFunction(String),
  UndefinedLabel(String),
  UndefinedVariable { func: String, var: String },
  UninitializedMemory(i64),
  BadDestination { func: String, inst: InstIx },
  BadCallTarget(i64),
  BadAllocation(i64),
  BadPrint(i64),
  InputExhausted,
  /// `tensor-error` was called.  The program stops here.
  TensorError { num_args: i64 },
  FellOffEnd(String),
  CallDepthExceeded,
  StepBudgetExhausted,
}

impl RunError {
  /// Whether an allocated program must fail in exactly the same way.  The
  /// other errors come from reading state that allocation is free to change,
  /// or from the run being cut short.
  pub fn is_observable(&self) -> bool {
    match self {
      RunError::TensorError { .. } => true,
      _ => false,
    }
  }
}

#[derive(Clone, Debug)]
pub struct RunResult {
  /// One entry per `print`.
  pub output: Vec<String>,
  /// The entry function's `rax`, or how execution stopped.
  pub outcome: Result<i64, RunError>,
  pub num_steps: usize,
}

struct IState<'a> {
  funcs: FxHashMap<&'a str, &'a Function>,
  label_codes: FxHashMap<String, i64>,
  labels_by_code: FxHashMap<i64, String>,
  regs: [i64; NUM_PHYS_REGS],
  mem: FxHashMap<i64, i64>,
  heap_top: i64,
  // Base address -> element count, for printing.
  arrays: FxHashMap<i64, i64>,
  input: VecDeque<i64>,
  output: Vec<String>,
  steps: usize,
  budget: usize,
  univ: &'a RegUniverse,
}

impl<'a> IState<'a> {
  fn new(
    prog: &'a Program, univ: &'a RegUniverse, input: &[i64], budget: usize,
  ) -> Self {
    let mut funcs = FxHashMap::default();
    let mut label_codes = FxHashMap::default();
    let mut labels_by_code = FxHashMap::default();
    // Every label anywhere in the program gets a distinct value, so that a
    // label can sit in a register and still be called through.
    let mut intern = |name: String| {
      if !label_codes.contains_key(&name) {
        let code = LABEL_BASE + 8 * label_codes.len() as i64;
        labels_by_code.insert(code, name.clone());
        label_codes.insert(name, code);
      }
    };
    for func in &prog.functions {
      funcs.insert(func.name.as_str(), func);
      intern(func.name.clone());
      for ix in 0..func.num_items() {
        if let Item::Label(name) = func.item(ItemIx::new(ix)) {
          intern(name.clone());
        }
      }
    }
    let mut regs = [0; NUM_PHYS_REGS];
    regs[univ.stack_ptr.get_index()] = STACK_TOP;
    IState {
      funcs,
      label_codes,
      labels_by_code,
      regs,
      mem: FxHashMap::default(),
      heap_top: HEAP_BASE,
      arrays: FxHashMap::default(),
      input: input.iter().copied().collect(),
      output: Vec::new(),
      steps: 0,
      budget,
      univ,
    }
  }

  fn get_reg(&self, r: PhysReg) -> i64 {
    self.regs[r.get_index()]
  }

  fn set_reg(&mut self, r: PhysReg, v: i64) {
    self.regs[r.get_index()] = v;
  }

  fn load(&self, addr: i64) -> Result<i64, RunError> {
    match self.mem.get(&addr) {
      Some(v) => Ok(*v),
      None => Err(RunError::UninitializedMemory(addr)),
    }
  }

  fn store(&mut self, addr: i64, v: i64) {
    self.mem.insert(addr, v);
  }

  fn item_value(
    &self, func: &Function, vars: &FxHashMap<ItemIx, i64>, ix: ItemIx,
  ) -> Result<i64, RunError> {
    match func.item(ix) {
      Item::Reg(r) => Ok(self.get_reg(*r)),
      Item::Var(name) => match vars.get(&ix) {
        Some(v) => Ok(*v),
        None => Err(RunError::UndefinedVariable {
          func: func.name.clone(),
          var: name.clone(),
        }),
      },
      Item::Label(name) => Ok(self.label_codes[name]),
    }
  }

  fn get_operand(
    &self, func: &Function, vars: &FxHashMap<ItemIx, i64>, op: &Operand,
  ) -> Result<i64, RunError> {
    match op {
      Operand::Item(ix) => self.item_value(func, vars, *ix),
      Operand::Const(n) => Ok(*n),
      Operand::Mem { base, offset } => {
        let addr = self.item_value(func, vars, *base)?.wrapping_add(*offset);
        self.load(addr)
      }
      Operand::Cmp(cmp) => {
        let lhs = self.get_operand(func, vars, &cmp.lhs)?;
        let rhs = self.get_operand(func, vars, &cmp.rhs)?;
        Ok(cmp.op.eval(lhs, rhs) as i64)
      }
      Operand::StackArg(m) => {
        let frame = func.num_locals * self.univ.word_size;
        self.load(self.get_reg(self.univ.stack_ptr) + frame + m)
      }
    }
  }

  fn set_operand(
    &mut self, func: &Function, vars: &mut FxHashMap<ItemIx, i64>,
    iix: InstIx, op: &Operand, v: i64,
  ) -> Result<(), RunError> {
    match op {
      Operand::Item(ix) => match func.item(*ix) {
        Item::Reg(r) => self.set_reg(*r, v),
        Item::Var(_) => {
          vars.insert(*ix, v);
        }
        Item::Label(_) => {
          return Err(RunError::BadDestination {
            func: func.name.clone(),
            inst: iix,
          })
        }
      },
      Operand::Mem { base, offset } => {
        let addr = self.item_value(func, vars, *base)?.wrapping_add(*offset);
        self.store(addr, v);
      }
      _ => {
        return Err(RunError::BadDestination {
          func: func.name.clone(),
          inst: iix,
        })
      }
    }
    Ok(())
  }

  fn render_value(&self, v: i64, depth: usize) -> Result<String, RunError> {
    if v & 1 == 1 {
      return Ok((v >> 1).to_string());
    }
    let len = match self.arrays.get(&v) {
      Some(len) if depth < MAX_PRINT_DEPTH => *len,
      _ => return Err(RunError::BadPrint(v)),
    };
    let mut s = format!("{{s:{}", len);
    for i in 0..len {
      let elem = self.load(v + 8 * (i + 1))?;
      s.push_str(", ");
      s.push_str(&self.render_value(elem, depth + 1)?);
    }
    s.push('}');
    Ok(s)
  }

  fn call_runtime(&mut self, rt: RuntimeFn, num_args: i64) -> Result<(), RunError> {
    let arg0 = self.get_reg(self.univ.arg_regs[0]);
    let arg1 = self.get_reg(self.univ.arg_regs[1]);
    let ret = self.univ.return_reg;
    match rt {
      RuntimeFn::Print => {
        let s = self.render_value(arg0, 0)?;
        debug!("IState::call_runtime: print {}", s);
        self.output.push(s);
        self.set_reg(ret, 1);
      }
      RuntimeFn::Input => match self.input.pop_front() {
        Some(n) => self.set_reg(ret, n.wrapping_mul(2).wrapping_add(1)),
        None => return Err(RunError::InputExhausted),
      },
      RuntimeFn::Allocate => {
        // The length is encoded; the header keeps it that way.
        let len = arg0 >> 1;
        if arg0 & 1 == 0 || len < 0 || len > MAX_ARRAY_LEN {
          return Err(RunError::BadAllocation(arg0));
        }
        let base = self.heap_top;
        self.store(base, arg0);
        for i in 0..len {
          self.store(base + 8 * (i + 1), arg1);
        }
        self.heap_top += 8 * (len + 1);
        self.arrays.insert(base, len);
        self.set_reg(ret, base);
      }
      RuntimeFn::TensorError => return Err(RunError::TensorError { num_args }),
    }
    Ok(())
  }

  fn resolve_callee(
    &self, func: &Function, vars: &FxHashMap<ItemIx, i64>, op: &Operand,
  ) -> Result<&'a Function, RunError> {
    let name = match op {
      Operand::Item(ix) if func.is_label(*ix) => match func.item(*ix) {
        Item::Label(name) => name.clone(),
        _ => unreachable!(),
      },
      _ => {
        let v = self.get_operand(func, vars, op)?;
        match self.labels_by_code.get(&v) {
          Some(name) => name.clone(),
          None => return Err(RunError::BadCallTarget(v)),
        }
      }
    };
    match self.funcs.get(name.as_str()) {
      Some(f) => Ok(*f),
      None => Err(RunError::UnknownFunction(name)),
    }
  }

  // Runs |func| to its return.  On entry the return address slot and any
  // stack arguments are already below the caller's stack pointer.
  fn run_function(&mut self, func: &Function, depth: usize) -> Result<(), RunError> {
    if depth > MAX_CALL_DEPTH {
      return Err(RunError::CallDepthExceeded);
    }
    let rsp = self.univ.stack_ptr;
    let word = self.univ.word_size;
    self.set_reg(rsp, self.get_reg(rsp) - func.num_locals * word);

    let mut label_pos = FxHashMap::<ItemIx, InstIx>::default();
    for iix in func.insns.range() {
      if let Inst::Label { label } = &func.insns[iix] {
        label_pos.insert(*label, iix);
      }
    }
    let mut vars = FxHashMap::<ItemIx, i64>::default();
    let nInsns = func.insns.len();
    let mut pc = InstIx::new(0);

    loop {
      if pc.get() >= nInsns {
        return Err(RunError::FellOffEnd(func.name.clone()));
      }
      self.steps += 1;
      if self.steps > self.budget {
        return Err(RunError::StepBudgetExhausted);
      }
      let iix = pc;
      pc = pc.plus(1);

      match &func.insns[iix] {
        Inst::Return { value } => {
          if let Some(v) = value {
            let v = self.get_operand(func, &vars, v)?;
            self.set_reg(self.univ.return_reg, v);
          }
          let stack_args = (func.num_args - self.univ.arg_regs.len() as i64).max(0);
          let pop = (func.num_locals + stack_args + 1) * word;
          self.set_reg(rsp, self.get_reg(rsp) + pop);
          return Ok(());
        }
        Inst::Label { .. } => {}
        Inst::Assign { dst, src } => {
          let v = self.get_operand(func, &vars, src)?;
          self.set_operand(func, &mut vars, iix, dst, v)?;
        }
        Inst::Arith { op, dst, src } => {
          let a = self.get_operand(func, &vars, dst)?;
          let b = self.get_operand(func, &vars, src)?;
          self.set_operand(func, &mut vars, iix, dst, op.eval(a, b))?;
        }
        Inst::Shift { op, dst, amount } => {
          let a = self.get_operand(func, &vars, dst)?;
          let n = self.get_operand(func, &vars, amount)?;
          self.set_operand(func, &mut vars, iix, dst, op.eval(a, n))?;
        }
        Inst::Lea { dst, base, index, scale } => {
          let b = self.get_operand(func, &vars, base)?;
          let i = self.get_operand(func, &vars, index)?;
          let v = b.wrapping_add(i.wrapping_mul(*scale));
          self.set_operand(func, &mut vars, iix, dst, v)?;
        }
        Inst::Inc { dst } => {
          let v = self.get_operand(func, &vars, dst)?.wrapping_add(1);
          self.set_operand(func, &mut vars, iix, dst, v)?;
        }
        Inst::Dec { dst } => {
          let v = self.get_operand(func, &vars, dst)?.wrapping_sub(1);
          self.set_operand(func, &mut vars, iix, dst, v)?;
        }
        Inst::Goto { target } => pc = jump_target(func, &label_pos, *target)?,
        Inst::CJump { cond, target } => {
          let lhs = self.get_operand(func, &vars, &cond.lhs)?;
          let rhs = self.get_operand(func, &vars, &cond.rhs)?;
          if cond.op.eval(lhs, rhs) {
            pc = jump_target(func, &label_pos, *target)?;
          }
        }
        Inst::Call { callee: Callee::Runtime(rt), num_args } => {
          self.call_runtime(*rt, *num_args)?;
        }
        Inst::Call { callee: Callee::User(op), num_args } => {
          let callee = self.resolve_callee(func, &vars, op)?;
          let stack_args = (num_args - self.univ.arg_regs.len() as i64).max(0);
          self.set_reg(rsp, self.get_reg(rsp) - (stack_args + 1) * word);
          self.run_function(callee, depth + 1)?;
        }
      }
    }
  }
}

fn jump_target(
  func: &Function, label_pos: &FxHashMap<ItemIx, InstIx>, label: ItemIx,
) -> Result<InstIx, RunError> {
  match label_pos.get(&label) {
    Some(iix) => Ok(*iix),
    None => Err(RunError::UndefinedLabel(func.item_name(label))),
  }
}

/// Run `prog` from its entry function.  `input` feeds the `input` runtime
/// call, one decoded number per call.
pub fn run_program(
  prog: &Program, univ: &RegUniverse, input: &[i64], budget: usize,
) -> RunResult {
  let mut istate = IState::new(prog, univ, input, budget);
  let outcome = match prog.find(&prog.entry) {
    None => Err(RunError::UnknownFunction(prog.entry.clone())),
    Some(entry) => {
      // The host's call pushes a return address.
      let rsp = univ.stack_ptr;
      istate.set_reg(rsp, istate.get_reg(rsp) - univ.word_size);
      istate
        .run_function(entry, 0)
        .map(|()| istate.get_reg(univ.return_reg))
    }
  };
  info!(
    "run_program: '{}' stopped after {} steps with {:?}",
    prog.entry, istate.steps, outcome
  );
  RunResult { output: istate.output, outcome, num_steps: istate.steps }
}

/// Compare a run of the original program with a run of the allocated one.
/// A run that stopped for a reason allocation may legitimately change proves
/// nothing, and is accepted.
pub fn check_results(before: &RunResult, after: &RunResult) -> Result<(), String> {
  if let Err(e) = &before.outcome {
    if !e.is_observable() {
      return Ok(());
    }
  }
  if before.output != after.output {
    return Err(format!(
      "different output before/after allocation:\n- before: {:?}\n- after: {:?}",
      before.output, after.output
    ));
  }
  if before.outcome != after.outcome {
    return Err(format!(
      "different outcome before/after allocation: {:?} vs {:?}",
      before.outcome, after.outcome
    ));
  }
  // Allocation only ever adds instructions.
  if after.num_steps < before.num_steps {
    return Err(format!(
      "allocated program ran fewer steps ({} < {})",
      after.num_steps, before.num_steps
    ));
  }
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::parser::parse_program;

  fn run(src: &str, input: &[i64]) -> RunResult {
    let _ = pretty_env_logger::try_init();
    let prog = parse_program(src).unwrap();
    run_program(&prog, &RegUniverse::x86_64(), input, DEFAULT_STEP_BUDGET)
  }

  #[test]
  fn prints_encoded_numbers_and_arrays() {
    let r = run(
      "(:main (:main 0
         rdi <- 11
         call print 1
         rdi <- 5
         rsi <- 7
         call allocate 2
         rdi <- rax
         call print 1
         rax <- 0
         return))",
      &[],
    );
    assert_eq!(r.output, vec!["5".to_string(), "{s:2, 3, 3}".to_string()]);
    assert_eq!(r.outcome, Ok(0));
  }

  #[test]
  fn calls_pass_stack_arguments() {
    let r = run(
      "(:main
        (:main 0
          rdi <- 1 rsi <- 2 rdx <- 3 rcx <- 4 r8 <- 5 r9 <- 6
          mem rsp -16 <- 7
          mem rsp -24 <- 8
          mem rsp -8 <- :ret
          call :last 8
          :ret
          rdi <- rax
          rdi <<= 1
          rdi++
          call print 1
          return)
        (:last 8
          %a <- stack-arg 0
          %b <- stack-arg 8
          rax <- %a
          rax *= 10
          rax += %b
          return))",
      &[],
    );
    assert_eq!(r.output, vec!["87".to_string()]);
  }

  #[test]
  fn tensor_error_stops_the_program() {
    let r = run(
      "(:main (:main 0 rdi <- 3 call print 1 rdi <- 1 call tensor-error 1 return))",
      &[],
    );
    assert_eq!(r.output, vec!["1".to_string()]);
    assert_eq!(r.outcome, Err(RunError::TensorError { num_args: 1 }));
  }

  #[test]
  fn input_and_undefined_variables() {
    let r = run("(:main (:main 0 call input 0 rdi <- rax call print 1 return))", &[21]);
    assert_eq!(r.output, vec!["21".to_string()]);
    let r = run("(:main (:main 0 call input 0 return))", &[]);
    assert_eq!(r.outcome, Err(RunError::InputExhausted));
    let r = run("(:main (:main 0 rax <- %nope return))", &[]);
    match r.outcome {
      Err(RunError::UndefinedVariable { var, .. }) => assert_eq!(var, "nope"),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn step_budget_bounds_infinite_loops() {
    let prog = parse_program("(:main (:main 0 :top goto :top))").unwrap();
    let r = run_program(&prog, &RegUniverse::x86_64(), &[], 100);
    assert_eq!(r.outcome, Err(RunError::StepBudgetExhausted));
    assert_eq!(r.num_steps, 101);
  }

  #[test]
  fn stack_args_lower_to_frame_offsets() {
    let univ = RegUniverse::x86_64();
    let mut prog =
      parse_program("(:main (:main 7 %x <- stack-arg 0 rax <- %x return))").unwrap();
    prog.functions[0].num_locals = 2;
    let l1 = prog.emit_l1(&univ);
    assert!(l1.starts_with("(:main\n(:main\n\t7 2\n"));
    assert!(l1.contains("\t%x <- mem rsp 16\n"));
  }

  #[test]
  fn unobservable_failures_are_not_compared() {
    let ok = RunResult { output: vec!["1".to_string()], outcome: Ok(0), num_steps: 3 };
    let undefined = RunResult {
      output: vec![],
      outcome: Err(RunError::UninitializedMemory(0)),
      num_steps: 1,
    };
    assert!(check_results(&undefined, &ok).is_ok());
    assert!(check_results(&ok, &undefined).is_err());
    let mut more = ok.clone();
    more.num_steps = 10;
    assert!(check_results(&ok, &more).is_ok());
    assert!(check_results(&more, &ok).is_err());
  }
}
