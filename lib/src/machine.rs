/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Description of the target machine: its registers, their roles in the
//! calling convention, and the runtime entry points callable from L2 code.

use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Physical registers

/// The sixteen x86-64 integer registers.  The discriminant doubles as the
/// item handle of the register inside every `Function`, so the order here
/// must not change.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum PhysReg {
  Rdi,
  Rax,
  Rsi,
  Rdx,
  Rcx,
  R8,
  R9,
  Rbx,
  Rbp,
  R10,
  R11,
  R12,
  R13,
  R14,
  R15,
  Rsp,
}

pub const NUM_PHYS_REGS: usize = 16;

impl PhysReg {
  pub const ALL: [PhysReg; NUM_PHYS_REGS] = [
    PhysReg::Rdi,
    PhysReg::Rax,
    PhysReg::Rsi,
    PhysReg::Rdx,
    PhysReg::Rcx,
    PhysReg::R8,
    PhysReg::R9,
    PhysReg::Rbx,
    PhysReg::Rbp,
    PhysReg::R10,
    PhysReg::R11,
    PhysReg::R12,
    PhysReg::R13,
    PhysReg::R14,
    PhysReg::R15,
    PhysReg::Rsp,
  ];

  pub fn get_index(self) -> usize {
    self as usize
  }

  pub fn name(self) -> &'static str {
    match self {
      PhysReg::Rdi => "rdi",
      PhysReg::Rax => "rax",
      PhysReg::Rsi => "rsi",
      PhysReg::Rdx => "rdx",
      PhysReg::Rcx => "rcx",
      PhysReg::R8 => "r8",
      PhysReg::R9 => "r9",
      PhysReg::Rbx => "rbx",
      PhysReg::Rbp => "rbp",
      PhysReg::R10 => "r10",
      PhysReg::R11 => "r11",
      PhysReg::R12 => "r12",
      PhysReg::R13 => "r13",
      PhysReg::R14 => "r14",
      PhysReg::R15 => "r15",
      PhysReg::Rsp => "rsp",
    }
  }

  pub fn from_name(name: &str) -> Option<PhysReg> {
    PhysReg::ALL.iter().copied().find(|r| r.name() == name)
  }
}

impl fmt::Display for PhysReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{}", self.name())
  }
}

//=============================================================================
// Colours

/// A colour is an index into the universe's colour order.  Lower numbers are
/// preferred by the colour selector.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Color(u8);

impl Color {
  pub fn new(n: u8) -> Self {
    Color(n)
  }
  pub fn get(self) -> usize {
    self.0 as usize
  }
}

//=============================================================================
// The register universe

// The universe is built once and handed by reference to every stage of the
// allocator.  Nothing in it is ever mutated after construction.
pub struct RegUniverse {
  /// Registers that take part in colouring: everything except the stack
  /// pointer.
  pub gp_regs: Vec<PhysReg>,

  /// Clobbered by every call.
  pub caller_saved: Vec<PhysReg>,

  /// Preserved across calls, and hence live at every return.
  pub callee_saved: Vec<PhysReg>,

  /// Argument-passing registers, in argument order.
  pub arg_regs: Vec<PhysReg>,

  pub return_reg: PhysReg,

  /// The only register a variable shift amount may live in.
  pub shift_count_reg: PhysReg,

  pub stack_ptr: PhysReg,

  /// Size in bytes of one stack slot.
  pub word_size: i64,

  // Colour |c| is bound to |colors[c]|.  Caller-saved registers come first
  // so that variables prefer them.
  colors: Vec<PhysReg>,
}

impl RegUniverse {
  pub fn x86_64() -> Self {
    use PhysReg::*;
    let caller_saved = vec![R10, R11, R8, R9, Rax, Rcx, Rdi, Rdx, Rsi];
    let callee_saved = vec![R12, R13, R14, R15, Rbp, Rbx];
    let mut colors = caller_saved.clone();
    colors.extend_from_slice(&[Rbx, Rbp, R12, R13, R14, R15]);
    let univ = RegUniverse {
      gp_regs: PhysReg::ALL.iter().copied().filter(|r| *r != Rsp).collect(),
      caller_saved,
      callee_saved,
      arg_regs: vec![Rdi, Rsi, Rdx, Rcx, R8, R9],
      return_reg: Rax,
      shift_count_reg: Rcx,
      stack_ptr: Rsp,
      word_size: 8,
      colors,
    };
    univ.check_is_sane();
    univ
  }

  // Check that the given universe satisfies various invariants, and panic
  // if not.  All the invariants are important.
  fn check_is_sane(&self) {
    let mut ok = self.gp_regs.len() == self.colors.len();
    // Every general purpose register is bound to exactly one colour.
    if ok {
      ok = self.gp_regs.iter().all(|r| {
        self.colors.iter().filter(|c| *c == r).count() == 1
      });
    }
    // The saved-register partition covers the general purpose registers.
    if ok {
      ok = self.caller_saved.len() + self.callee_saved.len()
        == self.gp_regs.len()
        && self.gp_regs.iter().all(|r| {
          self.caller_saved.contains(r) != self.callee_saved.contains(r)
        });
    }
    if ok {
      ok = !self.gp_regs.contains(&self.stack_ptr)
        && self.gp_regs.contains(&self.shift_count_reg)
        && self.gp_regs.contains(&self.return_reg)
        && self.arg_regs.iter().all(|r| self.caller_saved.contains(r));
    }
    if !ok {
      panic!("RegUniverse::check_is_sane: invalid RegUniverse");
    }
  }

  /// The colour budget K.
  pub fn num_colors(&self) -> usize {
    self.colors.len()
  }

  pub fn color_of(&self, reg: PhysReg) -> Option<Color> {
    self
      .colors
      .iter()
      .position(|r| *r == reg)
      .map(|ix| Color::new(ix as u8))
  }

  pub fn reg_of(&self, color: Color) -> PhysReg {
    self.colors[color.get()]
  }

  /// All colours, most preferred first.
  pub fn colors(&self) -> impl Iterator<Item = Color> {
    (0..self.colors.len()).map(|ix| Color::new(ix as u8))
  }

  /// The first `n` argument registers, clamped to however many there are.
  pub fn arg_regs_for(&self, n: i64) -> &[PhysReg] {
    let n = if n < 0 { 0 } else { n as usize };
    &self.arg_regs[..n.min(self.arg_regs.len())]
  }
}

//=============================================================================
// Runtime entry points

#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RuntimeFn {
  Print,
  Input,
  Allocate,
  TensorError,
}

impl RuntimeFn {
  pub const ALL: [RuntimeFn; 4] =
    [RuntimeFn::Print, RuntimeFn::Input, RuntimeFn::Allocate, RuntimeFn::TensorError];

  pub fn name(self) -> &'static str {
    match self {
      RuntimeFn::Print => "print",
      RuntimeFn::Input => "input",
      RuntimeFn::Allocate => "allocate",
      RuntimeFn::TensorError => "tensor-error",
    }
  }

  pub fn from_name(name: &str) -> Option<RuntimeFn> {
    RuntimeFn::ALL.iter().copied().find(|f| f.name() == name)
  }

  /// Control never comes back from this call.
  pub fn never_returns(self) -> bool {
    self == RuntimeFn::TensorError
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn x86_64_universe_shape() {
    let univ = RegUniverse::x86_64();
    assert_eq!(univ.num_colors(), 15);
    assert_eq!(univ.gp_regs.len(), 15);
    assert_eq!(univ.caller_saved.len(), 9);
    assert_eq!(univ.callee_saved.len(), 6);
    assert!(!univ.gp_regs.contains(&PhysReg::Rsp));
  }

  #[test]
  fn colors_prefer_caller_saved() {
    let univ = RegUniverse::x86_64();
    let first: Vec<PhysReg> =
      univ.colors().take(9).map(|c| univ.reg_of(c)).collect();
    assert!(first.iter().all(|r| univ.caller_saved.contains(r)));
    assert_eq!(univ.reg_of(Color::new(0)), PhysReg::R10);
    for r in &univ.gp_regs {
      let c = univ.color_of(*r).unwrap();
      assert_eq!(univ.reg_of(c), *r);
    }
    assert_eq!(univ.color_of(PhysReg::Rsp), None);
  }

  #[test]
  fn arg_regs_are_clamped() {
    let univ = RegUniverse::x86_64();
    assert_eq!(univ.arg_regs_for(2), &[PhysReg::Rdi, PhysReg::Rsi]);
    assert_eq!(univ.arg_regs_for(9).len(), 6);
    assert!(univ.arg_regs_for(0).is_empty());
  }

  #[test]
  fn names_round_trip() {
    for r in PhysReg::ALL.iter() {
      assert_eq!(PhysReg::from_name(r.name()), Some(*r));
      assert_eq!(r.get_index(), *r as usize);
    }
    assert_eq!(RuntimeFn::from_name("tensor-error"), Some(RuntimeFn::TensorError));
    assert!(RuntimeFn::TensorError.never_returns());
    assert!(!RuntimeFn::Print.never_returns());
  }
}
