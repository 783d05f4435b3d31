/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Chaitin-style graph colouring with optimistic spilling.
//!
//! The node selector dismantles its own copy of the interference graph,
//! producing a stack of variables.  The colour selector then pops that stack
//! and colours each variable against its neighbours in the original graph.

use log::{debug, trace};

use crate::data_structures::{ItemIx, Map, Set};
use crate::interference::InterferenceGraph;
use crate::ir::Function;
use crate::machine::{Color, RegUniverse};

//=============================================================================
// Node selection

pub struct NodeSelector {
  graph: InterferenceGraph,
  k: usize,
}

impl NodeSelector {
  /// `graph` is consumed: simplification destroys it.
  pub fn new(graph: InterferenceGraph, k: usize) -> Self {
    NodeSelector { graph, k }
  }

  // Prefer the highest-degree node that is still trivially colourable.
  // Failing that, every node has more than K neighbours, so optimistically
  // remove the highest-degree node of all.  Ties go to the lowest handle.
  fn select_next(&self) -> ItemIx {
    let mut best_low: Option<(usize, ItemIx)> = None;
    let mut best_any: Option<(usize, ItemIx)> = None;
    for n in self.graph.nodes() {
      let deg = self.graph.degree(n);
      if deg <= self.k && best_low.map_or(true, |(d, _)| deg > d) {
        best_low = Some((deg, n));
      }
      if best_any.map_or(true, |(d, _)| deg > d) {
        best_any = Some((deg, n));
      }
    }
    match best_low.or(best_any) {
      Some((deg, n)) => {
        trace!("NodeSelector::select_next: {:?} (degree {})", n, deg);
        n
      }
      None => panic!("NodeSelector::select_next: graph is empty"),
    }
  }

  /// Remove every node, returning the removed variables in removal order.
  /// The last element is the first to be coloured.
  #[inline(never)]
  pub fn simplify(mut self, func: &Function) -> Vec<ItemIx> {
    let mut stack = Vec::<ItemIx>::new();
    while !self.graph.is_empty() {
      let n = self.select_next();
      self.graph.remove_node(n);
      if func.is_var(n) {
        stack.push(n);
      }
    }
    stack
  }
}

//=============================================================================
// Colour selection

pub struct Coloring {
  /// Colours of every node that got one, registers included.
  pub assignment: Map<ItemIx, Color>,
  /// Variables for which every colour was taken by a neighbour.
  pub uncolorable: Set<ItemIx>,
}

impl Coloring {
  pub fn is_complete(&self) -> bool {
    self.uncolorable.is_empty()
  }

  pub fn color_of(&self, n: ItemIx) -> Option<Color> {
    self.assignment.get(&n).copied()
  }
}

#[inline(never)]
pub fn select_colors(
  graph: &InterferenceGraph, mut stack: Vec<ItemIx>, func: &Function,
  univ: &RegUniverse,
) -> Coloring {
  let mut assignment = Map::<ItemIx, Color>::default();
  let mut uncolorable = Set::<ItemIx>::empty();

  for r in &univ.gp_regs {
    if let Some(c) = univ.color_of(*r) {
      assignment.insert(func.reg(*r), c);
    }
  }

  while let Some(n) = stack.pop() {
    let mut taken = Set::<Color>::empty();
    for m in graph.neighbours(n).iter() {
      if let Some(c) = assignment.get(m) {
        taken.insert(*c);
      }
    }
    match univ.colors().find(|c| !taken.contains(*c)) {
      Some(c) => {
        trace!("select_colors: {} -> {}", func.item_name(n), univ.reg_of(c));
        assignment.insert(n, c);
      }
      None => {
        trace!("select_colors: {} is uncolourable", func.item_name(n));
        uncolorable.insert(n);
      }
    }
  }

  Coloring { assignment, uncolorable }
}

/// Colour `graph`, leaving it untouched.
#[inline(never)]
pub fn color_graph(
  graph: &InterferenceGraph, func: &Function, univ: &RegUniverse,
) -> Coloring {
  let stack = NodeSelector::new(graph.clone(), univ.num_colors()).simplify(func);
  let coloring = select_colors(graph, stack, func, univ);
  debug!(
    "color_graph: {} nodes, {} uncolourable",
    graph.num_nodes(),
    coloring.uncolorable.card()
  );
  coloring
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::analysis::run_liveness;
  use crate::interference::build_interference_graph;
  use crate::ir::{ArithOp, ShiftOp};
  use crate::machine::PhysReg;
  use crate::test_utils::{c, Builder};

  fn check_valid(g: &InterferenceGraph, col: &Coloring) {
    for n in g.nodes() {
      for m in g.neighbours(n).iter() {
        if let (Some(a), Some(b)) = (col.color_of(n), col.color_of(*m)) {
          assert_ne!(a, b, "{:?} and {:?} share a colour", n, m);
        }
      }
    }
  }

  fn color_function(f: &Function) -> (InterferenceGraph, Coloring) {
    let univ = RegUniverse::x86_64();
    let lv = run_liveness(f, &univ).unwrap();
    let g = build_interference_graph(f, &lv, &univ);
    let col = color_graph(&g, f, &univ);
    (g, col)
  }

  #[test]
  fn stack_holds_only_variables() {
    let mut b = Builder::new("f", 0);
    let x = b.var("x");
    let y = b.var("y");
    let rax = b.reg(PhysReg::Rax);
    b.assign(x.clone(), c(1));
    b.assign(y.clone(), x.clone());
    b.arith(y.clone(), ArithOp::Add, x);
    b.assign(rax, y);
    b.ret();
    let f = b.finish();
    let univ = RegUniverse::x86_64();
    let lv = run_liveness(&f, &univ).unwrap();
    let g = build_interference_graph(&f, &lv, &univ);
    let stack = NodeSelector::new(g.clone(), univ.num_colors()).simplify(&f);
    assert_eq!(stack.len(), 2);
    assert!(stack.iter().all(|n| f.is_var(*n)));
    // The original graph is intact.
    assert_eq!(g.num_nodes(), 17);
  }

  #[test]
  fn selector_prefers_high_degree_below_budget() {
    let mut b = Builder::new("f", 0);
    let v: Vec<ItemIx> = (0..4).map(|i| b.var_ix(&format!("v{}", i))).collect();
    let f = b.finish();
    let mut g = InterferenceGraph::new();
    // v0 - v1 - v2, v3 isolated.  With K = 1 only v0, v2 and v3 qualify at
    // first, and of those v0 has the highest degree and the lowest handle.
    g.add_edge(v[0], v[1]);
    g.add_edge(v[1], v[2]);
    g.add_node(v[3]);
    let stack = NodeSelector::new(g, 1).simplify(&f);
    assert_eq!(stack[0], v[0]);
    assert_eq!(stack.len(), 4);
  }

  #[test]
  fn optimistic_removal_takes_max_degree() {
    let mut b = Builder::new("f", 0);
    let v: Vec<ItemIx> = (0..5).map(|i| b.var_ix(&format!("v{}", i))).collect();
    let f = b.finish();
    let mut g = InterferenceGraph::new();
    // A 4-clique on v0..v3 plus v4 attached to v3.  With K = 1 nothing
    // qualifies except v4 (degree 1), so v4 goes first; then all of the
    // clique members have degree 3 > K and v0 is removed optimistically.
    g.add_clique(&Set::from_vec(v[0..4].to_vec()));
    g.add_edge(v[3], v[4]);
    let stack = NodeSelector::new(g, 1).simplify(&f);
    assert_eq!(stack[0], v[4]);
    assert_eq!(stack[1], v[0]);
  }

  #[test]
  fn clique_larger_than_palette_leaves_one_uncolorable() {
    let univ = RegUniverse::x86_64();
    let mut b = Builder::new("f", 0);
    let vars: Vec<ItemIx> =
      (0..16).map(|i| b.var_ix(&format!("v{}", i))).collect();
    let f = b.finish();
    let mut g = InterferenceGraph::new();
    g.add_clique(&Set::from_vec(vars.clone()));
    let col = color_graph(&g, &f, &univ);
    assert_eq!(col.uncolorable.card(), 1);
    assert_eq!(col.assignment.len(), 15 + 15);
    check_valid(&g, &col);
  }

  #[test]
  fn disjoint_variables_share_a_colour() {
    let mut b = Builder::new("f", 0);
    let x = b.var("x");
    let y = b.var("y");
    let rax = b.reg(PhysReg::Rax);
    b.assign(x.clone(), c(1));
    b.assign(rax.clone(), x.clone());
    b.assign(y.clone(), c(2));
    b.arith(rax, ArithOp::Add, y.clone());
    b.ret();
    let f = b.finish();
    let (g, col) = color_function(&f);
    assert!(col.is_complete());
    check_valid(&g, &col);
    let cx = col.color_of(x.as_item().unwrap()).unwrap();
    let cy = col.color_of(y.as_item().unwrap()).unwrap();
    assert_eq!(cx, cy);
    let univ = RegUniverse::x86_64();
    assert!(univ.caller_saved.contains(&univ.reg_of(cx)));
  }

  #[test]
  fn shift_amount_is_coloured_rcx() {
    let mut b = Builder::new("f", 0);
    let x = b.var("x");
    let n = b.var("n");
    let rax = b.reg(PhysReg::Rax);
    b.assign(x.clone(), c(1));
    b.assign(n.clone(), c(3));
    b.shift(x.clone(), ShiftOp::Right, n.clone());
    b.assign(rax, x);
    b.ret();
    let f = b.finish();
    let (g, col) = color_function(&f);
    assert!(col.is_complete());
    check_valid(&g, &col);
    let univ = RegUniverse::x86_64();
    let cn = col.color_of(n.as_item().unwrap()).unwrap();
    assert_eq!(univ.reg_of(cn), PhysReg::Rcx);
  }

  #[test]
  fn registers_keep_their_own_colour() {
    let mut b = Builder::new("f", 0);
    b.ret();
    let f = b.finish();
    let (_g, col) = color_function(&f);
    let univ = RegUniverse::x86_64();
    for r in &univ.gp_regs {
      assert_eq!(col.color_of(f.reg(*r)), univ.color_of(*r));
    }
  }
}
