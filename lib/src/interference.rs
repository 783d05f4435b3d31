/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Interference graph over physical registers and variables.

use log::debug;

use crate::analysis::Liveness;
use crate::data_structures::{ItemIx, Map, Set};
use crate::ir::{Function, Inst, Operand};
use crate::machine::RegUniverse;

/// An undirected graph without self loops.  It is a plain value: consumers
/// that want to mutate it take their own clone.
#[derive(Clone, Debug)]
pub struct InterferenceGraph {
  adj: Map<ItemIx, Set<ItemIx>>,
}

impl InterferenceGraph {
  pub fn new() -> Self {
    InterferenceGraph { adj: Map::default() }
  }

  pub fn add_node(&mut self, n: ItemIx) {
    self.adj.entry(n).or_insert_with(Set::empty);
  }

  /// Adds both endpoints as nodes.  Self edges are dropped.
  pub fn add_edge(&mut self, a: ItemIx, b: ItemIx) {
    self.add_node(a);
    self.add_node(b);
    if a == b {
      return;
    }
    if let Some(s) = self.adj.get_mut(&a) {
      s.insert(b);
    }
    if let Some(s) = self.adj.get_mut(&b) {
      s.insert(a);
    }
  }

  /// Every pair of distinct members of `set` interferes.
  pub fn add_clique(&mut self, set: &Set<ItemIx>) {
    let members = set.to_vec();
    for (i, a) in members.iter().enumerate() {
      self.add_node(*a);
      for b in &members[i + 1..] {
        self.add_edge(*a, *b);
      }
    }
  }

  pub fn add_all_pairs(&mut self, from: &Set<ItemIx>, to: &Set<ItemIx>) {
    for a in from.iter() {
      for b in to.iter() {
        self.add_edge(*a, *b);
      }
    }
  }

  pub fn remove_node(&mut self, n: ItemIx) {
    if let Some(neighbours) = self.adj.remove(&n) {
      for m in neighbours.iter() {
        if let Some(s) = self.adj.get_mut(m) {
          s.delete(n);
        }
      }
    }
  }

  pub fn contains(&self, n: ItemIx) -> bool {
    self.adj.contains_key(&n)
  }

  pub fn has_edge(&self, a: ItemIx, b: ItemIx) -> bool {
    self.adj.get(&a).map_or(false, |s| s.contains(b))
  }

  pub fn neighbours(&self, n: ItemIx) -> &Set<ItemIx> {
    match self.adj.get(&n) {
      Some(s) => s,
      None => panic!("InterferenceGraph::neighbours: {:?} is not a node", n),
    }
  }

  pub fn degree(&self, n: ItemIx) -> usize {
    self.neighbours(n).card()
  }

  /// All nodes, sorted.
  pub fn nodes(&self) -> Vec<ItemIx> {
    let mut nodes: Vec<ItemIx> = self.adj.keys().copied().collect();
    nodes.sort_unstable();
    nodes
  }

  pub fn num_nodes(&self) -> usize {
    self.adj.len()
  }

  pub fn is_empty(&self) -> bool {
    self.adj.is_empty()
  }

  pub fn num_edges(&self) -> usize {
    self.adj.values().map(|s| s.card()).sum::<usize>() / 2
  }

  /// One line per node: the node, then its neighbours.  Everything is
  /// sorted by name.
  pub fn render(&self, func: &Function) -> String {
    let mut lines: Vec<(String, String)> = self
      .adj
      .iter()
      .map(|(n, neighbours)| {
        let mut names: Vec<String> =
          neighbours.iter().map(|m| func.item_name(*m)).collect();
        names.sort();
        (func.item_name(*n), names.join(" "))
      })
      .collect();
    lines.sort();
    let mut s = String::new();
    for (node, neighbours) in lines {
      s.push_str(&node);
      if !neighbours.is_empty() {
        s.push(' ');
        s.push_str(&neighbours);
      }
      s.push('\n');
    }
    s
  }
}

#[inline(never)]
pub fn build_interference_graph(
  func: &Function, liveness: &Liveness, univ: &RegUniverse,
) -> InterferenceGraph {
  debug!("build_interference_graph: begin");
  let mut g = InterferenceGraph::new();

  // The machine registers conflict among themselves.
  let gp: Set<ItemIx> =
    Set::from_vec(univ.gp_regs.iter().map(|r| func.reg(*r)).collect());
  g.add_clique(&gp);

  // Every variable gets a node, even one that is never live.
  for inst in func.insns.iter() {
    inst.for_each_item(&mut |ix| {
      if func.is_var(ix) {
        g.add_node(ix);
      }
    });
  }

  let shift_reg = func.reg(univ.shift_count_reg);
  for iix in func.insns.range() {
    g.add_clique(&liveness.live_in[iix]);
    g.add_clique(&liveness.live_out[iix]);
    g.add_all_pairs(&liveness.kill[iix], &liveness.live_out[iix]);

    // A shift amount held in a register can only be in the shift count
    // register.
    if let Inst::Shift { amount: Operand::Item(amt), .. } = &func.insns[iix] {
      if func.is_var(*amt) || gp.contains(*amt) {
        for r in gp.iter() {
          if *r != shift_reg {
            g.add_edge(*amt, *r);
          }
        }
      }
    }
  }

  debug!(
    "build_interference_graph: end, {} nodes, {} edges",
    g.num_nodes(),
    g.num_edges()
  );
  g
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::analysis::run_liveness;
  use crate::ir::{ArithOp, ShiftOp};
  use crate::machine::PhysReg;
  use crate::test_utils::{c, Builder};

  fn graph_of(f: &Function) -> InterferenceGraph {
    let univ = RegUniverse::x86_64();
    let lv = run_liveness(f, &univ).unwrap();
    build_interference_graph(f, &lv, &univ)
  }

  #[test]
  fn graph_basics() {
    let mut g = InterferenceGraph::new();
    let (a, b, c) = (ItemIx::new(20), ItemIx::new(21), ItemIx::new(22));
    g.add_edge(a, a);
    assert!(g.contains(a));
    assert_eq!(g.degree(a), 0);
    g.add_edge(a, b);
    g.add_edge(b, c);
    assert!(g.has_edge(b, a));
    assert_eq!(g.num_edges(), 2);
    let copy = g.clone();
    g.remove_node(b);
    assert_eq!(g.degree(a), 0);
    assert!(!g.contains(b));
    // The clone is unaffected.
    assert_eq!(copy.degree(b), 2);
  }

  #[test]
  #[should_panic]
  fn neighbours_of_missing_node() {
    let g = InterferenceGraph::new();
    g.neighbours(ItemIx::new(3));
  }

  #[test]
  fn registers_form_a_clique() {
    let mut b = Builder::new("f", 0);
    b.ret();
    let f = b.finish();
    let g = graph_of(&f);
    let univ = RegUniverse::x86_64();
    assert_eq!(g.num_nodes(), 15);
    for r in &univ.gp_regs {
      assert_eq!(g.degree(f.reg(*r)), 14);
    }
    assert!(!g.contains(f.reg(PhysReg::Rsp)));
  }

  #[test]
  fn variable_shift_amount_avoids_all_but_rcx() {
    let mut b = Builder::new("f", 0);
    let x = b.var("x");
    let n = b.var("n");
    let rax = b.reg(PhysReg::Rax);
    b.assign(x.clone(), c(1));
    b.assign(n.clone(), c(3));
    b.shift(x.clone(), ShiftOp::Left, n.clone());
    b.assign(rax, x);
    b.ret();
    let f = b.finish();
    let g = graph_of(&f);
    let univ = RegUniverse::x86_64();
    let n_ix = n.as_item().unwrap();
    for r in &univ.gp_regs {
      let expect = *r != PhysReg::Rcx;
      assert_eq!(g.has_edge(n_ix, f.reg(*r)), expect, "{:?}", r);
    }
  }

  #[test]
  fn disjoint_live_ranges_do_not_interfere() {
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
    let g = graph_of(&f);
    let (x, y) = (x.as_item().unwrap(), y.as_item().unwrap());
    assert!(g.contains(x) && g.contains(y));
    assert!(!g.has_edge(x, y));
  }

  #[test]
  fn dead_definition_interferes_with_live_values() {
    let mut b = Builder::new("f", 0);
    let x = b.var("x");
    let dead = b.var("dead");
    let rax = b.reg(PhysReg::Rax);
    b.assign(x.clone(), c(1));
    b.assign(dead.clone(), c(2));
    b.assign(rax, x.clone());
    b.ret();
    let f = b.finish();
    let g = graph_of(&f);
    assert!(g.has_edge(dead.as_item().unwrap(), x.as_item().unwrap()));
  }

  #[test]
  fn render_lists_neighbours() {
    let mut g = InterferenceGraph::new();
    let mut b = Builder::new("f", 0);
    let x = b.var_ix("x");
    let y = b.var_ix("y");
    let f = b.finish();
    g.add_edge(x, y);
    g.add_node(f.reg(PhysReg::Rax));
    assert_eq!(g.render(&f), "%x %y\n%y %x\nrax\n");
  }
}
