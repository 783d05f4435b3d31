/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data structures for the whole crate.

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Index;
use std::ops::IndexMut;
use std::slice::{Iter, IterMut};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Maps

pub type Map<K, V> = FxHashMap<K, V>;

//=============================================================================
// Sets of things

// Iteration order of the underlying hash set is not meaningful.  Anything
// whose result must be reproducible goes through |to_vec|, which sorts.
#[derive(Clone)]
pub struct Set<T> {
  set: FxHashSet<T>,
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> Set<T> {
  #[inline(never)]
  pub fn empty() -> Self {
    Self { set: FxHashSet::<T>::default() }
  }

  #[inline(never)]
  pub fn card(&self) -> usize {
    self.set.len()
  }

  #[inline(never)]
  pub fn insert(&mut self, item: T) {
    self.set.insert(item);
  }

  #[inline(never)]
  pub fn delete(&mut self, item: T) {
    self.set.remove(&item);
  }

  #[inline(never)]
  pub fn is_empty(&self) -> bool {
    self.set.is_empty()
  }

  #[inline(never)]
  pub fn contains(&self, item: T) -> bool {
    self.set.contains(&item)
  }

  #[inline(never)]
  pub fn union(&mut self, other: &Self) {
    for item in other.set.iter() {
      self.set.insert(*item);
    }
  }

  #[inline(never)]
  pub fn remove(&mut self, other: &Self) {
    for item in other.set.iter() {
      self.set.remove(item);
    }
  }

  #[inline(never)]
  pub fn is_subset_of(&self, other: &Self) -> bool {
    self.set.is_subset(&other.set)
  }

  #[inline(never)]
  pub fn to_vec(&self) -> Vec<T> {
    let mut res = Vec::<T>::new();
    for item in self.set.iter() {
      res.push(*item)
    }
    // Don't delete this.  It is important.
    res.sort_unstable();
    res
  }

  #[inline(never)]
  pub fn from_vec(vec: Vec<T>) -> Self {
    let mut res = Set::<T>::empty();
    for x in vec {
      res.insert(x);
    }
    res
  }

  #[inline(never)]
  pub fn equals(&self, other: &Self) -> bool {
    self.set == other.set
  }

  pub fn iter(&self) -> std::collections::hash_set::Iter<T> {
    self.set.iter()
  }
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> fmt::Debug for Set<T> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    // Print the elements in some way which depends only on what is
    // present in the set, and not on any other factor.
    write!(fmt, "{:?}", self.to_vec())
  }
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> PartialEq for Set<T> {
  fn eq(&self, other: &Self) -> bool {
    self.equals(other)
  }
}
impl<T: Eq + Ord + Hash + Copy + fmt::Debug> Eq for Set<T> {}

//=============================================================================
// Index ranges, so that |TypedIxVec::range| can be iterated with typed
// indices.

pub trait PlusOne {
  fn plus_one(&self) -> Self;
}

#[derive(Clone, Copy)]
pub struct IxRange<T> {
  first: T,
  last_plus1: T,
}
impl<T: Copy + PartialOrd + PlusOne> IntoIterator for IxRange<T> {
  type Item = T;
  type IntoIter = IxRangeIter<T>;
  fn into_iter(self) -> Self::IntoIter {
    IxRangeIter { range: self, next: self.first }
  }
}

pub struct IxRangeIter<T> {
  range: IxRange<T>,
  next: T,
}
impl<T: Copy + PartialOrd + PlusOne> Iterator for IxRangeIter<T> {
  type Item = T;
  fn next(&mut self) -> Option<Self::Item> {
    if self.next >= self.range.last_plus1 {
      None
    } else {
      let res = Some(self.next);
      self.next = self.next.plus_one();
      res
    }
  }
}

//=============================================================================
// Vectors where both the index and element types can be specified (and at
// most 2^32-1 elems can be stored.  What if this overflows?)

#[derive(Clone)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TypedIxVec<TyIx, Ty> {
  vek: Vec<Ty>,
  ty_ix: PhantomData<TyIx>,
}

impl<TyIx, Ty> TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
  TyIx: Copy + PartialOrd + PlusOne + From<u32> + Into<u32>,
{
  pub fn new() -> Self {
    Self { vek: Vec::new(), ty_ix: PhantomData::<TyIx> }
  }
  pub fn into_vec(self) -> Vec<Ty> {
    self.vek
  }
  pub fn iter(&self) -> Iter<Ty> {
    self.vek.iter()
  }
  pub fn iter_mut(&mut self) -> IterMut<Ty> {
    self.vek.iter_mut()
  }
  pub fn len(&self) -> u32 {
    // FIXME what if this overflows?
    self.vek.len() as u32
  }
  pub fn is_empty(&self) -> bool {
    self.vek.is_empty()
  }
  pub fn push(&mut self, item: Ty) -> TyIx {
    let ix = TyIx::from(self.len());
    self.vek.push(item);
    ix
  }
  pub fn resize(&mut self, new_len: u32, value: Ty) {
    self.vek.resize(new_len as usize, value);
  }
  pub fn range(&self) -> IxRange<TyIx> {
    IxRange { first: TyIx::from(0), last_plus1: TyIx::from(self.len()) }
  }
  pub fn get(&self, ix: TyIx) -> Option<&Ty> {
    self.vek.get(ix.into() as usize)
  }
}

impl<TyIx, Ty> Index<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  type Output = Ty;
  fn index(&self, ix: TyIx) -> &Ty {
    &self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> IndexMut<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  fn index_mut(&mut self, ix: TyIx) -> &mut Ty {
    &mut self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty: fmt::Debug> fmt::Debug for TypedIxVec<TyIx, Ty> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.vek)
  }
}

impl<TyIx, Ty: PartialEq> PartialEq for TypedIxVec<TyIx, Ty> {
  fn eq(&self, other: &Self) -> bool {
    self.vek == other.vek
  }
}

//=============================================================================

macro_rules! generate_boilerplate {
  ($TypeIx:ident, $PrintingPrefix:expr) => {
    #[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    pub struct $TypeIx(u32);
    impl $TypeIx {
      #[inline(always)]
      pub fn new(n: u32) -> Self {
        Self(n)
      }
      #[inline(always)]
      pub fn get(self) -> u32 {
        self.0
      }
      #[inline(always)]
      pub fn plus(self, delta: u32) -> $TypeIx {
        Self(self.0 + delta)
      }
    }
    impl fmt::Debug for $TypeIx {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $PrintingPrefix, &self.0)
      }
    }
    impl PlusOne for $TypeIx {
      #[inline(always)]
      fn plus_one(&self) -> Self {
        self.plus(1)
      }
    }
    impl From<$TypeIx> for u32 {
      #[inline(always)]
      fn from(ix: $TypeIx) -> u32 {
        ix.get()
      }
    }
    impl From<u32> for $TypeIx {
      #[inline(always)]
      fn from(n: u32) -> $TypeIx {
        $TypeIx::new(n)
      }
    }
  };
}

generate_boilerplate!(InstIx, "i");

generate_boilerplate!(ItemIx, "it");

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn set_to_vec_is_sorted() {
    let s = Set::from_vec(vec![ItemIx::new(7), ItemIx::new(2), ItemIx::new(5)]);
    assert_eq!(s.to_vec(), vec![ItemIx::new(2), ItemIx::new(5), ItemIx::new(7)]);
  }

  #[test]
  fn set_algebra() {
    let mut a = Set::from_vec(vec![1u32, 2, 3]);
    let b = Set::from_vec(vec![2u32, 4]);
    a.remove(&b);
    assert_eq!(a.to_vec(), vec![1, 3]);
    a.union(&b);
    assert_eq!(a.to_vec(), vec![1, 2, 3, 4]);
    assert!(b.is_subset_of(&a));
    assert!(!a.is_subset_of(&b));
    assert!(a.equals(&Set::from_vec(vec![4, 3, 2, 1])));
  }

  #[test]
  fn typed_ix_vec_push_returns_index() {
    let mut v = TypedIxVec::<InstIx, &str>::new();
    let i0 = v.push("a");
    let i1 = v.push("b");
    assert_eq!(i0, InstIx::new(0));
    assert_eq!(i1, InstIx::new(1));
    assert_eq!(v[i1], "b");
    let ixs: Vec<InstIx> = v.range().into_iter().collect();
    assert_eq!(ixs, vec![i0, i1]);
    assert_eq!(format!("{:?}", i1), "i1");
  }
}
