// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Ordered index of live DMA mappings.
//!
//! The index is a probabilistic skip list keyed by virtual address. Virtual
//! addresses are opaque ordering keys here; the index never dereferences
//! them. Lookup, insert, and erase all run in expected O(log n).

use std::ptr;
use std::sync::Mutex;

use crate::{Error, Result};

const SKIPLIST_LEVELS: usize = 8;

/// One live mapping: `len` bytes at virtual address `vaddr`, reachable by the
/// device at `iova`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub vaddr: u64,
    pub len: u64,
    pub iova: u64,
}

impl Mapping {
    fn end(&self) -> u64 {
        self.vaddr.saturating_add(self.len)
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr < self.end()
    }
}

struct Node {
    mapping: Mapping,
    forward: [*mut Node; SKIPLIST_LEVELS],
}

/// A null forward link stands in for the tail entry with `vaddr = ∞`: every
/// comparison against it terminates the per-level scan.
struct SkipList {
    head: *mut Node,
    height: usize,
    len: usize,
    rng: u64,
}

// SAFETY: all nodes are owned exclusively by the list; raw pointers never
// escape it.
unsafe impl Send for SkipList {}

impl SkipList {
    fn new(seed: u64) -> Self {
        let head = Box::into_raw(Box::new(Node {
            mapping: Mapping {
                vaddr: 0,
                len: 0,
                iova: 0,
            },
            forward: [ptr::null_mut(); SKIPLIST_LEVELS],
        }));

        SkipList {
            head,
            height: 0,
            len: 0,
            rng: seed | 1,
        }
    }

    /// Draw a level from a geometric distribution capped at the top level.
    fn random_level(&mut self) -> usize {
        let mut k = 0;

        while k < SKIPLIST_LEVELS - 1 {
            self.rng ^= self.rng << 13;
            self.rng ^= self.rng >> 7;
            self.rng ^= self.rng << 17;

            if self.rng & 1 == 0 {
                break;
            }

            k += 1;
        }

        k
    }

    /// Descend from the top level, recording at each level the last node
    /// whose mapping still ends at or before `addr`. Returns the node
    /// containing `addr`, if any.
    ///
    /// # Safety
    ///
    /// The list invariants must hold (all forward pointers reference live
    /// nodes or are null).
    unsafe fn find_path(
        &self,
        addr: u64,
        mut path: Option<&mut [*mut Node; SKIPLIST_LEVELS]>,
    ) -> *mut Node {
        let mut p = self.head;

        for k in (0..=self.height).rev() {
            loop {
                let next = (*p).forward[k];
                if next.is_null() || addr < (*next).mapping.end() {
                    break;
                }
                p = next;
            }

            if let Some(path) = path.as_deref_mut() {
                path[k] = p;
            }
        }

        let cand = (*p).forward[0];
        if !cand.is_null() && (*cand).mapping.contains(addr) {
            cand
        } else {
            ptr::null_mut()
        }
    }

    fn insert(&mut self, mapping: Mapping) -> Result<()> {
        let mut path = [ptr::null_mut(); SKIPLIST_LEVELS];

        // SAFETY: the list owns all its nodes and the path array is filled
        // for every level up to the current height before use.
        unsafe {
            if !self.find_path(mapping.vaddr, Some(&mut path)).is_null() {
                return Err(Error::Overlap);
            }

            let mut k = self.random_level();
            if k > self.height {
                self.height += 1;
                k = self.height;
                path[k] = self.head;
            }

            let node = Box::into_raw(Box::new(Node {
                mapping,
                forward: [ptr::null_mut(); SKIPLIST_LEVELS],
            }));

            for r in 0..=k {
                (*node).forward[r] = (*path[r]).forward[r];
                (*path[r]).forward[r] = node;
            }
        }

        self.len += 1;

        Ok(())
    }

    fn remove(&mut self, addr: u64) -> Result<Mapping> {
        let mut path = [ptr::null_mut(); SKIPLIST_LEVELS];

        // SAFETY: `node` was returned by find_path and is therefore live;
        // it is unlinked from every level before being released.
        unsafe {
            let node = self.find_path(addr, Some(&mut path));
            if node.is_null() {
                return Err(Error::NotMapped);
            }

            for r in 0..=self.height {
                if (*path[r]).forward[r] != node {
                    break;
                }
                (*path[r]).forward[r] = (*node).forward[r];
            }

            let mapping = (*node).mapping;
            drop(Box::from_raw(node));

            while self.height > 0 && (*self.head).forward[self.height].is_null() {
                self.height -= 1;
            }

            self.len -= 1;

            Ok(mapping)
        }
    }

    fn find(&self, addr: u64) -> Option<Mapping> {
        // SAFETY: read-only traversal of live nodes.
        let node = unsafe { self.find_path(addr, None) };
        if node.is_null() {
            None
        } else {
            // SAFETY: non-null nodes returned by find_path are live.
            Some(unsafe { (*node).mapping })
        }
    }

    fn clear_with(&mut self, mut f: Option<&mut dyn FnMut(&Mapping)>) {
        // SAFETY: level 0 links every node exactly once; each node is
        // released after its successor pointer has been read.
        unsafe {
            let mut n = (*self.head).forward[0];
            while !n.is_null() {
                let next = (*n).forward[0];

                if let Some(f) = f.as_deref_mut() {
                    f(&(*n).mapping);
                }

                drop(Box::from_raw(n));
                n = next;
            }

            (*self.head).forward = [ptr::null_mut(); SKIPLIST_LEVELS];
        }

        self.height = 0;
        self.len = 0;
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        self.clear_with(None);

        // SAFETY: the head node was created by Box::into_raw in new() and is
        // not referenced by anything once the list is empty.
        unsafe {
            drop(Box::from_raw(self.head));
        }
    }
}

/// Mutex-guarded mapping index. Every operation takes the index's own lock;
/// traversals never block on anything else.
pub struct IovaIndex {
    list: Mutex<SkipList>,
}

impl IovaIndex {
    pub fn new() -> Self {
        IovaIndex {
            list: Mutex::new(SkipList::new(0x853c_49e6_748f_ea9b)),
        }
    }

    /// Record a mapping of `len` bytes at `vaddr`.
    pub fn insert(&self, vaddr: u64, len: u64, iova: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidLength);
        }

        self.list
            .lock()
            .unwrap()
            .insert(Mapping { vaddr, len, iova })
    }

    /// Remove the mapping containing `vaddr`.
    pub fn remove(&self, vaddr: u64) -> Result<Mapping> {
        self.list.lock().unwrap().remove(vaddr)
    }

    /// Return the mapping containing `vaddr`, if any.
    pub fn find(&self, vaddr: u64) -> Option<Mapping> {
        self.list.lock().unwrap().find(vaddr)
    }

    /// Translate a virtual address to the IOVA the device must use for it.
    pub fn translate(&self, vaddr: u64) -> Option<u64> {
        self.find(vaddr).map(|m| m.iova + (vaddr - m.vaddr))
    }

    /// Remove every mapping, invoking `f` once per entry before its release.
    pub fn clear_with(&self, mut f: impl FnMut(&Mapping)) {
        self.list.lock().unwrap().clear_with(Some(&mut f));
    }

    pub fn clear(&self) {
        self.list.lock().unwrap().clear_with(None);
    }

    pub fn len(&self) -> usize {
        self.list.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IovaIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_remove() {
        let index = IovaIndex::new();

        index.insert(0x1000, 0x1000, 0x10000).unwrap();

        let m = index.find(0x1000).unwrap();
        assert_eq!(m.vaddr, 0x1000);
        assert_eq!(m.len, 0x1000);
        assert_eq!(m.iova, 0x10000);

        assert_eq!(index.find(0x1fff), Some(m));
        assert_eq!(index.find(0x2000), None);
        assert_eq!(index.find(0xfff), None);

        index.remove(0x1000).unwrap();
        assert_eq!(index.find(0x1000), None);
    }

    #[test]
    fn insert_zero_length_fails() {
        let index = IovaIndex::new();
        assert!(matches!(
            index.insert(0x1000, 0, 0x10000),
            Err(Error::InvalidLength)
        ));
    }

    #[test]
    fn insert_overlap_fails() {
        let index = IovaIndex::new();

        index.insert(0x0, 1, 0x0).unwrap();
        index.insert(0x1, 4, 0x0).unwrap();

        assert!(matches!(index.insert(0x2, 1, 0x0), Err(Error::Overlap)));
        assert!(matches!(index.insert(0x3, 1, 0x0), Err(Error::Overlap)));
        assert!(matches!(index.insert(0x4, 1, 0x0), Err(Error::Overlap)));

        index.insert(0x5, 1, 0x0).unwrap();

        index.remove(0x1).unwrap();
        assert_eq!(index.find(0x4), None);
        assert!(index.find(0x5).is_some());
    }

    #[test]
    fn remove_unmapped_fails() {
        let index = IovaIndex::new();
        assert!(matches!(index.remove(0x1000), Err(Error::NotMapped)));
    }

    #[test]
    fn translate_offsets_into_mapping() {
        let index = IovaIndex::new();

        index.insert(0x7f00_0000_0000, 4096, 0x10000).unwrap();
        assert_eq!(index.translate(0x7f00_0000_0008), Some(0x10008));
        assert_eq!(index.translate(0x7f00_0000_0fff), Some(0x10fff));
        assert_eq!(index.translate(0x7f00_0000_1000), None);
    }

    #[test]
    fn clear_with_visits_every_mapping() {
        let index = IovaIndex::new();

        for i in 0..32u64 {
            index.insert(i * 0x2000, 0x1000, i * 0x1000).unwrap();
        }

        let mut seen = Vec::new();
        index.clear_with(|m| seen.push(m.vaddr));
        seen.sort_unstable();

        assert_eq!(seen.len(), 32);
        assert_eq!(seen[0], 0);
        assert_eq!(seen[31], 31 * 0x2000);
        assert!(index.is_empty());
    }

    // Pseudo-random non-overlapping mappings, removed in a shuffled order;
    // afterwards every lookup misses and the list height is back to zero.
    #[test]
    fn random_insert_remove_leaves_empty_index() {
        let index = IovaIndex::new();
        let mut keys = Vec::new();
        let mut state = 0x2545_f491_4f6c_dd1du64;

        for i in 0..10_000u64 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;

            // Disjoint 64 KiB lanes keep the ranges non-overlapping while the
            // offset and length vary.
            let vaddr = i * 0x10000 + (state & 0x7000);
            let len = 0x1000 + (state >> 16 & 0x7000);
            index.insert(vaddr, len, i).unwrap();
            keys.push(vaddr);
        }

        // Fisher-Yates with the same generator.
        for i in (1..keys.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            keys.swap(i, (state % (i as u64 + 1)) as usize);
        }

        for &vaddr in &keys {
            index.remove(vaddr).unwrap();
        }

        for &vaddr in &keys {
            assert_eq!(index.find(vaddr), None);
        }

        assert!(index.is_empty());
        assert_eq!(index.list.lock().unwrap().height, 0);
    }
}
