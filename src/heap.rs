use std::collections::{HashMap, HashSet};

use crate::value::{Location, OpalValue};

/// The value heap: a dense, append-only store of tagged values indexed by
/// Location. A prefix of the heap holds every preallocated literal; it is
/// permanently live and never moved by compaction.
pub struct Heap {
    cells: Vec<OpalValue>,
    num_literals: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            cells: Vec::new(),
            num_literals: 0,
        }
    }

    /// Append a value and return its location.
    pub fn alloc(&mut self, value: OpalValue) -> Location {
        self.cells.push(value);
        self.cells.len() - 1
    }

    #[inline]
    pub fn get(&self, loc: Location) -> &OpalValue {
        &self.cells[loc]
    }

    /// Overwrite the cell at `loc` in place. Letrec relies on this to make
    /// closures captured during an initializer see the final binding.
    #[inline]
    pub fn set(&mut self, loc: Location, value: OpalValue) {
        self.cells[loc] = value;
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Freeze the current heap contents as the permanent literal prefix.
    pub fn freeze_literals(&mut self) {
        self.num_literals = self.cells.len();
    }

    pub fn num_literals(&self) -> usize {
        self.num_literals
    }

    /// Mark `root` and everything transitively reachable from it through
    /// closure environments. Uses an explicit worklist so deep closure
    /// chains cannot overflow the host stack.
    pub fn mark_from(&self, root: Location, marked: &mut HashSet<Location>) {
        let mut worklist = vec![root];
        while let Some(loc) = worklist.pop() {
            if !marked.insert(loc) {
                continue;
            }
            if let OpalValue::Closure(closure) = &self.cells[loc] {
                for &(_, l) in &closure.env {
                    if !marked.contains(&l) {
                        worklist.push(l);
                    }
                }
            }
        }
    }

    /// Slide every marked cell above the literal prefix down over the dead
    /// ones. Returns the number of cells removed and the old-to-new map for
    /// the cells that moved; the caller must rewrite every held location.
    pub fn sweep_compact(
        &mut self,
        marked: &HashSet<Location>,
    ) -> (usize, HashMap<Location, Location>) {
        let n = self.cells.len();
        let mut relocation = HashMap::new();
        let mut i = self.num_literals;
        for j in self.num_literals..n {
            if marked.contains(&j) {
                if i < j {
                    self.cells.swap(i, j);
                    relocation.insert(j, i);
                }
                i += 1;
            }
        }
        self.cells.truncate(i);
        (n - i, relocation)
    }

    /// Rewrite the captured environments of every closure still on the
    /// heap through the relocation map.
    pub fn relocate_closures(&mut self, relocation: &HashMap<Location, Location>) {
        for cell in &mut self.cells {
            if let OpalValue::Closure(closure) = cell {
                for (_, loc) in &mut closure.env {
                    if let Some(&new) = relocation.get(loc) {
                        *loc = new;
                    }
                }
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ast::ExprId;
    use crate::value::{Closure, SymbolId};

    #[test]
    fn alloc_returns_consecutive_locations() {
        let mut heap = Heap::new();
        assert_eq!(heap.alloc(OpalValue::Integer(1)), 0);
        assert_eq!(heap.alloc(OpalValue::Integer(2)), 1);
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn compaction_preserves_the_literal_prefix() {
        let mut heap = Heap::new();
        heap.alloc(OpalValue::Integer(10));
        heap.alloc(OpalValue::Integer(11));
        heap.freeze_literals();
        heap.alloc(OpalValue::Integer(12));
        let live = heap.alloc(OpalValue::Integer(13));

        let mut marked = HashSet::new();
        heap.mark_from(live, &mut marked);
        let (removed, relocation) = heap.sweep_compact(&marked);
        assert_eq!(removed, 1);
        assert_eq!(relocation, HashMap::from([(3, 2)]));
        assert_eq!(heap.len(), 3);
        assert_eq!(heap.get(0).as_integer(), Some(10));
        assert_eq!(heap.get(1).as_integer(), Some(11));
        assert_eq!(heap.get(2).as_integer(), Some(13));
    }

    #[test]
    fn mark_follows_closure_environments() {
        let mut heap = Heap::new();
        let a = heap.alloc(OpalValue::Integer(1));
        let dead = heap.alloc(OpalValue::Integer(2));
        let closure = heap.alloc(OpalValue::Closure(Closure {
            env: vec![(SymbolId(0), a)],
            lambda: ExprId(0),
        }));

        let mut marked = HashSet::new();
        heap.mark_from(closure, &mut marked);
        assert!(marked.contains(&a));
        assert!(marked.contains(&closure));
        assert!(!marked.contains(&dead));
    }

    #[test]
    fn relocation_rewrites_captured_environments() {
        let mut heap = Heap::new();
        let a = heap.alloc(OpalValue::Integer(1));
        heap.alloc(OpalValue::Closure(Closure {
            env: vec![(SymbolId(0), a)],
            lambda: ExprId(0),
        }));
        heap.relocate_closures(&HashMap::from([(a, 7)]));
        let OpalValue::Closure(closure) = heap.get(1) else {
            panic!("expected closure");
        };
        assert_eq!(closure.env[0].1, 7);
    }
}
