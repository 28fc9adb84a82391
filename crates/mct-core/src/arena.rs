//! Arena storage with typed integer handles
//!
//! All lines and blocks of one tile's transform network live in owning
//! arenas; cross references between them are plain indices, so the whole
//! graph is dropped with the network and no entity outlives the tile.

use std::marker::PhantomData;

/// Index newtype identifying an entry in an [`Arena`]
pub trait ArenaHandle: Copy + Eq {
    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
}

macro_rules! define_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl ArenaHandle for $name {
            fn from_index(index: usize) -> Self {
                $name(index as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_handle!(
    /// Handle to a line in the network's line arena
    LineHandle
);
define_handle!(
    /// Handle to a transform block in the network's block arena
    BlockHandle
);

/// Flat owning container addressed by a typed handle
#[derive(Debug)]
pub struct Arena<H: ArenaHandle, T> {
    items: Vec<T>,
    _marker: PhantomData<H>,
}

impl<H: ArenaHandle, T> Default for Arena<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ArenaHandle, T> Arena<H, T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn alloc(&mut self, item: T) -> H {
        let handle = H::from_index(self.items.len());
        self.items.push(item);
        handle
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, handle: H) -> &T {
        &self.items[handle.index()]
    }

    pub fn get_mut(&mut self, handle: H) -> &mut T {
        &mut self.items[handle.index()]
    }

    /// Mutable access to two distinct entries at once
    pub fn pair_mut(&mut self, a: H, b: H) -> (&mut T, &mut T) {
        let (ia, ib) = (a.index(), b.index());
        assert_ne!(ia, ib);
        if ia < ib {
            let (lo, hi) = self.items.split_at_mut(ib);
            (&mut lo[ia], &mut hi[0])
        } else {
            let (lo, hi) = self.items.split_at_mut(ia);
            (&mut hi[0], &mut lo[ib])
        }
    }

    /// Mutable access to three distinct entries at once
    pub fn trio_mut(&mut self, a: H, b: H, c: H) -> (&mut T, &mut T, &mut T) {
        let (ia, ib, ic) = (a.index(), b.index(), c.index());
        assert!(ia != ib && ib != ic && ia != ic);
        let mut order = [ia, ib, ic];
        order.sort_unstable();
        let (head, rest) = self.items.split_at_mut(order[1]);
        let (mid, tail) = rest.split_at_mut(order[2] - order[1]);
        let mut refs = [
            Some(&mut head[order[0]]),
            Some(&mut mid[0]),
            Some(&mut tail[0]),
        ];
        let mut pick = |idx: usize| {
            let slot = order
                .iter()
                .position(|&o| o == idx)
                .unwrap_or_else(|| unreachable!());
            refs[slot].take().unwrap_or_else(|| unreachable!())
        };
        (pick(ia), pick(ib), pick(ic))
    }

    pub fn handles(&self) -> impl Iterator<Item = H> + '_ {
        (0..self.items.len()).map(H::from_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (H::from_index(i), item))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (H, &mut T)> {
        self.items
            .iter_mut()
            .enumerate()
            .map(|(i, item)| (H::from_index(i), item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_lookup() {
        let mut arena: Arena<LineHandle, i32> = Arena::new();
        let a = arena.alloc(10);
        let b = arena.alloc(20);
        assert_ne!(a, b);
        assert_eq!(*arena.get(a), 10);
        *arena.get_mut(b) += 1;
        assert_eq!(*arena.get(b), 21);
    }

    #[test]
    fn test_pair_mut() {
        let mut arena: Arena<BlockHandle, i32> = Arena::new();
        let a = arena.alloc(1);
        let b = arena.alloc(2);
        let (pa, pb) = arena.pair_mut(b, a);
        std::mem::swap(pa, pb);
        assert_eq!(*arena.get(a), 2);
        assert_eq!(*arena.get(b), 1);
    }

    #[test]
    fn test_trio_mut_any_order() {
        let mut arena: Arena<LineHandle, i32> = Arena::new();
        let a = arena.alloc(1);
        let b = arena.alloc(2);
        let c = arena.alloc(3);
        let _ = arena.alloc(4);
        let (pc, pa, pb) = arena.trio_mut(c, a, b);
        assert_eq!((*pc, *pa, *pb), (3, 1, 2));
        *pa += 10;
        *pb += 20;
        *pc += 30;
        assert_eq!(*arena.get(a), 11);
        assert_eq!(*arena.get(b), 22);
        assert_eq!(*arena.get(c), 33);
    }
}
