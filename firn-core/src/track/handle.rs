use {
    super::{Registry, Shape},
    crate::cursor::Cursor,
    std::{fmt, ptr},
};

/// Reference-counted owning handle to a tracked allocation.
///
/// A handle reports its whole lifecycle to the [`Registry`] it was created
/// against: construction and cloning increment the reference count of the
/// tracked address, reassignment moves one reference from the old address
/// to the new one, and dropping decrements the count and sweeps. Ownership
/// of the allocation is shared among all handles of the combination that
/// hold the same address; the allocation lives until the last of them is
/// dropped or reassigned away, and is then reclaimed by the sweep rather
/// than at the decrement itself.
///
/// `N` is the compile-time element count of the combination: 0 tracks
/// scalars, anything greater tracks arrays of that length. The count is
/// part of the type, so handles of different counts consult different
/// registries even for the same pointee type.
pub struct Handle<'r, T, const N: usize = 0>
{
    /// The registry this handle reports its lifecycle to.
    registry: &'r Registry<T, N>,

    /// The tracked address.
    addr: *mut T,

    /// Local mirror of the record's shape, derived from `N`.
    shape: Shape,
}

impl<'r, T> Handle<'r, T, 0>
{
    /// Allocate a scalar and hand ownership to the registry.
    pub fn alloc(registry: &'r Registry<T, 0>, value: T) -> Self
    {
        let addr = Box::into_raw(Box::new(value));
        // SAFETY: addr is a fresh live scalar allocation, owned by nobody.
        unsafe { Self::adopt(registry, addr) }
    }
}

impl<'r, T, const N: usize> Handle<'r, T, N>
{
    /// Allocate an array and hand ownership to the registry.
    ///
    /// Only array combinations have this constructor; scalar combinations
    /// allocate with [`Self::alloc`].
    pub fn alloc_array(registry: &'r Registry<T, N>, values: [T; N]) -> Self
    {
        const { assert!(N > 0, "Scalar combinations allocate with Handle::alloc") }

        let addr = Box::into_raw(Box::new(values)).cast::<T>();
        // SAFETY: addr is the first element of a fresh live array
        //         allocation, owned by nobody.
        unsafe { Self::adopt(registry, addr) }
    }

    /// Track the null address.
    ///
    /// Null is a legitimate tracked state with a record of its own, not an
    /// error; the sweep merely skips deallocating it.
    pub fn null(registry: &'r Registry<T, N>) -> Self
    {
        // SAFETY: The null address has no backing allocation to misuse.
        unsafe { Self::adopt(registry, ptr::null_mut()) }
    }

    /// Track an arbitrary raw allocation.
    ///
    /// If `addr` is already tracked, its reference count is incremented;
    /// otherwise a fresh record is inserted. The safe constructors are
    /// wrappers over this.
    ///
    /// # Safety
    ///
    /// `addr` must be null, or the start of a live [`Box`] allocation that
    /// matches this combination's shape: a boxed `T` when `N` is 0, a
    /// boxed `[T; N]` otherwise. Ownership passes to the registry: the
    /// allocation must stay live until the registry releases it, and
    /// nothing else may free it.
    pub unsafe fn adopt(registry: &'r Registry<T, N>, addr: *mut T) -> Self
    {
        registry.retain(addr);
        Self{registry, addr, shape: Shape::from_element_count(N)}
    }

    /// Point this handle at a different raw allocation.
    ///
    /// The current address loses one reference and `addr` gains one, with
    /// a fresh record inserted when `addr` was not yet tracked. Nothing is
    /// reclaimed here: a record left at zero waits for the next sweep.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::adopt`] for `addr`.
    pub unsafe fn reset(&mut self, addr: *mut T)
    {
        self.registry.release(self.addr);
        self.registry.retain(addr);
        self.addr = addr;
    }

    /// Point this handle at the null address.
    pub fn clear(&mut self)
    {
        // SAFETY: The null address satisfies the adopt contract.
        unsafe { self.reset(ptr::null_mut()); }
    }

    /// The tracked address.
    pub fn as_ptr(&self) -> *mut T
    {
        self.addr
    }

    /// Whether this handle tracks the null address.
    pub fn is_null(&self) -> bool
    {
        self.addr.is_null()
    }

    /// The registry this handle consults.
    pub fn registry(&self) -> &'r Registry<T, N>
    {
        self.registry
    }

    /// Borrow the tracked value.
    ///
    /// Returns [`None`] for a null handle. For array combinations this
    /// borrows the first element; use [`Self::begin`] to reach the rest.
    ///
    /// This borrow keeps the handle borrowed, and a live handle keeps its
    /// record's reference count above zero, so the allocation cannot be
    /// swept out from under the returned reference.
    pub fn get(&self) -> Option<&T>
    {
        if self.addr.is_null() {
            return None;
        }

        // SAFETY: Non-null tracked addresses are live (adopt contract),
        //         and no safe API hands out exclusive references.
        unsafe { Some(&*self.addr) }
    }

    /// Borrow the tracked value exclusively.
    ///
    /// # Safety
    ///
    /// Ownership is shared: the caller must guarantee that no reference
    /// obtained through any other handle to this allocation is alive for
    /// the duration of the borrow.
    pub unsafe fn get_mut(&mut self) -> Option<&mut T>
    {
        if self.addr.is_null() {
            return None;
        }

        Some(&mut *self.addr)
    }

    /// A cursor positioned at the first element.
    ///
    /// The cursor's bounds cover the whole allocation: one element for
    /// scalars, `N` elements for arrays. A null handle yields an empty
    /// range, so every checked access through the cursor fails instead of
    /// touching the null address.
    pub fn begin(&self) -> Cursor<'_, T>
    {
        let upper = self.upper_bound();
        // SAFETY: The range is this handle's live allocation, and the
        //         cursor borrows the handle for its whole lifetime.
        unsafe { Cursor::new(self.addr, self.addr, upper) }
    }

    /// A cursor positioned one past the last element.
    pub fn end(&self) -> Cursor<'_, T>
    {
        let upper = self.upper_bound();
        // SAFETY: As in begin.
        unsafe { Cursor::new(upper, self.addr, upper) }
    }

    /// One past the last element of the allocation.
    fn upper_bound(&self) -> *mut T
    {
        if self.addr.is_null() {
            return self.addr;
        }

        self.addr.wrapping_add(self.shape.element_count())
    }
}

impl<'r, T, const N: usize> Clone for Handle<'r, T, N>
{
    fn clone(&self) -> Self
    {
        // The source handle keeps the record alive, so it must be found.
        self.registry.retain_existing(self.addr);
        Self{registry: self.registry, addr: self.addr, shape: self.shape}
    }

    /// Handle-to-handle assignment.
    ///
    /// The current address loses one reference and `source`'s address
    /// gains one. `source` is by construction already tracked, so unlike
    /// [`Self::reset`] this never inserts a record. Reclamation is
    /// deferred to the next sweep.
    fn clone_from(&mut self, source: &Self)
    {
        self.registry.release(self.addr);
        source.registry.retain_existing(source.addr);
        self.registry = source.registry;
        self.addr = source.addr;
        self.shape = source.shape;
    }
}

impl<'r, T, const N: usize> Drop for Handle<'r, T, N>
{
    fn drop(&mut self)
    {
        self.registry.release(self.addr);
        self.registry.sweep();
    }
}

impl<'r, T, const N: usize> fmt::Debug for Handle<'r, T, N>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        fmt::Debug::fmt(&self.addr, f)
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        proptest::proptest,
        std::{array, cell::Cell, collections::HashMap, mem},
    };

    /// Counts its drops, so tests can observe deallocation.
    struct Tally<'c>
    {
        drops: &'c Cell<usize>,
    }

    impl Drop for Tally<'_>
    {
        fn drop(&mut self)
        {
            self.drops.set(self.drops.get() + 1);
        }
    }

    #[test]
    fn the_last_handle_out_triggers_reclamation()
    {
        let drops = Cell::new(0);
        let registry = Registry::new();

        let h1 = Handle::alloc(&registry, Tally{drops: &drops});
        let addr = h1.as_ptr();
        assert_eq!(registry.refcount_of(addr), Some(1));

        let h2 = h1.clone();
        assert_eq!(registry.refcount_of(addr), Some(2));

        drop(h1);
        assert_eq!(registry.refcount_of(addr), Some(1));
        assert_eq!(drops.get(), 0);

        drop(h2);
        assert_eq!(drops.get(), 1);
        assert!(registry.is_empty());
        assert!(!registry.sweep());
    }

    #[test]
    fn array_allocations_release_with_the_array_form()
    {
        let drops = Cell::new(0);
        let registry = Registry::<Tally, 5>::new();

        let handle = Handle::alloc_array(
            &registry,
            array::from_fn(|_| Tally{drops: &drops}),
        );
        assert_eq!(registry.refcount_of(handle.as_ptr()), Some(1));

        drop(handle);
        assert_eq!(drops.get(), 5);
        assert!(registry.is_empty());
    }

    #[test]
    fn assignment_defers_reclamation_to_the_sweep()
    {
        let drops = Cell::new(0);
        let registry = Registry::new();

        let source = Handle::alloc(&registry, Tally{drops: &drops});
        let mut target = Handle::alloc(&registry, Tally{drops: &drops});
        let orphan = target.as_ptr();

        target.clone_from(&source);
        assert_eq!(registry.refcount_of(source.as_ptr()), Some(2));

        // The assignment itself frees nothing.
        assert_eq!(registry.refcount_of(orphan), Some(0));
        assert_eq!(drops.get(), 0);

        assert!(registry.sweep());
        assert_eq!(drops.get(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bare_pointer_reassignment_inserts_fresh_records()
    {
        let drops = Cell::new(0);
        let registry = Registry::new();

        let mut handle = Handle::alloc(&registry, Tally{drops: &drops});
        let orphan = handle.as_ptr();

        let replacement = Box::into_raw(Box::new(Tally{drops: &drops}));
        // SAFETY: replacement is a fresh boxed scalar owned by nobody.
        unsafe { handle.reset(replacement); }

        assert_eq!(registry.refcount_of(replacement), Some(1));
        assert_eq!(registry.refcount_of(orphan), Some(0));
        assert_eq!(registry.len(), 2);

        assert!(registry.sweep());
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn null_handles_share_a_record()
    {
        let registry = Registry::<i32>::new();

        let a = Handle::null(&registry);
        let _b = Handle::null(&registry);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.refcount_of(a.as_ptr()), Some(2));
    }

    #[test]
    fn clearing_points_the_handle_at_null()
    {
        let drops = Cell::new(0);
        let registry = Registry::new();

        let mut handle = Handle::alloc(&registry, Tally{drops: &drops});
        handle.clear();

        assert!(handle.is_null());
        assert_eq!(drops.get(), 0);

        assert!(registry.sweep());
        assert_eq!(drops.get(), 1);
        assert_eq!(registry.len(), 1);

        drop(handle);
        assert!(registry.is_empty());
    }

    #[test]
    fn access_through_the_handle()
    {
        let registry = Registry::new();
        let mut handle = Handle::alloc(&registry, 19);

        assert_eq!(handle.get().copied(), Some(19));

        // SAFETY: No other handle shares this allocation.
        unsafe { *handle.get_mut().unwrap() = 23; }
        assert_eq!(handle.get().copied(), Some(23));

        handle.clear();
        assert_eq!(handle.get(), None);
    }

    #[test]
    fn cursors_span_the_whole_array()
    {
        let registry = Registry::<i32, 3>::new();
        let handle = Handle::alloc_array(&registry, [10, 20, 30]);

        let visited: Vec<i32> = handle.begin().copied().collect();
        assert_eq!(visited, [10, 20, 30]);

        let end = handle.end();
        assert!(end.get().is_err());
        assert_eq!(end.get_at(2).copied().unwrap(), 30);
    }

    #[test]
    fn scalar_cursors_span_one_element()
    {
        let registry = Registry::new();
        let handle = Handle::alloc(&registry, 7);

        let begin = handle.begin();
        assert_eq!(begin.len(), 1);
        assert_eq!(*begin.get().unwrap(), 7);
    }

    #[test]
    fn null_cursors_are_empty()
    {
        let registry = Registry::<i32>::new();
        let handle = Handle::null(&registry);

        let begin = handle.begin();
        assert!(begin.is_empty());
        assert!(begin.get().is_err());
    }

    #[test]
    fn registries_track_independently()
    {
        let first = Registry::<i32>::new();
        let second = Registry::<i32>::new();

        let _a = Handle::alloc(&first, 1);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
    }

    #[test]
    fn leaked_handles_cannot_leak_their_allocations()
    {
        let drops = Cell::new(0);

        {
            let registry = Registry::new();
            let handle = Handle::alloc(&registry, Tally{drops: &drops});
            mem::forget(handle);
            assert_eq!(drops.get(), 0);
        }

        assert_eq!(drops.get(), 1);
    }

    proptest!
    {
        #[test]
        fn refcounts_always_match_live_handles(
            ops in proptest::collection::vec((0u8..4, 0usize..8, 0usize..8), 0..48),
        )
        {
            let registry = Registry::<u32>::new();
            let mut handles: Vec<Handle<u32>> = Vec::new();
            let mut next = 0;

            for (op, a, b) in ops {
                match op {
                    0 => {
                        handles.push(Handle::alloc(&registry, next));
                        next += 1;
                    },
                    1 if !handles.is_empty() => {
                        let copy = handles[a % handles.len()].clone();
                        handles.push(copy);
                    },
                    2 if !handles.is_empty() => {
                        let index = a % handles.len();
                        drop(handles.swap_remove(index));
                    },
                    3 if handles.len() >= 2 => {
                        let target = a % handles.len();
                        let source = b % handles.len();
                        if target != source {
                            let (lo, hi) = handles.split_at_mut(target.max(source));
                            if target < source {
                                lo[target].clone_from(&hi[0]);
                            }
                            else {
                                hi[0].clone_from(&lo[source]);
                            }
                        }
                    },
                    _ => { },
                }

                // Every address some live handle points at counts exactly
                // the live handles pointing at it.
                let mut counts: HashMap<*mut u32, usize> = HashMap::new();
                for handle in &handles {
                    *counts.entry(handle.as_ptr()).or_insert(0) += 1;
                }
                for (addr, count) in counts {
                    assert_eq!(registry.refcount_of(addr), Some(count));
                }
            }

            // Dropping the last handle sweeps out whatever remains.
            drop(handles);
            assert!(registry.is_empty());
        }
    }
}
