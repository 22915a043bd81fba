use {
    super::{Record, Shape, ShapeMismatch},
    smallvec::SmallVec,
    std::{any::type_name, cell::RefCell, fmt, ptr},
};

/// How many records a registry stores without spilling to the heap.
const INLINE_RECORDS: usize = 8;

/// Shared bookkeeping for one (pointee type, element count) combination.
///
/// The registry holds one [`Record`] per tracked address and owns the
/// authoritative reference count for each. [`Handle`]s mutate those counts
/// during their lifecycle; the [`sweep`] evicts records whose count has
/// dropped to zero and releases their backing allocations.
///
/// A registry is an ordinary value: the host program decides where it
/// lives, and tests instantiate isolated registries instead of sharing
/// process-global state. Two registries never see each other's records,
/// and neither do registries of different combinations; a registry
/// constructed at the top of `main` tracks its combination for the whole
/// process and releases whatever is still outstanding when it is dropped.
///
/// [`Handle`]: `super::Handle`
/// [`sweep`]: `Self::sweep`
pub struct Registry<T, const N: usize = 0>
{
    // INVARIANT: At most one record per address. Every record's shape is
    // derived from N, so records can only disagree on shape if the storage
    // was corrupted from outside the handle lifecycle.
    records: RefCell<SmallVec<[Record<T>; INLINE_RECORDS]>>,
}

impl<T, const N: usize> Registry<T, N>
{
    /// Create a registry tracking no allocations.
    pub fn new() -> Self
    {
        Self{records: RefCell::new(SmallVec::new())}
    }

    /// The number of tracked allocations.
    pub fn len(&self) -> usize
    {
        self.records.borrow().len()
    }

    /// Whether no allocations are tracked.
    pub fn is_empty(&self) -> bool
    {
        self.records.borrow().is_empty()
    }

    /// The current reference count for an address, if it is tracked.
    pub fn refcount_of(&self, addr: *const T) -> Option<usize>
    {
        let records = self.records.borrow();
        let record = records.iter().find(|r| r.addr.cast_const() == addr)?;
        Some(record.refcount)
    }

    /// Scan for the record tracking `addr`.
    ///
    /// The scan compares a probe record against each stored record, so a
    /// corrupted registry (two shapes under one address) is detected here,
    /// on the next operation that touches the shared address, rather than
    /// silently picking a side.
    fn lookup(records: &[Record<T>], addr: *mut T)
        -> Result<Option<usize>, ShapeMismatch>
    {
        let probe = Record::new(addr, N);

        for (index, record) in records.iter().enumerate() {
            if record.coincides(&probe)? {
                return Ok(Some(index));
            }
        }

        Ok(None)
    }

    /// Like [`lookup`] but treats corruption as fatal.
    ///
    /// A registry that disagrees with itself cannot be repaired, and the
    /// handle lifecycle hooks that land here have no way to report an
    /// error, so the mismatch is escalated to a panic.
    ///
    /// [`lookup`]: `Self::lookup`
    fn position(records: &[Record<T>], addr: *mut T) -> Option<usize>
    {
        match Self::lookup(records, addr) {
            Ok(position) => position,
            Err(err) => panic!("{err}"),
        }
    }

    /// Register one more handle for an address.
    ///
    /// A fresh record is inserted when the address was not yet tracked.
    /// This is the construction path; it is also reused by bare-pointer
    /// reassignment, which may legitimately introduce an unseen address.
    pub (super) fn retain(&self, addr: *mut T)
    {
        const ERR: &str = "Too many handles for one address";
        let mut records = self.records.borrow_mut();
        match Self::position(&records, addr) {
            Some(index) => {
                let record = &mut records[index];
                record.refcount = record.refcount.checked_add(1).expect(ERR);
            },
            None =>
                records.push(Record::new(addr, N)),
        }
    }

    /// Register one more handle for an already-tracked address.
    ///
    /// This is the copy and handle-to-handle assignment path: the source
    /// handle keeps its record alive, so there is no insert branch, and a
    /// lookup miss means a handle was produced outside the lifecycle.
    pub (super) fn retain_existing(&self, addr: *mut T)
    {
        const ERR: &str = "Too many handles for one address";
        let mut records = self.records.borrow_mut();
        let index = Self::position(&records, addr)
            .unwrap_or_else(|| panic!("Address {addr:p} is not tracked by this registry"));
        let record = &mut records[index];
        record.refcount = record.refcount.checked_add(1).expect(ERR);
    }

    /// Drop one handle's claim on an address.
    ///
    /// The count never goes below zero; the guard applies to every
    /// decrement path uniformly. Nothing is reclaimed here, a record left
    /// at zero waits for the next [`sweep`].
    ///
    /// [`sweep`]: `Self::sweep`
    pub (super) fn release(&self, addr: *mut T)
    {
        let mut records = self.records.borrow_mut();
        let index = Self::position(&records, addr)
            .unwrap_or_else(|| panic!("Address {addr:p} is not tracked by this registry"));
        let record = &mut records[index];
        record.refcount = record.refcount.saturating_sub(1);
    }

    /// Reclaim every allocation whose reference count dropped to zero.
    ///
    /// Each eviction restarts the scan from the beginning, which is
    /// quadratic in the worst case; registries are expected to stay small.
    /// Returns whether at least one record was reclaimed.
    pub fn sweep(&self) -> bool
    {
        let mut reclaimed = false;

        loop {
            let mut records = self.records.borrow_mut();
            let Some(index) = records.iter().position(|r| r.refcount == 0)
                else { return reclaimed };
            let record = records.swap_remove(index);

            // The drop glue of T may run handle lifecycles that re-enter
            // this registry, so the borrow must end before the release.
            drop(records);

            // SAFETY: Tracked addresses satisfy the adopt contract and the
            //         record was just evicted, so this releases it once.
            unsafe { release_allocation(record); }
            reclaimed = true;
        }
    }

    /// Force-release every outstanding allocation.
    ///
    /// Every reference count is set to zero and a single sweep reclaims
    /// the lot, regardless of how many handles never ran their destructor.
    /// On an empty registry this is a no-op. Dropping the registry calls
    /// this as well, so a leaked handle cannot leak its allocation past
    /// the registry's lifetime.
    pub fn shutdown(&self)
    {
        if self.records.borrow().is_empty() {
            return;
        }

        for record in self.records.borrow_mut().iter_mut() {
            record.refcount = 0;
        }

        self.sweep();
    }

    /// Write a human-readable report of the registry to `sink`.
    ///
    /// The report names the pointee type and element count, then lists
    /// each record's address, reference count, and the value stored at the
    /// address, with a placeholder for null. The format is meant for eyes,
    /// not for parsing, and may change.
    pub fn dump(&self, sink: &mut dyn fmt::Write) -> fmt::Result
        where T: fmt::Display
    {
        let records = self.records.borrow();

        writeln!(sink, "registry<{}, {}>:", type_name::<T>(), N)?;

        if records.is_empty() {
            return writeln!(sink, "  (empty)");
        }

        for record in records.iter() {
            write!(sink, "  [{:p}] {} ", record.addr, record.refcount)?;
            if record.addr.is_null() {
                writeln!(sink, "---")?;
            }
            else {
                // SAFETY: Non-null tracked addresses are live while their
                //         record exists; see the adopt contract.
                let value = unsafe { &*record.addr };
                writeln!(sink, "{value}")?;
            }
        }

        Ok(())
    }
}

impl<T, const N: usize> Default for Registry<T, N>
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl<T, const N: usize> Drop for Registry<T, N>
{
    fn drop(&mut self)
    {
        self.shutdown();
    }
}

/// Release the backing allocation of an evicted record.
///
/// Null addresses have no backing allocation and are skipped.
///
/// # Safety
///
/// `record.addr` must be null, or the start of a live [`Box`] allocation
/// matching `record.shape` that has not been released before.
unsafe fn release_allocation<T>(record: Record<T>)
{
    if record.addr.is_null() {
        return;
    }

    match record.shape {
        Shape::Scalar =>
            drop(Box::from_raw(record.addr)),
        Shape::Array{len} =>
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(record.addr, len))),
    }
}
