use thiserror::Error;

/// Allocation shape of a tracked address.
///
/// The shape decides how the backing memory is released once its record is
/// evicted: scalars and arrays are allocated differently and must be
/// deallocated differently. Keeping the distinction as a variant forces
/// every release path to match on it exhaustively.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Shape
{
    /// A single value.
    Scalar,

    /// An array of consecutive values.
    Array {
        /// The number of elements in the array.
        len: usize,
    },
}

impl Shape
{
    /// Derive the shape from an element count.
    ///
    /// A count of zero denotes a scalar; any other count denotes an array
    /// of that many elements.
    pub fn from_element_count(count: usize) -> Self
    {
        match count {
            0 => Self::Scalar,
            len => Self::Array{len},
        }
    }

    /// The number of elements reachable from the tracked address.
    ///
    /// This is 1 for scalars and the array length for arrays.
    pub fn element_count(self) -> usize
    {
        match self {
            Self::Scalar => 1,
            Self::Array{len} => len,
        }
    }
}

/// Two records track the same address with conflicting shapes.
///
/// A single address cannot be both a scalar and an array, nor two arrays
/// of different lengths, so this state is unreachable through the handle
/// lifecycle. Observing it means the registry's bookkeeping is corrupted,
/// and there is no way to repair it: neither shape can be trusted.
#[derive(Debug, Error)]
#[error("Records for address {addr:p} disagree on allocation shape: {a:?} vs {b:?}")]
pub struct ShapeMismatch
{
    /// The address both records track.
    pub addr: *const (),

    /// The shape recorded by the first record.
    pub a: Shape,

    /// The shape recorded by the second record.
    pub b: Shape,
}

/// Bookkeeping for one tracked allocation.
///
/// A record is created when a previously unseen address is first tracked,
/// counts the live handles pointing at that address, and is removed (with
/// its backing allocation released) by the sweep that observes its count
/// at zero.
pub struct Record<T>
{
    /// The tracked address; identity key for lookups.
    ///
    /// Null is a legitimate tracked address. It gets a record like any
    /// other address, but the sweep never tries to release it.
    pub (super) addr: *mut T,

    /// The number of live handles currently pointing at `addr`.
    pub (super) refcount: usize,

    /// How `addr` was allocated.
    pub (super) shape: Shape,
}

impl<T> Record<T>
{
    /// Create a record for a newly tracked address.
    ///
    /// The reference count starts at 1, for the handle that caused the
    /// registration.
    pub (super) fn new(addr: *mut T, element_count: usize) -> Self
    {
        Self{addr, refcount: 1, shape: Shape::from_element_count(element_count)}
    }

    /// The tracked address.
    pub fn addr(&self) -> *mut T
    {
        self.addr
    }

    /// The number of live handles currently pointing at the address.
    pub fn refcount(&self) -> usize
    {
        self.refcount
    }

    /// How the address was allocated.
    pub fn shape(&self) -> Shape
    {
        self.shape
    }

    /// Whether two records track the same allocation.
    ///
    /// Records coincide iff their addresses match. Matching addresses with
    /// differing shapes mean two different allocations were tracked under
    /// one address; that is reported as [`ShapeMismatch`] rather than
    /// treated as mere inequality.
    pub fn coincides(&self, other: &Self) -> Result<bool, ShapeMismatch>
    {
        if self.addr != other.addr {
            return Ok(false);
        }

        if self.shape != other.shape {
            return Err(ShapeMismatch{
                addr: self.addr.cast_const().cast(),
                a: self.shape,
                b: other.shape,
            });
        }

        Ok(true)
    }
}
