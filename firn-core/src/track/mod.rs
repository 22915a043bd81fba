//! Reference-counted tracking of raw heap allocations.
//!
//! The registry owns the authoritative reference count for every tracked
//! address; handles are transient observers and incrementers of that count.
//! Handles register and unregister themselves during construction, cloning,
//! and dropping, and every handle drop runs a sweep, so unreferenced
//! allocations are reclaimed eagerly rather than in batches. Whatever is
//! still outstanding when the registry itself is dropped is released then,
//! exactly once.
//!
//! ## Notes
//!
//!  1. Each (pointee type, element count) combination is its own registry
//!     type, and each registry instance tracks its own allocations.
//!     Registries never see or reclaim each other's records, even for the
//!     same pointee type.
//!  2. Allocations referenced only by a cycle of tracked values are never
//!     reclaimed before the registry is dropped; there is no cycle
//!     detection.
//!  3. Everything here is single-threaded. The registry has no internal
//!     synchronization, and none of the types are [`Send`] or [`Sync`].

pub use self::{
    handle::*,
    record::*,
    registry::*,
};

mod handle;
mod record;
mod registry;
