//! Generic GPU-resource containers.
//!
//! - [`FixedSlotResource`]: append-only table of records at aligned strides,
//!   bound with dynamic offsets
//! - [`IndefiniteArrayResource`]: a base record plus an array of items in one
//!   storage buffer, updated by range
//!
//! Both are generic over [`GpuDevice`](lumen_rhi::GpuDevice), so they run
//! unchanged on the host-memory backend.

mod fixed_slot;
mod indefinite_array;

pub use fixed_slot::FixedSlotResource;
pub use indefinite_array::IndefiniteArrayResource;
