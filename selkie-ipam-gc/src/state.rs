//! In-memory view of the IPAM datastore maintained by the controller.
//!
//! All types here are exclusively owned by the reconciliation task. External
//! producers never touch them; they push update messages through channels and
//! the task mutates these caches in response.

pub mod allocation;
pub mod allocations;
pub mod blocks;
pub mod handles;
pub mod pools;

pub use allocation::Allocation;
pub use allocations::AllocationState;
pub use blocks::BlockReleaseTracker;
pub use handles::HandleTracker;
pub use pools::PoolManager;
