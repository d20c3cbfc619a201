//! Concurrency core of the quill storage engine: task admission and routing,
//! deadlock-free named-resource locking, and group-commit orchestration.
//!
//! Historical and read-committed tasks run with full concurrency. The active
//! phase of read-write transactions runs concurrently across transactions and
//! serializes per isolated index within one transaction. Unisolated writers
//! predeclare their lock sets, execute single-threaded per live index, and
//! become durable in coalesced commit groups that share one journal sync.

pub mod group;
pub mod locks;
pub mod manager;
pub mod pool;
pub mod sampler;

mod context;
mod write;

pub use manager::{ConcurrencyManager, ManagerCounters};

#[cfg(test)]
mod tests;
