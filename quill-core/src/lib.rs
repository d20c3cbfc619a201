//! Shared task model used by the scheduling and storage layers: task
//! classification and bodies, completion tickets, and per-pool counters.

pub mod counters;
pub mod task;
pub mod ticket;
