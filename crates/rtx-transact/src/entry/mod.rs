//! Per-transaction state of individual resources and task sets.
//!
//! An entry is plain data plus an operational strategy chosen when it is
//! materialized:
//!
//! - **absent**: the key does not exist; reads report "not present" and
//!   mutations are rejected
//! - **read-only**: proxies committed state; mutations are rejected
//! - **copy-on-write**: reads fall through to committed state until the
//!   first mutation clones it into a private overlay
//!
//! Only copy-on-write entries that diverged from committed state are
//! flushed on commit.

mod resource;
mod task;

pub use resource::ResourceEntry;
pub use task::TaskEntry;
