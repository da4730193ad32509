//! Shared counters for admission control, build quotas and usage stats.
//!
//! Everything here sits on an [`AccountingStore`]: a small key/value store of
//! integer counters with optional expiry and atomic update primitives.
//! [`MemoryStore`] lives in one process; [`FileStore`] is shared by every
//! process pointed at the same file.

pub mod admission;
pub mod error;
pub mod file_store;
pub mod keys;
pub mod ledger;
pub mod store;
pub mod usage;

pub use {
    admission::{AdmissionGate, AdmissionPermit},
    error::{Error, Result},
    file_store::FileStore,
    ledger::BuildLedger,
    store::{AccountingStore, MemoryStore},
    usage::{UsageRecorder, UsageStats},
};
