//! Foundational low-level utilities shared across Rift crates.
//!
//! Provides the atomic file-write helper used for the mirror snapshot, the
//! size-rotated append-only audit log, and time helpers for retention math.

pub mod atomic_io;
pub mod audit_log;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use audit_log::{format_audit_line, AuditLog, AuditRotationPolicy};
pub use time_utils::{current_unix_timestamp_ms, format_iso8601, retention_remaining};
