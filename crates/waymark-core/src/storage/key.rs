//! Identifier and timestamp helpers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Generate a process-unique, time-ordered identifier.
///
/// Layout: `[timestamp_us (8 bytes, big-endian)][counter (8 bytes, big-endian)]`,
/// so byte order matches creation order.
pub fn generate_id() -> [u8; 16] {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

    let mut id = [0u8; 16];
    id[..8].copy_from_slice(&current_timestamp().to_be_bytes());
    id[8..].copy_from_slice(&counter.to_be_bytes());
    id
}
