//! Protocol constants and tuning parameters.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Application name sent in the AP field of BINF.
pub const CLIENT_APP: &str = "radc";

/// Application version sent in the VE field of BINF.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Hashing
// ============================================================================

/// Width in bytes of one Tiger digest (one tree leaf, and the root).
pub const LEAF_WIDTH: usize = 24;

/// Bytes of file data hashed into one tree leaf.
pub const LEAF_BLOCK_SIZE: usize = 1024;

// ============================================================================
// Transfer tuning
// ============================================================================

/// First chunk size a download worker requests from a peer.
pub const INITIAL_REQUEST_SIZE: u64 = 64 * 1024;

/// Largest request a worker will grow to (the wire size field is 32-bit).
pub const MAX_REQUEST_SIZE: u64 = 1 << 32;

/// Smallest request a worker will shrink to.
pub const MIN_REQUEST_SIZE: u64 = 1;

/// A chunk that completes faster than this doubles the request size.
pub const REQUEST_GROW_THRESHOLD: Duration = Duration::from_secs(60);

/// A chunk that completes slower than this halves the request size.
pub const REQUEST_SHRINK_THRESHOLD: Duration = Duration::from_secs(4 * 60);

// ============================================================================
// Channel capacities
// ============================================================================

/// Bounded search result channel; results past this are dropped.
pub const SEARCH_RESULT_CAPACITY: usize = 256;

/// Hub client error channel depth.
pub const ERROR_CHANNEL_CAPACITY: usize = 8;
