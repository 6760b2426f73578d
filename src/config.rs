//! Mount configuration.
//!
//! Assembled in `main` from CLI flags and environment variables, then owned
//! by the mount session. The inode cache bounds (`cache_cap`,
//! `cache_min_entries`) and `poll_time` are the knobs the engine itself
//! consumes; everything else configures the API layer.

/// Default background poll interval in seconds.
pub const DEFAULT_POLL_TIME: u64 = 15;

/// Default maximum resident inodes before eviction kicks in.
pub const DEFAULT_CACHE_CAP: usize = 4096;

/// Default floor below which eviction never shrinks the inode table.
pub const DEFAULT_CACHE_MIN_ENTRIES: usize = 128;

/// Default block cache budget (256 MiB).
pub const DEFAULT_BLOCK_CACHE_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Base URL of the Harbor API.
    pub api_url: String,
    /// Bearer token for API requests.
    pub api_token: String,
    /// Restrict magic-directory lookups to portable data hashes.
    pub pdh_only: bool,
    /// Seconds between background refresh cycles for dynamic directories.
    pub poll_time: u64,
    /// Principal UUID excluded from the shared-objects listing.
    pub exclude: Option<String>,
    /// Maximum resident inodes.
    pub cache_cap: usize,
    /// Eviction floor for the inode table.
    pub cache_min_entries: usize,
    /// Byte budget for the block content cache.
    pub block_cache_bytes: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:9400".to_string(),
            api_token: String::new(),
            pdh_only: false,
            poll_time: DEFAULT_POLL_TIME,
            exclude: None,
            cache_cap: DEFAULT_CACHE_CAP,
            cache_min_entries: DEFAULT_CACHE_MIN_ENTRIES,
            block_cache_bytes: DEFAULT_BLOCK_CACHE_BYTES,
        }
    }
}
