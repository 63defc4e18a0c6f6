use std::time::Duration;

/// Default `maxChunkSizeBytes` for migrations when the caller passes none or 0.
pub const DEFAULT_MAX_CHUNK_SIZE_BYTES: u64 = 64 * 1024 * 1024;

/// Tunables shared by the coordinators.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identity written into lock leases.
    pub process_id: String,
    /// How long an admin operation waits for a contended lock.
    pub lock_wait: Duration,
    pub lock_retry_interval: Duration,
    /// Lease lifetime before another process may take a lock over.
    pub lock_ttl: Duration,
    pub max_chunk_size_bytes: u64,
    pub default_wait_for_delete: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            process_id: format!("holo-shard-{}", std::process::id()),
            lock_wait: Duration::from_secs(5),
            lock_retry_interval: Duration::from_millis(50),
            lock_ttl: Duration::from_secs(15 * 60),
            max_chunk_size_bytes: DEFAULT_MAX_CHUNK_SIZE_BYTES,
            default_wait_for_delete: false,
        }
    }
}

impl CoordinatorConfig {
    /// Effective chunk size limit for a request, treating 0 as unset.
    pub fn chunk_size_limit(&self, requested: Option<u64>) -> u64 {
        match requested {
            Some(bytes) if bytes > 0 => bytes,
            _ if self.max_chunk_size_bytes > 0 => self.max_chunk_size_bytes,
            _ => DEFAULT_MAX_CHUNK_SIZE_BYTES,
        }
    }
}
