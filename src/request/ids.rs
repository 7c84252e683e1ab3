use std::sync::atomic::{AtomicU64, Ordering};

// Shared by every connection and shard thread in the process.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Generates ids that are unique across the whole run.
///
/// The counter makes ids unique within a process; the random prefix keeps
/// shards running in separate processes from colliding.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    prefix: String,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            prefix: format!("{:08x}", rand::random::<u32>()),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn next_id(&self) -> String {
        format!("{}-{}", self.prefix, NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
