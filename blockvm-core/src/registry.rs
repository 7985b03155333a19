use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::Block;
use crate::error::SpawnError;
use crate::types::{Pid, PidCounter};

/// Number of buckets; must be a power of two.
const SHARD_COUNT: usize = 64;

/// Concurrent PID → block map, sharded by the low PID bits so lookups on
/// different shards never contend. Reads take a shard read lock; inserts
/// and removals a shard write lock.
pub struct Registry {
    shards: Vec<RwLock<HashMap<u64, Arc<Block>>>>,
    count: AtomicUsize,
    max_blocks: usize,
    pids: PidCounter,
}

impl Registry {
    pub fn new(max_blocks: usize) -> Registry {
        Registry {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            count: AtomicUsize::new(0),
            max_blocks,
            pids: PidCounter::new(),
        }
    }

    /// Issue the next PID. Strictly monotonic within one registry.
    pub fn next_pid(&self) -> Pid {
        self.pids.next()
    }

    fn shard(&self, pid: Pid) -> &RwLock<HashMap<u64, Arc<Block>>> {
        &self.shards[(pid.as_u64() as usize) & (SHARD_COUNT - 1)]
    }

    pub fn insert(&self, block: Arc<Block>) -> Result<(), SpawnError> {
        // Reserve a count slot first so concurrent inserts cannot blow
        // past the cap.
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        if prev >= self.max_blocks {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(SpawnError::MaxBlocks);
        }
        let pid = block.pid();
        self.shard(pid).write().insert(pid.as_u64(), block);
        Ok(())
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Block>> {
        if !pid.is_valid() {
            return None;
        }
        self.shard(pid).read().get(&pid.as_u64()).cloned()
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<Block>> {
        let removed = self.shard(pid).write().remove(&pid.as_u64());
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Snapshot of all live blocks, across shards.
    pub fn all(&self) -> Vec<Arc<Block>> {
        let mut out = Vec::with_capacity(self.count());
        for shard in &self.shards {
            out.extend(shard.read().values().cloned());
        }
        out
    }
}
