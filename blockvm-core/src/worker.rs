use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_deque::{Steal, Stealer, Worker as Deque};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::block::Block;
use crate::scheduler::Scheduler;

/// Worker lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

/// Per-worker counters, shared with the scheduler for aggregation.
pub struct WorkerStats {
    pub executed: AtomicU64,
    pub steal_attempts: AtomicU64,
    pub steals_won: AtomicU64,
    pub reductions: AtomicU64,
    state: AtomicU8,
}

impl WorkerStats {
    pub fn new() -> WorkerStats {
        WorkerStats {
            executed: AtomicU64::new(0),
            steal_attempts: AtomicU64::new(0),
            steals_won: AtomicU64::new(0),
            reductions: AtomicU64::new(0),
            state: AtomicU8::new(WorkerState::Idle as u8),
        }
    }

    pub fn state(&self) -> WorkerState {
        match self.state.load(Ordering::Acquire) {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            _ => WorkerState::Stopped,
        }
    }

    fn set_state(&self, s: WorkerState) {
        self.state.store(s as u8, Ordering::Release);
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Park interval when a worker finds nothing to do anywhere.
const IDLE_PARK: Duration = Duration::from_micros(100);
/// Spins before the worker starts parking.
const SPIN_LIMIT: u32 = 16;

/// Worker thread body: pop local work, fall back to the global queue,
/// then to stealing from a random peer, then park briefly.
///
/// The local deque is FIFO for its owner while thieves take from the
/// opposite end, so hot blocks keep their worker and cold blocks migrate.
pub(crate) fn worker_main(
    id: usize,
    sched: Arc<Scheduler>,
    local: Deque<Arc<Block>>,
    stealers: Vec<Stealer<Arc<Block>>>,
    stats: Arc<WorkerStats>,
) {
    // Weak, deterministic per-worker RNG; only victim choice depends on it.
    let mut rng = SmallRng::seed_from_u64(id as u64 ^ 0x5eed);
    let mut spins = 0u32;

    trace!(worker = id, "worker started");
    while !sched.should_stop() {
        let block = local
            .pop()
            .or_else(|| sched.steal_global(&local))
            .or_else(|| {
                if sched.config().enable_stealing && stealers.len() > 1 {
                    steal_peer(id, &stealers, &mut rng, &stats)
                } else {
                    None
                }
            });

        match block {
            Some(block) => {
                spins = 0;
                stats.set_state(WorkerState::Running);
                sched.execute_one(block, Some(&local), Some(&stats));
            }
            None => {
                stats.set_state(WorkerState::Idle);
                spins += 1;
                if spins < SPIN_LIMIT {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(IDLE_PARK);
                }
            }
        }
    }

    // Hand unfinished local work back so nothing is stranded.
    while let Some(block) = local.pop() {
        sched.reinject(block);
    }
    stats.set_state(WorkerState::Stopped);
    trace!(worker = id, "worker stopped");
}

fn steal_peer(
    id: usize,
    stealers: &[Stealer<Arc<Block>>],
    rng: &mut SmallRng,
    stats: &WorkerStats,
) -> Option<Arc<Block>> {
    let victim = rng.gen_range(0..stealers.len());
    if victim == id {
        return None;
    }
    stats.steal_attempts.fetch_add(1, Ordering::Relaxed);
    loop {
        match stealers[victim].steal() {
            Steal::Success(block) => {
                stats.steals_won.fetch_add(1, Ordering::Relaxed);
                trace!(thief = id, victim, "stole block");
                return Some(block);
            }
            Steal::Empty => return None,
            Steal::Retry => {}
        }
    }
}
