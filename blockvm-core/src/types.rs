use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;

// ─── Scalar aliases ───────────────────────────────────────────

/// Bytecode address (instruction pointer offset within a chunk).
pub type Addr = usize;

/// Monitor reference identifier.
pub type MonitorRef = u64;

/// Epoch milliseconds (UTC).
pub type Timestamp = u64;

/// Current epoch time in milliseconds.
pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─── Pid ──────────────────────────────────────────────────────

/// Process identifier for a block. Opaque, monotonically increasing,
/// unique within one scheduler. Zero is reserved as the invalid PID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u64);

impl Pid {
    pub const INVALID: Pid = Pid(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<0.{}>", self.0)
    }
}

/// Issues monotonically increasing PIDs, starting at 1.
pub struct PidCounter(AtomicU64);

impl PidCounter {
    pub fn new() -> Self {
        PidCounter(AtomicU64::new(1))
    }

    pub fn next(&self) -> Pid {
        Pid(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for PidCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Capabilities ─────────────────────────────────────────────

bitflags::bitflags! {
    /// Permission mask gating sensitive opcodes. A block without the
    /// required bit fails the opcode with a capability error.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const SPAWN      = 1 << 0;
        const SEND       = 1 << 1;
        const RECEIVE    = 1 << 2;
        const FILE_READ  = 1 << 3;
        const FILE_WRITE = 1 << 4;
        const SHELL      = 1 << 5;
        const EXEC       = 1 << 6;
        const INFERENCE  = 1 << 7;
        const DB         = 1 << 8;
        const TRAP_EXIT  = 1 << 9;
        const MONITOR    = 1 << 10;
        const SUPERVISE  = 1 << 11;
    }
}

impl Capabilities {
    /// Default grant for `spawn`: messaging plus monitor, no I/O, no trap.
    pub fn standard() -> Self {
        Capabilities::SPAWN | Capabilities::SEND | Capabilities::RECEIVE | Capabilities::MONITOR
    }
}

// ─── Resource limits ──────────────────────────────────────────

/// Per-block resource ceilings, enforced at operation time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Soft cap on the block's private heap, in bytes.
    pub max_heap_bytes: usize,
    /// Maximum value-stack depth.
    pub max_stack_depth: usize,
    /// Maximum call-frame depth.
    pub max_call_depth: usize,
    /// Reduction quantum granted per dispatch.
    pub max_reductions: u64,
    /// Mailbox capacity; pushes beyond this are rejected.
    pub max_mailbox: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            max_heap_bytes: 16 * 1024 * 1024,
            max_stack_depth: 4096,
            max_call_depth: 256,
            max_reductions: 2000,
            max_mailbox: 10_000,
        }
    }
}

// ─── Scheduler configuration ──────────────────────────────────

/// Embedder-supplied runtime configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker OS threads. Zero selects single-threaded mode, where the
    /// scheduler drives one VM synchronously via `run`/`step`.
    pub num_workers: usize,
    /// Hard cap on live blocks; `spawn` fails beyond it.
    pub max_blocks: usize,
    /// Default reduction quantum for blocks without an override.
    pub default_reductions: u64,
    /// Whether idle workers steal from peers.
    pub enable_stealing: bool,
    /// Keep dead blocks addressable for post-mortem inspection. A
    /// debugging aid; leave off for long-running systems.
    #[serde(default)]
    pub retain_dead: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            num_workers: num_cpus::get(),
            max_blocks: 1_048_576,
            default_reductions: 2000,
            enable_stealing: true,
            retain_dead: false,
        }
    }
}

impl SchedulerConfig {
    /// Single-threaded configuration, useful for deterministic tests.
    pub fn single_threaded() -> Self {
        SchedulerConfig {
            num_workers: 0,
            ..Default::default()
        }
    }
}

// ─── Block lifecycle ──────────────────────────────────────────

/// Lifecycle state of a block.
///
/// A Running block is held by exactly one worker; a Waiting block is in
/// no run queue; Dead is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    Runnable = 0,
    Running = 1,
    Waiting = 2,
    Dead = 3,
}

impl BlockState {
    pub fn from_u8(v: u8) -> BlockState {
        match v {
            0 => BlockState::Runnable,
            1 => BlockState::Running,
            2 => BlockState::Waiting,
            _ => BlockState::Dead,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == BlockState::Dead
    }
}

// ─── Exit reasons ─────────────────────────────────────────────

/// Why a block terminated.
#[derive(Clone, Debug, PartialEq)]
pub enum ExitReason {
    /// The block halted on its own.
    Normal,
    /// Explicitly killed via `Scheduler::kill`.
    Killed,
    /// A runtime error ended the block.
    Error(String),
    /// A linked block exited abnormally, propagating its reason.
    Linked(Pid, Box<ExitReason>),
}

impl ExitReason {
    /// Abnormal exits kill linked non-trapping blocks; normal ones do not.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, ExitReason::Normal)
    }

    /// Short tag used in exit/down message payloads.
    pub fn describe(&self) -> String {
        match self {
            ExitReason::Normal => "normal".to_string(),
            ExitReason::Killed => "killed".to_string(),
            ExitReason::Error(e) => format!("error: {e}"),
            ExitReason::Linked(pid, inner) => format!("linked: {} {}", pid, inner.describe()),
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────

/// Tag distinguishing ordinary messages from system notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Ordinary guest-level payload.
    User,
    /// Exit notification delivered to a trapping linked block.
    Exit,
    /// Monitor down notification.
    Down,
    /// Module upgrade notification.
    Upgrade,
}

/// One mailbox entry.
#[derive(Clone, Debug)]
pub struct Message {
    pub sender: Pid,
    pub payload: Value,
    pub kind: MessageKind,
}

impl Message {
    pub fn user(sender: Pid, payload: Value) -> Self {
        Message {
            sender,
            payload,
            kind: MessageKind::User,
        }
    }
}

// ─── Runtime statistics ───────────────────────────────────────

/// Aggregated scheduler counters, snapshotted on demand.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_spawned: u64,
    pub total_terminated: u64,
    pub live_blocks: usize,
    pub blocks_executed: u64,
    pub steal_attempts: u64,
    pub steals_won: u64,
    pub total_reductions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_counter_is_monotonic() {
        let c = PidCounter::new();
        let a = c.next();
        let b = c.next();
        assert!(a.is_valid());
        assert!(b.0 > a.0);
    }

    #[test]
    fn invalid_pid_is_zero() {
        assert_eq!(Pid::INVALID.as_u64(), 0);
        assert!(!Pid::INVALID.is_valid());
    }

    #[test]
    fn standard_caps_exclude_io_and_trap() {
        let caps = Capabilities::standard();
        assert!(caps.contains(Capabilities::SEND));
        assert!(caps.contains(Capabilities::RECEIVE));
        assert!(!caps.contains(Capabilities::SHELL));
        assert!(!caps.contains(Capabilities::TRAP_EXIT));
    }

    #[test]
    fn normal_exit_is_not_abnormal() {
        assert!(!ExitReason::Normal.is_abnormal());
        assert!(ExitReason::Killed.is_abnormal());
        assert!(ExitReason::Error("boom".into()).is_abnormal());
    }
}
