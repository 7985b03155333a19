use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::mailbox::Mailbox;
use crate::types::{BlockState, Capabilities, ExitReason, MonitorRef, Pid, ResourceLimits};
use crate::vm::Vm;

/// A monitor this block holds on another block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorEntry {
    pub target: Pid,
    pub reference: MonitorRef,
}

/// A single lightweight process: the unit of scheduling and isolation.
///
/// The VM state behind `vm` is owned by whichever worker holds the block
/// in the Running state; everything else is shared and synchronized.
/// Following the single-writer discipline, `vm_mut` must only be called
/// by that worker (or by the scheduler before the block is first
/// enqueued and after it is Dead).
pub struct Block {
    pid: Pid,
    name: Option<String>,
    parent: Pid,
    caps: Capabilities,
    limits: ResourceLimits,
    pub mailbox: Mailbox,

    state: AtomicU8,
    vm: UnsafeCell<Vm>,

    links: Mutex<Vec<Pid>>,
    monitors: Mutex<Vec<MonitorEntry>>,
    monitored_by: Mutex<Vec<(Pid, MonitorRef)>>,

    pending_upgrade: AtomicBool,
    pending_kill: Mutex<Option<ExitReason>>,
    exit_reason: Mutex<Option<ExitReason>>,
    module: Mutex<Option<String>>,

    /// Absolute wake deadline in epoch ms for a pending receive-timeout;
    /// zero when none is armed.
    wake_deadline: AtomicU64,

    pub reductions: AtomicU64,
    pub msgs_sent: AtomicU64,
    pub msgs_received: AtomicU64,
    pub gc_cycles: AtomicU64,
}

// The UnsafeCell is confined to the worker that owns the Running state.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    pub fn new(
        pid: Pid,
        name: Option<String>,
        parent: Pid,
        caps: Capabilities,
        limits: ResourceLimits,
        vm: Vm,
    ) -> Block {
        Block {
            pid,
            name,
            parent,
            caps,
            limits,
            mailbox: Mailbox::new(),
            state: AtomicU8::new(BlockState::Runnable as u8),
            vm: UnsafeCell::new(vm),
            links: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            monitored_by: Mutex::new(Vec::new()),
            pending_upgrade: AtomicBool::new(false),
            pending_kill: Mutex::new(None),
            exit_reason: Mutex::new(None),
            module: Mutex::new(None),
            wake_deadline: AtomicU64::new(0),
            reductions: AtomicU64::new(0),
            msgs_sent: AtomicU64::new(0),
            msgs_received: AtomicU64::new(0),
            gc_cycles: AtomicU64::new(0),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> Pid {
        self.parent
    }

    pub fn caps(&self) -> Capabilities {
        self.caps
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn traps_exits(&self) -> bool {
        self.caps.contains(Capabilities::TRAP_EXIT)
    }

    // ─── Lifecycle ────────────────────────────────────────────

    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: BlockState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Transition `from` -> `to` if the block is still in `from`.
    pub fn transition(&self, from: BlockState, to: BlockState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Wake a Waiting block; true if this call won the transition and the
    /// caller must enqueue it.
    pub fn try_wake(&self) -> bool {
        self.transition(BlockState::Waiting, BlockState::Runnable)
    }

    pub fn is_dead(&self) -> bool {
        self.state() == BlockState::Dead
    }

    // ─── VM access ────────────────────────────────────────────

    /// Mutable VM access for the owning worker.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn vm_mut(&self) -> &mut Vm {
        &mut *self.vm.get()
    }

    // ─── Links ────────────────────────────────────────────────

    /// Insert a link to `other`, idempotently. Bidirectionality is the
    /// caller's job; the scheduler links both directions.
    pub fn link(&self, other: Pid) {
        let mut links = self.links.lock();
        if let Err(at) = links.binary_search(&other) {
            links.insert(at, other);
        }
    }

    /// Remove a link; removing an absent link is a no-op.
    pub fn unlink(&self, other: Pid) {
        let mut links = self.links.lock();
        if let Ok(at) = links.binary_search(&other) {
            links.remove(at);
        }
    }

    pub fn links(&self) -> Vec<Pid> {
        self.links.lock().clone()
    }

    pub fn is_linked_to(&self, other: Pid) -> bool {
        self.links.lock().binary_search(&other).is_ok()
    }

    pub(crate) fn take_links(&self) -> Vec<Pid> {
        std::mem::take(&mut *self.links.lock())
    }

    // ─── Monitors ─────────────────────────────────────────────

    pub fn add_monitor(&self, target: Pid, reference: MonitorRef) {
        self.monitors.lock().push(MonitorEntry { target, reference });
    }

    /// Drop the monitor with this reference; returns its target.
    pub fn remove_monitor(&self, reference: MonitorRef) -> Option<Pid> {
        let mut monitors = self.monitors.lock();
        let at = monitors.iter().position(|m| m.reference == reference)?;
        Some(monitors.remove(at).target)
    }

    pub fn monitors(&self) -> Vec<MonitorEntry> {
        self.monitors.lock().clone()
    }

    pub(crate) fn take_monitors(&self) -> Vec<MonitorEntry> {
        std::mem::take(&mut *self.monitors.lock())
    }

    pub fn add_watcher(&self, watcher: Pid, reference: MonitorRef) {
        self.monitored_by.lock().push((watcher, reference));
    }

    pub fn remove_watcher(&self, reference: MonitorRef) {
        self.monitored_by.lock().retain(|(_, r)| *r != reference);
    }

    pub(crate) fn take_watchers(&self) -> Vec<(Pid, MonitorRef)> {
        std::mem::take(&mut *self.monitored_by.lock())
    }

    // ─── Kill / upgrade flags ─────────────────────────────────

    /// Request termination; consumed at the next dispatch or safe point.
    pub fn request_kill(&self, reason: ExitReason) {
        let mut pending = self.pending_kill.lock();
        if pending.is_none() {
            *pending = Some(reason);
        }
    }

    pub fn has_pending_kill(&self) -> bool {
        self.pending_kill.lock().is_some()
    }

    pub(crate) fn take_pending_kill(&self) -> Option<ExitReason> {
        self.pending_kill.lock().take()
    }

    pub fn mark_pending_upgrade(&self) {
        self.pending_upgrade.store(true, Ordering::Release);
    }

    pub(crate) fn take_pending_upgrade(&self) -> bool {
        self.pending_upgrade.swap(false, Ordering::AcqRel)
    }

    // ─── Module association ───────────────────────────────────

    pub fn set_module(&self, name: Option<String>) {
        *self.module.lock() = name;
    }

    pub fn module(&self) -> Option<String> {
        self.module.lock().clone()
    }

    // ─── Exit bookkeeping ─────────────────────────────────────

    pub(crate) fn set_exit_reason(&self, reason: ExitReason) {
        let mut slot = self.exit_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason.lock().clone()
    }

    // ─── Receive timeout ──────────────────────────────────────

    pub fn arm_wake(&self, deadline_ms: u64) {
        self.wake_deadline.store(deadline_ms, Ordering::Release);
    }

    pub fn wake_deadline(&self) -> Option<u64> {
        match self.wake_deadline.load(Ordering::Acquire) {
            0 => None,
            d => Some(d),
        }
    }

    pub fn clear_wake(&self) {
        self.wake_deadline.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("mailbox_len", &self.mailbox.len())
            .finish()
    }
}
