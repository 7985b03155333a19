use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Worker as Deque};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::block::Block;
use crate::bytecode::Bytecode;
use crate::checkpoint::Checkpoint;
use crate::error::{RegistryError, SendError};
use crate::module::ModuleRegistry;
use crate::registry::Registry;
use crate::types::{
    now_ms, BlockState, Capabilities, ExitReason, Message, MessageKind, MonitorRef, Pid,
    ResourceLimits, SchedulerConfig, SchedulerStats,
};
use crate::value::{Str, StructObj, Value};
use crate::vm::{NoopHooks, PrimitiveHooks, RunOutcome, Vm};
use crate::worker::{worker_main, WorkerStats};

/// Snapshot of one block's observable state, for diagnostics and tests.
/// The VM-derived fields are read best-effort; a Running block reports
/// `stack_top` as None.
#[derive(Clone, Debug)]
pub struct BlockInspection {
    pub pid: Pid,
    pub name: Option<String>,
    pub state: BlockState,
    pub mailbox_len: usize,
    pub reductions: u64,
    pub msgs_sent: u64,
    pub msgs_received: u64,
    pub links: Vec<Pid>,
    pub stack_top: Option<Value>,
    pub globals: Vec<(String, Value)>,
    pub exit_reason: Option<ExitReason>,
}

/// Owns the workers, the registry, the name and group tables, and the
/// module registry. Spawns blocks, routes messages, propagates exits.
///
/// With `num_workers == 0` the scheduler runs single-threaded: `run` and
/// `step` drive one VM synchronously on the calling thread.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Registry,
    names: Mutex<HashMap<String, Pid>>,
    groups: RwLock<HashMap<String, Mutex<Vec<Pid>>>>,
    modules: ModuleRegistry,
    hooks: RwLock<Arc<dyn PrimitiveHooks>>,

    injector: Injector<Arc<Block>>,
    /// Blocks sitting in the global queue or a worker deque.
    queued: AtomicUsize,
    /// Blocks currently held by a worker.
    executing: AtomicUsize,

    /// (deadline ms, pid) entries for armed receive timeouts.
    timers: Mutex<BinaryHeap<Reverse<(u64, u64)>>>,
    monitor_refs: AtomicU64,

    stop: AtomicBool,
    running: AtomicBool,

    total_spawned: AtomicU64,
    total_terminated: AtomicU64,
    executed: AtomicU64,
    reductions: AtomicU64,
    worker_stats: RwLock<Vec<Arc<WorkerStats>>>,

    /// Post-mortem store, populated only when the config retains dead
    /// blocks for inspection.
    dead: Mutex<HashMap<u64, Arc<Block>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Scheduler> {
        debug!(
            workers = config.num_workers,
            max_blocks = config.max_blocks,
            quantum = config.default_reductions,
            stealing = config.enable_stealing,
            "scheduler created"
        );
        Arc::new(Scheduler {
            registry: Registry::new(config.max_blocks),
            names: Mutex::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            modules: ModuleRegistry::new(),
            hooks: RwLock::new(Arc::new(NoopHooks)),
            injector: Injector::new(),
            queued: AtomicUsize::new(0),
            executing: AtomicUsize::new(0),
            timers: Mutex::new(BinaryHeap::new()),
            monitor_refs: AtomicU64::new(1),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            total_spawned: AtomicU64::new(0),
            total_terminated: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            reductions: AtomicU64::new(0),
            worker_stats: RwLock::new(Vec::new()),
            dead: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Install the embedder's unsafe-primitive hooks.
    pub fn set_hooks(&self, hooks: Arc<dyn PrimitiveHooks>) {
        *self.hooks.write() = hooks;
    }

    pub(crate) fn hooks(&self) -> Arc<dyn PrimitiveHooks> {
        self.hooks.read().clone()
    }

    // ─── Spawning ─────────────────────────────────────────────

    /// Spawn a block running `code`'s main chunk with the standard
    /// capability grant. Returns `Pid::INVALID` on failure.
    pub fn spawn(&self, code: Arc<Bytecode>, name: Option<&str>) -> Pid {
        let limits = ResourceLimits {
            max_reductions: self.config.default_reductions,
            ..Default::default()
        };
        self.spawn_ex(code, name, Capabilities::standard(), limits)
    }

    /// Spawn with explicit capabilities and limits.
    pub fn spawn_ex(
        &self,
        code: Arc<Bytecode>,
        name: Option<&str>,
        caps: Capabilities,
        limits: ResourceLimits,
    ) -> Pid {
        let vm = Vm::new(code);
        self.spawn_inner(vm, name, Pid::INVALID, caps, limits)
    }

    /// SPAWN opcode path: child runs `entry` (function or closure, deep
    /// copied into the child's heap) and inherits the parent's sandbox.
    pub(crate) fn spawn_child(&self, parent: &Block, code: Arc<Bytecode>, entry: Value) -> Pid {
        let vm = match Vm::with_entry(code, entry.deep_copy()) {
            Ok(vm) => vm,
            Err(e) => {
                warn!(parent = parent.pid().as_u64(), error = %e, "spawn rejected");
                return Pid::INVALID;
            }
        };
        self.spawn_inner(vm, None, parent.pid(), parent.caps(), *parent.limits())
    }

    fn spawn_inner(
        &self,
        mut vm: Vm,
        name: Option<&str>,
        parent: Pid,
        caps: Capabilities,
        limits: ResourceLimits,
    ) -> Pid {
        vm.set_limits(
            limits.max_stack_depth,
            limits.max_call_depth,
            limits.max_heap_bytes,
        );

        // Reserve the name before paying for the block.
        if let Some(name) = name {
            let mut names = self.names.lock();
            if names.contains_key(name) {
                warn!(name, "spawn rejected: name taken");
                return Pid::INVALID;
            }
            let pid = self.registry.next_pid();
            let block = Arc::new(Block::new(
                pid,
                Some(name.to_string()),
                parent,
                caps,
                limits,
                vm,
            ));
            if self.registry.insert(block.clone()).is_err() {
                warn!("spawn rejected: block limit reached");
                return Pid::INVALID;
            }
            names.insert(name.to_string(), pid);
            drop(names);
            self.finish_spawn(block);
            return pid;
        }

        let pid = self.registry.next_pid();
        let block = Arc::new(Block::new(pid, None, parent, caps, limits, vm));
        if self.registry.insert(block.clone()).is_err() {
            warn!("spawn rejected: block limit reached");
            return Pid::INVALID;
        }
        self.finish_spawn(block);
        pid
    }

    fn finish_spawn(&self, block: Arc<Block>) {
        self.total_spawned.fetch_add(1, Ordering::Relaxed);
        trace!(pid = block.pid().as_u64(), "spawned block");
        self.enqueue(block);
    }

    // ─── Run queue ────────────────────────────────────────────

    /// Place a runnable block on the global queue.
    pub fn enqueue(&self, block: Arc<Block>) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.injector.push(block);
    }

    /// Take one block off the global queue.
    pub fn dequeue(&self) -> Option<Arc<Block>> {
        loop {
            match self.injector.steal() {
                Steal::Success(block) => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    return Some(block);
                }
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    pub(crate) fn steal_global(&self, local: &Deque<Arc<Block>>) -> Option<Arc<Block>> {
        loop {
            match self.injector.steal_batch_and_pop(local) {
                Steal::Success(block) => return Some(block),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    pub(crate) fn reinject(&self, block: Arc<Block>) {
        self.injector.push(block);
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    // ─── Execution ────────────────────────────────────────────

    /// Run one block for one quantum and act on the outcome. `local` is
    /// the caller's deque for re-enqueueing, when the caller is a worker.
    pub(crate) fn execute_one(
        &self,
        block: Arc<Block>,
        local: Option<&Deque<Arc<Block>>>,
        stats: Option<&WorkerStats>,
    ) {
        // Claim the executing slot before releasing the queued one so the
        // quiescence check never sees the block in neither counter.
        self.executing.fetch_add(1, Ordering::AcqRel);
        self.queued.fetch_sub(1, Ordering::AcqRel);

        if block.is_dead() {
            self.executing.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        block.set_state(BlockState::Running);

        // Kill bit is observed at dispatch, before any opcode runs.
        if let Some(reason) = block.take_pending_kill() {
            self.exit_block(&block, reason);
            self.executing.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        let budget = block.limits().max_reductions;
        let before = block.reductions.load(Ordering::Relaxed);
        let vm = unsafe { block.vm_mut() };
        let outcome = vm.run(&block, self, budget);
        let used = block.reductions.load(Ordering::Relaxed) - before;

        self.executed.fetch_add(1, Ordering::Relaxed);
        self.reductions.fetch_add(used, Ordering::Relaxed);
        if let Some(stats) = stats {
            stats.executed.fetch_add(1, Ordering::Relaxed);
            stats.reductions.fetch_add(used, Ordering::Relaxed);
        }

        match outcome {
            Ok(RunOutcome::Yielded) => {
                block.set_state(BlockState::Runnable);
                self.queued.fetch_add(1, Ordering::AcqRel);
                match local {
                    Some(deque) => deque.push(block),
                    None => self.injector.push(block),
                }
            }
            Ok(RunOutcome::Waiting) => {
                block.set_state(BlockState::Waiting);
                // Re-check after publishing Waiting: a message, kill, or
                // due timer that raced the transition must not be lost.
                let due = block.wake_deadline().map(|d| now_ms() >= d).unwrap_or(false);
                if (!block.mailbox.is_empty() || block.has_pending_kill() || due)
                    && block.try_wake()
                {
                    self.enqueue(block);
                }
            }
            Ok(RunOutcome::Halted) => {
                self.exit_block(&block, ExitReason::Normal);
            }
            Ok(RunOutcome::Killed) => {
                let reason = block.take_pending_kill().unwrap_or(ExitReason::Killed);
                self.exit_block(&block, reason);
            }
            Err(e) => {
                debug!(pid = block.pid().as_u64(), error = %e, "block errored");
                self.exit_block(&block, ExitReason::Error(e.to_string()));
            }
        }
        self.executing.fetch_sub(1, Ordering::AcqRel);
    }

    /// Advance one block by one quantum. Returns whether any work was
    /// done.
    pub fn step(&self) -> bool {
        self.fire_due_timers();
        match self.dequeue() {
            Some(block) => {
                // dequeue already decremented the queue count; execute_one
                // decrements again, so rebalance first.
                self.queued.fetch_add(1, Ordering::AcqRel);
                self.execute_one(block, None, None);
                true
            }
            None => false,
        }
    }

    /// Drive the runtime until all runnable work is drained.
    ///
    /// Multi-threaded mode starts the workers, services timers, and
    /// returns once queues are empty, no worker holds a block, and no
    /// timer is armed. Single-threaded mode loops `step` on the caller.
    pub fn run(self: &Arc<Self>) {
        self.stop.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);

        if self.config.num_workers == 0 {
            loop {
                if self.should_stop() {
                    break;
                }
                if self.step() {
                    continue;
                }
                if self.has_pending_timers() {
                    std::thread::sleep(Duration::from_micros(500));
                    continue;
                }
                break;
            }
            self.running.store(false, Ordering::Release);
            return;
        }

        let mut locals = Vec::with_capacity(self.config.num_workers);
        for _ in 0..self.config.num_workers {
            locals.push(Deque::new_fifo());
        }
        let stealers: Vec<_> = locals.iter().map(|d| d.stealer()).collect();

        let mut handles = Vec::with_capacity(locals.len());
        for (id, local) in locals.into_iter().enumerate() {
            let stats = Arc::new(WorkerStats::new());
            self.worker_stats.write().push(stats.clone());
            let sched = self.clone();
            let stealers = stealers.clone();
            let handle = std::thread::Builder::new()
                .name(format!("blockvm-worker-{id}"))
                .spawn(move || worker_main(id, sched, local, stealers, stats))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        loop {
            self.fire_due_timers();
            if self.should_stop() {
                break;
            }
            let idle = self.queued.load(Ordering::Acquire) == 0
                && self.executing.load(Ordering::Acquire) == 0;
            if idle && !self.has_pending_timers() {
                break;
            }
            std::thread::sleep(Duration::from_micros(200));
        }

        self.stop.store(true, Ordering::Release);
        for handle in handles {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::Release);
        debug!("scheduler drained");
    }

    /// Signal workers to halt between blocks, and wait for the run loop
    /// to wind down.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // ─── Lookup ───────────────────────────────────────────────

    pub fn get_block(&self, pid: Pid) -> Option<Arc<Block>> {
        self.registry.get(pid)
    }

    pub fn block_count(&self) -> usize {
        self.registry.count()
    }

    /// Observable state of a live or (when retained) dead block.
    pub fn inspect(&self, pid: Pid) -> Option<BlockInspection> {
        let block = self
            .registry
            .get(pid)
            .or_else(|| self.dead.lock().get(&pid.as_u64()).cloned())?;
        let state = block.state();
        let (stack_top, globals) = if state == BlockState::Running {
            (None, Vec::new())
        } else {
            let vm = unsafe { block.vm_mut() };
            let mut globals: Vec<(String, Value)> = vm
                .globals
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            globals.sort_by(|a, b| a.0.cmp(&b.0));
            (vm.stack_top(), globals)
        };
        Some(BlockInspection {
            pid: block.pid(),
            name: block.name().map(str::to_string),
            state,
            mailbox_len: block.mailbox.len(),
            reductions: block.reductions.load(Ordering::Relaxed),
            msgs_sent: block.msgs_sent.load(Ordering::Relaxed),
            msgs_received: block.msgs_received.load(Ordering::Relaxed),
            links: block.links(),
            stack_top,
            globals,
            exit_reason: block.exit_reason(),
        })
    }

    // ─── Messaging ────────────────────────────────────────────

    /// Deliver `payload` to `to`, waking it if it was waiting. The value
    /// is deep-copied across the heap boundary.
    pub fn send(&self, from: Pid, to: Pid, payload: Value) -> Result<(), SendError> {
        let target = self
            .registry
            .get(to)
            .ok_or(SendError::UnknownPid(to.as_u64()))?;
        if target.is_dead() {
            return Err(SendError::DeadTarget);
        }
        let payload = payload.deep_copy();
        target.mailbox.push(
            Message::user(from, payload),
            target.limits().max_mailbox,
        )?;
        if let Some(sender) = self.registry.get(from) {
            sender.msgs_sent.fetch_add(1, Ordering::Relaxed);
        }
        if target.try_wake() {
            self.enqueue(target);
        }
        Ok(())
    }

    pub fn send_named(&self, from: Pid, name: &str, payload: Value) -> Result<(), SendError> {
        let to = self
            .whereis(name)
            .ok_or_else(|| SendError::UnknownName(name.to_string()))?;
        self.send(from, to, payload)
    }

    /// Broadcast to a group; returns how many members accepted delivery.
    pub fn send_group(&self, from: Pid, group: &str, payload: &Value) -> usize {
        let members = self.group_members(group);
        let mut delivered = 0;
        for pid in members {
            if self.send(from, pid, payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    // ─── Names ────────────────────────────────────────────────

    pub fn register_name(&self, name: &str, pid: Pid) -> Result<(), RegistryError> {
        let mut names = self.names.lock();
        if names.contains_key(name) {
            return Err(RegistryError::NameTaken(name.to_string()));
        }
        names.insert(name.to_string(), pid);
        Ok(())
    }

    pub fn whereis(&self, name: &str) -> Option<Pid> {
        self.names.lock().get(name).copied()
    }

    pub fn unregister_name(&self, name: &str) -> Result<(), RegistryError> {
        self.names
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NameNotFound(name.to_string()))
    }

    // ─── Process groups ───────────────────────────────────────

    pub fn group_join(&self, group: &str, pid: Pid) -> bool {
        if self.registry.get(pid).is_none() {
            return false;
        }
        {
            let groups = self.groups.read();
            if let Some(members) = groups.get(group) {
                let mut members = members.lock();
                if !members.contains(&pid) {
                    members.push(pid);
                }
                return true;
            }
        }
        let mut groups = self.groups.write();
        groups
            .entry(group.to_string())
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .push(pid);
        true
    }

    pub fn group_leave(&self, group: &str, pid: Pid) -> bool {
        let groups = self.groups.read();
        match groups.get(group) {
            Some(members) => {
                let mut members = members.lock();
                let before = members.len();
                members.retain(|p| *p != pid);
                members.len() != before
            }
            None => false,
        }
    }

    pub fn group_members(&self, group: &str) -> Vec<Pid> {
        let groups = self.groups.read();
        groups
            .get(group)
            .map(|m| m.lock().clone())
            .unwrap_or_default()
    }

    // ─── Links and monitors ───────────────────────────────────

    /// Establish a bidirectional link. False if either side is gone.
    pub fn link(&self, a: Pid, b: Pid) -> bool {
        let (Some(ba), Some(bb)) = (self.registry.get(a), self.registry.get(b)) else {
            return false;
        };
        if ba.is_dead() || bb.is_dead() {
            return false;
        }
        ba.link(b);
        bb.link(a);
        true
    }

    /// Remove both directions of a link.
    pub fn unlink(&self, a: Pid, b: Pid) {
        if let Some(block) = self.registry.get(a) {
            block.unlink(b);
        }
        if let Some(block) = self.registry.get(b) {
            block.unlink(a);
        }
    }

    /// Start monitoring `target`. If the target is already gone the down
    /// notification is delivered immediately.
    pub fn monitor(&self, watcher: Pid, target: Pid) -> MonitorRef {
        let reference = self.monitor_refs.fetch_add(1, Ordering::Relaxed);
        let watcher_block = match self.registry.get(watcher) {
            Some(b) => b,
            None => return reference,
        };
        match self.registry.get(target) {
            Some(target_block) if !target_block.is_dead() => {
                watcher_block.add_monitor(target, reference);
                target_block.add_watcher(watcher, reference);
            }
            _ => {
                watcher_block
                    .mailbox
                    .push_system(down_message(target, reference, &ExitReason::Normal));
                if watcher_block.try_wake() {
                    self.enqueue(watcher_block);
                }
            }
        }
        reference
    }

    pub fn demonitor(&self, watcher: Pid, reference: MonitorRef) {
        if let Some(watcher_block) = self.registry.get(watcher) {
            if let Some(target) = watcher_block.remove_monitor(reference) {
                if let Some(target_block) = self.registry.get(target) {
                    target_block.remove_watcher(reference);
                }
            }
        }
    }

    // ─── Kill and exit propagation ────────────────────────────

    /// Mark `pid` for termination; the mark is observed at the block's
    /// next dispatch or safe point.
    pub fn kill(&self, pid: Pid) -> bool {
        match self.registry.get(pid) {
            Some(block) if !block.is_dead() => {
                block.request_kill(ExitReason::Killed);
                if block.try_wake() {
                    self.enqueue(block);
                }
                true
            }
            _ => false,
        }
    }

    /// Terminate a block: drain its mailbox, retire its registrations,
    /// and notify links and monitors per the exit rules. Abnormal exits
    /// kill non-trapping linked blocks; trapping blocks get an exit
    /// message instead. Monitors always get a down message.
    pub(crate) fn exit_block(&self, block: &Arc<Block>, reason: ExitReason) {
        if block.is_dead() {
            return;
        }
        block.set_state(BlockState::Dead);
        block.set_exit_reason(reason.clone());
        block.clear_wake();
        block.mailbox.drain();

        let pid = block.pid();
        self.registry.remove(pid);
        if let Some(name) = block.name() {
            let mut names = self.names.lock();
            if names.get(name) == Some(&pid) {
                names.remove(name);
            }
        }
        {
            let groups = self.groups.read();
            for members in groups.values() {
                members.lock().retain(|p| *p != pid);
            }
        }
        if let Some(module) = block.module() {
            self.modules.unregister_block(&module, pid);
        }
        self.total_terminated.fetch_add(1, Ordering::Relaxed);
        debug!(pid = pid.as_u64(), reason = %reason.describe(), "block exited");

        // Withdraw monitors this block held on others.
        for entry in block.take_monitors() {
            if let Some(target) = self.registry.get(entry.target) {
                target.remove_watcher(entry.reference);
            }
        }

        // Down notifications to watchers.
        for (watcher, reference) in block.take_watchers() {
            if let Some(watcher_block) = self.registry.get(watcher) {
                watcher_block.remove_monitor(reference);
                watcher_block
                    .mailbox
                    .push_system(down_message(pid, reference, &reason));
                if watcher_block.try_wake() {
                    self.enqueue(watcher_block);
                }
            }
        }

        // Exit signals along links. Propagation is not recursive here:
        // a killed partner is marked and reaped at its own dispatch.
        for linked in block.take_links() {
            let Some(partner) = self.registry.get(linked) else {
                continue;
            };
            partner.unlink(pid);
            if partner.traps_exits() {
                partner.mailbox.push_system(exit_message(pid, &reason));
                if partner.try_wake() {
                    self.enqueue(partner);
                }
            } else if reason.is_abnormal() {
                partner.request_kill(ExitReason::Linked(pid, Box::new(reason.clone())));
                if partner.try_wake() {
                    self.enqueue(partner);
                }
            }
        }

        if self.config.retain_dead {
            self.dead.lock().insert(pid.as_u64(), block.clone());
        }
    }

    // ─── Timers ───────────────────────────────────────────────

    pub(crate) fn arm_timer(&self, pid: Pid, deadline_ms: u64) {
        self.timers.lock().push(Reverse((deadline_ms, pid.as_u64())));
    }

    fn fire_due_timers(&self) {
        let now = now_ms();
        let mut due = Vec::new();
        {
            let mut timers = self.timers.lock();
            while let Some(Reverse((deadline, pid))) = timers.peek().copied() {
                if deadline > now {
                    break;
                }
                timers.pop();
                due.push(Pid(pid));
            }
        }
        for pid in due {
            if let Some(block) = self.registry.get(pid) {
                let expired = block.wake_deadline().map(|d| d <= now).unwrap_or(false);
                if expired && block.try_wake() {
                    trace!(pid = pid.as_u64(), "receive timeout fired");
                    self.enqueue(block);
                }
            }
        }
    }

    fn has_pending_timers(&self) -> bool {
        let mut timers = self.timers.lock();
        timers.retain(|Reverse((_, pid))| {
            self.registry
                .get(Pid(*pid))
                .map(|b| !b.is_dead() && b.wake_deadline().is_some())
                .unwrap_or(false)
        });
        !timers.is_empty()
    }

    // ─── Modules ──────────────────────────────────────────────

    /// Record `pid`'s dependency on a loaded module so upgrades reach it.
    pub fn register_module_block(&self, name: &str, pid: Pid) -> bool {
        let Some(block) = self.registry.get(pid) else {
            return false;
        };
        if !self.modules.register_block(name, pid) {
            return false;
        }
        block.set_module(Some(name.to_string()));
        true
    }

    /// Mark every block registered against `name` for upgrade at its next
    /// safe point.
    pub fn trigger_upgrade(&self, name: &str) -> usize {
        self.modules.trigger_upgrade(name, &self.registry)
    }

    // ─── Checkpoint restore ───────────────────────────────────

    /// Build a scaffold block from persisted metadata. The block is left
    /// Waiting and is not enqueued; live execution state is not restored.
    pub fn restore_block(&self, cp: &Checkpoint, code: Arc<Bytecode>) -> Pid {
        let mut vm = Vm::new(code);
        for (name, value) in &cp.globals {
            vm.set_global(name.clone(), value.clone());
        }
        let limits = ResourceLimits {
            max_reductions: self.config.default_reductions,
            ..Default::default()
        };
        vm.set_limits(
            limits.max_stack_depth,
            limits.max_call_depth,
            limits.max_heap_bytes,
        );

        let name = match &cp.name {
            Some(n) if self.whereis(n).is_none() => Some(n.clone()),
            _ => None,
        };
        let pid = self.registry.next_pid();
        let block = Arc::new(Block::new(
            pid,
            name.clone(),
            cp.parent,
            cp.capabilities,
            limits,
            vm,
        ));
        for linked in &cp.links {
            block.link(*linked);
        }
        block.set_state(BlockState::Waiting);
        if self.registry.insert(block).is_err() {
            return Pid::INVALID;
        }
        if let Some(name) = name {
            self.names.lock().insert(name, pid);
        }
        self.total_spawned.fetch_add(1, Ordering::Relaxed);
        debug!(pid = pid.as_u64(), "restored scaffold block");
        pid
    }

    // ─── Statistics ───────────────────────────────────────────

    /// Lifecycle state of each worker started by `run`, in worker order.
    pub fn worker_states(&self) -> Vec<crate::worker::WorkerState> {
        self.worker_stats
            .read()
            .iter()
            .map(|w| w.state())
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut steal_attempts = 0;
        let mut steals_won = 0;
        for w in self.worker_stats.read().iter() {
            steal_attempts += w.steal_attempts.load(Ordering::Relaxed);
            steals_won += w.steals_won.load(Ordering::Relaxed);
        }
        SchedulerStats {
            total_spawned: self.total_spawned.load(Ordering::Relaxed),
            total_terminated: self.total_terminated.load(Ordering::Relaxed),
            live_blocks: self.registry.count(),
            blocks_executed: self.executed.load(Ordering::Relaxed),
            steal_attempts,
            steals_won,
            total_reductions: self.reductions.load(Ordering::Relaxed),
        }
    }
}

// ─── System message payloads ──────────────────────────────────

fn exit_message(from: Pid, reason: &ExitReason) -> Message {
    Message {
        sender: from,
        payload: Value::Struct(Arc::new(StructObj {
            name: Str::new("exit"),
            fields: vec![
                (Str::new("from"), Value::Pid(from)),
                (Str::new("reason"), Value::str(reason.describe())),
            ],
        })),
        kind: MessageKind::Exit,
    }
}

fn down_message(from: Pid, reference: MonitorRef, reason: &ExitReason) -> Message {
    Message {
        sender: from,
        payload: Value::Struct(Arc::new(StructObj {
            name: Str::new("down"),
            fields: vec![
                (Str::new("from"), Value::Pid(from)),
                (Str::new("reference"), Value::Int(reference as i64)),
                (Str::new("reason"), Value::str(reason.describe())),
            ],
        })),
        kind: MessageKind::Down,
    }
}
