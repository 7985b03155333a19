//! Concurrent runtime for a dynamically-typed, bytecode-compiled
//! language: large populations of lightweight processes ("blocks")
//! multiplexed over a small pool of OS threads, with typed message
//! passing, preemptive fairness via reduction accounting, crash
//! isolation, links and monitors, named processes and process groups,
//! and in-place code upgrades.
//!
//! The embedder constructs a [`Scheduler`] from a [`SchedulerConfig`],
//! loads [`Bytecode`] produced by a front-end compiler, spawns blocks,
//! and drives the runtime with [`Scheduler::run`] or
//! [`Scheduler::step`].

pub mod block;
pub mod bytecode;
pub mod cache;
pub mod checkpoint;
pub mod error;
pub mod mailbox;
pub mod module;
pub mod registry;
pub mod scheduler;
pub mod slot;
pub mod types;
pub mod value;
pub mod vm;
pub mod worker;

pub use block::Block;
pub use bytecode::{Bytecode, Chunk, Opcode, ToolMeta};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use error::{BytecodeError, CheckpointError, RegistryError, SendError, SpawnError, VmError};
pub use mailbox::Mailbox;
pub use module::{ModuleRegistry, ModuleVersion};
pub use scheduler::{BlockInspection, Scheduler};
pub use slot::{Slot, SlotKind};
pub use types::{
    BlockState, Capabilities, ExitReason, Message, MessageKind, Pid, ResourceLimits,
    SchedulerConfig, SchedulerStats,
};
pub use value::Value;
pub use vm::{NoopHooks, Primitive, PrimitiveHooks, RunOutcome, Vm};
pub use worker::{WorkerState, WorkerStats};
