//! Minimal embedding: a relay block forwards whatever it receives to a
//! sink block, and the host watches the runtime drain.
//!
//! Run with `cargo run --example token_ring`.

use std::sync::Arc;

use blockvm_core::bytecode::{Bytecode, Opcode};
use blockvm_core::types::{Pid, SchedulerConfig};
use blockvm_core::value::Value;
use blockvm_core::Scheduler;

/// Program: receive one value, leave it on the stack, halt.
fn sink() -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    bc.main.write_op(Opcode::Receive, 1);
    bc.main.write_op(Opcode::Halt, 2);
    Arc::new(bc)
}

/// Program: receive a value and forward it to `target`.
fn relay(target: Pid) -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    let k = bc.main.add_const(Value::Pid(target));
    bc.main.write_op(Opcode::Const, 1);
    bc.main.write_u16(k, 1);
    bc.main.write_op(Opcode::Receive, 2);
    bc.main.write_op(Opcode::Send, 3);
    bc.main.write_op(Opcode::Halt, 4);
    Arc::new(bc)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let sched = Scheduler::new(SchedulerConfig {
        num_workers: 2,
        retain_dead: true,
        ..Default::default()
    });

    let end = sched.spawn(sink(), Some("sink"));
    let start = sched.spawn(relay(end), Some("relay"));
    sched
        .send(Pid::INVALID, start, Value::Int(42))
        .expect("relay is alive");
    sched.run();

    let delivered = sched
        .inspect(end)
        .and_then(|i| i.stack_top)
        .expect("sink retained");
    let stats = sched.stats();
    println!(
        "delivered {delivered} through {} blocks in {} reductions",
        stats.total_terminated, stats.total_reductions
    );
}
