//! Integration tests: exercise the full runtime through the scheduler
//! facade — spawn, message routing, links and monitors, preemption,
//! selective receive, hot upgrade, checkpointing.

use std::sync::Arc;

use blockvm_core::bytecode::{Bytecode, Opcode};
use blockvm_core::checkpoint::CheckpointManager;
use blockvm_core::types::{
    BlockState, Capabilities, ExitReason, Pid, ResourceLimits, SchedulerConfig,
};
use blockvm_core::value::Value;
use blockvm_core::Scheduler;

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

fn test_scheduler() -> Arc<Scheduler> {
    init_logs();
    Scheduler::new(SchedulerConfig {
        retain_dead: true,
        ..SchedulerConfig::single_threaded()
    })
}

// ─── Program fixtures ─────────────────────────────────────────

fn emit_const(bc: &mut Bytecode, v: Value) {
    let k = bc.main.add_const(v);
    bc.main.write_op(Opcode::Const, 1);
    bc.main.write_u16(k, 1);
}

/// Program: `HALT`.
fn halt_program() -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    bc.main.write_op(Opcode::Halt, 1);
    Arc::new(bc)
}

/// Program: receive one message, leave it on the stack, halt.
fn receive_halt() -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    bc.main.write_op(Opcode::Receive, 1);
    bc.main.write_op(Opcode::Halt, 1);
    Arc::new(bc)
}

/// Program: `1 / 0`.
fn div_zero() -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    emit_const(&mut bc, Value::Int(1));
    emit_const(&mut bc, Value::Int(0));
    bc.main.write_op(Opcode::Div, 1);
    bc.main.write_op(Opcode::Halt, 1);
    Arc::new(bc)
}

/// The canonical countdown loop from `n` to 0.
fn countdown(n: i64) -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    emit_const(&mut bc, Value::Int(n));
    let top = bc.main.len();
    bc.main.write_op(Opcode::Dup, 2);
    emit_const(&mut bc, Value::Int(0));
    bc.main.write_op(Opcode::Le, 2);
    let exit = bc.main.emit_jump(Opcode::JumpIf, 2);
    bc.main.write_op(Opcode::Pop, 3);
    emit_const(&mut bc, Value::Int(1));
    bc.main.write_op(Opcode::Sub, 3);
    bc.main.emit_loop(top, 3).unwrap();
    bc.main.patch_jump(exit).unwrap();
    bc.main.write_op(Opcode::Pop, 4);
    bc.main.write_op(Opcode::Halt, 4);
    Arc::new(bc)
}

/// Receive `n` messages, appending each payload to the `seen` global.
fn receive_n_into_seen(n: i64) -> Arc<Bytecode> {
    let mut bc = Bytecode::new();
    let seen = bc.add_string("seen");
    bc.main.write_op(Opcode::ArrayNew, 1);
    bc.main.write_u16(0, 1);
    bc.main.write_op(Opcode::SetGlobal, 1);
    bc.main.write_u16(seen, 1);
    emit_const(&mut bc, Value::Int(n));
    let top = bc.main.len();
    bc.main.write_op(Opcode::Dup, 2);
    emit_const(&mut bc, Value::Int(0));
    bc.main.write_op(Opcode::Le, 2);
    let exit = bc.main.emit_jump(Opcode::JumpIf, 2);
    bc.main.write_op(Opcode::Pop, 3);
    bc.main.write_op(Opcode::GetGlobal, 3);
    bc.main.write_u16(seen, 3);
    bc.main.write_op(Opcode::Receive, 3);
    bc.main.write_op(Opcode::ArrayPush, 3);
    bc.main.write_op(Opcode::SetGlobal, 3);
    bc.main.write_u16(seen, 3);
    emit_const(&mut bc, Value::Int(1));
    bc.main.write_op(Opcode::Sub, 3);
    bc.main.emit_loop(top, 3).unwrap();
    bc.main.patch_jump(exit).unwrap();
    bc.main.write_op(Opcode::Pop, 4);
    bc.main.write_op(Opcode::Halt, 4);
    Arc::new(bc)
}

// ─── Scenario 1: spawn and halt ───────────────────────────────

#[test]
fn spawn_100_blocks_all_terminate() {
    let s = test_scheduler();
    let code = halt_program();
    let mut pids = Vec::new();
    for _ in 0..100 {
        let pid = s.spawn(code.clone(), None);
        assert!(pid.is_valid());
        pids.push(pid);
    }
    s.run();
    for pid in pids {
        assert_eq!(s.inspect(pid).unwrap().state, BlockState::Dead);
    }
    let stats = s.stats();
    assert_eq!(stats.total_spawned, 100);
    assert_eq!(stats.total_terminated, 100);
    assert!(s.dequeue().is_none());
}

// ─── Scenario 2: countdown loop ───────────────────────────────

#[test]
fn countdown_runs_to_zero_with_preemption() {
    let s = test_scheduler();
    let pid = s.spawn_ex(
        countdown(1000),
        None,
        Capabilities::standard(),
        ResourceLimits {
            max_reductions: 100,
            ..Default::default()
        },
    );

    // One quantum cannot finish the loop: the block yields first.
    assert!(s.step());
    assert_eq!(
        s.get_block(pid).unwrap().state(),
        BlockState::Runnable,
        "block must yield before dying"
    );

    s.run();
    let insp = s.inspect(pid).unwrap();
    assert_eq!(insp.state, BlockState::Dead);
    assert_eq!(insp.exit_reason, Some(ExitReason::Normal));
    assert!(insp.reductions >= 1000);
    assert!(insp.stack_top.unwrap().equals(&Value::Int(0)));
}

// ─── Scenario 3: message ping ─────────────────────────────────

#[test]
fn send_42_between_blocks() {
    let s = test_scheduler();
    let b = s.spawn(receive_halt(), None);
    s.run(); // B parks on the empty mailbox.
    assert_eq!(s.get_block(b).unwrap().state(), BlockState::Waiting);

    let mut bc = Bytecode::new();
    emit_const(&mut bc, Value::Pid(b));
    emit_const(&mut bc, Value::Int(42));
    bc.main.write_op(Opcode::Send, 1);
    bc.main.write_op(Opcode::Halt, 1);
    let a = s.spawn(Arc::new(bc), None);
    s.run();

    let a_insp = s.inspect(a).unwrap();
    assert_eq!(a_insp.state, BlockState::Dead);
    // SEND surfaces a guest result.
    assert!(a_insp.stack_top.unwrap().equals(&Value::ok(Value::Nil)));

    let b_insp = s.inspect(b).unwrap();
    assert_eq!(b_insp.state, BlockState::Dead);
    assert_eq!(b_insp.mailbox_len, 0);
    assert_eq!(b_insp.msgs_received, 1);
    assert!(b_insp.stack_top.unwrap().equals(&Value::Int(42)));
}

// ─── Scenario 4: link propagation ─────────────────────────────

#[test]
fn abnormal_exit_kills_linked_partner() {
    let s = test_scheduler();
    let a = s.spawn(div_zero(), None);
    let b = s.spawn(receive_halt(), None);
    assert!(s.link(a, b));
    s.run();

    let a_insp = s.inspect(a).unwrap();
    assert_eq!(a_insp.state, BlockState::Dead);
    assert!(matches!(a_insp.exit_reason, Some(ExitReason::Error(_))));

    let b_insp = s.inspect(b).unwrap();
    assert_eq!(b_insp.state, BlockState::Dead);
    assert!(matches!(b_insp.exit_reason, Some(ExitReason::Linked(p, _)) if p == a));
}

#[test]
fn trapping_partner_receives_one_exit_message() {
    let s = test_scheduler();
    let a = s.spawn(div_zero(), None);
    let b = s.spawn_ex(
        receive_halt(),
        None,
        Capabilities::standard() | Capabilities::TRAP_EXIT,
        ResourceLimits::default(),
    );
    assert!(s.link(a, b));
    s.run();

    let b_insp = s.inspect(b).unwrap();
    assert_eq!(b_insp.state, BlockState::Dead);
    // B halted normally after consuming exactly one exit message.
    assert_eq!(b_insp.exit_reason, Some(ExitReason::Normal));
    assert_eq!(b_insp.msgs_received, 1);
    match b_insp.stack_top.unwrap() {
        Value::Struct(st) => {
            assert_eq!(st.name.as_str(), "exit");
            let from = st.field(&blockvm_core::value::Str::new("from")).unwrap();
            assert!(from.equals(&Value::Pid(a)));
        }
        other => panic!("expected exit struct, got {other}"),
    }
}

// ─── Scenario 5: selective receive ────────────────────────────

#[test]
fn selective_receive_preserves_residual_order() {
    let s = test_scheduler();
    let mut bc = Bytecode::new();
    let (g1, g2, g3) = {
        let a = bc.add_string("matched");
        let b = bc.add_string("second");
        let c = bc.add_string("third");
        (a, b, c)
    };
    emit_const(&mut bc, Value::Int(2));
    bc.main.write_op(Opcode::ReceiveMatch, 1);
    bc.main.write_op(Opcode::SetGlobal, 1);
    bc.main.write_u16(g1, 1);
    bc.main.write_op(Opcode::Receive, 2);
    bc.main.write_op(Opcode::SetGlobal, 2);
    bc.main.write_u16(g2, 2);
    bc.main.write_op(Opcode::Receive, 3);
    bc.main.write_op(Opcode::SetGlobal, 3);
    bc.main.write_u16(g3, 3);
    bc.main.write_op(Opcode::Halt, 4);

    let pid = s.spawn(Arc::new(bc), None);
    for tag in [1, 2, 3] {
        s.send(Pid::INVALID, pid, Value::Int(tag)).unwrap();
    }
    s.run();

    let insp = s.inspect(pid).unwrap();
    assert_eq!(insp.state, BlockState::Dead);
    let get = |name: &str| {
        insp.globals
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    assert!(get("matched").equals(&Value::Int(2)));
    assert!(get("second").equals(&Value::Int(1)));
    assert!(get("third").equals(&Value::Int(3)));
}

// ─── Scenario 6: hot upgrade ──────────────────────────────────

#[test]
fn hot_upgrade_swaps_bytecode_at_safe_point() {
    let s = test_scheduler();
    let v1 = receive_halt();

    s.modules().load("m", v1.clone());
    let pid = s.spawn(v1, None);
    assert!(s.register_module_block("m", pid));
    s.run(); // Parks at the receive safe point.
    assert_eq!(s.get_block(pid).unwrap().state(), BlockState::Waiting);

    // v2 drops the message and leaves 99 behind.
    let mut v2 = Bytecode::new();
    v2.main.write_op(Opcode::Receive, 1);
    v2.main.write_op(Opcode::Pop, 1);
    emit_const(&mut v2, Value::Int(99));
    v2.main.write_op(Opcode::Halt, 1);
    s.modules().load("m", Arc::new(v2));

    assert_eq!(s.trigger_upgrade("m"), 1);
    s.send(Pid::INVALID, pid, Value::Int(7)).unwrap();
    s.run();

    let insp = s.inspect(pid).unwrap();
    assert_eq!(insp.state, BlockState::Dead);
    // Only v2 leaves 99 on the stack.
    assert!(insp.stack_top.unwrap().equals(&Value::Int(99)));

    assert!(s.modules().rollback("m"));
    assert_eq!(s.modules().current("m").unwrap().version, 1);
}

// ─── P-properties ─────────────────────────────────────────────

#[test]
fn p1_registry_lookup_until_death() {
    let s = test_scheduler();
    let pid = s.spawn(receive_halt(), None);
    assert!(s.get_block(pid).is_some());
    assert!(s.get_block(Pid(123_456)).is_none());
    s.kill(pid);
    s.run();
    assert!(s.get_block(pid).is_none());
}

#[test]
fn p2_pids_strictly_increase() {
    let s = test_scheduler();
    let code = halt_program();
    let mut last = 0;
    for _ in 0..50 {
        let pid = s.spawn(code.clone(), None);
        assert!(pid.as_u64() > last);
        last = pid.as_u64();
    }
}

#[test]
fn p3_per_sender_fifo_through_concurrent_sends() {
    let s = test_scheduler();
    let pid = s.spawn(receive_n_into_seen(100), None);

    let mut handles = Vec::new();
    for sender in 0..2u64 {
        let s = s.clone();
        handles.push(std::thread::spawn(move || {
            for seq in 0..50i64 {
                let payload =
                    Value::array(vec![Value::Int(sender as i64), Value::Int(seq)]);
                s.send(Pid(900 + sender), pid, payload).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    s.run();

    let insp = s.inspect(pid).unwrap();
    assert_eq!(insp.state, BlockState::Dead);
    assert_eq!(insp.msgs_received, 100);
    let seen = insp
        .globals
        .iter()
        .find(|(n, _)| n == "seen")
        .map(|(_, v)| v.clone())
        .unwrap();
    let Value::Array(items) = seen else {
        panic!("seen is not an array")
    };
    assert_eq!(items.items.len(), 100);
    let mut last_seq = [-1i64; 2];
    for entry in &items.items {
        let Value::Array(pair) = entry else {
            panic!("entry is not a pair")
        };
        let (Value::Int(sender), Value::Int(seq)) = (&pair.items[0], &pair.items[1]) else {
            panic!("bad pair")
        };
        assert!(
            *seq > last_seq[*sender as usize],
            "per-sender order violated for sender {sender}"
        );
        last_seq[*sender as usize] = *seq;
    }
}

#[test]
fn p4_link_unlink_is_clean() {
    let s = test_scheduler();
    let a = s.spawn(receive_halt(), None);
    let b = s.spawn(receive_halt(), None);
    assert!(s.link(a, b));
    assert!(s.link(a, b)); // idempotent
    assert_eq!(s.get_block(a).unwrap().links(), vec![b]);
    assert_eq!(s.get_block(b).unwrap().links(), vec![a]);
    s.unlink(a, b);
    s.unlink(a, b); // duplicate unlink is safe
    assert!(s.get_block(a).unwrap().links().is_empty());
    assert!(s.get_block(b).unwrap().links().is_empty());
}

#[test]
fn p5_quiescence_means_everything_dead() {
    let s = test_scheduler();
    let code = countdown(50);
    let mut pids = Vec::new();
    for _ in 0..25 {
        pids.push(s.spawn(code.clone(), None));
    }
    s.run();
    assert!(s.dequeue().is_none());
    for pid in pids {
        assert_eq!(s.inspect(pid).unwrap().state, BlockState::Dead);
    }
    assert_eq!(s.stats().live_blocks, 0);
}

#[test]
fn p6_capability_error_propagates_over_links() {
    let s = test_scheduler();
    // A has no capabilities at all; its first receive is a capability
    // error, not a type error.
    let a = s.spawn_ex(
        receive_halt(),
        None,
        Capabilities::empty(),
        ResourceLimits::default(),
    );
    let b = s.spawn(receive_halt(), None);
    assert!(s.link(a, b));
    s.run();

    match s.inspect(a).unwrap().exit_reason {
        Some(ExitReason::Error(e)) => assert!(e.contains("capability"), "got: {e}"),
        other => panic!("expected capability error, got {other:?}"),
    }
    assert_eq!(s.inspect(b).unwrap().state, BlockState::Dead);
}

#[test]
fn p7_serialized_bytecode_round_trips_through_execution() {
    let s = test_scheduler();
    let original = countdown(10);
    let bytes = original.serialize().unwrap();
    let restored = Bytecode::deserialize(&bytes).unwrap();
    assert_eq!(restored.serialize().unwrap(), bytes);

    let pid = s.spawn(Arc::new(restored), None);
    s.run();
    assert!(s
        .inspect(pid)
        .unwrap()
        .stack_top
        .unwrap()
        .equals(&Value::Int(0)));
}

#[test]
fn p10_exit_chain_reaches_every_link() {
    let s = test_scheduler();
    // a - b - c chained links; a dies abnormally; all must die.
    let a = s.spawn(div_zero(), None);
    let b = s.spawn(receive_halt(), None);
    let c = s.spawn(receive_halt(), None);
    assert!(s.link(a, b));
    assert!(s.link(b, c));
    s.run();
    for pid in [a, b, c] {
        assert_eq!(s.inspect(pid).unwrap().state, BlockState::Dead);
    }
}

// ─── Supplementary paths ──────────────────────────────────────

#[test]
fn spawn_opcode_creates_child_running_function() {
    let s = test_scheduler();
    let mut bc = Bytecode::new();
    // fn child() { halt-by-return }
    let mut f = blockvm_core::bytecode::Chunk::new();
    f.write_op(Opcode::Arity, 1);
    f.write_byte(0, 1);
    f.write_op(Opcode::Nil, 1);
    f.write_op(Opcode::Return, 1);
    let fidx = bc.add_function(f);

    let k = bc.main.add_const(Value::Function(fidx));
    bc.main.write_op(Opcode::Const, 1);
    bc.main.write_u16(k, 1);
    bc.main.write_op(Opcode::Spawn, 1);
    bc.main.write_op(Opcode::Halt, 1);

    let parent = s.spawn(Arc::new(bc), None);
    s.run();

    let insp = s.inspect(parent).unwrap();
    let child_pid = match insp.stack_top.unwrap() {
        Value::Pid(p) => p,
        other => panic!("expected pid, got {other}"),
    };
    assert!(child_pid.as_u64() > parent.as_u64());
    let stats = s.stats();
    assert_eq!(stats.total_spawned, 2);
    assert_eq!(stats.total_terminated, 2);
}

#[test]
fn receive_timeout_fires_without_mail() {
    let s = test_scheduler();
    let mut bc = Bytecode::new();
    let g = bc.add_string("r");
    emit_const(&mut bc, Value::Int(30));
    bc.main.write_op(Opcode::ReceiveTimeout, 1);
    bc.main.write_op(Opcode::SetGlobal, 1);
    bc.main.write_u16(g, 1);
    bc.main.write_op(Opcode::Halt, 1);
    let pid = s.spawn(Arc::new(bc), None);
    s.run();

    let insp = s.inspect(pid).unwrap();
    assert_eq!(insp.state, BlockState::Dead);
    let r = insp
        .globals
        .iter()
        .find(|(n, _)| n == "r")
        .map(|(_, v)| v.clone())
        .unwrap();
    assert!(r.equals(&Value::err(Value::str("timeout"))));
}

#[test]
fn receive_timeout_prefers_mail_over_timer() {
    let s = test_scheduler();
    let mut bc = Bytecode::new();
    emit_const(&mut bc, Value::Int(10_000));
    bc.main.write_op(Opcode::ReceiveTimeout, 1);
    bc.main.write_op(Opcode::Halt, 1);
    let pid = s.spawn(Arc::new(bc), None);
    s.send(Pid::INVALID, pid, Value::Int(5)).unwrap();
    s.run();
    let insp = s.inspect(pid).unwrap();
    assert_eq!(insp.state, BlockState::Dead);
    assert!(insp
        .stack_top
        .unwrap()
        .equals(&Value::ok(Value::Int(5))));
}

#[test]
fn monitor_delivers_down_on_target_death() {
    let s = test_scheduler();
    let target = s.spawn(div_zero(), None);
    let watcher = s.spawn(receive_halt(), None);
    let reference = s.monitor(watcher, target);
    s.run();

    let insp = s.inspect(watcher).unwrap();
    assert_eq!(insp.state, BlockState::Dead);
    match insp.stack_top.unwrap() {
        Value::Struct(st) => {
            assert_eq!(st.name.as_str(), "down");
            let r = st
                .field(&blockvm_core::value::Str::new("reference"))
                .unwrap();
            assert!(r.equals(&Value::Int(reference as i64)));
        }
        other => panic!("expected down struct, got {other}"),
    }
}

#[test]
fn named_send_reaches_target() {
    let s = test_scheduler();
    let b = s.spawn(receive_halt(), Some("inbox"));
    s.send_named(Pid::INVALID, "inbox", Value::Int(8)).unwrap();
    s.run();
    assert!(s
        .inspect(b)
        .unwrap()
        .stack_top
        .unwrap()
        .equals(&Value::Int(8)));
    assert!(s
        .send_named(Pid::INVALID, "inbox", Value::Nil)
        .is_err());
}

#[test]
fn checkpoint_restores_scaffold_block() {
    let s = test_scheduler();
    let mut bc = Bytecode::new();
    let g = bc.add_string("acc");
    emit_const(&mut bc, Value::Int(5));
    bc.main.write_op(Opcode::SetGlobal, 1);
    bc.main.write_u16(g, 1);
    bc.main.write_op(Opcode::Receive, 1);
    bc.main.write_op(Opcode::Halt, 1);
    let code = Arc::new(bc);
    let pid = s.spawn_ex(
        code.clone(),
        Some("keeper"),
        Capabilities::standard() | Capabilities::TRAP_EXIT,
        ResourceLimits::default(),
    );
    s.run(); // Parks on receive with acc set.

    let block = s.get_block(pid).unwrap();
    let bytes = CheckpointManager::checkpoint(&block).unwrap();
    let cp = CheckpointManager::restore(&bytes).unwrap();
    assert_eq!(cp.pid, pid);
    assert_eq!(cp.name.as_deref(), Some("keeper"));

    // Retire the original, then restore the scaffold.
    s.kill(pid);
    s.run();
    let restored = s.restore_block(&cp, code);
    assert!(restored.is_valid());
    let insp = s.inspect(restored).unwrap();
    assert_eq!(insp.state, BlockState::Waiting);
    assert_eq!(insp.name.as_deref(), Some("keeper"));
    let acc = insp
        .globals
        .iter()
        .find(|(n, _)| n == "acc")
        .map(|(_, v)| v.clone())
        .unwrap();
    assert!(acc.equals(&Value::Int(5)));
}

#[test]
fn multi_threaded_spawn_storm_drains() {
    init_logs();
    let s = Scheduler::new(SchedulerConfig {
        num_workers: 4,
        ..Default::default()
    });
    let code = countdown(200);
    for _ in 0..1000 {
        assert!(s.spawn(code.clone(), None).is_valid());
    }
    s.run();
    let stats = s.stats();
    assert_eq!(stats.total_spawned, 1000);
    assert_eq!(stats.total_terminated, 1000);
    assert_eq!(stats.live_blocks, 0);
    assert!(stats.total_reductions >= 200_000);
}

#[test]
fn stop_halts_workers_between_blocks() {
    init_logs();
    let s = Scheduler::new(SchedulerConfig {
        num_workers: 2,
        ..Default::default()
    });
    // Long-running loops keep the workers busy.
    let code = countdown(1_000_000);
    for _ in 0..16 {
        s.spawn(code.clone(), None);
    }
    let runner = {
        let s = s.clone();
        std::thread::spawn(move || s.run())
    };
    std::thread::sleep(std::time::Duration::from_millis(20));
    s.stop();
    runner.join().unwrap();
    // Not everything finished; the runtime stopped on request.
    assert!(s.stats().total_terminated < 16);
    assert!(s
        .worker_states()
        .iter()
        .all(|st| *st == blockvm_core::WorkerState::Stopped));
}
