use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::block::Block;
use crate::bytecode::Bytecode;
use crate::registry::Registry;
use crate::types::{now_ms, Pid, Timestamp};
use crate::value::{MapObj, Str, Value};
use crate::vm::{RunOutcome, Vm};

/// Reduction budget granted to a migration function.
const MIGRATION_BUDGET: u64 = 100_000;

/// One loaded version of a module's code.
#[derive(Debug)]
pub struct ModuleVersion {
    pub name: String,
    pub version: u32,
    pub bytecode: Arc<Bytecode>,
    pub loaded_at: Timestamp,
    /// Function-chunk index of the state migration hook, if the version
    /// ships one.
    pub migration_fn: Option<u16>,
    /// The version this one replaced; rollback restores it.
    pub prev: Option<Arc<ModuleVersion>>,
}

struct ModuleEntry {
    current: Arc<ModuleVersion>,
    dependents: Vec<Pid>,
}

/// Versioned code store. Loading a newer version links the previous one;
/// triggering an upgrade marks every dependent block, and the mark is
/// consumed at the block's next safe point.
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<Mutex<ModuleEntry>>>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Load `bytecode` as the newest version of `name`; returns the new
    /// version number.
    pub fn load(&self, name: &str, bytecode: Arc<Bytecode>) -> u32 {
        self.load_with_migration(name, bytecode, None)
    }

    pub fn load_with_migration(
        &self,
        name: &str,
        bytecode: Arc<Bytecode>,
        migration_fn: Option<u16>,
    ) -> u32 {
        let mut modules = self.modules.write();
        match modules.get(name) {
            Some(entry) => {
                let mut entry = entry.lock();
                let version = entry.current.version + 1;
                entry.current = Arc::new(ModuleVersion {
                    name: name.to_string(),
                    version,
                    bytecode,
                    loaded_at: now_ms(),
                    migration_fn,
                    prev: Some(entry.current.clone()),
                });
                debug!(module = name, version, "loaded module version");
                version
            }
            None => {
                modules.insert(
                    name.to_string(),
                    Arc::new(Mutex::new(ModuleEntry {
                        current: Arc::new(ModuleVersion {
                            name: name.to_string(),
                            version: 1,
                            bytecode,
                            loaded_at: now_ms(),
                            migration_fn,
                            prev: None,
                        }),
                        dependents: Vec::new(),
                    })),
                );
                debug!(module = name, version = 1, "loaded module");
                1
            }
        }
    }

    pub fn current(&self, name: &str) -> Option<Arc<ModuleVersion>> {
        let modules = self.modules.read();
        modules.get(name).map(|e| e.lock().current.clone())
    }

    /// Record a block's dependency on `name`. False if no such module.
    pub fn register_block(&self, name: &str, pid: Pid) -> bool {
        let modules = self.modules.read();
        match modules.get(name) {
            Some(entry) => {
                let mut entry = entry.lock();
                if !entry.dependents.contains(&pid) {
                    entry.dependents.push(pid);
                }
                true
            }
            None => false,
        }
    }

    pub fn unregister_block(&self, name: &str, pid: Pid) {
        let modules = self.modules.read();
        if let Some(entry) = modules.get(name) {
            entry.lock().dependents.retain(|p| *p != pid);
        }
    }

    /// Mark every dependent block pending-upgrade. Returns how many were
    /// marked; each consumes the mark at its next safe point.
    pub fn trigger_upgrade(&self, name: &str, blocks: &Registry) -> usize {
        let entry = {
            let modules = self.modules.read();
            match modules.get(name) {
                Some(e) => e.clone(),
                None => return 0,
            }
        };
        let dependents = entry.lock().dependents.clone();
        let mut marked = 0;
        for pid in dependents {
            if let Some(block) = blocks.get(pid) {
                block.mark_pending_upgrade();
                marked += 1;
            }
        }
        debug!(module = name, marked, "upgrade triggered");
        marked
    }

    /// Restore the previous version as current, if one exists.
    pub fn rollback(&self, name: &str) -> bool {
        let modules = self.modules.read();
        match modules.get(name) {
            Some(entry) => {
                let mut entry = entry.lock();
                match entry.current.prev.clone() {
                    Some(prev) => {
                        debug!(module = name, version = prev.version, "rolled back");
                        entry.current = prev;
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Safe-point hook: swap the block's bytecode for the current version of
/// its module, threading state through the migration function when the
/// new version ships one.
pub(crate) fn apply_upgrade(vm: &mut Vm, block: &Block, sched: &crate::scheduler::Scheduler) {
    let Some(name) = block.module() else {
        return;
    };
    let Some(version) = sched.modules().current(&name) else {
        return;
    };
    if Arc::ptr_eq(&version.bytecode, vm.bytecode()) {
        return;
    }

    if let Some(idx) = version.migration_fn {
        match migrate_state(vm, block, sched, &version.bytecode, idx) {
            Ok(()) => {}
            Err(e) => {
                // The upgrade still lands; state is threaded unchanged.
                warn!(pid = block.pid().as_u64(), module = %name, error = %e,
                      "migration function failed; keeping state");
            }
        }
    }
    vm.swap_bytecode(version.bytecode.clone());
    debug!(
        pid = block.pid().as_u64(),
        module = %name,
        version = version.version,
        "applied module upgrade"
    );
}

/// Run the migration function on a scratch VM: it receives the block's
/// globals as a map and returns the replacement map.
fn migrate_state(
    vm: &mut Vm,
    block: &Block,
    sched: &crate::scheduler::Scheduler,
    bytecode: &Arc<Bytecode>,
    migration_fn: u16,
) -> Result<(), String> {
    let mut state = MapObj::new();
    for (k, v) in vm.globals.iter() {
        state.set(Str::new(k.as_str()), v.clone());
    }

    let mut scratch = Vm::with_entry(bytecode.clone(), Value::Function(migration_fn))
        .map_err(|e| e.to_string())?;
    scratch
        .push_arg(Value::map(state))
        .map_err(|e| e.to_string())?;
    match scratch.run(block, sched, MIGRATION_BUDGET) {
        Ok(RunOutcome::Halted) => match scratch.stack_top() {
            Some(Value::Map(m)) => {
                vm.globals = m
                    .entries()
                    .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                    .collect();
                Ok(())
            }
            _ => Err("migration did not return a map".to_string()),
        },
        Ok(other) => Err(format!("migration suspended: {other:?}")),
        Err(e) => Err(e.to_string()),
    }
}
