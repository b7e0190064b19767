//! Schema evaluation that follows its own dependencies.

use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use rdao_core::{MoreEntry, Observable, Observer, Path, Schema, apply_signal, collect_pointers};
use serde_json::Value;
use tracing::error;

use super::trigger::PushTrigger;
use super::{PointerList, Serial};

struct Dependency {
    observable: Option<Arc<dyn Observable>>,
    observer: Arc<dyn Observer>,
    value: Option<Value>,
}

#[derive(Default)]
struct ScanState {
    base: Option<Value>,
    deps: IndexMap<Path, Dependency>,
    targets: IndexMap<Path, Arc<PushTrigger>>,
    scanning: bool,
    dirty: bool,
    disposed: bool,
}

#[derive(Default)]
struct Plan {
    add_deps: Vec<Path>,
    drop_deps: Vec<Path>,
    add_targets: Vec<Path>,
    drop_targets: Vec<Path>,
}

/// Evaluates `schema` against a base value and keeps one trigger per
/// resulting pointer.
///
/// Every `source` pointer consulted during evaluation becomes a dependency:
/// it is pushed, watched, and a change to its value re-runs the scan.
/// Dependencies the last evaluation no longer consulted are released, so a
/// `switch` that changes branch also changes what is watched.
pub(crate) struct DepsScanner {
    schema: Vec<Schema>,
    more: Vec<MoreEntry>,
    pointers: Arc<PointerList>,
    serial: Serial,
    state: Mutex<ScanState>,
    this: Weak<DepsScanner>,
}

impl DepsScanner {
    pub(crate) fn new(
        schema: Vec<Schema>,
        more: Vec<MoreEntry>,
        pointers: Arc<PointerList>,
        serial: Serial,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            schema,
            more,
            pointers,
            serial,
            state: Mutex::new(ScanState::default()),
            this: this.clone(),
        })
    }

    /// Replace the base value and rescan.
    pub(crate) fn set_base(&self, base: Option<Value>) {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.base = base;
        }
        self.scan();
    }

    /// Evaluate and reconcile until no dependency changed mid-way.
    ///
    /// Watching a new dependency replays its value synchronously, which
    /// lands here again; the nested call only marks the state dirty.
    pub(crate) fn scan(&self) {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            if state.scanning {
                state.dirty = true;
                return;
            }
            state.scanning = true;
        }
        loop {
            let plan = self.plan();
            self.apply(plan);
            let mut state = self.state.lock();
            if state.dirty && !state.disposed {
                continue;
            }
            state.scanning = false;
            break;
        }
    }

    fn plan(&self) -> Plan {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.dirty = false;

        let mut consulted: IndexSet<Path> = IndexSet::new();
        let result = {
            let deps = &state.deps;
            let mut resolve = |pointer: &Value| {
                let path = Path::new(pointer.clone());
                let value = deps.get(&path).and_then(|dep| dep.value.clone());
                let _ = consulted.insert(path);
                value
            };
            collect_pointers(state.base.as_ref(), &self.schema, &mut resolve)
        };
        let found: IndexSet<Path> = match result {
            Ok(values) => values.into_iter().map(Path::new).collect(),
            Err(err) => {
                error!(error = %err, "push schema violates cardinality, keeping previous pointers");
                return Plan::default();
            }
        };

        Plan {
            add_deps: consulted
                .iter()
                .filter(|what| !state.deps.contains_key(*what))
                .cloned()
                .collect(),
            drop_deps: state
                .deps
                .keys()
                .filter(|what| !consulted.contains(*what))
                .cloned()
                .collect(),
            add_targets: found
                .iter()
                .filter(|what| !state.targets.contains_key(*what))
                .cloned()
                .collect(),
            drop_targets: state
                .targets
                .keys()
                .filter(|what| !found.contains(*what))
                .cloned()
                .collect(),
        }
    }

    // Additions run before removals so a pointer kept by both the old and
    // the new result never drops to zero references.
    fn apply(&self, plan: Plan) {
        for what in plan.add_deps {
            let observer: Arc<dyn Observer> = Arc::new(DependencyObserver {
                scanner: self.this.clone(),
                what: what.clone(),
            });
            {
                let mut state = self.state.lock();
                if state.disposed {
                    return;
                }
                let _ = state.deps.insert(
                    what.clone(),
                    Dependency {
                        observable: None,
                        observer: observer.clone(),
                        value: None,
                    },
                );
            }
            let observable = self.pointers.acquire(&what);
            let kept = match self.state.lock().deps.get_mut(&what) {
                Some(dep) => {
                    dep.observable.clone_from(&observable);
                    true
                }
                None => false,
            };
            if !kept {
                self.pointers.release(&what);
                continue;
            }
            if let Some(observable) = observable {
                observable.observe(observer);
            }
        }

        for what in plan.add_targets {
            let trigger = PushTrigger::new(what.clone(), &self.more, self.pointers.clone(), self.serial.clone());
            {
                let mut state = self.state.lock();
                if state.disposed {
                    return;
                }
                let _ = state.targets.insert(what, trigger.clone());
            }
            trigger.start();
        }

        for what in plan.drop_targets {
            let removed = self.state.lock().targets.shift_remove(&what);
            if let Some(trigger) = removed {
                trigger.dispose();
            }
        }

        for what in plan.drop_deps {
            let removed = self.state.lock().deps.shift_remove(&what);
            if let Some(dep) = removed {
                if let Some(observable) = &dep.observable {
                    observable.unobserve(&dep.observer);
                }
                self.pointers.release(&what);
            }
        }
    }

    fn on_dependency(&self, what: &Path, signal: &str, args: &[Value]) {
        let _serial = self.serial.lock();
        let changed = {
            let mut state = self.state.lock();
            if state.disposed || signal == "error" {
                return;
            }
            state
                .deps
                .get_mut(what)
                .is_some_and(|dep| apply_signal(&mut dep.value, signal, args))
        };
        if changed {
            self.scan();
        }
    }

    /// Release every dependency and target.
    pub(crate) fn dispose(&self) {
        let (deps, targets) = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (
                std::mem::take(&mut state.deps),
                std::mem::take(&mut state.targets),
            )
        };
        for (_, trigger) in targets {
            trigger.dispose();
        }
        for (what, dep) in deps {
            if let Some(observable) = &dep.observable {
                observable.unobserve(&dep.observer);
            }
            self.pointers.release(&what);
        }
    }

    #[cfg(test)]
    pub(crate) fn targets(&self) -> Vec<Path> {
        self.state.lock().targets.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn dependencies(&self) -> Vec<Path> {
        self.state.lock().deps.keys().cloned().collect()
    }
}

struct DependencyObserver {
    scanner: Weak<DepsScanner>,
    what: Path,
}

impl Observer for DependencyObserver {
    fn notify(&self, signal: &str, args: &[Value]) {
        if let Some(scanner) = self.scanner.upgrade() {
            scanner.on_dependency(&self.what, signal, args);
        }
    }
}
