//! One pushed target and its nested dependents.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rdao_core::{MoreEntry, Observable, Observer, Path, apply_signal};
use serde_json::Value;

use super::scanner::DepsScanner;
use super::{PointerList, Serial};

#[derive(Default)]
struct TriggerState {
    observable: Option<Arc<dyn Observable>>,
    observer: Option<Arc<dyn Observer>>,
    value: Option<Value>,
    acquired: bool,
    disposed: bool,
}

/// Holds a push reference to `what` and keeps nested entries in sync with
/// its value.
pub(crate) struct PushTrigger {
    what: Path,
    scanners: Vec<Arc<DepsScanner>>,
    pointers: Arc<PointerList>,
    serial: Serial,
    state: Mutex<TriggerState>,
}

impl PushTrigger {
    pub(crate) fn new(what: Path, more: &[MoreEntry], pointers: Arc<PointerList>, serial: Serial) -> Arc<Self> {
        let scanners = more
            .iter()
            .map(|entry| {
                DepsScanner::new(
                    entry.schema.clone(),
                    entry.more.clone(),
                    pointers.clone(),
                    serial.clone(),
                )
            })
            .collect();
        Arc::new(Self {
            what,
            scanners,
            pointers,
            serial,
            state: Mutex::new(TriggerState::default()),
        })
    }

    pub(crate) fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.disposed || state.acquired {
                return;
            }
            state.acquired = true;
        }
        let Some(observable) = self.pointers.acquire(&self.what) else {
            return;
        };
        if self.scanners.is_empty() {
            return;
        }
        let observer: Arc<dyn Observer> = Arc::new(TargetObserver {
            trigger: Arc::downgrade(self),
        });
        {
            let mut state = self.state.lock();
            state.observable = Some(observable.clone());
            state.observer = Some(observer.clone());
        }
        observable.observe(observer);
    }

    fn on_signal(&self, signal: &str, args: &[Value]) {
        let _serial = self.serial.lock();
        let value = {
            let mut state = self.state.lock();
            if state.disposed || signal == "error" || !apply_signal(&mut state.value, signal, args) {
                return;
            }
            state.value.clone()
        };
        for scanner in &self.scanners {
            scanner.set_base(value.clone());
        }
    }

    pub(crate) fn dispose(&self) {
        let (observable, observer, acquired) = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (state.observable.take(), state.observer.take(), state.acquired)
        };
        if let (Some(observable), Some(observer)) = (observable, observer) {
            observable.unobserve(&observer);
        }
        for scanner in &self.scanners {
            scanner.dispose();
        }
        if acquired {
            self.pointers.release(&self.what);
        }
    }
}

struct TargetObserver {
    trigger: Weak<PushTrigger>,
}

impl Observer for TargetObserver {
    fn notify(&self, signal: &str, args: &[Value]) {
        if let Some(trigger) = self.trigger.upgrade() {
            trigger.on_signal(signal, args);
        }
    }
}
