//! Dependency push.
//!
//! A client observing a composite path (`{paths: [...]}`) receives a
//! [`PushObservable`]: an ordered list of every path the entries currently
//! reach. Each listed path is also pushed to the client, so its value
//! arrives without a separate `observe`.
//!
//! - [`PointerList`] counts references per path. The first reference pushes
//!   the path through the session's [`PushRegistry`], the last one unpushes
//!   it.
//! - [`trigger::PushTrigger`] holds one reference to a target path and, when
//!   the entry has nested `more`, watches the target's value with one
//!   [`scanner::DepsScanner`] per nested entry.
//! - A scanner evaluates its schemas against a base value, holds references
//!   to every `source` the evaluation consulted, and keeps one trigger per
//!   resulting pointer.
//!
//! All mutation happens with the session's serial lock held, which gives
//! the single-threaded discipline of one connection even when DAO cells fire
//! from other tasks.

mod observable;
mod scanner;
mod trigger;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use rdao_core::{Observable, ObservableList, ObservationError, Path};
use tracing::{debug, warn};

pub use observable::PushObservable;

/// Session lock serializing every change to subscription state.
pub type Serial = Arc<ReentrantMutex<()>>;

/// Reference-counted push subscriptions of one session.
pub trait PushRegistry: Send + Sync {
    /// Add one push reference to `what`, subscribing on the first.
    ///
    /// Returns the cell backing the path.
    fn push(&self, what: &Path) -> Result<Arc<dyn Observable>, ObservationError>;

    /// Drop one push reference to `what`.
    fn unpush(&self, what: &Path) -> Result<(), ObservationError>;
}

struct Held {
    count: usize,
    observable: Option<Arc<dyn Observable>>,
}

/// Paths referenced by one push observable, in first-reference order.
pub(crate) struct PointerList {
    list: ObservableList,
    refs: Mutex<HashMap<Path, Held>>,
    registry: Weak<dyn PushRegistry>,
}

impl PointerList {
    pub(crate) fn new(registry: Weak<dyn PushRegistry>) -> Self {
        Self {
            list: ObservableList::new(Vec::new()),
            refs: Mutex::new(HashMap::new()),
            registry,
        }
    }

    pub(crate) fn list(&self) -> &ObservableList {
        &self.list
    }

    /// Take a reference to `what`. Returns the backing cell unless the
    /// registry refused the push.
    pub(crate) fn acquire(&self, what: &Path) -> Option<Arc<dyn Observable>> {
        if let Some(held) = self.refs.lock().get_mut(what) {
            held.count += 1;
            return held.observable.clone();
        }
        let observable = match self.registry.upgrade().map(|registry| registry.push(what)) {
            Some(Ok(observable)) => Some(observable),
            Some(Err(error)) => {
                debug!(%what, %error, "push refused");
                None
            }
            None => None,
        };
        let _ = self.refs.lock().insert(
            what.clone(),
            Held {
                count: 1,
                observable: observable.clone(),
            },
        );
        if observable.is_some() {
            self.list.push(what.value().clone());
        }
        observable
    }

    /// Drop a reference taken by [`PointerList::acquire`].
    pub(crate) fn release(&self, what: &Path) {
        let last = {
            let mut refs = self.refs.lock();
            let Some(held) = refs.get_mut(what) else {
                warn!(%what, "release without a matching reference");
                return;
            };
            held.count -= 1;
            if held.count > 0 {
                return;
            }
            refs.remove(what)
        };
        if last.is_some_and(|held| held.observable.is_some()) {
            self.unpush(what);
        }
    }

    /// Unpush whatever is still referenced.
    pub(crate) fn drain(&self) {
        let leftover: Vec<(Path, Held)> = self.refs.lock().drain().collect();
        for (what, held) in leftover {
            warn!(%what, count = held.count, "dropping leftover push references");
            if held.observable.is_some() {
                self.unpush(&what);
            }
        }
    }

    fn unpush(&self, what: &Path) {
        self.list.remove(what.value());
        if let Some(registry) = self.registry.upgrade() {
            if let Err(error) = registry.unpush(what) {
                debug!(%what, %error, "unpush refused");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self, what: &Path) -> usize {
        self.refs.lock().get(what).map_or(0, |held| held.count)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory push registry over a fixed set of cells.

    use super::*;
    use rdao_core::{ErrorObservable, ObservableValue};
    use serde_json::{Value, json};

    #[derive(Default)]
    pub(crate) struct FakeRegistry {
        cells: Mutex<HashMap<Path, Arc<dyn Observable>>>,
        pushed: Mutex<HashMap<Path, usize>>,
        log: Mutex<Vec<String>>,
    }

    impl FakeRegistry {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn value(&self, what: Value, value: Value) -> Arc<ObservableValue> {
            let cell = Arc::new(ObservableValue::new(value));
            let _ = self.cells.lock().insert(Path::new(what), cell.clone());
            cell
        }

        pub(crate) fn list(&self, what: Value, items: Vec<Value>) -> Arc<ObservableList> {
            let cell = Arc::new(ObservableList::new(items));
            let _ = self.cells.lock().insert(Path::new(what), cell.clone());
            cell
        }

        pub(crate) fn is_pushed(&self, what: &Value) -> bool {
            self.pushed.lock().contains_key(&Path::new(what.clone()))
        }

        pub(crate) fn pushed_count(&self) -> usize {
            self.pushed.lock().len()
        }

        pub(crate) fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        pub(crate) fn clear_log(&self) {
            self.log.lock().clear();
        }

        pub(crate) fn weak(self: &Arc<Self>) -> Weak<dyn PushRegistry> {
            let weak: Weak<dyn PushRegistry> = Arc::downgrade(self) as Weak<dyn PushRegistry>;
            weak
        }
    }

    impl PushRegistry for FakeRegistry {
        fn push(&self, what: &Path) -> Result<Arc<dyn Observable>, ObservationError> {
            *self.pushed.lock().entry(what.clone()).or_default() += 1;
            self.log.lock().push(format!("push {what}"));
            let cell = self.cells.lock().get(what).cloned();
            Ok(cell.unwrap_or_else(|| Arc::new(ErrorObservable::new(json!("not found")))))
        }

        fn unpush(&self, what: &Path) -> Result<(), ObservationError> {
            let mut pushed = self.pushed.lock();
            let Some(count) = pushed.get_mut(what) else {
                return Err(ObservationError::NotPushed(what.clone()));
            };
            *count -= 1;
            if *count == 0 {
                let _ = pushed.remove(what);
            }
            self.log.lock().push(format!("unpush {what}"));
            Ok(())
        }
    }
}
