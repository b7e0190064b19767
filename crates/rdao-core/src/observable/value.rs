//! Single-value cell.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::{Observable, Observer, ObserverSet, fire};

#[derive(Default)]
struct ValueState {
    value: Option<Value>,
    error: Option<Value>,
    observers: ObserverSet,
}

/// Cell holding one JSON value.
///
/// New observers receive `set` with the current value (or `error` when an
/// error was reported). As an [`Observer`] the cell applies remote `set` and
/// `error` signals and passes any other signal through unchanged.
#[derive(Default)]
pub struct ObservableValue {
    state: Mutex<ValueState>,
}

impl ObservableValue {
    /// Cell with an initial value.
    pub fn new(value: Value) -> Self {
        Self {
            state: Mutex::new(ValueState {
                value: Some(value),
                ..ValueState::default()
            }),
        }
    }

    /// Current value, `None` before the first `set`.
    pub fn get(&self) -> Option<Value> {
        self.state.lock().value.clone()
    }

    /// Last reported error, if any.
    pub fn error(&self) -> Option<Value> {
        self.state.lock().error.clone()
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Replace the value. An equal value is a no-op.
    pub fn set(&self, value: Value) {
        let observers = {
            let mut state = self.state.lock();
            if state.value.as_ref() == Some(&value) && state.error.is_none() {
                return;
            }
            state.value = Some(value.clone());
            state.error = None;
            state.observers.snapshot()
        };
        fire(&observers, "set", &[value]);
    }

    /// Report an error to observers.
    pub fn set_error(&self, error: Value) {
        let observers = {
            let mut state = self.state.lock();
            state.error = Some(error.clone());
            state.observers.snapshot()
        };
        fire(&observers, "error", &[error]);
    }

    /// Change the value in place and fire a custom signal.
    ///
    /// Used for signals such as `inc` whose meaning the receiver knows.
    pub fn mutate(&self, signal: &str, args: &[Value], f: impl FnOnce(&mut Option<Value>)) {
        let observers = {
            let mut state = self.state.lock();
            f(&mut state.value);
            state.observers.snapshot()
        };
        fire(&observers, signal, args);
    }
}

impl Observable for ObservableValue {
    fn observe(&self, observer: Arc<dyn Observer>) {
        let (value, error) = {
            let mut state = self.state.lock();
            state.observers.add(observer.clone());
            (state.value.clone(), state.error.clone())
        };
        if let Some(error) = error {
            observer.notify("error", &[error]);
        } else if let Some(value) = value {
            observer.notify("set", &[value]);
        }
    }

    fn unobserve(&self, observer: &Arc<dyn Observer>) {
        let _ = self.state.lock().observers.remove(observer);
    }

    fn value(&self) -> Option<Value> {
        self.get()
    }
}

impl Observer for ObservableValue {
    fn notify(&self, signal: &str, args: &[Value]) {
        let first = || args.first().cloned().unwrap_or(Value::Null);
        match signal {
            "set" => self.set(first()),
            "error" => self.set_error(first()),
            _ => self.mutate(signal, args, |_| {}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::FnObserver;
    use serde_json::json;

    fn recording() -> (Arc<dyn Observer>, Arc<Mutex<Vec<(String, Vec<Value>)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let observer = FnObserver::new(move |signal, args| sink.lock().push((signal.to_owned(), args.to_vec())));
        (observer, log)
    }

    #[test]
    fn observe_replays_value() {
        let cell = ObservableValue::new(json!(42));
        let (observer, log) = recording();
        cell.observe(observer);
        assert_eq!(*log.lock(), vec![("set".to_owned(), vec![json!(42)])]);
    }

    #[test]
    fn set_notifies_only_on_change() {
        let cell = ObservableValue::new(json!(1));
        let (observer, log) = recording();
        cell.observe(observer);
        cell.set(json!(1));
        cell.set(json!(2));
        assert_eq!(log.lock().len(), 2);
        assert_eq!(cell.get(), Some(json!(2)));
    }

    #[test]
    fn error_replaces_replay() {
        let cell = ObservableValue::default();
        cell.set_error(json!({"message": "nope"}));
        let (observer, log) = recording();
        cell.observe(observer);
        assert_eq!(log.lock()[0].0, "error");
        cell.set(json!(3));
        assert!(cell.error().is_none());
    }

    #[test]
    fn mutate_fires_custom_signal() {
        let cell = ObservableValue::new(json!(0));
        let (observer, log) = recording();
        cell.observe(observer);
        cell.mutate("inc", &[], |v| {
            let n = v.as_ref().and_then(Value::as_i64).unwrap_or(0);
            *v = Some(json!(n + 1));
        });
        assert_eq!(cell.get(), Some(json!(1)));
        assert_eq!(log.lock()[1].0, "inc");
    }

    #[test]
    fn observer_can_call_back_into_cell() {
        let cell = Arc::new(ObservableValue::new(json!(0)));
        let inner = cell.clone();
        let observer = FnObserver::new(move |_, _| {
            let _ = inner.get();
        });
        cell.observe(observer);
        cell.set(json!(1));
    }

    #[test]
    fn facade_applies_set() {
        let facade = ObservableValue::default();
        facade.notify("set", &[json!("remote")]);
        assert_eq!(facade.get(), Some(json!("remote")));
    }
}
