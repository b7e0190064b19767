//! Ordered list cell.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::{Observable, Observer, ObserverSet, fire};

const LIST_SIGNALS: &[&str] = &[
    "push",
    "unshift",
    "pop",
    "shift",
    "splice",
    "remove",
    "update",
    "removeByField",
    "updateByField",
];

pub(crate) fn is_list_signal(signal: &str) -> bool {
    LIST_SIGNALS.contains(&signal)
}

/// Apply a list signal to `items`. Returns `false` for unknown signals.
pub fn apply_list_signal(items: &mut Vec<Value>, signal: &str, args: &[Value]) -> bool {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    match signal {
        "push" => items.push(arg(0)),
        "unshift" => items.insert(0, arg(0)),
        "pop" => {
            let _ = items.pop();
        }
        "shift" => {
            if !items.is_empty() {
                let _ = items.remove(0);
            }
        }
        "splice" => {
            let len = items.len();
            let at = match args.first().and_then(Value::as_i64).unwrap_or(0) {
                neg if neg < 0 => len.saturating_sub(usize::try_from(neg.unsigned_abs()).unwrap_or(len)),
                pos => usize::try_from(pos).unwrap_or(len).min(len),
            };
            let delete = args
                .get(1)
                .and_then(Value::as_u64)
                .map_or(len - at, |d| usize::try_from(d).unwrap_or(len))
                .min(len - at);
            let inserted = args.iter().skip(2).cloned();
            let _ = items.splice(at..at + delete, inserted);
        }
        "remove" => {
            let exact = arg(0);
            items.retain(|item| *item != exact);
        }
        "update" => {
            let (exact, element) = (arg(0), arg(1));
            for item in items.iter_mut().filter(|item| **item == exact) {
                item.clone_from(&element);
            }
        }
        "removeByField" => {
            let (field, value) = (arg(0), arg(1));
            let Some(field) = field.as_str() else { return true };
            items.retain(|item| item.get(field) != Some(&value));
        }
        "updateByField" => {
            let (field, value, element) = (arg(0), arg(1), arg(2));
            let Some(field) = field.as_str() else { return true };
            for item in items.iter_mut().filter(|item| item.get(field) == Some(&value)) {
                item.clone_from(&element);
            }
        }
        _ => return false,
    }
    true
}

#[derive(Default)]
struct ListState {
    list: Option<Vec<Value>>,
    error: Option<Value>,
    observers: ObserverSet,
}

/// Ordered list that notifies observers of element-level changes.
///
/// Also usable as a client-side facade: as an [`Observer`] it applies the
/// remote list signals to itself and re-fires them to its own observers.
#[derive(Default)]
pub struct ObservableList {
    state: Mutex<ListState>,
}

impl ObservableList {
    /// List with initial contents.
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            state: Mutex::new(ListState {
                list: Some(items),
                ..ListState::default()
            }),
        }
    }

    /// Current contents, `None` before the first `set`.
    pub fn get(&self) -> Option<Vec<Value>> {
        self.state.lock().list.clone()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.state.lock().list.as_ref().map_or(0, Vec::len)
    }

    /// Whether the list has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an element equal to `value` is present.
    pub fn contains(&self, value: &Value) -> bool {
        self.state
            .lock()
            .list
            .as_ref()
            .is_some_and(|list| list.contains(value))
    }

    /// Last reported error, if any.
    pub fn error(&self) -> Option<Value> {
        self.state.lock().error.clone()
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Replace the whole list. Equal contents are a no-op.
    pub fn set(&self, items: Vec<Value>) {
        let observers = {
            let mut state = self.state.lock();
            if state.list.as_ref() == Some(&items) && state.error.is_none() {
                return;
            }
            state.list = Some(items.clone());
            state.error = None;
            state.observers.snapshot()
        };
        fire(&observers, "set", &[Value::Array(items)]);
    }

    /// Append an element.
    pub fn push(&self, value: Value) {
        self.mutate("push", vec![value]);
    }

    /// Prepend an element.
    pub fn unshift(&self, value: Value) {
        self.mutate("unshift", vec![value]);
    }

    /// Remove the last element.
    pub fn pop(&self) {
        self.mutate("pop", Vec::new());
    }

    /// Remove the first element.
    pub fn shift(&self) {
        self.mutate("shift", Vec::new());
    }

    /// Remove `delete` elements at `at` and insert `items` there.
    pub fn splice(&self, at: usize, delete: usize, items: Vec<Value>) {
        let mut args = vec![Value::from(at), Value::from(delete)];
        args.extend(items);
        self.mutate("splice", args);
    }

    /// Remove every element equal to `value`.
    pub fn remove(&self, value: &Value) {
        self.mutate("remove", vec![value.clone()]);
    }

    /// Replace every element equal to `old` with `new`.
    pub fn update(&self, old: &Value, new: Value) {
        self.mutate("update", vec![old.clone(), new]);
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

    fn mutate(&self, signal: &str, args: Vec<Value>) {
        let observers = {
            let mut state = self.state.lock();
            let list = state.list.get_or_insert_with(Vec::new);
            if !apply_list_signal(list, signal, &args) {
                return;
            }
            state.observers.snapshot()
        };
        fire(&observers, signal, &args);
    }
}

impl Observable for ObservableList {
    fn observe(&self, observer: Arc<dyn Observer>) {
        let (list, error) = {
            let mut state = self.state.lock();
            state.observers.add(observer.clone());
            (state.list.clone(), state.error.clone())
        };
        if let Some(error) = error {
            observer.notify("error", &[error]);
        } else if let Some(list) = list {
            observer.notify("set", &[Value::Array(list)]);
        }
    }

    fn unobserve(&self, observer: &Arc<dyn Observer>) {
        let _ = self.state.lock().observers.remove(observer);
    }

    fn value(&self) -> Option<Value> {
        self.get().map(Value::Array)
    }
}

impl Observer for ObservableList {
    fn notify(&self, signal: &str, args: &[Value]) {
        match signal {
            "set" => {
                let items = match args.first() {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                self.set(items);
            }
            "error" => self.set_error(args.first().cloned().unwrap_or(Value::Null)),
            _ if is_list_signal(signal) => self.mutate(signal, args.to_vec()),
            _ => {
                let observers = self.state.lock().observers.snapshot();
                fire(&observers, signal, args);
            }
        }
    }
}
