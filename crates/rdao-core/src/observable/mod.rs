//! Observable cells and the observer seam.
//!
//! An [`Observable`] calls each registered [`Observer`] with a
//! `(signal, args)` pair whenever it changes. Observers are always invoked
//! without any internal lock held, so an observer may call back into the
//! cell that notified it.
//!
//! Three observer conventions are supported through adapters:
//! - any type implementing [`Observer::notify`],
//! - a closure, via [`FnObserver`],
//! - an object with one method per standard signal, via [`SignalDispatch`].

mod error;
mod list;
mod value;

use std::sync::Arc;

use serde_json::Value;

pub use error::ErrorObservable;
pub use list::{ObservableList, apply_list_signal};
pub use value::ObservableValue;

/// Receiver of change signals.
pub trait Observer: Send + Sync {
    /// Handle one signal.
    fn notify(&self, signal: &str, args: &[Value]);
}

/// A cell that notifies observers about changes.
pub trait Observable: Send + Sync {
    /// Register an observer. Cells holding a value replay it immediately.
    fn observe(&self, observer: Arc<dyn Observer>);

    /// Remove a previously registered observer (matched by identity).
    fn unobserve(&self, observer: &Arc<dyn Observer>);

    /// Current value, when the cell keeps one.
    fn value(&self) -> Option<Value> {
        None
    }

    /// Release resources held while observed.
    fn dispose(&self) {}

    /// Undo [`Observable::dispose`].
    fn respawn(&self) {}
}

impl std::fmt::Debug for dyn Observable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable").finish_non_exhaustive()
    }
}

/// Whether two observer handles point at the same object.
pub fn same_observer(a: &Arc<dyn Observer>, b: &Arc<dyn Observer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Observer backed by a closure.
pub struct FnObserver<F>(F);

impl<F> FnObserver<F>
where
    F: Fn(&str, &[Value]) + Send + Sync + 'static,
{
    /// Wrap a closure as a shareable observer.
    pub fn new(f: F) -> Arc<dyn Observer> {
        Arc::new(Self(f))
    }
}

impl<F> Observer for FnObserver<F>
where
    F: Fn(&str, &[Value]) + Send + Sync,
{
    fn notify(&self, signal: &str, args: &[Value]) {
        (self.0)(signal, args);
    }
}

/// Per-signal callbacks; every method defaults to a no-op.
#[allow(unused_variables)]
pub trait SignalHandler: Send + Sync {
    /// Whole value replaced.
    fn set(&self, value: &Value) {}
    /// Error reported.
    fn error(&self, error: &Value) {}
    /// Element appended.
    fn push(&self, value: &Value) {}
    /// Element prepended.
    fn unshift(&self, value: &Value) {}
    /// Last element removed.
    fn pop(&self) {}
    /// First element removed.
    fn shift(&self) {}
    /// Elements equal to `value` removed.
    fn remove(&self, value: &Value) {}
    /// Elements equal to `old` replaced by `new`.
    fn update(&self, old: &Value, new: &Value) {}
    /// Any other signal.
    fn other(&self, signal: &str, args: &[Value]) {}
}

/// Adapter routing signals to [`SignalHandler`] methods.
pub struct SignalDispatch<H>(pub H);

impl<H: SignalHandler> Observer for SignalDispatch<H> {
    fn notify(&self, signal: &str, args: &[Value]) {
        static NULL: Value = Value::Null;
        let arg = |i: usize| args.get(i).unwrap_or(&NULL);
        match signal {
            "set" => self.0.set(arg(0)),
            "error" => self.0.error(arg(0)),
            "push" => self.0.push(arg(0)),
            "unshift" => self.0.unshift(arg(0)),
            "pop" => self.0.pop(),
            "shift" => self.0.shift(),
            "remove" => self.0.remove(arg(0)),
            "update" => self.0.update(arg(0), arg(1)),
            _ => self.0.other(signal, args),
        }
    }
}

/// Mirror a standard signal onto a JSON value.
///
/// Returns `false` for signals whose effect is unknown (custom signals).
/// `error` is recognized but leaves the value untouched.
pub fn apply_signal(target: &mut Option<Value>, signal: &str, args: &[Value]) -> bool {
    match signal {
        "set" => {
            *target = Some(args.first().cloned().unwrap_or(Value::Null));
            true
        }
        "error" => true,
        _ if !list::is_list_signal(signal) => false,
        _ => {
            let list = target.get_or_insert_with(|| Value::Array(Vec::new()));
            match list {
                Value::Array(items) => apply_list_signal(items, signal, args),
                _ => false,
            }
        }
    }
}

/// Registered observers of one cell.
#[derive(Default)]
pub(crate) struct ObserverSet {
    observers: Vec<Arc<dyn Observer>>,
}

impl ObserverSet {
    pub(crate) fn add(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    pub(crate) fn remove(&mut self, observer: &Arc<dyn Observer>) -> bool {
        let before = self.observers.len();
        if let Some(pos) = self.observers.iter().position(|o| same_observer(o, observer)) {
            let _ = self.observers.remove(pos);
        }
        self.observers.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Observer>> {
        self.observers.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }
}

pub(crate) fn fire(observers: &[Arc<dyn Observer>], signal: &str, args: &[Value]) {
    for observer in observers {
        observer.notify(signal, args);
    }
}
