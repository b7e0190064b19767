//! Cell that only ever reports an error.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::{Observable, Observer, ObserverSet};

/// Observable standing in for a value that could not be produced.
///
/// Each new observer immediately receives `error` with the stored payload.
pub struct ErrorObservable {
    error: Value,
    observers: Mutex<ObserverSet>,
}

impl ErrorObservable {
    /// Wrap an error payload.
    pub fn new(error: Value) -> Self {
        Self {
            error,
            observers: Mutex::new(ObserverSet::default()),
        }
    }
}

impl Observable for ErrorObservable {
    fn observe(&self, observer: Arc<dyn Observer>) {
        self.observers.lock().add(observer.clone());
        observer.notify("error", std::slice::from_ref(&self.error));
    }

    fn unobserve(&self, observer: &Arc<dyn Observer>) {
        let _ = self.observers.lock().remove(observer);
    }
}
