//! Client-side observations.
//!
//! One [`Observation`] per observed path multiplexes a single network
//! subscription onto any number of local facades. It also mirrors the
//! remote value so a facade attached after data arrived starts from the
//! current state.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use rdao_core::{Observer, Path, apply_signal};
use serde_json::Value;
use tracing::debug;

use crate::connection::Inner;

/// One signal as delivered to observers.
pub(crate) type Signal = (String, Vec<Value>);

/// Custom signals kept after the last snapshot for replay.
pub(crate) const MAX_REPLAY_TAIL: usize = 256;

/// A facade attached to an observation.
pub(crate) struct Facade {
    pub(crate) id: u64,
    pub(crate) observer: Arc<dyn Observer>,
    /// Set for facades created by type, so later lookups can share them.
    pub(crate) shared: Option<Arc<dyn Any + Send + Sync>>,
    /// Live handles referring to this facade.
    pub(crate) handles: usize,
    /// Cleared until the facade received its replay.
    pub(crate) ready: bool,
}

/// Network subscription state for one path.
pub(crate) struct Observation {
    pub(crate) facades: Vec<Facade>,
    pub(crate) pushed: bool,
    value: Option<Value>,
    error: Option<Value>,
    /// Signals the mirror cannot fold into `value`, oldest first.
    tail: VecDeque<Signal>,
    /// Serializes delivery to facades so replays and live signals never
    /// interleave. Reentrant so an observer may attach on the same path.
    pub(crate) delivery: Arc<ReentrantMutex<()>>,
}

impl Observation {
    pub(crate) fn new(pushed: bool) -> Self {
        Self {
            facades: Vec::new(),
            pushed,
            value: None,
            error: None,
            tail: VecDeque::new(),
            delivery: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Update the mirror with a remote signal.
    ///
    /// `set` and `error` reset the tail. Past [`MAX_REPLAY_TAIL`] custom
    /// signals the oldest are dropped.
    pub(crate) fn apply(&mut self, signal: &str, args: &[Value]) {
        match signal {
            "set" => {
                self.error = None;
                self.tail.clear();
                let _ = apply_signal(&mut self.value, signal, args);
            }
            "error" => {
                self.tail.clear();
                self.error = Some(args.first().cloned().unwrap_or(Value::Null));
            }
            _ => {
                if !apply_signal(&mut self.value, signal, args) {
                    if self.tail.len() == MAX_REPLAY_TAIL {
                        let _ = self.tail.pop_front();
                        debug!(signal, "replay tail full, dropping oldest signal");
                    }
                    self.tail.push_back((signal.to_owned(), args.to_vec()));
                }
            }
        }
    }

    /// Signals that bring a fresh facade up to date.
    pub(crate) fn replay(&self) -> Vec<Signal> {
        let mut signals = Vec::with_capacity(1 + self.tail.len());
        if let Some(error) = &self.error {
            signals.push(("error".to_owned(), vec![error.clone()]));
        } else if let Some(value) = &self.value {
            signals.push(("set".to_owned(), vec![value.clone()]));
        }
        signals.extend(self.tail.iter().cloned());
        signals
    }

    pub(crate) fn observers(&self) -> Vec<Arc<dyn Observer>> {
        self.facades
            .iter()
            .filter(|f| f.ready)
            .map(|f| f.observer.clone())
            .collect()
    }

    /// Last mirrored value.
    pub(crate) fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }
}

/// Deliver signals to observers while holding the delivery lock.
pub(crate) fn deliver(
    delivery: &ReentrantMutex<()>,
    observers: &[Arc<dyn Observer>],
    signals: &[Signal],
) {
    let _serial = delivery.lock();
    for (signal, args) in signals {
        for observer in observers {
            observer.notify(signal, args);
        }
    }
}

/// Handle to a facade attached to a remote path.
///
/// Dereferences to the facade. Dropping the handle (or calling
/// [`RemoteObservable::dispose`]) detaches it; when the last facade of a
/// path detaches the connection sends `unobserve`.
pub struct RemoteObservable<F: ?Sized> {
    connection: Weak<Inner>,
    what: Path,
    facade: Arc<F>,
    observer: Arc<dyn Observer>,
    /// Type-erased facade for handles created by type, so a respawn can be
    /// found again by later typed lookups.
    shared: Option<Arc<dyn Any + Send + Sync>>,
    attachment: Mutex<Option<u64>>,
}

impl<F: ?Sized> RemoteObservable<F> {
    pub(crate) fn new(
        connection: Weak<Inner>,
        what: Path,
        facade: Arc<F>,
        observer: Arc<dyn Observer>,
        shared: Option<Arc<dyn Any + Send + Sync>>,
        facade_id: u64,
    ) -> Self {
        Self {
            connection,
            what,
            facade,
            observer,
            shared,
            attachment: Mutex::new(Some(facade_id)),
        }
    }

    /// Observed path.
    pub fn what(&self) -> &Path {
        &self.what
    }

    /// Shared facade object.
    pub fn facade(&self) -> &Arc<F> {
        &self.facade
    }

    /// Whether this handle is currently attached.
    pub fn is_attached(&self) -> bool {
        self.attachment.lock().is_some()
    }

    /// Detach from the path. Idempotent.
    pub fn dispose(&self) {
        let Some(facade_id) = self.attachment.lock().take() else {
            return;
        };
        if let Some(inner) = self.connection.upgrade() {
            inner.detach(&self.what, facade_id);
        }
    }

    /// Attach again after [`RemoteObservable::dispose`], creating a fresh
    /// observation when the old one was torn down.
    pub fn respawn(&self) {
        let mut attachment = self.attachment.lock();
        if attachment.is_some() {
            return;
        }
        if let Some(inner) = self.connection.upgrade() {
            let shared = self.shared.clone();
            *attachment = Some(inner.attach_object(&self.what, self.observer.clone(), shared));
        }
    }
}

impl<F: ?Sized> Deref for RemoteObservable<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.facade
    }
}

impl<F: ?Sized> Drop for RemoteObservable<F> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<F: ?Sized> fmt::Debug for RemoteObservable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObservable")
            .field("what", &self.what)
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}
