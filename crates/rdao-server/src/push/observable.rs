//! The list observable handed to clients for composite paths.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rdao_core::{FetchPath, Observable, Observer, Path};
use serde_json::Value;
use tracing::debug;

use super::scanner::DepsScanner;
use super::trigger::PushTrigger;
use super::{PointerList, PushRegistry, Serial};

enum Root {
    Target(Arc<PushTrigger>),
    Scan(Arc<DepsScanner>),
}

impl Root {
    fn dispose(&self) {
        match self {
            Self::Target(trigger) => trigger.dispose(),
            Self::Scan(scanner) => scanner.dispose(),
        }
    }
}

/// Ordered list of every path the entries currently reach.
///
/// Starts resolving when the first observer arrives and releases every push
/// reference when the last one leaves.
pub struct PushObservable {
    entries: Vec<FetchPath>,
    pointers: Arc<PointerList>,
    serial: Serial,
    roots: Mutex<Option<Vec<Root>>>,
}

impl PushObservable {
    /// Push observable over `entries`, pushing through `registry`.
    pub fn new(entries: Vec<FetchPath>, registry: Weak<dyn PushRegistry>, serial: Serial) -> Self {
        Self {
            entries,
            pointers: Arc::new(PointerList::new(registry)),
            serial,
            roots: Mutex::new(None),
        }
    }

    /// Paths currently in the list.
    pub fn paths(&self) -> Vec<Path> {
        self.pointers
            .list()
            .get()
            .unwrap_or_default()
            .into_iter()
            .map(Path::new)
            .collect()
    }

    /// Whether resolution is running.
    pub fn is_active(&self) -> bool {
        self.roots.lock().is_some()
    }

    fn start(&self) {
        {
            let mut roots = self.roots.lock();
            if roots.is_some() {
                return;
            }
            *roots = Some(Vec::new());
        }
        debug!(entries = self.entries.len(), "push observable started");
        for entry in &self.entries {
            let root = match entry {
                FetchPath::What { what, more } => {
                    let trigger = PushTrigger::new(what.clone(), more, self.pointers.clone(), self.serial.clone());
                    trigger.start();
                    Root::Target(trigger)
                }
                FetchPath::Schema { schema, more } => {
                    let scanner = DepsScanner::new(
                        schema.clone(),
                        more.clone(),
                        self.pointers.clone(),
                        self.serial.clone(),
                    );
                    scanner.scan();
                    Root::Scan(scanner)
                }
            };
            match self.roots.lock().as_mut() {
                Some(roots) => roots.push(root),
                None => root.dispose(),
            }
        }
    }

    fn stop(&self) {
        let Some(roots) = self.roots.lock().take() else {
            return;
        };
        for root in &roots {
            root.dispose();
        }
        self.pointers.drain();
        debug!("push observable stopped");
    }
}

impl Observable for PushObservable {
    fn observe(&self, observer: Arc<dyn Observer>) {
        let _serial = self.serial.lock();
        self.start();
        self.pointers.list().observe(observer);
    }

    fn unobserve(&self, observer: &Arc<dyn Observer>) {
        let _serial = self.serial.lock();
        self.pointers.list().unobserve(observer);
        if self.pointers.list().observer_count() == 0 {
            self.stop();
        }
    }

    fn value(&self) -> Option<Value> {
        self.pointers.list().value()
    }

    fn dispose(&self) {
        let _serial = self.serial.lock();
        self.stop();
    }

    fn respawn(&self) {
        let _serial = self.serial.lock();
        self.start();
    }
}
