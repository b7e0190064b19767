//! Demo data served by `rdao serve` under the `demo` prefix.
//!
//! | Path | Kind |
//! |------|------|
//! | `["demo", "clock"]` | value, server time (ms), ticks every second |
//! | `["demo", "counter"]` | value |
//! | `["demo", "notes"]` | list of note ids |
//! | `["demo", "note", {"note": id}]` | value, `{id, text, createdAt}` |
//! | `["demo", "increment"]` / `["demo", "reset"]` | methods on the counter |
//! | `["demo", "addNote"]` / `["demo", "removeNote"]` | methods on notes |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rdao_core::{DaoError, Observable, ObservableList, ObservableValue, Path};
use rdao_server::{Dao, RoutedDao, SimpleDao};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::debug;

const TICK: Duration = Duration::from_secs(1);

/// In-memory state behind the demo DAO.
pub struct Demo {
    clock: Arc<ObservableValue>,
    counter: Arc<ObservableValue>,
    notes: Arc<ObservableList>,
    note_cells: Mutex<BTreeMap<i64, Arc<ObservableValue>>>,
    next_note: AtomicI64,
}

impl Demo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clock: Arc::new(ObservableValue::new(json!(Utc::now().timestamp_millis()))),
            counter: Arc::new(ObservableValue::new(json!(0))),
            notes: Arc::new(ObservableList::new(Vec::new())),
            note_cells: Mutex::new(BTreeMap::new()),
            next_note: AtomicI64::new(1),
        })
    }

    /// Tick the clock until the returned task is aborted.
    pub fn start_clock(self: &Arc<Self>) -> JoinHandle<()> {
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            loop {
                let _ = interval.tick().await;
                clock.set(json!(Utc::now().timestamp_millis()));
            }
        })
    }

    /// DAO shared by every session.
    pub fn dao(self: &Arc<Self>) -> Arc<dyn Dao> {
        let values = SimpleDao::new()
            .cell("clock", {
                let clock = self.clock.clone();
                move |_| Ok(clock.clone() as Arc<dyn Observable>)
            })
            .cell("counter", {
                let counter = self.counter.clone();
                move |_| Ok(counter.clone() as Arc<dyn Observable>)
            })
            .cell("notes", {
                let notes = self.notes.clone();
                move |_| Ok(notes.clone() as Arc<dyn Observable>)
            })
            .cell("note", {
                let demo = self.clone();
                move |params| demo.note(params)
            });
        let dao = values
            .action("increment", {
                let demo = self.clone();
                move |args| Ok(demo.increment(args.first().and_then(Value::as_i64).unwrap_or(1)))
            })
            .action("reset", {
                let counter = self.counter.clone();
                move |_| {
                    counter.set(json!(0));
                    Ok(json!(0))
                }
            })
            .action("addNote", {
                let demo = self.clone();
                move |args| match args.first().and_then(Value::as_str) {
                    Some(text) => Ok(json!(demo.add_note(text))),
                    None => Err(DaoError::BadRequest("addNote expects a text argument".into())),
                }
            })
            .action("removeNote", {
                let demo = self.clone();
                move |args| match args.first().and_then(Value::as_i64) {
                    Some(id) => Ok(json!(demo.remove_note(id))),
                    None => Err(DaoError::BadRequest("removeNote expects a note id".into())),
                }
            });
        Arc::new(RoutedDao::new().route("demo", Arc::new(dao)))
    }

    fn note(&self, params: &[Value]) -> Result<Arc<dyn Observable>, DaoError> {
        let id = params
            .first()
            .and_then(|p| p.get("note"))
            .and_then(Value::as_i64)
            .ok_or_else(|| DaoError::BadRequest("note path needs {\"note\": id}".into()))?;
        match self.note_cells.lock().get(&id) {
            Some(cell) => Ok(cell.clone() as Arc<dyn Observable>),
            None => Err(DaoError::NotFound(Path::new(json!(["demo", "note", {"note": id}])))),
        }
    }

    fn increment(&self, by: i64) -> Value {
        let next = self.counter.get().and_then(|v| v.as_i64()).unwrap_or(0) + by;
        self.counter.set(json!(next));
        json!(next)
    }

    fn add_note(&self, text: &str) -> i64 {
        let id = self.next_note.fetch_add(1, Ordering::SeqCst);
        let note = json!({
            "id": id,
            "text": text,
            "createdAt": Utc::now().to_rfc3339(),
        });
        let _ = self
            .note_cells
            .lock()
            .insert(id, Arc::new(ObservableValue::new(note)));
        self.notes.push(json!(id));
        debug!(id, "note added");
        id
    }

    fn remove_note(&self, id: i64) -> bool {
        if self.note_cells.lock().remove(&id).is_none() {
            return false;
        }
        self.notes.remove(&json!(id));
        debug!(id, "note removed");
        true
    }
}
