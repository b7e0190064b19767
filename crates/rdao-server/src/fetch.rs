//! Batch dependency fetch (`getMore`).
//!
//! Every path is fetched at most once per call. In-flight fetches are shared,
//! so two dependents reaching the same path await one `get`. The response
//! lists each fetched path once, in the order it was first requested.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rdao_core::{DaoError, FetchPath, Fetched, MoreEntry, Path, Schema, collect_pointers};
use serde_json::Value;
use tracing::{debug, error};

use crate::dao::Dao;

type PendingFetch = Shared<BoxFuture<'static, Result<Value, DaoError>>>;

struct Slot {
    pending: PendingFetch,
    value: Option<Value>,
}

/// State of one `getMore` call.
struct BatchFetch {
    dao: Arc<dyn Dao>,
    max_rounds: usize,
    slots: Mutex<IndexMap<Path, Slot>>,
}

/// Fetch `paths` and everything their `more` schemas reach.
pub async fn get_more(dao: Arc<dyn Dao>, paths: &[FetchPath], max_rounds: usize) -> Result<Vec<Fetched>, DaoError> {
    let batch = BatchFetch {
        dao,
        max_rounds,
        slots: Mutex::new(IndexMap::new()),
    };
    batch.run(paths).await?;
    let fetched = batch
        .slots
        .into_inner()
        .into_iter()
        .filter_map(|(what, slot)| slot.value.map(|data| Fetched { what, data }))
        .collect::<Vec<_>>();
    debug!(count = fetched.len(), "getMore complete");
    Ok(fetched)
}

impl BatchFetch {
    async fn run<'a>(&self, paths: &'a [FetchPath]) -> Result<(), DaoError> {
        let mut level: Vec<(Path, &'a [MoreEntry])> = Vec::new();
        for entry in paths {
            match entry {
                FetchPath::What { what, more } => level.push((what.clone(), more)),
                FetchPath::Schema { schema, more } => {
                    for pointer in self.resolve(schema, None).await? {
                        level.push((Path::new(pointer), more));
                    }
                }
            }
        }

        let mut expanded: HashSet<(Path, usize)> = HashSet::new();
        while !level.is_empty() {
            let values = join_all(level.iter().map(|(what, _)| self.fetched(what))).await;
            let mut next = Vec::new();
            for ((what, more), value) in level.iter().zip(values) {
                let value = value?;
                for entry in *more {
                    if !expanded.insert((what.clone(), std::ptr::from_ref(entry).addr())) {
                        continue;
                    }
                    for pointer in self.resolve(&entry.schema, Some(&value)).await? {
                        next.push((Path::new(pointer), entry.more.as_slice()));
                    }
                }
            }
            level = next;
        }
        Ok(())
    }

    /// Shared fetch of one path. Only the first request reaches the DAO.
    fn fetch(&self, what: &Path) -> PendingFetch {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(what) {
            return slot.pending.clone();
        }
        let dao = self.dao.clone();
        let target = what.clone();
        let pending = async move { dao.get(&target).await }.boxed().shared();
        let _ = slots.insert(
            what.clone(),
            Slot {
                pending: pending.clone(),
                value: None,
            },
        );
        pending
    }

    /// Await the shared fetch and record its value for source lookups.
    async fn fetched(&self, what: &Path) -> Result<Value, DaoError> {
        let value = self.fetch(what).await?;
        if let Some(slot) = self.slots.lock().get_mut(what) {
            slot.value.get_or_insert_with(|| value.clone());
        }
        Ok(value)
    }

    /// Evaluate `schemas`, fetching every consulted source until the
    /// evaluation no longer asks for an unknown one.
    async fn resolve(&self, schemas: &[Schema], base: Option<&Value>) -> Result<Vec<Value>, DaoError> {
        for _ in 0..self.max_rounds.max(1) {
            let mut missing: Vec<Path> = Vec::new();
            let pointers = {
                let slots = self.slots.lock();
                collect_pointers(base, schemas, &mut |pointer| {
                    let source = Path::new(pointer.clone());
                    match slots.get(&source).and_then(|slot| slot.value.clone()) {
                        Some(value) => Some(value),
                        None => {
                            missing.push(source);
                            None
                        }
                    }
                })
            };
            let pointers = pointers.map_err(|err| {
                error!(error = %err, "dependency schema violates cardinality");
                DaoError::Internal(err.to_string())
            })?;
            if missing.is_empty() {
                return Ok(pointers);
            }
            for result in join_all(missing.iter().map(|source| self.fetched(source))).await {
                let _ = result?;
            }
        }
        Err(DaoError::BadRequest(format!(
            "source chain not resolved after {} rounds",
            self.max_rounds
        )))
    }
}
