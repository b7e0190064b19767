//! Builder-style DAOs.
//!
//! [`SimpleDao`] serves paths of the form `[prefix, name, params...]`: the
//! second segment selects a registered value or method and the remaining
//! segments are handed to it as parameters. [`RoutedDao`] picks a source by
//! the longest run of leading string segments, joined with `.`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use rdao_core::{DaoError, Observable, Path};
use serde_json::Value;

use crate::dao::Dao;

type ObservableFn = Arc<dyn Fn(&[Value]) -> Result<Arc<dyn Observable>, DaoError> + Send + Sync>;
type CallFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, DaoError>> + Send + Sync>;

struct ValueEntry {
    observable: ObservableFn,
    get: CallFn,
}

/// DAO assembled from named values and methods.
#[derive(Default)]
pub struct SimpleDao {
    values: HashMap<String, ValueEntry>,
    methods: HashMap<String, CallFn>,
}

impl SimpleDao {
    /// Empty DAO.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value with separate observable and fetch functions.
    #[must_use]
    pub fn value<O, G, Fut>(mut self, name: &str, observable: O, get: G) -> Self
    where
        O: Fn(&[Value]) -> Result<Arc<dyn Observable>, DaoError> + Send + Sync + 'static,
        G: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, DaoError>> + Send + 'static,
    {
        let entry = ValueEntry {
            observable: Arc::new(observable),
            get: Arc::new(move |params: Vec<Value>| get(params).boxed()),
        };
        let _ = self.values.insert(name.to_owned(), entry);
        self
    }

    /// Register a value whose fetch reads the observable's current value.
    #[must_use]
    pub fn cell<O>(mut self, name: &str, observable: O) -> Self
    where
        O: Fn(&[Value]) -> Result<Arc<dyn Observable>, DaoError> + Send + Sync + 'static,
    {
        let observable: ObservableFn = Arc::new(observable);
        let reader = observable.clone();
        let get: CallFn = Arc::new(move |params: Vec<Value>| {
            let current = reader(&params).map(|cell| cell.value().unwrap_or(Value::Null));
            async move { current }.boxed()
        });
        let _ = self
            .values
            .insert(name.to_owned(), ValueEntry { observable, get });
        self
    }

    /// Register an asynchronous method. Path parameters precede the
    /// request arguments.
    #[must_use]
    pub fn method<M, Fut>(mut self, name: &str, method: M) -> Self
    where
        M: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, DaoError>> + Send + 'static,
    {
        let _ = self
            .methods
            .insert(name.to_owned(), Arc::new(move |args: Vec<Value>| method(args).boxed()));
        self
    }

    /// Register a synchronous method.
    #[must_use]
    pub fn action<M>(self, name: &str, action: M) -> Self
    where
        M: Fn(Vec<Value>) -> Result<Value, DaoError> + Send + Sync + 'static,
    {
        self.method(name, move |args| std::future::ready(action(args)))
    }

    fn lookup<'a, T>(
        table: &'a HashMap<String, T>,
        what: &'a Path,
        missing: fn(Path) -> DaoError,
    ) -> Result<(&'a T, &'a [Value]), DaoError> {
        let name = what
            .segment_str(1)
            .ok_or_else(|| DaoError::BadRequest(format!("path {what} has no name segment")))?;
        let entry = table.get(name).ok_or_else(|| missing(what.clone()))?;
        Ok((entry, &what.segments()[2..]))
    }
}

#[async_trait]
impl Dao for SimpleDao {
    fn observable(&self, what: &Path) -> Result<Arc<dyn Observable>, DaoError> {
        let (entry, params) = Self::lookup(&self.values, what, DaoError::NotFound)?;
        (entry.observable)(params)
    }

    async fn get(&self, what: &Path) -> Result<Value, DaoError> {
        let (entry, params) = Self::lookup(&self.values, what, DaoError::NotFound)?;
        (entry.get)(params.to_vec()).await
    }

    async fn request(&self, method: &Path, args: Vec<Value>) -> Result<Value, DaoError> {
        let (call, params) = Self::lookup(&self.methods, method, DaoError::MethodNotFound)?;
        let mut all = params.to_vec();
        all.extend(args);
        call(all).await
    }
}

/// DAO delegating to sources registered under path prefixes.
#[derive(Default)]
pub struct RoutedDao {
    routes: HashMap<String, Arc<dyn Dao>>,
    fallback: Option<Arc<dyn Dao>>,
}

impl RoutedDao {
    /// Router without routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve paths starting with `prefix` (segments joined by `.`) from `dao`.
    #[must_use]
    pub fn route(mut self, prefix: impl Into<String>, dao: Arc<dyn Dao>) -> Self {
        let _ = self.routes.insert(prefix.into(), dao);
        self
    }

    /// Source for paths no route matches.
    #[must_use]
    pub fn fallback(mut self, dao: Arc<dyn Dao>) -> Self {
        self.fallback = Some(dao);
        self
    }

    fn find(&self, what: &Path) -> Option<&Arc<dyn Dao>> {
        let prefix: Vec<&str> = what.segments().iter().map_while(Value::as_str).collect();
        (1..=prefix.len())
            .rev()
            .find_map(|len| self.routes.get(&prefix[..len].join(".")))
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl Dao for RoutedDao {
    fn observable(&self, what: &Path) -> Result<Arc<dyn Observable>, DaoError> {
        self.find(what)
            .ok_or_else(|| DaoError::NotFound(what.clone()))?
            .observable(what)
    }

    async fn get(&self, what: &Path) -> Result<Value, DaoError> {
        self.find(what)
            .ok_or_else(|| DaoError::NotFound(what.clone()))?
            .get(what)
            .await
    }

    async fn request(&self, method: &Path, args: Vec<Value>) -> Result<Value, DaoError> {
        self.find(method)
            .ok_or_else(|| DaoError::MethodNotFound(method.clone()))?
            .request(method, args)
            .await
    }

    fn dispose(&self) {
        for dao in self.routes.values().chain(self.fallback.iter()) {
            dao.dispose();
        }
    }
}
