//! Shared fixture for end-to-end tests: a small users / roles / languages /
//! projects model behind the `test` prefix, plus helpers to connect a client
//! through the loopback transport.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdao_client::ReactiveConnection;
use rdao_core::{DaoError, Observable, ObservableList, ObservableValue, Path, Schema};
use rdao_server::{Dao, LoopbackConnector, ReactiveServer, RoutedDao, SimpleDao, shared_dao};
use rdao_settings::{ConnectionSettings, ServerSettings};
use serde_json::{Value, json};

pub fn path(value: Value) -> Path {
    Path::new(value)
}

pub fn schema(value: Value) -> Vec<Schema> {
    Schema::list_from_value(&value).unwrap()
}

/// Poll `condition` until it holds, failing after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

struct Project {
    id: i64,
    owner: i64,
    language: i64,
}

/// Mutable model shared by every session.
pub struct TestData {
    pub users: Arc<ObservableList>,
    pub me: Arc<ObservableValue>,
    pub counter: Arc<ObservableValue>,
    user_cells: Mutex<BTreeMap<i64, Arc<ObservableValue>>>,
    roles: BTreeMap<i64, Arc<ObservableValue>>,
    languages: BTreeMap<i64, (String, Arc<ObservableValue>)>,
    projects: Mutex<Vec<Project>>,
    project_lists: Mutex<HashMap<(i64, i64), Arc<ObservableList>>>,
    next_id: AtomicI64,
    gets: Mutex<HashMap<Path, usize>>,
    pub slow_calls: AtomicUsize,
}

impl TestData {
    pub fn new() -> Arc<Self> {
        let user_cells = [(0, "alice", 0), (1, "bob", 1), (2, "carol", 1), (3, "dave", 1)]
            .into_iter()
            .map(|(id, name, role)| (id, Arc::new(ObservableValue::new(user(id, name, role)))))
            .collect();
        let roles = [(0, "admin"), (1, "member"), (2, "guest")]
            .into_iter()
            .map(|(id, name)| (id, Arc::new(ObservableValue::new(json!({"id": id, "name": name})))))
            .collect();
        let languages = [(0, "js"), (1, "java"), (2, "cpp")]
            .into_iter()
            .map(|(id, name)| {
                let cell = Arc::new(ObservableValue::new(json!({"id": id, "name": name})));
                (id, (name.to_owned(), cell))
            })
            .collect();
        let projects = (0..3)
            .map(|id| Project {
                id,
                owner: 0,
                language: id,
            })
            .collect();
        Arc::new(Self {
            users: Arc::new(ObservableList::new(vec![json!(0), json!(1), json!(2), json!(3)])),
            me: Arc::new(ObservableValue::new(json!({"id": 0}))),
            counter: Arc::new(ObservableValue::new(json!(0))),
            user_cells: Mutex::new(user_cells),
            roles,
            languages,
            projects: Mutex::new(projects),
            project_lists: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(4),
            gets: Mutex::new(HashMap::new()),
            slow_calls: AtomicUsize::new(0),
        })
    }

    /// Number of DAO `get` calls for `what`.
    pub fn gets_of(&self, what: &Value) -> usize {
        self.gets.lock().get(&path(what.clone())).copied().unwrap_or(0)
    }

    pub fn total_gets(&self) -> usize {
        self.gets.lock().values().sum()
    }

    pub fn user_cell(&self, id: i64) -> Option<Arc<ObservableValue>> {
        self.user_cells.lock().get(&id).cloned()
    }

    pub fn role_cell(&self, id: i64) -> Option<Arc<ObservableValue>> {
        self.roles.get(&id).cloned()
    }

    fn project_list(&self, owner: i64, language: i64) -> Arc<ObservableList> {
        let mut lists = self.project_lists.lock();
        lists
            .entry((owner, language))
            .or_insert_with(|| {
                let ids = self
                    .projects
                    .lock()
                    .iter()
                    .filter(|p| p.owner == owner && p.language == language)
                    .map(|p| json!(p.id))
                    .collect();
                Arc::new(ObservableList::new(ids))
            })
            .clone()
    }

    fn add_user(&self, name: &str, role: i64) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .user_cells
            .lock()
            .insert(id, Arc::new(ObservableValue::new(user(id, name, role))));
        self.users.push(json!(id));
        id
    }

    fn remove_user(&self, id: i64) -> bool {
        if self.user_cells.lock().remove(&id).is_none() {
            return false;
        }
        self.users.remove(&json!(id));
        true
    }

    fn add_project(&self, owner: i64, language: i64) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.projects.lock().push(Project { id, owner, language });
        let list = self.project_lists.lock().get(&(owner, language)).cloned();
        if let Some(list) = list {
            list.push(json!(id));
        }
        id
    }

    fn remove_project(&self, id: i64) -> bool {
        let removed = {
            let mut projects = self.projects.lock();
            let Some(pos) = projects.iter().position(|p| p.id == id) else {
                return false;
            };
            projects.remove(pos)
        };
        let list = self.project_lists.lock().get(&(removed.owner, removed.language)).cloned();
        if let Some(list) = list {
            list.remove(&json!(id));
        }
        true
    }
}

fn user(id: i64, name: &str, role: i64) -> Value {
    json!({"id": id, "name": name, "role": role})
}

fn param(params: &[Value], key: &str) -> Option<Value> {
    params.first().and_then(|p| p.get(key)).cloned()
}

fn int_param(params: &[Value], key: &str) -> Result<i64, DaoError> {
    param(params, key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| DaoError::BadRequest(format!("missing integer parameter {key}")))
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, DaoError> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| DaoError::BadRequest(format!("argument {index} must be an integer")))
}

fn cell(observable: Arc<impl Observable + 'static>) -> Arc<dyn Observable> {
    observable
}

fn missing(what: &str) -> DaoError {
    DaoError::NotFound(path(json!(["test", what])))
}

fn model(data: &Arc<TestData>) -> SimpleDao {
    let d = data.clone();
    let dao = SimpleDao::new().cell("users", move |_| Ok(cell(d.users.clone())));
    let d = data.clone();
    let dao = dao.cell("me", move |_| Ok(cell(d.me.clone())));
    let d = data.clone();
    let dao = dao.cell("counter", move |_| Ok(cell(d.counter.clone())));
    let d = data.clone();
    let dao = dao.cell("user", move |params| {
        let id = int_param(params, "user")?;
        d.user_cell(id).map(cell).ok_or_else(|| missing("user"))
    });
    let d = data.clone();
    let dao = dao.cell("role", move |params| {
        let id = int_param(params, "role")?;
        d.roles.get(&id).cloned().map(cell).ok_or_else(|| missing("role"))
    });
    let d = data.clone();
    let dao = dao.cell("languages", move |_| {
        let ids = d.languages.keys().map(|id| json!(id)).collect();
        Ok(cell(Arc::new(ObservableList::new(ids))))
    });
    let d = data.clone();
    let dao = dao.cell("language", move |params| {
        let id = int_param(params, "language")?;
        d.languages
            .get(&id)
            .map(|(_, c)| cell(c.clone()))
            .ok_or_else(|| missing("language"))
    });
    let d = data.clone();
    let dao = dao.cell("languageByName", move |params| {
        let name = param(params, "name").unwrap_or(Value::Null);
        d.languages
            .iter()
            .find(|(_, (n, _))| Some(n.as_str()) == name.as_str())
            .map(|(_, (_, c))| cell(c.clone()))
            .ok_or_else(|| missing("languageByName"))
    });
    let d = data.clone();
    let dao = dao.cell("userProjectsByLanguage", move |params| {
        let owner = int_param(params, "user")?;
        let language = int_param(params, "language")?;
        Ok(cell(d.project_list(owner, language)))
    });
    let dao = dao.cell("project", move |params| {
        let id = int_param(params, "project")?;
        Ok(cell(Arc::new(ObservableValue::new(json!({"id": id})))))
    });
    let dao = dao.value(
        "instaError",
        |_| Err(DaoError::Rejected(json!("insta"))),
        |_params: Vec<Value>| async { Err::<Value, _>(DaoError::Rejected(json!("insta"))) },
    );

    let d = data.clone();
    let dao = dao.action("addUser", move |args| {
        let name = args.first().and_then(Value::as_str).unwrap_or("anonymous").to_owned();
        Ok(json!(d.add_user(&name, int_arg(&args, 1)?)))
    });
    let d = data.clone();
    let dao = dao.action("removeUser", move |args| Ok(json!(d.remove_user(int_arg(&args, 0)?))));
    let d = data.clone();
    let dao = dao.action("addProject", move |args| {
        Ok(json!(d.add_project(int_arg(&args, 0)?, int_arg(&args, 1)?)))
    });
    let d = data.clone();
    let dao = dao.action("removeProject", move |args| Ok(json!(d.remove_project(int_arg(&args, 0)?))));
    let d = data.clone();
    let dao = dao.action("login", move |args| {
        let id = int_arg(&args, 0)?;
        d.me.set(json!({"id": id}));
        Ok(json!(id))
    });
    let d = data.clone();
    let dao = dao.action("increment", move |_args| {
        let next = d.counter.get().and_then(|v| v.as_i64()).unwrap_or(0) + 1;
        d.counter.set(json!(next));
        Ok(json!(next))
    });
    let d = data.clone();
    dao.method("slowIncrement", move |_args| {
        let d = d.clone();
        async move {
            let _ = d.slow_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            let next = d.counter.get().and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            d.counter.set(json!(next));
            Ok::<_, DaoError>(json!(next))
        }
    })
}

/// Counts every `get` before delegating.
struct CountingDao {
    data: Arc<TestData>,
    inner: RoutedDao,
}

#[async_trait]
impl Dao for CountingDao {
    fn observable(&self, what: &Path) -> Result<Arc<dyn Observable>, DaoError> {
        self.inner.observable(what)
    }

    async fn get(&self, what: &Path) -> Result<Value, DaoError> {
        *self.data.gets.lock().entry(what.clone()).or_default() += 1;
        self.inner.get(what).await
    }

    async fn request(&self, method: &Path, args: Vec<Value>) -> Result<Value, DaoError> {
        self.inner.request(method, args).await
    }
}

/// Server over `data` with default settings.
pub fn server(data: &Arc<TestData>) -> Arc<ReactiveServer> {
    server_with(data, ServerSettings::default())
}

pub fn server_with(data: &Arc<TestData>, settings: ServerSettings) -> Arc<ReactiveServer> {
    let dao = CountingDao {
        data: data.clone(),
        inner: RoutedDao::new().route("test", Arc::new(model(data))),
    };
    Arc::new(ReactiveServer::with_settings(shared_dao(Arc::new(dao)), settings))
}

/// Client settings with a short reconnect delay.
pub fn fast_settings() -> ConnectionSettings {
    ConnectionSettings {
        reconnect_delay_ms: 50,
        ..ConnectionSettings::default()
    }
}

pub fn connect(server: &Arc<ReactiveServer>) -> ReactiveConnection {
    connect_with(LoopbackConnector::new(server.clone()), fast_settings())
}

pub fn connect_with(connector: LoopbackConnector, settings: ConnectionSettings) -> ReactiveConnection {
    ReactiveConnection::new(Arc::new(connector), json!({"user": "tester"}), settings)
}
