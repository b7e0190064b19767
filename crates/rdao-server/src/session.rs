//! Server side of one client connection.
//!
//! A [`Session`] authenticates the client through the server's
//! [`DaoFactory`], then dispatches every frame: calls run on their own tasks
//! and reply by request ID, while subscription changes run inline under the
//! session's serial lock. Each path has at most one server observation,
//! kept alive while the client observes it directly or any push refers to
//! it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use indexmap::IndexMap;
use metrics::{counter, gauge};
use parking_lot::{Mutex, ReentrantMutex};
use rdao_core::{
    DaoError, ErrorObservable, Message, Observable, ObservationError, Observer, Path, ProtocolError, SessionId,
    now_millis,
};
use rdao_settings::ServerSettings;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::dao::{Dao, DaoFactory};
use crate::fetch::get_more;
use crate::push::{PushObservable, PushRegistry, Serial};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session lifecycle and heartbeat notifications.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// The client pinged us (already answered).
    Ping(Option<Value>),
    /// The client answered one of our pings.
    Pong(Option<Value>),
    /// The client broke the protocol; the session is closing.
    ClientError(String),
    /// The session ended.
    Closed,
}

/// Write half of the link, shared with every forwarder.
pub(crate) struct Outbound {
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Outbound {
    fn new(sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub(crate) fn send(&self, message: &Message) -> bool {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(error) => {
                warn!(kind = message.kind(), %error, "failed to encode message");
                return false;
            }
        };
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(frame).is_ok())
    }

    fn close(&self) {
        drop(self.sender.lock().take());
    }
}

/// Relays one observable's signals to the client as `notify`.
struct Forwarder {
    what: Path,
    outbound: Arc<Outbound>,
}

impl Observer for Forwarder {
    fn notify(&self, signal: &str, args: &[Value]) {
        let _ = self.outbound.send(&Message::Notify {
            what: self.what.clone(),
            signal: signal.to_owned(),
            args: args.to_vec(),
        });
    }
}

struct Observation {
    observable: Arc<dyn Observable>,
    forwarder: Arc<dyn Observer>,
    push_count: usize,
    observed: bool,
}

#[derive(Default)]
struct SessionState {
    dao: Option<Arc<dyn Dao>>,
    observations: IndexMap<Path, Observation>,
    closed: bool,
}

/// One authenticated (or authenticating) client.
pub struct Session {
    id: SessionId,
    settings: ServerSettings,
    outbound: Arc<Outbound>,
    serial: Serial,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
    this: Weak<Session>,
}

impl Session {
    /// Session writing its frames to `sender`. Drive it with [`Session::run`].
    pub fn new(settings: ServerSettings, sender: mpsc::UnboundedSender<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            id: SessionId::new(),
            settings,
            outbound: Arc::new(Outbound::new(sender)),
            serial: Arc::new(ReentrantMutex::new(())),
            state: Mutex::new(SessionState::default()),
            events,
            shutdown: CancellationToken::new(),
            this: this.clone(),
        })
    }

    /// Session ID, used as the `session_id` log field.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Ping the client. Returns `false` once the link is gone.
    pub fn send_ping(&self, data: Option<Value>) -> bool {
        self.outbound.send(&Message::Ping { data })
    }

    /// Close the link. Teardown runs on the session task.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether the session has ended or is ending.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.state.lock().closed
    }

    /// Whether the client observes `what` directly.
    pub fn is_observed(&self, what: &Path) -> bool {
        self.state.lock().observations.get(what).is_some_and(|o| o.observed)
    }

    /// Number of push references held on `what`.
    pub fn push_count(&self, what: &Path) -> usize {
        self.state.lock().observations.get(what).map_or(0, |o| o.push_count)
    }

    /// Paths with a live server observation, in creation order.
    pub fn observation_paths(&self) -> Vec<Path> {
        self.state.lock().observations.keys().cloned().collect()
    }

    /// Process frames from `receiver` until the link closes or
    /// [`Session::close`] is called.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn run(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<String>, factory: Arc<dyn DaoFactory>) {
        counter!("rdao_sessions_total").increment(1);
        gauge!("rdao_sessions_active").increment(1.0);
        debug!("session opened");

        if let Some((dao, backlog)) = self.authenticate(&mut receiver, factory.as_ref()).await {
            info!("session authenticated");
            self.state.lock().dao = Some(dao.clone());
            for frame in backlog {
                if self.shutdown.is_cancelled() {
                    break;
                }
                self.handle_frame(&dao, &frame);
            }
            loop {
                tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => break,
                    frame = receiver.recv() => match frame {
                        Some(frame) => self.handle_frame(&dao, &frame),
                        None => {
                            debug!("client closed the link");
                            break;
                        }
                    },
                }
            }
        }
        self.teardown();
    }

    /// Wait for `initializeSession` and build the DAO. Frames arriving while
    /// the factory runs are returned for replay in arrival order.
    async fn authenticate(
        &self,
        receiver: &mut mpsc::UnboundedReceiver<String>,
        factory: &dyn DaoFactory,
    ) -> Option<(Arc<dyn Dao>, Vec<String>)> {
        let first = tokio::select! {
            () = self.shutdown.cancelled() => return None,
            frame = receiver.recv() => frame?,
        };
        let credentials = match Message::decode(&first) {
            Ok(Message::InitializeSession { credentials }) => credentials,
            Ok(other) => {
                self.client_error(format!("expected initializeSession, got {}", other.kind()));
                return None;
            }
            Err(error) => {
                self.malformed(&first, &error);
                return None;
            }
        };

        let mut backlog = Vec::new();
        let creating = AssertUnwindSafe(factory.create(credentials)).catch_unwind();
        tokio::pin!(creating);
        let created = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return None,
                created = &mut creating => break created,
                frame = receiver.recv() => match frame {
                    Some(frame) => backlog.push(frame),
                    None => return None,
                },
            }
        };

        let error = match created {
            Ok(Ok(dao)) => return Some((dao, backlog)),
            Ok(Err(error)) => error,
            Err(_panic) => {
                error!("dao factory panicked");
                DaoError::Internal("dao factory panicked".into())
            }
        };
        warn!(%error, "authentication failed");
        let _ = self.outbound.send(&Message::AuthenticationError { error: error.payload() });
        None
    }

    fn handle_frame(&self, dao: &Arc<dyn Dao>, frame: &str) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(error) => {
                self.malformed(frame, &error);
                return;
            }
        };
        match message {
            Message::Request {
                request_id,
                method,
                args,
            } => {
                let dao = dao.clone();
                self.spawn_call(request_id, async move { dao.request(&method, args).await });
            }
            Message::Get { request_id, what } => match what.fetch_paths() {
                Some(Ok(paths)) => self.spawn_batch(dao, request_id, paths),
                Some(Err(error)) => {
                    let _ = self.outbound.send(&Message::Error {
                        response_id: request_id,
                        error: DaoError::BadRequest(error.to_string()).payload(),
                    });
                }
                None => {
                    let dao = dao.clone();
                    self.spawn_call(request_id, async move { dao.get(&what).await });
                }
            },
            Message::GetMore { request_id, paths } => self.spawn_batch(dao, request_id, paths),
            Message::Event { method, args } => {
                let dao = dao.clone();
                let span = info_span!("event", %method);
                drop(tokio::spawn(
                    async move {
                        match AssertUnwindSafe(dao.request(&method, args)).catch_unwind().await {
                            Ok(Ok(_)) => {}
                            Ok(Err(error)) => debug!(%error, "event handler failed"),
                            Err(_panic) => error!("event handler panicked"),
                        }
                    }
                    .instrument(span),
                ));
            }
            Message::Observe { what, pushed } => {
                if let Err(error) = self.observe(dao, what, pushed) {
                    self.client_error(error.to_string());
                }
            }
            Message::Unobserve { what, .. } => {
                if let Err(error) = self.unobserve(&what) {
                    self.client_error(error.to_string());
                }
            }
            Message::Push { what } => {
                if let Err(error) = self.push(&what) {
                    self.client_error(error.to_string());
                }
            }
            Message::Unpush { what } => {
                if let Err(error) = self.unpush(&what) {
                    self.client_error(error.to_string());
                }
            }
            Message::Ping { data } => {
                let _ = self.outbound.send(&Message::Pong { data: data.clone() });
                self.emit(SessionEvent::Ping(data));
            }
            Message::Pong { data } => self.emit(SessionEvent::Pong(data)),
            Message::TimeSync { client_timestamp, .. } => {
                let _ = self.outbound.send(&Message::TimeSync {
                    client_timestamp,
                    server_timestamp: Some(now_millis()),
                });
            }
            other => self.client_error(format!("unexpected {} message from client", other.kind())),
        }
    }

    /// Run one DAO call on its own task and answer `request_id`.
    fn spawn_call<F>(&self, request_id: u64, call: F)
    where
        F: Future<Output = Result<Value, DaoError>> + Send + 'static,
    {
        let outbound = self.outbound.clone();
        let span = info_span!("call", request_id);
        drop(tokio::spawn(
            async move {
                let outcome = AssertUnwindSafe(call).catch_unwind().await.unwrap_or_else(|_panic| {
                    error!("dao handler panicked");
                    Err(DaoError::Internal("dao handler panicked".into()))
                });
                let reply = match outcome {
                    Ok(response) => Message::Response {
                        response_id: request_id,
                        response,
                    },
                    Err(error) => {
                        debug!(%error, "call failed");
                        Message::Error {
                            response_id: request_id,
                            error: error.payload(),
                        }
                    }
                };
                let _ = outbound.send(&reply);
            }
            .instrument(span),
        ));
    }

    fn spawn_batch(&self, dao: &Arc<dyn Dao>, request_id: u64, paths: Vec<rdao_core::FetchPath>) {
        let dao = dao.clone();
        let rounds = self.settings.max_get_more_rounds;
        self.spawn_call(request_id, async move {
            let fetched = get_more(dao, &paths, rounds).await?;
            serde_json::to_value(fetched).map_err(|error| DaoError::Internal(error.to_string()))
        });
    }

    fn observe(&self, dao: &Arc<dyn Dao>, what: Path, pushed: bool) -> Result<(), ObservationError> {
        let _serial = self.serial.lock();
        let replay = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ObservationError::SessionClosed);
            }
            match state.observations.get_mut(&what) {
                Some(observation) if observation.observed => return Err(ObservationError::AlreadyObserved(what)),
                Some(observation) => {
                    observation.observed = true;
                    if pushed {
                        debug!(%what, "observe of pushed path");
                        return Ok(());
                    }
                    let fresh = self.forwarder(&what);
                    let stale = std::mem::replace(&mut observation.forwarder, fresh.clone());
                    Some((observation.observable.clone(), fresh, stale))
                }
                None => None,
            }
        };
        // The client lost the pushed data: attach a new forwarder for the
        // replay before dropping the old one so the cell keeps an observer.
        if let Some((observable, fresh, stale)) = replay {
            observable.observe(fresh);
            observable.unobserve(&stale);
            return Ok(());
        }

        debug!(%what, "observe");
        let observable = self.create_observable(dao, &what);
        let forwarder = self.forwarder(&what);
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ObservationError::SessionClosed);
            }
            let _ = state.observations.insert(
                what,
                Observation {
                    observable: observable.clone(),
                    forwarder: forwarder.clone(),
                    push_count: 0,
                    observed: true,
                },
            );
        }
        observable.observe(forwarder);
        Ok(())
    }

    fn unobserve(&self, what: &Path) -> Result<(), ObservationError> {
        let _serial = self.serial.lock();
        let detached = {
            let mut state = self.state.lock();
            let pushed = match state.observations.get_mut(what) {
                Some(observation) if observation.observed => {
                    observation.observed = false;
                    observation.push_count > 0
                }
                _ => return Err(ObservationError::NotObserved(what.clone())),
            };
            if pushed {
                None
            } else {
                state.observations.shift_remove(what)
            }
        };
        debug!(%what, "unobserve");
        if let Some(observation) = detached {
            observation.observable.unobserve(&observation.forwarder);
        }
        Ok(())
    }

    fn forwarder(&self, what: &Path) -> Arc<dyn Observer> {
        Arc::new(Forwarder {
            what: what.clone(),
            outbound: self.outbound.clone(),
        })
    }

    /// Cell backing `what`. Failures become an error cell so the client
    /// learns about them through `notify`.
    fn create_observable(&self, dao: &Arc<dyn Dao>, what: &Path) -> Arc<dyn Observable> {
        if let Some(entries) = what.fetch_paths() {
            return match entries {
                Ok(entries) => {
                    let registry: Weak<dyn PushRegistry> = self.this.clone();
                    Arc::new(PushObservable::new(entries, registry, self.serial.clone()))
                }
                Err(error) => Arc::new(ErrorObservable::new(DaoError::BadRequest(error.to_string()).payload())),
            };
        }
        let error = match std::panic::catch_unwind(AssertUnwindSafe(|| dao.observable(what))) {
            Ok(Ok(observable)) => return observable,
            Ok(Err(error)) => error,
            Err(_panic) => {
                error!(%what, "observable factory panicked");
                DaoError::Internal("observable factory panicked".into())
            }
        };
        debug!(%what, %error, "observable unavailable");
        Arc::new(ErrorObservable::new(error.payload()))
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn malformed(&self, frame: &str, error: &ProtocolError) {
        warn!(%error, "malformed frame from client");
        let _ = self.outbound.send(&Message::MalformedMessageError {
            error: error.to_string(),
            message: frame.to_owned(),
        });
        self.close();
    }

    fn client_error(&self, reason: String) {
        warn!(%reason, "client protocol error");
        counter!("rdao_client_errors_total").increment(1);
        self.emit(SessionEvent::ClientError(reason));
        self.close();
    }

    /// Drop every observation regardless of its counts, then the DAO.
    fn teardown(&self) {
        let (observations, dao) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (std::mem::take(&mut state.observations), state.dao.take())
        };
        {
            let _serial = self.serial.lock();
            for observation in observations.values() {
                observation.observable.unobserve(&observation.forwarder);
            }
        }
        if let Some(dao) = dao {
            dao.dispose();
        }
        self.outbound.close();
        self.shutdown.cancel();
        gauge!("rdao_sessions_active").decrement(1.0);
        info!(observations = observations.len(), "session closed");
        self.emit(SessionEvent::Closed);
    }
}

impl PushRegistry for Session {
    fn push(&self, what: &Path) -> Result<Arc<dyn Observable>, ObservationError> {
        let _serial = self.serial.lock();
        let (existing, dao) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ObservationError::SessionClosed);
            }
            let existing = state.observations.get_mut(what).map(|observation| {
                observation.push_count += 1;
                (observation.observable.clone(), observation.push_count == 1)
            });
            (existing, state.dao.clone())
        };
        if let Some((observable, first)) = existing {
            if first {
                let _ = self.outbound.send(&Message::Push { what: what.clone() });
            }
            return Ok(observable);
        }
        let dao = dao.ok_or(ObservationError::SessionClosed)?;

        debug!(%what, "push");
        let observable = self.create_observable(&dao, what);
        let forwarder = self.forwarder(what);
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ObservationError::SessionClosed);
            }
            let _ = state.observations.insert(
                what.clone(),
                Observation {
                    observable: observable.clone(),
                    forwarder: forwarder.clone(),
                    push_count: 1,
                    observed: false,
                },
            );
        }
        // The client must know the path before its first notify.
        let _ = self.outbound.send(&Message::Push { what: what.clone() });
        observable.observe(forwarder);
        Ok(observable)
    }

    fn unpush(&self, what: &Path) -> Result<(), ObservationError> {
        let _serial = self.serial.lock();
        let detached = {
            let mut state = self.state.lock();
            let observed = match state.observations.get_mut(what) {
                Some(observation) if observation.push_count > 0 => {
                    observation.push_count -= 1;
                    if observation.push_count > 0 {
                        return Ok(());
                    }
                    observation.observed
                }
                _ => return Err(ObservationError::NotPushed(what.clone())),
            };
            if observed {
                None
            } else {
                state.observations.shift_remove(what)
            }
        };
        debug!(%what, "unpush");
        let _ = self.outbound.send(&Message::Unpush { what: what.clone() });
        if let Some(observation) = detached {
            observation.observable.unobserve(&observation.forwarder);
        }
        Ok(())
    }
}
