//! Client connection state machine.
//!
//! A [`ReactiveConnection`] owns one link task that connects through a
//! [`Connector`], replays session state on every connect, dispatches inbound
//! frames and reconnects after a fixed delay. All mutable state sits behind
//! one mutex; observers are only ever called with that mutex released.
//!
//! ```text
//!   disconnected ──connect()──▶ connected ──link closed──▶ disconnected
//!        ▲                                                      │
//!        └──────────── reconnect_delay (unless finished) ◀──────┘
//! ```

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rdao_core::{ConnectionId, Connector, FetchPath, Fetched, Link, Message, Observer, Path, same_observer};
use rdao_settings::ConnectionSettings;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::RequestError;
use crate::observation::{Facade, Observation, RemoteObservable, deliver};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle and heartbeat notifications.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// The link is up and session state was replayed.
    Connect,
    /// The link went down.
    Disconnect,
    /// The server pinged us (already answered).
    Ping(Option<Value>),
    /// The server answered one of our pings.
    Pong(Option<Value>),
    /// The server answered a clock probe.
    TimeSync {
        /// Client clock when the probe was sent (ms).
        client_timestamp: i64,
        /// Server clock when it answered (ms).
        server_timestamp: i64,
    },
    /// The server rejected our credentials. Auto-reconnect is now off.
    AuthenticationError(Value),
    /// The server could not parse a frame we sent.
    MalformedMessage(String),
}

type Reply = oneshot::Sender<Result<Value, RequestError>>;

struct PendingRequest {
    frame: String,
    reply: Reply,
    /// Token of the send-timeout timer while the request waits in the queue.
    queued: Option<u64>,
}

#[derive(Default)]
struct State {
    connected: bool,
    finished: bool,
    auto_reconnect: bool,
    last_request_id: u64,
    last_queue_token: u64,
    last_facade_id: u64,
    pending: IndexMap<u64, PendingRequest>,
    queue: VecDeque<u64>,
    observations: IndexMap<Path, Observation>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    link: Option<CancellationToken>,
}

impl State {
    fn send(&self, frame: String) -> bool {
        match &self.outbound {
            Some(tx) if self.connected => tx.send(frame).is_ok(),
            _ => false,
        }
    }

    fn send_message(&self, message: &Message) -> bool {
        match message.encode() {
            Ok(frame) => self.send(frame),
            Err(error) => {
                warn!(kind = message.kind(), %error, "failed to encode message");
                false
            }
        }
    }

    fn next_queue_token(&mut self) -> u64 {
        self.last_queue_token += 1;
        self.last_queue_token
    }

    fn unqueue(&mut self, id: u64) {
        self.queue.retain(|queued| *queued != id);
    }
}

pub(crate) struct Inner {
    id: ConnectionId,
    credentials: Value,
    settings: ConnectionSettings,
    state: Mutex<State>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Client side of a reactive-dao session.
///
/// Cheap to clone; all clones share one link. Construct inside a tokio
/// runtime: the link task is spawned immediately.
#[derive(Clone)]
pub struct ReactiveConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReactiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveConnection")
            .field("id", &self.inner.id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ReactiveConnection {
    /// Start connecting through `connector`, presenting `credentials` on
    /// every connect.
    pub fn new(connector: Arc<dyn Connector>, credentials: Value, settings: ConnectionSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = State {
            auto_reconnect: settings.auto_reconnect,
            ..State::default()
        };
        let inner = Arc::new(Inner {
            id: ConnectionId::new(),
            credentials,
            settings,
            state: Mutex::new(state),
            events,
            shutdown: CancellationToken::new(),
        });
        drop(tokio::spawn(run_link(
            Arc::downgrade(&inner),
            connector,
            inner.shutdown.clone(),
            inner.settings.reconnect_delay(),
            inner.id,
        )));
        Self { inner }
    }

    /// Connection identifier (local only, for logs).
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Settings this connection was created with.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    /// Invoke a remote method.
    pub async fn request(&self, method: impl Into<Path>, args: Vec<Value>) -> Result<Value, RequestError> {
        let method = method.into();
        self.send_request(move |request_id| Message::Request {
            request_id,
            method,
            args,
        })
        .await
    }

    /// Fetch one value. Composite paths (`{paths: [...]}`) are answered
    /// with a batch fetch result.
    pub async fn get(&self, what: impl Into<Path>) -> Result<Value, RequestError> {
        let what = what.into();
        self.send_request(move |request_id| Message::Get { request_id, what })
            .await
    }

    /// Fetch paths together with everything their schemas point at.
    pub async fn get_more(&self, paths: Vec<FetchPath>) -> Result<Vec<Fetched>, RequestError> {
        let response = self
            .send_request(move |request_id| Message::GetMore { request_id, paths })
            .await?;
        serde_json::from_value(response).map_err(|e| RequestError::Decode(e.to_string()))
    }

    /// Fire-and-forget method invocation. Dropped while disconnected.
    pub fn event(&self, method: impl Into<Path>, args: Vec<Value>) -> bool {
        let message = Message::Event {
            method: method.into(),
            args,
        };
        self.inner.state.lock().send_message(&message)
    }

    /// Facade of type `F` for `what`, shared with any earlier call for the
    /// same path and type.
    pub fn observable<F>(&self, what: impl Into<Path>) -> RemoteObservable<F>
    where
        F: Observer + Default + 'static,
    {
        let what = what.into();
        let (facade_id, facade) = self.inner.attach_shared::<F>(&what);
        let observer: Arc<dyn Observer> = facade.clone();
        let shared: Arc<dyn Any + Send + Sync> = facade.clone();
        RemoteObservable::new(Arc::downgrade(&self.inner), what, facade, observer, Some(shared), facade_id)
    }

    /// Attach a caller-built facade to `what`.
    pub fn attach<F>(&self, what: impl Into<Path>, facade: Arc<F>) -> RemoteObservable<F>
    where
        F: Observer + 'static,
    {
        let what = what.into();
        let observer: Arc<dyn Observer> = facade.clone();
        let facade_id = self.inner.attach_object(&what, observer.clone(), None);
        RemoteObservable::new(Arc::downgrade(&self.inner), what, facade, observer, None, facade_id)
    }

    /// Attach a plain observer (for example a [`rdao_core::FnObserver`]).
    pub fn attach_observer(
        &self,
        what: impl Into<Path>,
        observer: Arc<dyn Observer>,
    ) -> RemoteObservable<dyn Observer> {
        let what = what.into();
        let facade_id = self.inner.attach_object(&what, observer.clone(), None);
        RemoteObservable::new(
            Arc::downgrade(&self.inner),
            what,
            observer.clone(),
            observer,
            None,
            facade_id,
        )
    }

    /// Drop the current link. The normal reconnect path follows.
    pub fn close_connection(&self) {
        let link = self.inner.state.lock().link.clone();
        if let Some(link) = link {
            debug!(connection_id = %self.inner.id, "closing link");
            link.cancel();
        }
    }

    /// Shut the connection down for good.
    ///
    /// Pending requests fail with [`RequestError::Disconnected`]; later
    /// requests are rejected immediately.
    pub fn dispose(&self) {
        let (was_connected, failed) = {
            let mut state = self.inner.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            let was_connected = state.connected;
            state.connected = false;
            state.outbound = None;
            state.link = None;
            state.queue.clear();
            state.observations.clear();
            let failed: Vec<Reply> = state.pending.drain(..).map(|(_, p)| p.reply).collect();
            (was_connected, failed)
        };
        self.inner.shutdown.cancel();
        for reply in failed {
            let _ = reply.send(Err(RequestError::Disconnected));
        }
        info!(connection_id = %self.inner.id, "connection disposed");
        if was_connected {
            self.inner.emit(ConnectionEvent::Disconnect);
        }
    }

    /// Send a heartbeat ping. Returns `false` while disconnected.
    pub fn send_ping(&self, data: Option<Value>) -> bool {
        self.inner.state.lock().send_message(&Message::Ping { data })
    }

    /// Send a clock probe stamped with `client_timestamp`.
    pub fn send_time_sync(&self, client_timestamp: i64) -> bool {
        self.inner.state.lock().send_message(&Message::TimeSync {
            client_timestamp,
            server_timestamp: None,
        })
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the link is up. Returns `false` if the connection was
    /// disposed first.
    pub async fn wait_connected(&self) -> bool {
        let mut events = self.events();
        loop {
            if self.is_connected() {
                return true;
            }
            if self.is_finished() {
                return false;
            }
            tokio::select! {
                () = self.inner.shutdown.cancelled() => return false,
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Connect) => return true,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return false,
                },
            }
        }
    }

    /// Whether the link is up.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    /// Whether [`ReactiveConnection::dispose`] was called.
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().finished
    }

    /// Whether any facade is attached to `what`.
    pub fn is_observing(&self, what: &Path) -> bool {
        self.inner
            .state
            .lock()
            .observations
            .get(what)
            .is_some_and(|o| !o.facades.is_empty())
    }

    /// Whether the server currently pushes `what`.
    pub fn is_pushed(&self, what: &Path) -> bool {
        self.inner
            .state
            .lock()
            .observations
            .get(what)
            .is_some_and(|o| o.pushed)
    }

    /// Paths with a live observation, in creation order.
    pub fn observation_paths(&self) -> Vec<Path> {
        self.inner.state.lock().observations.keys().cloned().collect()
    }

    /// Last value received for an observed or pushed path.
    pub fn observed_value(&self, what: &Path) -> Option<Value> {
        self.inner
            .state
            .lock()
            .observations
            .get(what)
            .and_then(|o| o.value().cloned())
    }

    /// Requests awaiting a reply (sent or queued).
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    async fn send_request(&self, build: impl FnOnce(u64) -> Message) -> Result<Value, RequestError> {
        let (id, mut reply) = self.inner.register(build)?;
        let _guard = PendingGuard {
            inner: &self.inner,
            id,
        };
        let outcome = match self.inner.settings.request_timeout() {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, &mut reply).await;
                match waited {
                    Ok(outcome) => outcome,
                    Err(_elapsed) => {
                        debug!(request_id = id, "request timed out");
                        let _ = self.inner.complete(id, Err(RequestError::Timeout));
                        reply.await
                    }
                }
            }
            None => reply.await,
        };
        outcome.unwrap_or(Err(RequestError::Disconnected))
    }
}

/// Removes a request from the tables when its future is dropped early.
struct PendingGuard<'a> {
    inner: &'a Arc<Inner>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.inner.complete(self.id, Err(RequestError::Disconnected));
    }
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn register(
        self: &Arc<Self>,
        build: impl FnOnce(u64) -> Message,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, RequestError>>), RequestError> {
        let (reply, receiver) = oneshot::channel();
        let (id, queued) = {
            let mut state = self.state.lock();
            if state.finished {
                return Err(RequestError::Disconnected);
            }
            state.last_request_id += 1;
            let id = state.last_request_id;
            let frame = build(id)
                .encode()
                .map_err(|e| RequestError::Encode(e.to_string()))?;

            if state.connected && state.send(frame.clone()) {
                let _ = state.pending.insert(
                    id,
                    PendingRequest {
                        frame,
                        reply,
                        queued: None,
                    },
                );
                (id, None)
            } else if self.settings.queue_requests_when_disconnected {
                let token = state.next_queue_token();
                let _ = state.pending.insert(
                    id,
                    PendingRequest {
                        frame,
                        reply,
                        queued: Some(token),
                    },
                );
                state.queue.push_back(id);
                debug!(request_id = id, "request queued until connected");
                (id, Some(token))
            } else {
                return Err(RequestError::Disconnected);
            }
        };
        if let Some(token) = queued {
            self.arm_send_timeout(id, token);
        }
        Ok((id, receiver))
    }

    /// Resolve a pending request. The first caller wins; later calls for the
    /// same ID return `false`.
    fn complete(&self, id: u64, result: Result<Value, RequestError>) -> bool {
        let entry = {
            let mut state = self.state.lock();
            let entry = state.pending.shift_remove(&id);
            if entry.as_ref().is_some_and(|p| p.queued.is_some()) {
                state.unqueue(id);
            }
            entry
        };
        match entry {
            Some(pending) => {
                let _ = pending.reply.send(result);
                true
            }
            None => false,
        }
    }

    fn arm_send_timeout(self: &Arc<Self>, id: u64, token: u64) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let delay = self.settings.request_send_timeout();
        drop(tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire_queued(id, token);
                    }
                }
            }
        }));
    }

    fn expire_queued(&self, id: u64, token: u64) {
        let still_queued = self
            .state
            .lock()
            .pending
            .get(&id)
            .is_some_and(|p| p.queued == Some(token));
        if still_queued && self.complete(id, Err(RequestError::Disconnected)) {
            debug!(request_id = id, "queued request expired before reconnect");
        }
    }

    fn should_reconnect(&self) -> bool {
        let state = self.state.lock();
        !state.finished && state.auto_reconnect
    }

    /// Bring a fresh link up: present credentials, replay observations,
    /// flush queued requests. Returns `false` after disposal.
    fn handle_connect(&self, sender: mpsc::UnboundedSender<String>, link: CancellationToken) -> bool {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.finished {
                return false;
            }
            state.connected = true;
            state.outbound = Some(sender);
            state.link = Some(link);

            let _ = state.send_message(&Message::InitializeSession {
                credentials: self.credentials.clone(),
            });

            let replay: Vec<Path> = state
                .observations
                .iter()
                .filter(|(_, o)| !o.facades.is_empty())
                .map(|(what, _)| what.clone())
                .collect();
            for what in replay {
                let _ = state.send_message(&Message::Observe { what, pushed: false });
            }

            while let Some(id) = state.queue.pop_front() {
                let frame = match state.pending.get_mut(&id) {
                    Some(pending) => {
                        pending.queued = None;
                        pending.frame.clone()
                    }
                    None => continue,
                };
                let _ = state.send(frame);
            }
        }
        info!(connection_id = %self.id, "connected");
        self.emit(ConnectionEvent::Connect);
        true
    }

    fn handle_disconnect(self: &Arc<Self>) {
        let (failed, requeued) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.connected = false;
            state.outbound = None;
            state.link = None;

            // Pushes do not survive the session that created them.
            state.observations.retain(|_, o| {
                o.pushed = false;
                !o.facades.is_empty()
            });

            let in_flight: Vec<u64> = state
                .pending
                .iter()
                .filter(|(_, p)| p.queued.is_none())
                .map(|(id, _)| *id)
                .collect();

            let mut failed = Vec::new();
            let mut requeued = Vec::new();
            if self.settings.queue_active_requests_on_disconnect {
                for id in in_flight.iter().rev() {
                    let token = state.next_queue_token();
                    if let Some(pending) = state.pending.get_mut(id) {
                        pending.queued = Some(token);
                        state.queue.push_front(*id);
                        requeued.push((*id, token));
                    }
                }
            } else {
                for id in in_flight {
                    if let Some(pending) = state.pending.shift_remove(&id) {
                        failed.push(pending.reply);
                    }
                }
            }
            (failed, requeued)
        };

        info!(
            connection_id = %self.id,
            failed = failed.len(),
            requeued = requeued.len(),
            "disconnected"
        );
        for reply in failed {
            let _ = reply.send(Err(RequestError::Disconnected));
        }
        for (id, token) in requeued {
            self.arm_send_timeout(id, token);
        }
        self.emit(ConnectionEvent::Disconnect);
    }

    fn handle_frame(&self, text: &str) {
        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(error) => {
                warn!(connection_id = %self.id, %error, "ignoring malformed frame from server");
                return;
            }
        };
        match message {
            Message::Response {
                response_id,
                response,
            } => self.resolve(response_id, Ok(response)),
            Message::Error { response_id, error } => {
                self.resolve(response_id, Err(RequestError::Remote(error)));
            }
            Message::Notify { what, signal, args } => self.handle_notify(&what, &signal, &args),
            Message::Push { what } => {
                let mut state = self.state.lock();
                state
                    .observations
                    .entry(what)
                    .or_insert_with(|| Observation::new(true))
                    .pushed = true;
            }
            Message::Unpush { what } => {
                let mut state = self.state.lock();
                let orphaned = state.observations.get_mut(&what).is_some_and(|o| {
                    o.pushed = false;
                    o.facades.is_empty()
                });
                if orphaned {
                    let _ = state.observations.shift_remove(&what);
                }
            }
            Message::Ping { data } => {
                let _ = self
                    .state
                    .lock()
                    .send_message(&Message::Pong { data: data.clone() });
                self.emit(ConnectionEvent::Ping(data));
            }
            Message::Pong { data } => self.emit(ConnectionEvent::Pong(data)),
            Message::TimeSync {
                client_timestamp,
                server_timestamp: Some(server_timestamp),
            } => self.emit(ConnectionEvent::TimeSync {
                client_timestamp,
                server_timestamp,
            }),
            Message::AuthenticationError { error } => {
                warn!(connection_id = %self.id, ?error, "authentication rejected, reconnect disabled");
                self.state.lock().auto_reconnect = false;
                self.emit(ConnectionEvent::AuthenticationError(error));
            }
            Message::MalformedMessageError { error, message } => {
                warn!(connection_id = %self.id, %error, "server could not parse a frame");
                self.emit(ConnectionEvent::MalformedMessage(message));
            }
            other => {
                warn!(connection_id = %self.id, kind = other.kind(), "unexpected message from server");
            }
        }
    }

    fn resolve(&self, id: u64, result: Result<Value, RequestError>) {
        if !self.complete(id, result) {
            debug!(request_id = id, "reply for unknown or expired request");
        }
    }

    fn handle_notify(&self, what: &Path, signal: &str, args: &[Value]) {
        let (observers, delivery) = {
            let mut state = self.state.lock();
            let Some(observation) = state.observations.get_mut(what) else {
                debug!(%what, signal, "notify for unobserved path");
                return;
            };
            observation.apply(signal, args);
            (observation.observers(), observation.delivery.clone())
        };
        deliver(&delivery, &observers, &[(signal.to_owned(), args.to_vec())]);
    }

    /// Attach (or share) a facade of type `F`.
    pub(crate) fn attach_shared<F>(&self, what: &Path) -> (u64, Arc<F>)
    where
        F: Observer + Default + 'static,
    {
        {
            let mut state = self.state.lock();
            if let Some(observation) = state.observations.get_mut(what) {
                for facade in &mut observation.facades {
                    let shared = facade.shared.clone().and_then(|any| any.downcast::<F>().ok());
                    if let Some(shared) = shared {
                        facade.handles += 1;
                        return (facade.id, shared);
                    }
                }
            }
        }
        let facade = Arc::new(F::default());
        let any: Arc<dyn Any + Send + Sync> = facade.clone();
        let id = self.add_facade(what, facade.clone(), Some(any));
        (id, facade)
    }

    /// Attach `observer`, reusing its facade if it is already attached.
    pub(crate) fn attach_object(
        &self,
        what: &Path,
        observer: Arc<dyn Observer>,
        shared: Option<Arc<dyn Any + Send + Sync>>,
    ) -> u64 {
        {
            let mut state = self.state.lock();
            if let Some(observation) = state.observations.get_mut(what) {
                if let Some(facade) = observation
                    .facades
                    .iter_mut()
                    .find(|f| same_observer(&f.observer, &observer))
                {
                    facade.handles += 1;
                    return facade.id;
                }
            }
        }
        self.add_facade(what, observer, shared)
    }

    fn add_facade(
        &self,
        what: &Path,
        observer: Arc<dyn Observer>,
        shared: Option<Arc<dyn Any + Send + Sync>>,
    ) -> u64 {
        let (id, delivery) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.last_facade_id += 1;
            let id = state.last_facade_id;
            let observation = state
                .observations
                .entry(what.clone())
                .or_insert_with(|| Observation::new(false));
            let announce = observation.facades.is_empty().then(|| Message::Observe {
                what: what.clone(),
                pushed: observation.pushed,
            });
            observation.facades.push(Facade {
                id,
                observer: observer.clone(),
                shared,
                handles: 1,
                ready: false,
            });
            let delivery = observation.delivery.clone();
            if let Some(announce) = announce {
                debug!(%what, "observe");
                let _ = state.send_message(&announce);
            }
            (id, delivery)
        };

        // Snapshot and mark ready under the delivery lock so no live signal
        // reaches the facade ahead of its replay.
        let _serial = delivery.lock();
        let replay = {
            let mut state = self.state.lock();
            state.observations.get_mut(what).map(|observation| {
                if let Some(facade) = observation.facades.iter_mut().find(|f| f.id == id) {
                    facade.ready = true;
                }
                observation.replay()
            })
        };
        for (signal, args) in replay.unwrap_or_default() {
            observer.notify(&signal, &args);
        }
        id
    }

    /// Release one handle on a facade; the last facade of a path sends
    /// `unobserve`.
    pub(crate) fn detach(&self, what: &Path, facade_id: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(observation) = state.observations.get_mut(what) else {
            return;
        };
        let Some(pos) = observation.facades.iter().position(|f| f.id == facade_id) else {
            return;
        };
        observation.facades[pos].handles -= 1;
        if observation.facades[pos].handles > 0 {
            return;
        }
        let _ = observation.facades.remove(pos);
        if !observation.facades.is_empty() {
            return;
        }
        let pushed = observation.pushed;
        if !pushed {
            let _ = state.observations.shift_remove(what);
        }
        debug!(%what, pushed, "unobserve");
        let _ = state.send_message(&Message::Unobserve {
            what: what.clone(),
            pushed,
        });
    }
}

#[instrument(skip_all, fields(connection_id = %connection_id))]
async fn run_link(
    inner: Weak<Inner>,
    connector: Arc<dyn Connector>,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
    connection_id: ConnectionId,
) {
    loop {
        let attempt = tokio::select! {
            () = shutdown.cancelled() => return,
            attempt = connector.connect() => attempt,
        };
        match attempt {
            Ok(link) => {
                if !drive_link(&inner, link, &shutdown).await {
                    return;
                }
            }
            Err(error) => warn!(%error, "connect failed"),
        }

        match inner.upgrade() {
            Some(strong) if strong.should_reconnect() => {}
            _ => return,
        }
        debug!(delay_ms = reconnect_delay.as_millis(), "reconnecting");
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(reconnect_delay) => {}
        }
    }
}

/// Run one link until it closes. Returns `false` once the connection is
/// gone for good.
async fn drive_link(inner: &Weak<Inner>, link: Link, shutdown: &CancellationToken) -> bool {
    let Link {
        sender,
        mut receiver,
    } = link;
    let link_token = shutdown.child_token();
    {
        let Some(strong) = inner.upgrade() else {
            return false;
        };
        if !strong.handle_connect(sender, link_token.clone()) {
            return false;
        }
    }

    loop {
        tokio::select! {
            () = link_token.cancelled() => break,
            frame = receiver.recv() => match frame {
                Some(text) => match inner.upgrade() {
                    Some(strong) => strong.handle_frame(&text),
                    None => return false,
                },
                None => break,
            },
        }
    }

    if shutdown.is_cancelled() {
        return false;
    }
    match inner.upgrade() {
        Some(strong) => {
            strong.handle_disconnect();
            true
        }
        None => false,
    }
}
