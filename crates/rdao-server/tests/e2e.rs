//! Client and server together over the loopback and WebSocket transports.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use common::{connect, connect_with, fast_settings, path, schema, server, wait_until, TestData};
use rdao_client::{ConnectionEvent, ReactiveConnection, RequestError, WsConnector};
use rdao_core::{
    Connector, DaoError, FetchPath, Fetched, Message, MoreEntry, ObservableList, ObservableValue, Path,
};
use rdao_server::{Dao, Direction, LoopbackConnector, ReactiveServer, serve};
use rdao_settings::{ConnectionSettings, ServerSettings};
use serde_json::{Value, json};

fn user(id: i64) -> Path {
    path(json!(["test", "user", {"user": id}]))
}

fn role(id: i64) -> Path {
    path(json!(["test", "role", {"role": id}]))
}

fn users_with_records() -> FetchPath {
    FetchPath::what(path(json!(["test", "users"])))
        .with(MoreEntry::new(schema(json!([["test", "user", {"user": {"identity": true}}]]))))
}

fn users_with_roles() -> FetchPath {
    FetchPath::what(path(json!(["test", "users"]))).with(
        MoreEntry::new(schema(json!([["test", "user", {"user": {"identity": true}}]])))
            .with(MoreEntry::new(schema(json!([["test", "role", {"role": {"property": "role"}}]])))),
    )
}

/// Counts client-to-server frames of one kind.
fn counting(server: &Arc<ReactiveServer>, kind: &'static str) -> (LoopbackConnector, Arc<AtomicUsize>) {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let connector = LoopbackConnector::new(server.clone()).with_packet_filter(move |message, direction| {
        if direction == Direction::ToServer && message.kind() == kind {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        }
        true
    });
    (connector, seen)
}

async fn round_trip(connection: &ReactiveConnection) {
    let _ = connection.get(json!(["test", "counter"])).await.unwrap();
}

async fn next_connect(events: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>) {
    loop {
        if events.recv().await.unwrap() == ConnectionEvent::Connect {
            return;
        }
    }
}

// ── batch fetch ──

#[tokio::test]
async fn get_more_flattens_users_in_order() {
    let data = TestData::new();
    let connection = connect(&server(&data));

    let fetched = connection.get_more(vec![users_with_records()]).await.unwrap();
    let whats: Vec<Path> = fetched.iter().map(|f| f.what.clone()).collect();
    assert_eq!(
        whats,
        vec![path(json!(["test", "users"])), user(0), user(1), user(2), user(3)]
    );
    assert_eq!(fetched[0].data, json!([0, 1, 2, 3]));
    assert_eq!(fetched[2].data, json!({"id": 1, "name": "bob", "role": 1}));
    for id in 0..4 {
        assert_eq!(data.gets_of(user(id).value()), 1);
    }
    connection.dispose();
}

#[tokio::test]
async fn shared_roles_are_fetched_once() {
    let data = TestData::new();
    let connection = connect(&server(&data));

    let fetched = connection.get_more(vec![users_with_roles()]).await.unwrap();
    assert_eq!(fetched.len(), 7);
    assert_eq!(
        fetched[5..],
        [
            Fetched {
                what: role(0),
                data: json!({"id": 0, "name": "admin"}),
            },
            Fetched {
                what: role(1),
                data: json!({"id": 1, "name": "member"}),
            },
        ]
    );
    assert_eq!(data.gets_of(role(1).value()), 1);
    assert_eq!(data.total_gets(), 7);
    connection.dispose();
}

#[tokio::test]
async fn composite_get_returns_the_batch() {
    let data = TestData::new();
    let connection = connect(&server(&data));

    let reply = connection
        .get(FetchPath::composite(&[users_with_records()]))
        .await
        .unwrap();
    let fetched: Vec<Fetched> = serde_json::from_value(reply).unwrap();
    assert_eq!(fetched.len(), 5);
    connection.dispose();
}

// ── requests ──

#[tokio::test]
async fn replies_resolve_their_own_request() {
    let data = TestData::new();
    let connection = connect(&server(&data));
    assert!(connection.wait_connected().await);

    let slow = connection.request(json!(["test", "slowIncrement"]), Vec::new());
    let fast = async {
        wait_until("slow call to start", || data.slow_calls.load(Ordering::SeqCst) == 1).await;
        connection.request(json!(["test", "increment"]), Vec::new()).await
    };
    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(fast, Ok(json!(1)));
    assert_eq!(slow, Ok(json!(2)));
    connection.dispose();
}

#[tokio::test]
async fn dao_errors_reach_the_caller() {
    let data = TestData::new();
    let connection = connect(&server(&data));

    let missing = connection.request(json!(["test", "nope"]), Vec::new()).await;
    assert_matches!(missing, Err(RequestError::Remote(error)) if error["code"] == "method_not_found");
    let rejected = connection.get(json!(["test", "instaError"])).await;
    assert_eq!(rejected, Err(RequestError::Remote(json!("insta"))));
    connection.dispose();
}

#[tokio::test]
async fn events_run_without_reply() {
    let data = TestData::new();
    let connection = connect(&server(&data));
    assert!(connection.wait_connected().await);

    assert!(connection.event(json!(["test", "increment"]), Vec::new()));
    wait_until("event to apply", || data.counter.get() == Some(json!(1))).await;
    assert_eq!(connection.pending_count(), 0);
    connection.dispose();
}

// ── observation ──

#[tokio::test]
async fn facades_share_one_remote_observation() {
    let data = TestData::new();
    let server = server(&data);
    let (observes, unobserves) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let connector = LoopbackConnector::new(server.clone()).with_packet_filter({
        let (observes, unobserves) = (observes.clone(), unobserves.clone());
        move |message, direction| {
            let seen = match (direction, message) {
                (Direction::ToServer, Message::Observe { .. }) => &observes,
                (Direction::ToServer, Message::Unobserve { .. }) => &unobserves,
                _ => return true,
            };
            let _ = seen.fetch_add(1, Ordering::SeqCst);
            true
        }
    });
    let connection = connect_with(connector, fast_settings());
    let what = path(json!(["test", "counter"]));

    let first = connection.attach(what.clone(), Arc::new(ObservableValue::default()));
    let second = connection.attach(what.clone(), Arc::new(ObservableValue::default()));
    wait_until("both facades to load", || {
        first.get() == Some(json!(0)) && second.get() == Some(json!(0))
    })
    .await;
    assert_eq!(observes.load(Ordering::SeqCst), 1);

    first.dispose();
    round_trip(&connection).await;
    assert_eq!(unobserves.load(Ordering::SeqCst), 0);
    assert_eq!(data.counter.observer_count(), 1);

    let _ = connection.request(json!(["test", "increment"]), Vec::new()).await.unwrap();
    wait_until("remaining facade to update", || second.get() == Some(json!(1))).await;
    assert_eq!(first.get(), Some(json!(0)));

    second.dispose();
    wait_until("unobserve", || unobserves.load(Ordering::SeqCst) == 1).await;
    wait_until("server to release the cell", || data.counter.observer_count() == 0).await;
    round_trip(&connection).await;
    assert_eq!(unobserves.load(Ordering::SeqCst), 1);
    assert_eq!(observes.load(Ordering::SeqCst), 1);
    connection.dispose();
}

#[tokio::test]
async fn reconnect_replays_each_observation_once() {
    let data = TestData::new();
    let server = server(&data);
    let (connector, observes) = counting(&server, "observe");
    let connection = connect_with(connector, fast_settings());
    let mut events = connection.events();
    let what = path(json!(["test", "counter"]));

    let facade = connection.observable::<ObservableValue>(what.clone());
    wait_until("initial value", || facade.get() == Some(json!(0))).await;
    assert_eq!(observes.load(Ordering::SeqCst), 1);

    connection.close_connection();
    next_connect(&mut events).await;
    next_connect(&mut events).await;
    round_trip(&connection).await;
    assert_eq!(observes.load(Ordering::SeqCst), 2);

    wait_until("old session to go away", || server.session_count() == 1).await;
    wait_until("one server observer", || data.counter.observer_count() == 1).await;
    assert!(server.sessions()[0].is_observed(&what));

    data.counter.set(json!(7));
    wait_until("value after reconnect", || facade.get() == Some(json!(7))).await;
    connection.dispose();
}

#[tokio::test]
async fn dao_failure_becomes_an_observed_error() {
    let data = TestData::new();
    let connection = connect(&server(&data));

    let facade = connection.observable::<ObservableValue>(json!(["test", "instaError"]));
    wait_until("error to arrive", || facade.error().is_some()).await;
    assert_eq!(facade.error(), Some(json!("insta")));
    assert_eq!(facade.get(), None);
    connection.dispose();
}

// ── dependency push ──

#[tokio::test]
async fn pushed_users_follow_list_changes() {
    let data = TestData::new();
    let server = server(&data);
    let connection = connect(&server);
    let list = FetchPath::composite(&[users_with_roles()]);

    let facade = connection.observable::<ObservableList>(list.clone());
    wait_until("initial pushes", || {
        (0..4).all(|id| connection.is_pushed(&user(id)))
            && connection.is_pushed(&role(0))
            && connection.is_pushed(&role(1))
    })
    .await;
    assert_eq!(
        connection.observed_value(&user(0)),
        Some(json!({"id": 0, "name": "alice", "role": 0}))
    );
    assert!(facade.contains(user(3).value()));
    assert!(!connection.is_pushed(&role(2)));

    let added = connection
        .request(json!(["test", "addUser"]), vec![json!("erin"), json!(2)])
        .await
        .unwrap();
    assert_eq!(added, json!(4));
    wait_until("new user to be pushed", || {
        connection.observed_value(&user(4)).is_some() && connection.observed_value(&role(2)).is_some()
    })
    .await;
    assert_eq!(
        connection.observed_value(&user(4)),
        Some(json!({"id": 4, "name": "erin", "role": 2}))
    );
    wait_until("list to mention the new user", || facade.contains(user(4).value())).await;

    let removed = connection
        .request(json!(["test", "removeUser"]), vec![json!(4)])
        .await
        .unwrap();
    assert_eq!(removed, json!(true));
    wait_until("new user to be unpushed", || {
        !connection.is_pushed(&user(4)) && !connection.is_pushed(&role(2))
    })
    .await;
    for id in 0..4 {
        assert!(connection.is_pushed(&user(id)), "user {id} lost its push");
    }
    assert!(connection.is_pushed(&role(0)));
    assert!(connection.is_pushed(&role(1)));
    let session = server.sessions()[0].clone();
    assert_eq!(session.push_count(&user(4)), 0);
    assert!(session.push_count(&role(1)) > 0);

    facade.dispose();
    wait_until("everything unpushed", || connection.observation_paths().is_empty()).await;
    wait_until("server cells released", || data.users.observer_count() == 0).await;
    connection.dispose();
}

#[tokio::test]
async fn projects_follow_both_sourced_keys() {
    let data = TestData::new();
    let connection = connect(&server(&data));
    let projects = FetchPath::schema(schema(json!([[
        "test",
        "userProjectsByLanguage",
        {
            "user": {"source": ["test", "me"], "schema": {"property": "id"}},
            "language": {"source": ["test", "languageByName", {"name": "java"}], "schema": {"property": "id"}}
        }
    ]])))
    .with(MoreEntry::new(schema(json!([["test", "project", {"project": {"identity": true}}]]))));
    let by_language = |owner: i64| path(json!(["test", "userProjectsByLanguage", {"user": owner, "language": 1}]));
    let project = |id: i64| path(json!(["test", "project", {"project": id}]));

    let facade = connection.observable::<ObservableList>(FetchPath::composite(&[projects]));
    wait_until("java projects of user 0", || {
        connection.is_pushed(&by_language(0)) && connection.is_pushed(&project(1))
    })
    .await;
    assert!(connection.is_pushed(&path(json!(["test", "me"]))));
    assert!(connection.is_pushed(&path(json!(["test", "languageByName", {"name": "java"}]))));
    assert!(!connection.is_pushed(&project(0)));

    let created = connection
        .request(json!(["test", "addProject"]), vec![json!(0), json!(1)])
        .await
        .unwrap();
    assert_eq!(created, json!(4));
    wait_until("new project to be pushed", || connection.is_pushed(&project(4))).await;
    assert!(connection.is_pushed(&project(1)));

    let _ = connection.request(json!(["test", "login"]), vec![json!(1)]).await.unwrap();
    wait_until("switch to user 1", || {
        connection.is_pushed(&by_language(1)) && !connection.is_pushed(&by_language(0))
    })
    .await;
    wait_until("old projects to be unpushed", || {
        !connection.is_pushed(&project(1)) && !connection.is_pushed(&project(4))
    })
    .await;

    let created = connection
        .request(json!(["test", "addProject"]), vec![json!(1), json!(1)])
        .await
        .unwrap();
    wait_until("user 1 project to be pushed", || {
        connection.is_pushed(&project(created.as_i64().unwrap_or_default()))
    })
    .await;
    assert!(facade.contains(by_language(1).value()));
    connection.dispose();
}

// ── reliability ──

#[tokio::test]
async fn queued_request_is_delivered_once_after_reconnect() {
    let data = TestData::new();
    let server = server(&data);
    let settings = ConnectionSettings {
        reconnect_delay_ms: 300,
        ..ConnectionSettings::default()
    };
    let connection = connect_with(LoopbackConnector::new(server.clone()), settings);
    let mut events = connection.events();
    assert!(connection.wait_connected().await);

    let in_flight = tokio::spawn({
        let connection = connection.clone();
        async move { connection.request(json!(["test", "slowIncrement"]), Vec::new()).await }
    });
    wait_until("slow call to start", || data.slow_calls.load(Ordering::SeqCst) == 1).await;
    connection.close_connection();
    assert_eq!(in_flight.await.unwrap(), Err(RequestError::Disconnected));
    assert!(!connection.is_connected());

    let queued = tokio::spawn({
        let connection = connection.clone();
        async move { connection.request(json!(["test", "increment"]), Vec::new()).await }
    });
    wait_until("request to be queued", || connection.pending_count() == 1).await;
    assert!(!connection.is_connected());

    next_connect(&mut events).await;
    assert_eq!(queued.await.unwrap(), Ok(json!(2)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(data.counter.get(), Some(json!(2)));
    assert_eq!(data.slow_calls.load(Ordering::SeqCst), 1);
    connection.dispose();
}

#[tokio::test]
async fn in_flight_request_is_resent_after_reconnect() {
    let data = TestData::new();
    let server = server(&data);
    let settings = ConnectionSettings {
        reconnect_delay_ms: 300,
        queue_active_requests_on_disconnect: true,
        ..ConnectionSettings::default()
    };
    let connection = connect_with(LoopbackConnector::new(server.clone()), settings);
    let mut events = connection.events();
    assert!(connection.wait_connected().await);

    let in_flight = tokio::spawn({
        let connection = connection.clone();
        async move { connection.request(json!(["test", "slowIncrement"]), Vec::new()).await }
    });
    wait_until("slow call to start", || data.slow_calls.load(Ordering::SeqCst) == 1).await;
    connection.close_connection();

    let queued = tokio::spawn({
        let connection = connection.clone();
        async move { connection.request(json!(["test", "increment"]), Vec::new()).await }
    });
    wait_until("both requests to wait", || connection.pending_count() == 2).await;
    assert!(!connection.is_connected());

    // The first slow call finishes on the old session before the reconnect
    // and its reply is lost, so the re-sent copy runs it a second time.
    next_connect(&mut events).await;
    assert_eq!(queued.await.unwrap(), Ok(json!(2)));
    assert_eq!(in_flight.await.unwrap(), Ok(json!(3)));
    assert_eq!(data.slow_calls.load(Ordering::SeqCst), 2);
    assert_eq!(data.counter.get(), Some(json!(3)));
    assert_eq!(connection.pending_count(), 0);
    connection.dispose();
}

#[tokio::test]
async fn rejected_credentials_stop_reconnecting() {
    let factory = |_credentials: Value| async { Err::<Arc<dyn Dao>, _>(DaoError::Rejected(json!("denied"))) };
    let server = Arc::new(ReactiveServer::new(factory));
    let (connector, logins) = counting(&server, "initializeSession");
    let connection = connect_with(connector, fast_settings());
    let mut events = connection.events();

    loop {
        if let ConnectionEvent::AuthenticationError(error) = events.recv().await.unwrap() {
            assert_eq!(error, json!("denied"));
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(logins.load(Ordering::SeqCst), 1);
    assert_eq!(server.session_count(), 0);
    assert!(!connection.is_connected());
    connection.dispose();
}

// ── protocol violations ──

#[tokio::test]
async fn server_only_messages_end_the_session() {
    let (logs, _guard) = rdao_logging::capture_logs();
    let data = TestData::new();
    let server = server(&data);
    let mut link = LoopbackConnector::new(server.clone()).connect().await.unwrap();

    let login = Message::InitializeSession { credentials: json!({}) };
    link.sender.send(login.encode().unwrap()).unwrap();
    let bogus = Message::Response {
        response_id: 1,
        response: json!(null),
    };
    link.sender.send(bogus.encode().unwrap()).unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while link.receiver.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "session stayed open");
    wait_until("session removal", || server.session_count() == 0).await;
    let warning = logs.find(tracing::Level::WARN, "client protocol error").unwrap();
    assert!(warning.field("reason").unwrap().contains("response"));
    assert!(warning.field("session_id").is_some());
}

#[tokio::test]
async fn malformed_frames_are_echoed_back() {
    let data = TestData::new();
    let mut link = LoopbackConnector::new(server(&data)).connect().await.unwrap();

    let login = Message::InitializeSession { credentials: json!({}) };
    link.sender.send(login.encode().unwrap()).unwrap();
    link.sender.send("{\"type\":".to_owned()).unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), link.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_matches!(
        Message::decode(&frame),
        Ok(Message::MalformedMessageError { message, .. }) if message == "{\"type\":"
    );
}

// ── websocket ──

#[tokio::test]
async fn observation_over_websocket() {
    let data = TestData::new();
    let settings = ServerSettings {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerSettings::default()
    };
    let handle = serve(common::server_with(&data, settings)).await.unwrap();
    let connection = ReactiveConnection::new(
        Arc::new(WsConnector::new(handle.url())),
        json!({"user": "tester"}),
        fast_settings(),
    );

    let facade = connection.observable::<ObservableValue>(json!(["test", "counter"]));
    wait_until("initial value", || facade.get() == Some(json!(0))).await;
    let reply = connection.request(json!(["test", "increment"]), Vec::new()).await.unwrap();
    assert_eq!(reply, json!(1));
    wait_until("notify over websocket", || facade.get() == Some(json!(1))).await;

    let fetched = connection.get_more(vec![users_with_roles()]).await.unwrap();
    assert_eq!(fetched.len(), 7);

    connection.dispose();
    handle.stop().await;
}

#[tokio::test]
async fn dropped_websocket_releases_push_state() {
    let data = TestData::new();
    let settings = ServerSettings {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerSettings::default()
    };
    let server = common::server_with(&data, settings);
    let handle = serve(server.clone()).await.unwrap();
    let connection = ReactiveConnection::new(
        Arc::new(WsConnector::new(handle.url())),
        json!({"user": "tester"}),
        ConnectionSettings {
            auto_reconnect: false,
            ..fast_settings()
        },
    );
    let bob = data.user_cell(1).unwrap();
    let member = data.role_cell(1).unwrap();
    assert_eq!(data.users.observer_count(), 0);
    assert_eq!(bob.observer_count(), 0);
    assert_eq!(member.observer_count(), 0);

    let _facade = connection.observable::<ObservableList>(FetchPath::composite(&[users_with_roles()]));
    wait_until("pushes over websocket", || {
        connection.is_pushed(&user(1)) && connection.is_pushed(&role(1))
    })
    .await;
    assert!(data.users.observer_count() > 0);
    assert!(bob.observer_count() > 0);
    assert!(member.observer_count() > 0);

    // Drop the socket without unobserving; only session teardown can clean up.
    connection.close_connection();
    wait_until("session to close", || server.session_count() == 0).await;
    wait_until("list observers released", || data.users.observer_count() == 0).await;
    wait_until("record observers released", || {
        (0..4).all(|id| data.user_cell(id).is_some_and(|cell| cell.observer_count() == 0))
    })
    .await;
    wait_until("role observers released", || {
        (0..3).all(|id| data.role_cell(id).is_some_and(|cell| cell.observer_count() == 0))
    })
    .await;
    assert!(!connection.is_connected());

    connection.dispose();
    handle.stop().await;
}
