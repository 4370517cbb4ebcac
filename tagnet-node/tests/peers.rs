mod common;

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use anyhow::bail;
use serde_json::{json, Map, Value};
use tagnet_core::flag::{INVALID_CONNECTION, NULL};
use tagnet_core::{wire, ConnectionTag, PeerId, PeerInfo, Reply, Request, Response};
use tagnet_node::builtins::{CONNECTIONS, INFO, NULL_CONNECTION, PASS_THROUGH};
use tagnet_node::{transport, PeerError, PeerProcess, RequestError};

use common::{local_config, test_peer};

fn add(_: &PeerProcess, request: &Request) -> anyhow::Result<Reply> {
    let a: i64 = request.arg(0)?;
    let b: i64 = request.arg(1)?;
    Ok(json!(a + b).into())
}

fn explode(_: &PeerProcess, _: &Request) -> anyhow::Result<Reply> {
    bail!("exploded")
}

fn boom(_: &PeerProcess, _: &Request) -> anyhow::Result<Reply> {
    panic!("boom")
}

fn flagged(_: &PeerProcess, _: &Request) -> anyhow::Result<Reply> {
    Ok(Reply::flag("TEST"))
}

fn args(values: &[Value]) -> Vec<Value> {
    values.to_vec()
}

#[test]
fn peers_take_distinct_ports() {
    let a = test_peer(local_config("ports", 41000, 5));
    let b = test_peer(local_config("ports", 41000, 5));
    assert_ne!(a.identity().port, b.identity().port);
    assert!((41000..41005).contains(&a.identity().port));
    assert!((41000..41005).contains(&b.identity().port));
    assert!(PeerProcess::ping("127.0.0.1", a.identity().port));
    assert!(PeerProcess::ping("127.0.0.1", b.identity().port));
    assert_eq!(a.id().decode().unwrap(), *a.identity());
}

#[test]
fn remote_and_local_calls_agree() {
    let a = test_peer(local_config("calls", 41010, 5));
    let b = test_peer(local_config("calls", 41010, 5));
    let on_a = a.connect(add);
    b.connect(add);

    let remote = on_a
        .call_on(&b.id(), args(&[json!(40), json!(2)]), Map::new())
        .unwrap();
    let local = on_a.call(args(&[json!(40), json!(2)]), Map::new()).unwrap();
    assert_eq!(remote, json!(42));
    assert_eq!(local, remote);
    assert_eq!(on_a.invoke(None, args(&[json!(1), json!(2)]), Map::new()).unwrap(), json!(3));
    assert_eq!(
        on_a.invoke(Some(&b.id()), args(&[json!(1), json!(2)]), Map::new())
            .unwrap(),
        json!(3)
    );
}

#[test]
fn named_connection_through_request() {
    let a = test_peer(local_config("named", 41020, 5));
    let b = test_peer(local_config("named", 41020, 5));
    let echo = b.connect_tagged("echo", |_: &PeerProcess, r: &Request| {
        Ok(json!({ "args": r.args, "kwargs": r.kwargs }).into())
    });
    assert_eq!(echo.name(), "echo");

    let mut kwargs = Map::new();
    kwargs.insert("k".into(), json!("v"));
    let value = a
        .request(&b.id(), &ConnectionTag::named("echo"), args(&[json!(1)]), kwargs)
        .unwrap();
    assert_eq!(value, json!({ "args": [1], "kwargs": { "k": "v" } }));
}

#[test]
fn missing_connection_lists_remote_connections() {
    let a = test_peer(local_config("missing", 41030, 5));
    let b = test_peer(local_config("missing", 41030, 5));
    let missing = a.connect_tagged("missing", add);

    let err = missing
        .call_on(&b.id(), args(&[json!(1), json!(2)]), Map::new())
        .unwrap_err();
    let RequestError::Signal(signal) = err else {
        panic!("expected a control signal, got {err:?}");
    };
    assert!(signal.is(INVALID_CONNECTION));
    assert_eq!(signal.peer, b.id());
    assert!(signal.message.contains("missing"), "{}", signal.message);
    assert!(signal.message.contains(INFO), "{}", signal.message);
    assert!(signal.message.contains("127.0.0.1@"), "{}", signal.message);

    // Registering it on the remote makes the same call succeed.
    b.connect_tagged("missing", add);
    assert_eq!(
        missing
            .call_on(&b.id(), args(&[json!(1), json!(2)]), Map::new())
            .unwrap(),
        json!(3)
    );
}

#[test]
fn handler_errors_come_back_as_remote_errors() {
    let a = test_peer(local_config("errors", 41040, 5));
    let b = test_peer(local_config("errors", 41040, 5));
    let on_a = a.connect_tagged("explode", explode);
    b.connect_tagged("explode", explode);

    match on_a.call_on(&b.id(), Vec::new(), Map::new()) {
        Err(RequestError::Remote(e)) => {
            assert_eq!(e.peer, b.id());
            assert!(e.traceback.contains("exploded"), "{}", e.traceback);
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
    match on_a.call(Vec::new(), Map::new()) {
        Err(RequestError::Remote(e)) => {
            assert_eq!(e.peer, a.id());
            assert!(e.traceback.contains("exploded"), "{}", e.traceback);
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    // The server survives a failed handler.
    let info = a
        .request(&b.id(), &ConnectionTag::named(INFO), Vec::new(), Map::new())
        .unwrap();
    assert_eq!(serde_json::from_value::<PeerInfo>(info).unwrap(), b.info());
}

#[test]
fn panicking_handler_is_contained() {
    let a = test_peer(local_config("panics", 41050, 5));
    let b = test_peer(local_config("panics", 41050, 5));
    let on_a = a.connect_tagged("boom", boom);
    b.connect_tagged("boom", boom);

    match on_a.call_on(&b.id(), Vec::new(), Map::new()) {
        Err(RequestError::Remote(e)) => assert!(e.traceback.contains("boom"), "{}", e.traceback),
        other => panic!("expected a remote error, got {other:?}"),
    }
    assert!(PeerProcess::ping("127.0.0.1", b.identity().port));
}

#[test]
fn custom_flag_needs_both_sides() {
    let a = test_peer(local_config("flags", 41060, 5));
    let b = test_peer(local_config("flags", 41060, 5));
    let on_a = a.connect_tagged("flagged", flagged);
    b.connect_tagged("flagged", flagged);

    // Unknown on the remote: it cannot produce a sentinel and reports an error instead.
    match on_a.call_on(&b.id(), Vec::new(), Map::new()) {
        Err(RequestError::Remote(e)) => assert!(e.traceback.contains("TEST"), "{}", e.traceback),
        other => panic!("expected a remote error, got {other:?}"),
    }

    // Known remotely, unknown locally: the sentinel is not recognised and fails to decode.
    b.register_flag("TEST", |_: &PeerProcess, _| Ok(json!("unused")))
        .unwrap();
    assert!(matches!(
        on_a.call_on(&b.id(), Vec::new(), Map::new()),
        Err(RequestError::Decode(_))
    ));

    a.register_flag("TEST", |_: &PeerProcess, call| Ok(json!(format!("handled {}", call.flag))))
        .unwrap();
    assert_eq!(
        on_a.call_on(&b.id(), Vec::new(), Map::new()).unwrap(),
        json!("handled TEST")
    );
    assert_eq!(on_a.call(Vec::new(), Map::new()).unwrap(), json!("handled TEST"));
}

#[test]
fn builtins() {
    let a = test_peer(local_config("builtins", 41070, 5));
    let b = test_peer(local_config("builtins", 41070, 5));
    let call = |name: &str, args: Vec<Value>, kwargs: Map<String, Value>| {
        a.request(&b.id(), &ConnectionTag::named(name), args, kwargs)
    };

    assert_eq!(call(NULL_CONNECTION, Vec::new(), Map::new()).unwrap(), Value::Null);

    let info: PeerInfo = serde_json::from_value(call(INFO, Vec::new(), Map::new()).unwrap()).unwrap();
    assert_eq!(info, b.info());
    assert_eq!(info.group, "builtins");
    assert!(!info.hub);

    assert_eq!(
        call(PASS_THROUGH, args(&[json!("x")]), Map::new()).unwrap(),
        json!("x")
    );
    let mut kwargs = Map::new();
    kwargs.insert("k".into(), json!(true));
    assert_eq!(
        call(PASS_THROUGH, args(&[json!(1), json!(2)]), kwargs).unwrap(),
        json!([[1, 2], { "k": true }])
    );

    let names: Vec<String> =
        serde_json::from_value(call(CONNECTIONS, Vec::new(), Map::new()).unwrap()).unwrap();
    for builtin in [INFO, PASS_THROUGH, NULL_CONNECTION, CONNECTIONS] {
        assert!(names.iter().any(|n| n == builtin), "{builtin} missing from {names:?}");
    }
    assert_eq!(a.remote_connections(&b.id()), Some(names));
}

#[test]
fn unreachable_peer_is_a_transport_error() {
    let a = test_peer(local_config("unreachable", 41080, 5));
    let nobody = PeerId::new("127.0.0.1", 41089, "unreachable").unwrap().token();
    let err = a
        .request_with_timeout(
            &nobody,
            &ConnectionTag::named(INFO),
            Vec::new(),
            Map::new(),
            Some(Duration::from_millis(200)),
        )
        .unwrap_err();
    assert!(matches!(err, RequestError::Io(_)), "{err:?}");
    assert!(!PeerProcess::ping("127.0.0.1", 41089));

    let garbage = tagnet_core::PeerToken::from("not a token");
    assert!(matches!(
        a.request(&garbage, &ConnectionTag::named(INFO), Vec::new(), Map::new()),
        Err(RequestError::Identity(_))
    ));
}

#[test]
fn raw_frames() {
    let a = test_peer(local_config("raw", 41090, 5));
    let target = a.identity().clone();

    let empty = transport::exchange(&target, b"", Some(Duration::from_secs(2))).unwrap();
    assert_eq!(empty, a.flag(NULL).unwrap().as_bytes());

    let garbage = transport::exchange(&target, b"%%% not base64", Some(Duration::from_secs(2))).unwrap();
    match wire::decode_response(&garbage).unwrap() {
        Response::Error { traceback, peer } => {
            assert_eq!(peer, a.id());
            assert!(traceback.contains("malformed"), "{traceback}");
        }
        other => panic!("expected an error payload, got {other:?}"),
    }
}

#[test]
fn answers_without_waiting_for_half_close() {
    let a = test_peer(local_config("open-ended", 41110, 3));
    let request = Request::new(ConnectionTag::named(PASS_THROUGH), args(&[json!(42)]), Map::new());
    let frame = wire::encode_request(&request).unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", a.identity().port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    stream.write_all(&frame).unwrap();
    stream.flush().unwrap();

    let reply = transport::read_frame(&mut stream).unwrap();
    let response = wire::decode_response(&reply).unwrap();
    assert_eq!(response.peer(), &a.id());
    assert_eq!(response.into_result().unwrap(), json!(42));
}

#[test]
fn launch_fails_without_a_free_port() {
    let empty = PeerProcess::builder(local_config("none", 41100, 0))
        .test_mode(true)
        .launch();
    assert!(matches!(
        empty,
        Err(PeerError::PortExhausted { start: 41100, end: 41100 })
    ));

    let _occupied = TcpListener::bind(("127.0.0.1", 41101)).unwrap();
    let taken = PeerProcess::builder(local_config("none", 41101, 1))
        .test_mode(true)
        .launch();
    assert!(matches!(taken, Err(PeerError::PortExhausted { .. })));
}
