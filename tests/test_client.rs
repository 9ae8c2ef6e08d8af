//! Integration tests: single requests, errors, and connection failure.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pipedis::{Arg, Charset, Client, ClientConfig, Error, RedisErrorKind, RespValue};
use common::*;

#[tokio::test]
async fn ping_and_echo() {
    let server = MockServer::kv(None).await;
    let client = server.client();

    assert_eq!(
        client.execute(["PING"]).await.unwrap(),
        RespValue::SimpleString("PONG".into())
    );
    assert_eq!(
        client.execute(["ECHO", "hello"]).await.unwrap(),
        RespValue::BulkString(Bytes::from_static(b"hello"))
    );
    assert_eq!(server.commands(), vec![vec!["PING"], vec!["ECHO", "hello"]]);
}

#[tokio::test]
async fn non_text_arguments_are_sent_as_bulk() {
    let server = MockServer::kv(None).await;
    let client = server.client();

    let args: Vec<Arg> = vec!["ECHO".into(), 42i64.into()];
    client.execute(args).await.unwrap();
    let args: Vec<Arg> = vec!["ECHO".into(), 1.5f64.into()];
    client.execute(args).await.unwrap();
    let args: Vec<Arg> = vec!["ECHO".into(), Arg::Null];
    client.execute(args).await.unwrap();

    assert_eq!(
        server.commands(),
        vec![vec!["ECHO", "42"], vec!["ECHO", "1.5"], vec!["ECHO", "null"]]
    );
}

#[tokio::test]
async fn auth_before_first_command() {
    let server = MockServer::kv(Some("s3cret")).await;
    let url = format!("redis://:s3cret@127.0.0.1:{}", server.addr().port());
    let client = Client::from_url(&url).unwrap();

    exec_ok(&client, &["SET", "k", "v"]).await;
    assert_eq!(server.commands()[0], vec!["AUTH", "s3cret"]);
    assert_eq!(server.command_names(), vec!["AUTH", "SET"]);
}

#[tokio::test]
async fn rejected_auth_fails_every_request() {
    let server = MockServer::kv(Some("s3cret")).await;
    let config = ClientConfig {
        password: Some("wrong".into()),
        ..server.config()
    };
    let client = Client::new(config).unwrap();

    let results = client.pipeline(vec![["PING"]; 5]).await.unwrap();
    assert_eq!(results.len(), 5);
    for result in results {
        match result {
            Err(Error::Auth(msg)) => assert!(msg.starts_with("WRONGPASS"), "{msg}"),
            other => panic!("expected auth error, got {other:?}"),
        }
    }
    // nothing but the AUTH attempt reached the server
    assert_eq!(server.command_names(), vec!["AUTH"]);
}

#[tokio::test]
async fn server_error_is_tagged_with_command() {
    let server = MockServer::start(|args| match text(&args[0]).as_str() {
        "GET" => Reply::Value(Arg::error(
            "WRONGTYPE Operation against a key holding the wrong kind of value",
        )),
        _ => Reply::Value(Arg::simple("PONG")),
    })
    .await;
    let client = server.client();

    let err = client.execute(["GET", "somekey"]).await.unwrap_err();
    assert_eq!(err.redis_kind(), Some(&RedisErrorKind::WrongType));
    assert!(!err.is_fatal());
    let shown = err.to_string();
    assert!(shown.contains("WRONGTYPE"), "{shown}");
    assert!(shown.ends_with("[GET, somekey]"), "{shown}");

    // the connection survives a server error
    exec(&client, &["PING"]).await;
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn malformed_frame_replaces_connection() {
    let server = MockServer::start(|args| match text(&args[0]).as_str() {
        "BROKEN" => Reply::Raw(b"$abc\r\n".to_vec()),
        _ => Reply::Value(Arg::simple("PONG")),
    })
    .await;
    let client = server.client();

    let err = client.execute(["BROKEN"]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err:?}");

    exec(&client, &["PING"]).await;
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn undecodable_integer_keeps_connection() {
    let server = MockServer::start(|args| match text(&args[0]).as_str() {
        "ODD" => Reply::Raw(b":471a\r\n".to_vec()),
        _ => Reply::Value(Arg::simple("PONG")),
    })
    .await;
    let client = server.client();

    let err = client.execute(["ODD"]).await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)), "{err:?}");

    exec(&client, &["PING"]).await;
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn hang_up_fails_request_and_reconnects() {
    let server = MockServer::start(|args| match text(&args[0]).as_str() {
        "KILL" => Reply::Close,
        _ => Reply::Value(Arg::simple("PONG")),
    })
    .await;
    let client = server.client();

    let err = client.execute(["KILL"]).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err:?}");

    exec(&client, &["PING"]).await;
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn connect_failure_is_reported() {
    init_tracing();
    let client = Client::new(ClientConfig::new("127.0.0.1", 1)).unwrap();
    let err = client.execute(["PING"]).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err:?}");
    assert!(err.is_fatal());
}

#[tokio::test]
async fn timeout_does_not_shift_replies() {
    let server = MockServer::start(|args| match text(&args[0]).as_str() {
        "SLOW" => Reply::Delayed(Duration::from_millis(200), Arg::from("slow")),
        _ => Reply::Value(Arg::from("fast")),
    })
    .await;
    let config = ClientConfig {
        max_connections: 1,
        ..server.config()
    };
    let client = Client::new(config).unwrap();

    let err = client
        .execute_timeout(["SLOW"], Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err:?}");

    // the late "slow" reply is consumed by the abandoned request
    let value = client.execute(["FAST"]).await.unwrap();
    assert_eq!(value, RespValue::BulkString(Bytes::from_static(b"fast")));
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn close_fails_requests_in_flight() {
    let server = MockServer::start(|_| Reply::Nothing).await;
    let client = Arc::new(server.client());

    let mut handles = vec![];
    for i in 0..3 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client.execute(["BLPOP".to_string(), format!("queue_{i}"), "0".into()]).await
        }));
    }
    wait_for(|| server.commands().len() == 3).await;

    client.close();
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed(_)), "{err:?}");
    }
    tokio::time::timeout(Duration::from_secs(5), client.closed())
        .await
        .unwrap();
    assert_eq!(client.live_connections(), 0);

    let err = client.execute(["PING"]).await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)));
}

#[tokio::test]
async fn latin1_charset() {
    let server = MockServer::kv(None).await;
    let config = ClientConfig {
        charset: Charset::Latin1,
        ..server.config()
    };
    let client = Client::new(config).unwrap();

    let value = client.execute(["ECHO", "café"]).await.unwrap();
    assert_eq!(value, RespValue::BulkString(Bytes::from_static(b"caf\xe9")));

    // only the unencodable request fails
    let err = client.execute(["ECHO", "€"]).await.unwrap_err();
    assert!(matches!(err, Error::Encoding(_)), "{err:?}");
    exec(&client, &["PING"]).await;
    assert_eq!(server.accepted(), 1);
}
