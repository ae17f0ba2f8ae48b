//! End-to-end scenario: a fake tunnel server hands the control session a
//! `RequestFrame`, the client executes it against a real local HTTP server,
//! and the resulting `ResponseFrame`s are read back off the same socket.
//! Mirrors the teacher's habit of driving a real running process over real
//! sockets in `tests/`, just without a database to containerize.

use std::time::Duration;

use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tunnel_client::control::run_session;
use tunnel_client::Config;
use tunnel_protocol::{RequestFrame, ResponseFrame};

async fn spawn_local_origin() -> u16 {
    let app = Router::new()
        .route("/hello", get(|| async { "hello world" }))
        .route(
            "/missing",
            get(|| async { (axum::http::StatusCode::NOT_FOUND, "nope") }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Accepts exactly one control-channel connection and hands back the raw WS
/// stream for the test body to drive by hand.
async fn spawn_fake_tunnel_server() -> (u16, tokio::sync::oneshot::Receiver<FakeTunnelSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = tx.send(ws);
    });
    (port, rx)
}

type FakeTunnelSocket = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

fn test_config(remote_port: u16, local_port: u16) -> Config {
    Config {
        client_id: "test-client".into(),
        remote_url: format!("ws://127.0.0.1:{remote_port}"),
        local_url: url::Url::parse(&format!("http://127.0.0.1:{local_port}")).unwrap(),
        conn_token: None,
        ping_interval: Duration::from_secs(30),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn buffered_round_trip_returns_local_response_over_the_tunnel() {
    let local_port = spawn_local_origin().await;
    let (remote_port, accepted) = spawn_fake_tunnel_server().await;
    let cfg = test_config(remote_port, local_port);

    let session = tokio::spawn(async move {
        run_session(&cfg, reqwest::Client::new()).await;
    });

    let mut server_side = accepted.await.expect("server accepted a connection");

    server_side
        .send(Message::Binary(
            RequestFrame::Header {
                request_id: "r1".into(),
                method: "GET".into(),
                path: "/hello".into(),
                headers: vec![],
                eof: true,
            }
            .encode(),
        ))
        .await
        .unwrap();

    let mut status = None;
    let mut body = Vec::new();
    loop {
        match server_side.next().await {
            Some(Ok(Message::Binary(bytes))) => match ResponseFrame::decode(&bytes) {
                Some(ResponseFrame::Header {
                    request_id, status: s, eof, ..
                }) => {
                    assert_eq!(request_id, "r1");
                    status = Some(s);
                    if eof {
                        break;
                    }
                }
                Some(ResponseFrame::Body { data, eof, .. }) => {
                    if let Some(chunk) = data {
                        body.extend(chunk);
                    }
                    if eof {
                        break;
                    }
                }
                None => panic!("undecodable response frame"),
            },
            other => panic!("unexpected message from client: {other:?}"),
        }
    }

    assert_eq!(status, Some(200));
    assert_eq!(body, b"hello world");

    let _ = server_side.send(Message::Close(None)).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), session).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_local_route_surfaces_as_404_not_502() {
    let local_port = spawn_local_origin().await;
    let (remote_port, accepted) = spawn_fake_tunnel_server().await;
    let cfg = test_config(remote_port, local_port);

    let session = tokio::spawn(async move {
        run_session(&cfg, reqwest::Client::new()).await;
    });

    let mut server_side = accepted.await.unwrap();
    server_side
        .send(Message::Binary(
            RequestFrame::Header {
                request_id: "r2".into(),
                method: "GET".into(),
                path: "/missing".into(),
                headers: vec![],
                eof: true,
            }
            .encode(),
        ))
        .await
        .unwrap();

    let mut status = None;
    loop {
        match server_side.next().await {
            Some(Ok(Message::Binary(bytes))) => match ResponseFrame::decode(&bytes) {
                Some(ResponseFrame::Header { status: s, eof, .. }) => {
                    status = Some(s);
                    if eof {
                        break;
                    }
                }
                Some(ResponseFrame::Body { eof: true, .. }) => break,
                _ => {}
            },
            other => panic!("unexpected message from client: {other:?}"),
        }
    }

    assert_eq!(status, Some(404));

    let _ = server_side.send(Message::Close(None)).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), session).await;
}
