//! HTTP clients served by backend processes over the wire protocol.

use std::sync::atomic::Ordering;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use hostbridge::net::Stream;
use hostbridge::protocol::{HandlerChannel, HandlerSession};
use hostbridge::Gateway;

mod common;

use common::{answer_with_uri, read_response, send_raw, spawn_gateway, start_wire_backend, test_config};

fn remote_config(applications: &str, endpoint: &str) -> hostbridge::GatewayConfig {
    let mut config = test_config(applications);
    config.backend.endpoint = Some(endpoint.to_string());
    config.backend.connect_attempts = 1;
    config.backend.connect_timeout_secs = 1;
    config
}

#[tokio::test]
async fn backend_process_answers_http_client() {
    let (backend, _) = start_wire_backend(answer_with_uri).await;
    let gateway = Gateway::with_remote_backends(remote_config("/app:/srv/app", &backend.to_string()))
        .unwrap();
    let gateway = spawn_gateway(gateway).await;

    let response = send_raw(gateway.addr, b"GET /app/list.aspx?page=2 HTTP/1.0\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Type: text/plain\r\n"));
    assert!(response.ends_with("backend saw /app/list.aspx"));

    gateway.stop().await;
}

#[tokio::test]
async fn backend_channel_is_reused_across_requests() {
    let (backend, accepted) = start_wire_backend(answer_with_uri).await;
    let gateway = Gateway::with_remote_backends(remote_config("/:/srv/root", &backend.to_string()))
        .unwrap();
    let gateway = spawn_gateway(gateway).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    for page in ["/one.aspx", "/two.aspx", "/three.aspx"] {
        let request = format!("GET {page} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        let response = read_response(&mut client).await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.header("Connection"), Some("Keep-Alive"));
        assert_eq!(response.body_text(), format!("backend saw {page}"));
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    gateway.stop().await;
}

async fn answer_once_then_hang_up(session: HandlerSession<Stream>) -> Option<HandlerChannel<Stream>> {
    answer_with_uri(session).await;
    None
}

#[tokio::test]
async fn backend_closing_idle_channel_gets_a_fresh_one() {
    let (backend, accepted) = start_wire_backend(answer_once_then_hang_up).await;
    let gateway = Gateway::with_remote_backends(remote_config("/:/srv/root", &backend.to_string()))
        .unwrap();
    let gateway = spawn_gateway(gateway).await;

    let first = send_raw(gateway.addr, b"GET /first.aspx HTTP/1.0\r\n\r\n").await;
    assert!(first.starts_with("HTTP/1.0 200 OK\r\n"), "{first}");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let second = send_raw(gateway.addr, b"GET /second.aspx HTTP/1.0\r\n\r\n").await;
    assert!(second.starts_with("HTTP/1.0 200 OK\r\n"), "{second}");
    assert!(second.ends_with("backend saw /second.aspx"));
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    gateway.stop().await;
}

async fn echo_body(mut session: HandlerSession<Stream>) -> Option<HandlerChannel<Stream>> {
    let mut body = Vec::new();
    loop {
        let chunk = session.read_body(4).await.ok()?;
        if chunk.is_empty() {
            break;
        }
        body.extend_from_slice(&chunk);
    }
    let peer = session.server_variable("REMOTE_ADDR").await.ok()??;
    let body = format!("{peer}:{}", String::from_utf8_lossy(&body));
    session.set_status(201, "201 Created").await.ok()?;
    session.set_response_header("Content-Length", body.len().to_string());
    session.send_bytes(Bytes::from(body)).await.ok()?;
    session.close().await.ok()
}

#[tokio::test]
async fn backend_reads_body_and_server_variables() {
    let (backend, _) = start_wire_backend(echo_body).await;
    let gateway = Gateway::with_remote_backends(remote_config("/:/srv/root", &backend.to_string()))
        .unwrap();
    let gateway = spawn_gateway(gateway).await;

    let response = send_raw(
        gateway.addr,
        b"POST /submit.aspx HTTP/1.0\r\nContent-Length: 10\r\n\r\nname=value",
    )
    .await;
    assert!(response.starts_with("HTTP/1.0 201 Created\r\n"), "{response}");
    assert!(response.ends_with("127.0.0.1:name=value"));

    gateway.stop().await;
}

async fn refuse(session: HandlerSession<Stream>) -> Option<HandlerChannel<Stream>> {
    session.not_found().await.ok()
}

#[tokio::test]
async fn backend_not_found_is_answered_by_gateway() {
    let (backend, _) = start_wire_backend(refuse).await;
    let gateway = Gateway::with_remote_backends(remote_config("/:/srv/root", &backend.to_string()))
        .unwrap();
    let gateway = spawn_gateway(gateway).await;

    let response = send_raw(gateway.addr, b"GET /gone.aspx HTTP/1.0\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"), "{response}");
    assert!(response.contains("/gone.aspx"));

    gateway.stop().await;
}

#[tokio::test]
async fn unreachable_backend_gives_server_error() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = closed.local_addr().unwrap().to_string();
    drop(closed);

    let gateway =
        Gateway::with_remote_backends(remote_config("/:/srv/root", &endpoint)).unwrap();
    let gateway = spawn_gateway(gateway).await;

    let response = send_raw(gateway.addr, b"GET /index.aspx HTTP/1.0\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 500 "), "{response}");

    gateway.stop().await;
}

#[tokio::test]
async fn route_endpoint_overrides_default_backend() {
    let (default_backend, default_accepted) = start_wire_backend(refuse).await;
    let (app_backend, _) = start_wire_backend(answer_with_uri).await;

    let mut config = remote_config("/:/srv/root", &default_backend.to_string());
    config.routes.push(hostbridge::routing::RouteSpec {
        host: None,
        port: None,
        prefix: "/app".into(),
        target: "/srv/app".into(),
        endpoint: Some(app_backend.to_string()),
    });
    let gateway = spawn_gateway(Gateway::with_remote_backends(config).unwrap()).await;

    let response = send_raw(gateway.addr, b"GET /app/home.aspx HTTP/1.0\r\n\r\n").await;
    assert!(response.ends_with("backend saw /app/home.aspx"), "{response}");
    assert_eq!(default_accepted.load(Ordering::SeqCst), 0);

    gateway.stop().await;
}
