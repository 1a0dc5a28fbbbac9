//! End-to-end tests for the HTTP transport with in-process backends.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

mod common;

use common::{is_closed, read_response, send_raw, start_echo_gateway, test_config};

#[tokio::test]
async fn request_reaches_matching_application() {
    let (gateway, factory) = start_echo_gateway(test_config("/app:/srv/app,/:/srv/root")).await;

    let response = send_raw(
        gateway.addr,
        b"GET /app/page.aspx HTTP/1.0\r\nHost: example.com\r\nUser-Agent: probe\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with(&format!(
        "GET /app/page.aspx target=/srv/app port={} agent=probe",
        gateway.addr.port()
    )));

    let response = send_raw(gateway.addr, b"GET /other/index.html HTTP/1.0\r\n\r\n").await;
    assert!(response.contains("target=/srv/root"), "{response}");
    assert_eq!(factory.created(), 2);

    gateway.stop().await;
}

#[tokio::test]
async fn unmatched_path_gets_not_found_page() {
    let (gateway, factory) = start_echo_gateway(test_config("/app:/srv/app")).await;

    let response = send_raw(gateway.addr, b"GET /nowhere/<b> HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"), "{response}");
    assert!(response.contains("/nowhere/&lt;b&gt;"));
    assert_eq!(factory.created(), 0);

    gateway.stop().await;
}

#[tokio::test]
async fn application_root_without_slash_redirects() {
    let (gateway, _factory) = start_echo_gateway(test_config("/app:/srv/app")).await;

    let response = send_raw(gateway.addr, b"GET /app?x=1 HTTP/1.0\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 301 "), "{response}");
    assert!(response.contains("Location: /app/?x=1\r\n"));

    let response = send_raw(gateway.addr, b"GET /app?q=\"<x> HTTP/1.0\r\n\r\n").await;
    assert!(response.contains("Location: /app/?q=%22%3Cx%3E\r\n"), "{response}");

    gateway.stop().await;
}

#[tokio::test]
async fn backend_refusals_become_not_found() {
    let (gateway, _factory) = start_echo_gateway(test_config("/:/srv/root")).await;

    for path in ["/missing.aspx", "/decline.aspx"] {
        let request = format!("GET {path} HTTP/1.0\r\n\r\n");
        let response = send_raw(gateway.addr, request.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"), "{path}: {response}");
    }

    gateway.stop().await;
}

#[tokio::test]
async fn request_body_is_delivered() {
    let (gateway, _factory) = start_echo_gateway(test_config("/:/srv/root")).await;

    let response = send_raw(
        gateway.addr,
        b"POST /echo.aspx HTTP/1.0\r\nContent-Length: 11\r\n\r\nhello world",
    )
    .await;
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Length: 11\r\n"));
    assert!(response.ends_with("\r\n\r\nhello world"));

    gateway.stop().await;
}

#[tokio::test]
async fn keep_alive_budget_counts_down_then_closes() {
    let mut config = test_config("/:/srv/root");
    config.keep_alive.max_reuses = 2;
    let (gateway, _factory) = start_echo_gateway(config).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    let request = b"GET /index.aspx HTTP/1.1\r\nHost: localhost\r\n\r\n";

    client.write_all(request).await.unwrap();
    let first = read_response(&mut client).await;
    assert_eq!(first.status(), 200);
    assert_eq!(first.header("Connection"), Some("Keep-Alive"));
    assert_eq!(first.header("Keep-Alive"), Some("timeout=5, max=2"));

    client.write_all(request).await.unwrap();
    let second = read_response(&mut client).await;
    assert_eq!(second.header("Keep-Alive"), Some("timeout=5, max=1"));

    client.write_all(request).await.unwrap();
    let third = read_response(&mut client).await;
    assert_eq!(third.header("Connection"), Some("close"));
    assert!(third.header("Keep-Alive").is_none());
    assert!(third.body_text().starts_with("GET /index.aspx"));

    assert!(is_closed(&mut client).await);
    gateway.stop().await;
}

#[tokio::test]
async fn pipelined_requests_are_served_in_order() {
    let (gateway, _factory) = start_echo_gateway(test_config("/:/srv/root")).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client
        .write_all(b"GET /a.aspx HTTP/1.1\r\nHost: x\r\n\r\nGET /b.aspx HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let first = read_response(&mut client).await;
    let second = read_response(&mut client).await;
    assert!(first.body_text().starts_with("GET /a.aspx"));
    assert!(second.body_text().starts_with("GET /b.aspx"));

    gateway.stop().await;
}

#[tokio::test]
async fn client_close_request_is_honoured() {
    let (gateway, _factory) = start_echo_gateway(test_config("/:/srv/root")).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(is_closed(&mut client).await);

    gateway.stop().await;
}

#[tokio::test]
async fn head_request_has_no_body() {
    let (gateway, _factory) = start_echo_gateway(test_config("/:/srv/root")).await;

    let response = send_raw(gateway.addr, b"HEAD /index.aspx HTTP/1.0\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    assert!(response.ends_with("\r\n\r\n"));

    gateway.stop().await;
}

#[tokio::test]
async fn overlong_request_line_gets_bad_request() {
    let (gateway, _factory) = start_echo_gateway(test_config("/:/srv/root")).await;

    let mut request = b"GET /".to_vec();
    request.extend(std::iter::repeat(b'a').take(10_000));
    request.extend_from_slice(b" HTTP/1.0\r\n\r\n");
    let response = send_raw(gateway.addr, &request).await;
    assert!(response.starts_with("HTTP/1.0 400 Bad Request\r\n"), "{response}");

    gateway.stop().await;
}

#[tokio::test]
async fn concurrent_first_requests_create_one_context() {
    let (gateway, factory) = common::start_echo_gateway_with_delay(
        test_config("/:/srv/root"),
        Duration::from_millis(100),
    )
    .await;

    let mut clients = Vec::new();
    for i in 0..8 {
        let addr = gateway.addr;
        clients.push(tokio::spawn(async move {
            let request = format!("GET /page{i}.aspx HTTP/1.0\r\n\r\n");
            send_raw(addr, request.as_bytes()).await
        }));
    }
    for client in clients {
        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    }
    assert_eq!(factory.created(), 1);

    gateway.stop().await;
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (gateway, _factory) = start_echo_gateway(test_config("/:/srv/root")).await;
    let addr = gateway.addr;
    gateway.stop().await;

    let refused = match TcpStream::connect(addr).await {
        Err(_) => true,
        Ok(mut stream) => is_closed(&mut stream).await,
    };
    assert!(refused);
}
