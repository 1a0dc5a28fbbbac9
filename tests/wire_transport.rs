//! End-to-end tests for the wire transport: the test plays the front web
//! server, the gateway routes and runs in-process applications.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use hostbridge::protocol::{Command, InitialRequest, Reply, RequesterChannel};
use hostbridge::worker::Transport;

mod common;

use common::{start_echo_gateway, test_config};

fn wire_config(applications: &str) -> hostbridge::GatewayConfig {
    let mut config = test_config(applications);
    config.listener.transport = Transport::Wire;
    config
}

fn request(verb: &str, uri: &str) -> InitialRequest {
    InitialRequest {
        verb: verb.into(),
        uri: uri.into(),
        protocol: "HTTP/1.1".into(),
        local_address: "10.0.0.1".into(),
        server_port: 8080,
        remote_address: "10.0.0.2".into(),
        remote_port: 51000,
        remote_name: "10.0.0.2".into(),
        headers: vec![
            ("Host".into(), "front.example:8080".into()),
            ("User-Agent".into(), "probe".into()),
        ],
        ..Default::default()
    }
}

/// Run one exchange as the front server, answering every command the way a
/// web server would. Returns the commands received, terminal one last.
async fn exchange(
    channel: &mut RequesterChannel<TcpStream>,
    request: InitialRequest,
    body: &[u8],
) -> Vec<Command> {
    let headers = request.headers.clone();
    channel.begin(request).await.unwrap();

    let mut remaining = body;
    let mut commands = Vec::new();
    loop {
        let command = tokio::time::timeout(Duration::from_secs(5), channel.next_command())
            .await
            .unwrap()
            .unwrap();
        let reply = match &command {
            Command::GetServerVariable(name) => {
                let value = name.strip_prefix("HTTP_").and_then(|header| {
                    let header = header.replace('_', "-");
                    headers
                        .iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case(&header))
                        .map(|(_, value)| value.clone())
                });
                Some(Reply::Variable(value))
            }
            Command::GetLocalPort => Some(Reply::Int(8080)),
            Command::IsConnected => Some(Reply::Int(1)),
            Command::SetupClientBlock => Some(Reply::Int(0)),
            Command::ShouldClientBlock => Some(Reply::Int(if body.is_empty() { 1 } else { 0 })),
            Command::GetClientBlock(size) => {
                let take = remaining.len().min(*size as usize);
                let (chunk, rest) = remaining.split_at(take);
                remaining = rest;
                Some(Reply::Block(Some(Bytes::copy_from_slice(chunk))))
            }
            _ => None,
        };
        if let Some(reply) = reply {
            channel.reply(reply).await.unwrap();
        }
        let terminal = command.is_terminal();
        commands.push(command);
        if terminal {
            return commands;
        }
    }
}

fn body_of(commands: &[Command]) -> String {
    let mut body = Vec::new();
    for command in commands {
        if let Command::SendBytes(data) = command {
            body.extend_from_slice(data);
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

async fn connect(addr: std::net::SocketAddr) -> RequesterChannel<TcpStream> {
    RequesterChannel::new(TcpStream::connect(addr).await.unwrap())
}

#[tokio::test]
async fn request_is_answered_with_commands() {
    let (gateway, _factory) = start_echo_gateway(wire_config("/:/srv/root")).await;
    let mut channel = connect(gateway.addr).await;

    let commands = exchange(&mut channel, request("GET", "/index.aspx"), b"").await;
    assert!(commands.contains(&Command::SetStatus {
        code: 200,
        status_line: "200 OK".into()
    }));
    let headers = commands
        .iter()
        .find_map(|c| match c {
            Command::SetResponseHeaders(headers) => Some(headers.clone()),
            _ => None,
        })
        .unwrap();
    assert!(headers.iter().any(|(name, _)| name == "Content-Length"));
    assert_eq!(
        body_of(&commands),
        "GET /index.aspx target=/srv/root port=8080 agent=probe"
    );
    assert_eq!(commands.last(), Some(&Command::Close));

    gateway.stop().await;
}

#[tokio::test]
async fn connection_carries_several_exchanges() {
    let (gateway, factory) = start_echo_gateway(wire_config("/:/srv/root")).await;
    let mut channel = connect(gateway.addr).await;

    for page in ["/a.aspx", "/b.aspx", "/c.aspx"] {
        let commands = exchange(&mut channel, request("GET", page), b"").await;
        assert!(body_of(&commands).starts_with(&format!("GET {page} ")));
    }
    assert_eq!(factory.created(), 1);

    gateway.stop().await;
}

#[tokio::test]
async fn body_is_read_through_client_blocks() {
    let (gateway, _factory) = start_echo_gateway(wire_config("/:/srv/root")).await;
    let mut channel = connect(gateway.addr).await;

    let mut post = request("POST", "/echo.aspx");
    post.headers.push(("Content-Length".into(), "9".into()));
    let commands = exchange(&mut channel, post, b"form=data").await;
    assert!(commands.iter().any(|c| matches!(c, Command::GetClientBlock(_))));
    assert_eq!(body_of(&commands), "form=data");

    gateway.stop().await;
}

#[tokio::test]
async fn unmatched_and_bare_roots_are_not_found() {
    let (gateway, factory) = start_echo_gateway(wire_config("/app:/srv/app")).await;
    let mut channel = connect(gateway.addr).await;

    // No fallback to a root route on this transport.
    let commands = exchange(&mut channel, request("GET", "/other/page.aspx"), b"").await;
    assert_eq!(commands, vec![Command::NotFound]);

    let commands = exchange(&mut channel, request("GET", "/app"), b"").await;
    assert_eq!(commands, vec![Command::NotFound]);

    // Path info after the page does not affect routing.
    let commands = exchange(&mut channel, request("GET", "/app/page.aspx/extra"), b"").await;
    assert!(body_of(&commands).contains("target=/srv/app"));
    assert_eq!(factory.created(), 1);

    gateway.stop().await;
}

#[tokio::test]
async fn backend_refusals_are_relayed() {
    let (gateway, _factory) = start_echo_gateway(wire_config("/:/srv/root")).await;
    let mut channel = connect(gateway.addr).await;

    let commands = exchange(&mut channel, request("GET", "/missing.aspx"), b"").await;
    assert_eq!(commands, vec![Command::NotFound]);

    let commands = exchange(&mut channel, request("GET", "/decline.aspx"), b"").await;
    assert_eq!(commands, vec![Command::Decline]);

    gateway.stop().await;
}

#[tokio::test]
async fn virtual_server_selects_host_route() {
    let (gateway, _factory) =
        start_echo_gateway(wire_config("/:/srv/root,shop.example:8080:/:/srv/shop")).await;
    let mut channel = connect(gateway.addr).await;

    let mut shop = request("GET", "/index.aspx");
    shop.virtual_server = "Shop.Example".into();
    let commands = exchange(&mut channel, shop, b"").await;
    assert!(body_of(&commands).contains("target=/srv/shop"));

    let commands = exchange(&mut channel, request("GET", "/index.aspx"), b"").await;
    assert!(body_of(&commands).contains("target=/srv/root"));

    gateway.stop().await;
}

#[tokio::test]
async fn version_mismatch_closes_the_connection() {
    let (gateway, _factory) = start_echo_gateway(wire_config("/:/srv/root")).await;

    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    stream.write_all(&[7, 0, 0, 0, 0]).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    gateway.stop().await;
}

#[tokio::test]
async fn shutdown_message_stops_the_gateway() {
    let (gateway, _factory) = start_echo_gateway(wire_config("/:/srv/root")).await;

    let channel = connect(gateway.addr).await;
    channel.announce_shutdown().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), gateway.handle)
        .await
        .expect("gateway did not stop")
        .unwrap();
}
