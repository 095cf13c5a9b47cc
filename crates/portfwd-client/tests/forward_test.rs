//! End-to-end forwarding through a real agent over an in-memory pipe

use portfwd_agent::{Agent, AgentConfig};
use portfwd_client::{ForwardError, ForwardTarget, ForwarderConfig, PortForwarder};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

fn mux_config() -> portfwd_mux::Config {
    portfwd_mux::Config::default().without_keep_alive()
}

fn forwarder_config() -> ForwarderConfig {
    ForwarderConfig::builder().mux(mux_config()).build().unwrap()
}

async fn start_with(agent_config: AgentConfig) -> PortForwarder {
    let (client_io, agent_io) = tokio::io::duplex(256 * 1024);

    tokio::spawn(async move {
        let _ = Agent::new(agent_config).serve(agent_io).await;
    });

    PortForwarder::builder()
        .config(forwarder_config())
        .connect(client_io)
        .await
        .unwrap()
}

async fn start() -> PortForwarder {
    start_with(AgentConfig {
        mux: mux_config(),
        port_detection: false,
        ..AgentConfig::default()
    })
    .await
}

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    port
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Send `payload` through the forward and collect what comes back
async fn round_trip(local_port: u16, payload: &[u8]) -> Vec<u8> {
    let socket = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    let (mut reader, mut writer) = socket.into_split();

    let payload = payload.to_vec();
    let sender = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let mut echoed = Vec::new();
    reader.read_to_end(&mut echoed).await.unwrap();
    sender.await.unwrap();
    echoed
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let echo_port = echo_server().await;
    let forwarder = start().await;

    let local_port = forwarder
        .add_port(ForwardTarget::tcp(echo_port), None)
        .await
        .unwrap();

    assert_eq!(
        round_trip(local_port, b"hello through the tunnel").await,
        b"hello through the tunnel"
    );

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 253) as u8).collect();
    assert!(round_trip(local_port, &payload).await == payload);

    forwarder.destroy().await;
}

#[tokio::test]
async fn test_port_in_use_falls_back_to_ephemeral() {
    // The echo server already holds 127.0.0.1:<echo_port>
    let echo_port = echo_server().await;
    let forwarder = start().await;

    let local_port = forwarder
        .add_port(ForwardTarget::tcp(echo_port), None)
        .await
        .unwrap();

    assert_ne!(local_port, echo_port);
    assert_ne!(local_port, 0);
    assert_eq!(round_trip(local_port, b"fallback").await, b"fallback");
}

#[tokio::test]
async fn test_pinned_local_port() {
    let echo_port = echo_server().await;
    let pinned = free_port().await;
    let forwarder = start().await;

    let local_port = forwarder
        .add_port(ForwardTarget::tcp(echo_port), Some(pinned))
        .await
        .unwrap();

    assert_eq!(local_port, pinned);
    assert_eq!(round_trip(local_port, b"pinned").await, b"pinned");
}

#[tokio::test]
async fn test_concurrent_connections() {
    let echo_port = echo_server().await;
    let forwarder = start().await;
    let local_port = forwarder
        .add_port(ForwardTarget::tcp(echo_port), None)
        .await
        .unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            tokio::spawn(async move {
                let payload = format!("connection {}", i).repeat(100);
                let echoed = round_trip(local_port, payload.as_bytes()).await;
                assert_eq!(echoed, payload.as_bytes());
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_remote_half_close_reaches_local_socket() {
    // Destination sends a banner, closes its write side, then keeps reading
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (received_tx, received_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"banner").await.unwrap();
        socket.shutdown().await.unwrap();

        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        let _ = received_tx.send(received);
    });

    let forwarder = start().await;
    let local_port = forwarder
        .add_port(ForwardTarget::tcp(port), None)
        .await
        .unwrap();

    let mut socket = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    let mut banner = Vec::new();
    socket.read_to_end(&mut banner).await.unwrap();
    assert_eq!(banner, b"banner");

    // Our direction is still open
    socket.write_all(b"late reply").await.unwrap();
    socket.shutdown().await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), received_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"late reply");
}

#[tokio::test]
async fn test_unreachable_target_closes_local_connection() {
    // Two distinct ports, so the local listener can never be the dead target
    let (dead_port, pinned) = {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        (
            dead.local_addr().unwrap().port(),
            local.local_addr().unwrap().port(),
        )
    };
    let echo_port = echo_server().await;
    let forwarder = start().await;

    let local_port = forwarder
        .add_port(ForwardTarget::tcp(dead_port), Some(pinned))
        .await
        .unwrap();
    assert_eq!(local_port, pinned);
    assert_ne!(local_port, dead_port);

    let mut socket = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut buf))
        .await
        .expect("local connection should be closed");
    assert!(buf.is_empty());

    // The failure is isolated to that connection
    let other = forwarder
        .add_port(ForwardTarget::tcp(echo_port), None)
        .await
        .unwrap();
    assert_eq!(round_trip(other, b"still alive").await, b"still alive");
}

#[tokio::test]
async fn test_remove_port() {
    let echo_port = echo_server().await;
    let forwarder = start().await;

    assert!(!forwarder
        .remove_port(&ForwardTarget::tcp(4321))
        .await
        .unwrap());

    let target = ForwardTarget::tcp(echo_port);
    let local_port = forwarder.add_port(target.clone(), None).await.unwrap();

    // A connection bridged before removal keeps working
    let mut inflight = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    inflight.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    inflight.read_exact(&mut buf).await.unwrap();

    assert!(forwarder.remove_port(&target).await.unwrap());
    assert!(forwarder.forwards().is_empty());
    assert!(TcpStream::connect(("127.0.0.1", local_port)).await.is_err());

    inflight.write_all(b"after").await.unwrap();
    inflight.shutdown().await.unwrap();
    let mut rest = Vec::new();
    inflight.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"after");
}

#[tokio::test]
async fn test_destroy_closes_everything() {
    let echo_a = echo_server().await;
    let echo_b = echo_server().await;
    let forwarder = start().await;

    let port_a = forwarder
        .add_port(ForwardTarget::tcp(echo_a), None)
        .await
        .unwrap();
    let port_b = forwarder
        .add_port(ForwardTarget::tcp(echo_b), None)
        .await
        .unwrap();
    assert_eq!(forwarder.forwards().len(), 2);

    forwarder.destroy().await;

    assert!(forwarder.is_destroyed());
    assert!(forwarder.forwards().is_empty());
    assert!(forwarder.session().is_closed());
    assert!(TcpStream::connect(("127.0.0.1", port_a)).await.is_err());
    assert!(TcpStream::connect(("127.0.0.1", port_b)).await.is_err());

    tokio::time::timeout(Duration::from_secs(1), forwarder.closed())
        .await
        .unwrap();
    assert!(matches!(
        forwarder.add_port(ForwardTarget::tcp(echo_a), None).await,
        Err(ForwardError::Destroyed)
    ));
}

#[tokio::test]
async fn test_auto_forward_announced_port() {
    let echo_port = echo_server().await;

    let dir = tempfile::tempdir().unwrap();
    let table: PathBuf = dir.path().join("tcp");
    std::fs::write(
        &table,
        format!(
            "  sl  local_address rem_address   st\n   0: 0100007F:{:04X} 00000000:0000 0A\n",
            echo_port
        ),
    )
    .unwrap();

    let forwarder = start_with(AgentConfig {
        mux: mux_config(),
        port_detection: true,
        scan_interval: Duration::from_millis(20),
        proc_net_paths: vec![table],
        ..AgentConfig::default()
    })
    .await;

    let target = ForwardTarget::tcp(echo_port);
    let mut local_port = None;
    for _ in 0..250 {
        if let Some(port) = forwarder.local_port(&target) {
            local_port = Some(port);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let local_port = local_port.expect("announced port should be forwarded");
    assert_eq!(round_trip(local_port, b"auto").await, b"auto");
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_target() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    let forwarder = start().await;
    let target = ForwardTarget::unix(path.to_string_lossy().into_owned());
    let local_port = forwarder.add_port(target.clone(), None).await.unwrap();

    assert_ne!(local_port, 0);
    assert_eq!(round_trip(local_port, b"unix echo").await, b"unix echo");

    let forwards = forwarder.forwards();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].target, target);
}
