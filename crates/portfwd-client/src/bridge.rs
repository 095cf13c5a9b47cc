//! Relays one local TCP connection over a freshly opened stream

use portfwd_mux::Control;
use portfwd_proto::{ForwardTarget, ACK};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::BridgeError;

/// Open a stream for `target`, wait for the peer's acknowledgement, then relay
///
/// Nothing is read from `socket` until the peer has acknowledged, so the
/// control message is always the first payload on the stream. Returns the
/// byte counts (local to peer, peer to local).
pub(crate) async fn run(
    control: &Control,
    target: &ForwardTarget,
    mut socket: TcpStream,
) -> Result<(u64, u64), BridgeError> {
    let mut stream = control.open_stream().await.map_err(BridgeError::Open)?;
    let stream_id = stream.id();

    let message = target.to_control_bytes().map_err(BridgeError::Encode)?;
    stream
        .write_all(&message)
        .await
        .map_err(BridgeError::Control)?;
    debug!(stream_id, "Sent control message, awaiting acknowledgement");

    // Exactly the acknowledgement, never destination bytes behind it
    let mut ack = [0u8; 2];
    match stream.read_exact(&mut ack).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(BridgeError::NotAcknowledged)
        }
        Err(e) => return Err(BridgeError::Relay(e)),
    }
    if &ack[..] != ACK {
        return Err(BridgeError::UnexpectedAck(ack));
    }

    debug!(stream_id, "Peer acknowledged, relaying");
    tokio::io::copy_bidirectional(&mut socket, &mut stream)
        .await
        .map_err(BridgeError::Relay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use portfwd_mux::{Incoming, Session};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn sessions() -> (Control, Incoming) {
        let config = portfwd_mux::Config::default().without_keep_alive();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Session::client(a, config.clone());
        let mut server = Session::server(b, config);
        (client.control(), server.take_incoming().unwrap())
    }

    /// A connected local socket pair: (application side, accepted side)
    async fn local_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let app = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (app, accepted)
    }

    #[tokio::test]
    async fn test_control_message_is_sole_payload_until_ack() {
        let (control, mut incoming) = sessions();
        let (mut app, socket) = local_pair().await;

        // The application talks first, before the peer is ready
        app.write_all(b"early bytes").await.unwrap();

        let target = ForwardTarget::tcp(6379);
        let bridge = tokio::spawn(async move { run(&control, &target, socket).await });

        let mut stream = incoming.accept().await.unwrap();
        let expected = br#"{"type":"tcp","port":6379}"#;
        let mut message = vec![0u8; expected.len()];
        stream.read_exact(&mut message).await.unwrap();
        assert_eq!(message, expected);

        let mut extra = [0u8; 1];
        let held = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut extra)).await;
        assert!(held.is_err(), "nothing may follow the control message before OK");

        stream.write_all(ACK).await.unwrap();
        let mut early = [0u8; 11];
        stream.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early bytes");

        stream.write_all(b"reply").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = Vec::new();
        app.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"reply");

        app.shutdown().await.unwrap();
        let (sent, received) = bridge.await.unwrap().unwrap();
        assert_eq!((sent, received), (11, 5));
    }

    #[tokio::test]
    async fn test_unexpected_ack_closes_connection() {
        let (control, mut incoming) = sessions();
        let (mut app, socket) = local_pair().await;

        let target = ForwardTarget::unix("/run/app.sock");
        let bridge = tokio::spawn(async move { run(&control, &target, socket).await });

        let mut stream = incoming.accept().await.unwrap();
        stream.write_all(b"NO").await.unwrap();

        let result = bridge.await.unwrap();
        assert!(matches!(result, Err(BridgeError::UnexpectedAck(ack)) if &ack == b"NO"));

        let mut buf = Vec::new();
        let _ = app.read_to_end(&mut buf).await;
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_peer_closing_without_ack() {
        let (control, mut incoming) = sessions();
        let (_app, socket) = local_pair().await;

        let target = ForwardTarget::tcp(1);
        let bridge = tokio::spawn(async move { run(&control, &target, socket).await });

        let mut stream = incoming.accept().await.unwrap();
        stream.shutdown().await.unwrap();

        assert!(matches!(
            bridge.await.unwrap(),
            Err(BridgeError::NotAcknowledged)
        ));
    }
}
