//! Per-stream forwarding: control message, dial, acknowledge, relay

use portfwd_mux::Stream;
use portfwd_proto::{ForwardTarget, ACK};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::AgentError;

/// Largest control message accepted
pub const MAX_CONTROL_MESSAGE: usize = 64 * 1024;

/// Serve one client stream end to end
///
/// Without a valid control message or a reachable target the stream is
/// closed without an acknowledgement.
pub async fn forward_stream(mut stream: Stream) -> Result<(), AgentError> {
    let (target, leftover) = match read_control_message(&mut stream, MAX_CONTROL_MESSAGE).await {
        Ok(decoded) => decoded,
        Err(e) => {
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    info!(%target, "Connecting");
    let result = match &target {
        ForwardTarget::Tcp { port } => match TcpStream::connect(("127.0.0.1", *port)).await {
            Ok(remote) => {
                let _ = remote.set_nodelay(true);
                relay(&mut stream, remote, &leftover).await
            }
            Err(source) => Err(AgentError::Connect {
                target: target.clone(),
                source,
            }),
        },
        #[cfg(unix)]
        ForwardTarget::Unix { path } => match tokio::net::UnixStream::connect(path).await {
            Ok(remote) => relay(&mut stream, remote, &leftover).await,
            Err(source) => Err(AgentError::Connect {
                target: target.clone(),
                source,
            }),
        },
        #[cfg(not(unix))]
        ForwardTarget::Unix { .. } => Err(AgentError::UnsupportedTarget(target.clone())),
    };

    match result {
        Ok((to_target, to_client)) => {
            debug!(%target, to_target, to_client, "Stream closed");
            Ok(())
        }
        Err(e) => {
            let _ = stream.shutdown().await;
            Err(e)
        }
    }
}

/// Acknowledge the stream and relay until both directions finish
async fn relay<S>(stream: &mut Stream, mut remote: S, leftover: &[u8]) -> Result<(u64, u64), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(ACK).await?;
    if !leftover.is_empty() {
        remote.write_all(leftover).await?;
    }
    Ok(tokio::io::copy_bidirectional(stream, &mut remote).await?)
}

/// Decode the control message at the start of `reader`
///
/// Reads only until one complete JSON value has arrived. Any bytes that came
/// in behind it are returned untouched so they can be delivered to the
/// target.
pub async fn read_control_message<R>(
    reader: &mut R,
    max_size: usize,
) -> Result<(ForwardTarget, Vec<u8>), AgentError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    let mut chunk = [0u8; 512];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(AgentError::ControlMessageIncomplete);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<ForwardTarget>();
        match values.next() {
            Some(Ok(target)) => {
                let consumed = values.byte_offset();
                target.validate()?;
                return Ok((target, buf[consumed..].to_vec()));
            }
            Some(Err(e)) if e.is_eof() => {}
            Some(Err(e)) => return Err(e.into()),
            None => {}
        }

        if buf.len() > max_size {
            return Err(AgentError::ControlMessageTooLarge(max_size));
        }
    }
}
