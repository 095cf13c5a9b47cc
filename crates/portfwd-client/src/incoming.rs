//! Handler for streams opened by the peer (auto-forward notifications)

use portfwd_mux::{Incoming, Stream};
use portfwd_proto::{ForwardTarget, PortNotification};
use std::sync::Weak;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn, Instrument};

use crate::forwarder::{Inner, PortForwarder};

/// Accept peer-initiated streams until the session ends
pub(crate) async fn run(mut incoming: Incoming, forwarder: Weak<Inner>) {
    while let Some(stream) = incoming.accept().await {
        let span = tracing::debug_span!("incoming", stream_id = stream.id());
        tokio::spawn(handle(stream, forwarder.clone()).instrument(span));
    }
    debug!("Incoming stream handler stopped");
}

async fn handle(stream: Stream, forwarder: Weak<Inner>) {
    let Some(max_size) = forwarder
        .upgrade()
        .map(|inner| inner.config.max_notification_size)
    else {
        return;
    };

    let payload = match read_to_end(stream, max_size).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to read incoming stream: {}", e);
            return;
        }
    };

    let notification = match PortNotification::decode(&payload) {
        Ok(Some(notification)) => notification,
        Ok(None) => {
            debug!("Ignoring incoming message without a usable port");
            return;
        }
        Err(e) => {
            warn!("Discarding malformed incoming message: {}", e);
            return;
        }
    };

    let Some(inner) = forwarder.upgrade() else {
        return;
    };
    if !inner.config.auto_forward {
        debug!(port = notification.port, "Auto-forward disabled, ignoring");
        return;
    }

    let forwarder = PortForwarder::from_inner(inner);
    let target = ForwardTarget::tcp(notification.port);
    match forwarder.add_port(target, None).await {
        Ok(local_port) => info!(
            remote_port = notification.port,
            local_port, "Auto-forwarded port"
        ),
        Err(e) => warn!(
            remote_port = notification.port,
            "Failed to auto-forward port: {}", e
        ),
    }
}

/// Buffer the whole stream, refusing payloads over `max_size` bytes
async fn read_to_end(mut stream: Stream, max_size: usize) -> std::io::Result<Vec<u8>> {
    let mut payload = Vec::new();
    (&mut stream)
        .take(max_size as u64 + 1)
        .read_to_end(&mut payload)
        .await?;

    if payload.len() > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message exceeds {} bytes", max_size),
        ));
    }
    Ok(payload)
}
