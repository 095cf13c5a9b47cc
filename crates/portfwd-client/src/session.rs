//! Session establishment with a bounded readiness handshake

use portfwd_mux::{Config, Control, Session};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, trace};

use crate::config::SessionConfig;
use crate::error::ForwardError;

/// Start a client session over `io` and wait until the peer answers a ping
///
/// On failure the session is closed before the error is returned.
pub(crate) async fn establish<T>(
    io: T,
    mux: Config,
    ready: &SessionConfig,
) -> Result<Session, ForwardError>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let session = Session::client(io, mux);
    let control = session.control();

    if let Err(e) = wait_ready(&control, ready).await {
        error!("Peer session never became ready: {}", e);
        let _ = control.close().await;
        return Err(e);
    }

    Ok(session)
}

/// Probe the session until a ping succeeds or the attempt budget runs out
pub(crate) async fn wait_ready(control: &Control, config: &SessionConfig) -> Result<(), ForwardError> {
    for attempt in 1..=config.ready_attempts {
        match tokio::time::timeout(config.ready_probe_timeout, control.ping()).await {
            Ok(Ok(rtt)) => {
                debug!(attempt, ?rtt, "Session ready");
                return Ok(());
            }
            Ok(Err(e)) => {
                trace!(attempt, "Readiness probe failed: {}", e);
                if control.is_closed() {
                    return Err(ForwardError::SessionNotReady { attempts: attempt });
                }
            }
            Err(_) => trace!(attempt, "Readiness probe timed out"),
        }

        if attempt < config.ready_attempts {
            tokio::time::sleep(config.ready_interval).await;
        }
    }

    Err(ForwardError::SessionNotReady {
        attempts: config.ready_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick() -> SessionConfig {
        SessionConfig {
            ready_attempts: 3,
            ready_interval: Duration::from_millis(5),
            ready_probe_timeout: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_ready_against_responsive_peer() {
        let (a, b) = tokio::io::duplex(4096);
        let _peer = Session::server(b, Config::default().without_keep_alive());

        let session = establish(a, Config::default().without_keep_alive(), &quick())
            .await
            .unwrap();
        assert!(!session.control().is_closed());
    }

    #[tokio::test]
    async fn test_not_ready_against_silent_peer() {
        let (a, _b) = tokio::io::duplex(4096);

        let err = establish(a, Config::default().without_keep_alive(), &quick())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::SessionNotReady { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_not_ready_stops_early_when_peer_is_gone() {
        let (a, b) = tokio::io::duplex(4096);
        drop(b);

        let config = SessionConfig {
            ready_attempts: 1000,
            ..quick()
        };
        let started = std::time::Instant::now();
        let err = establish(a, Config::default().without_keep_alive(), &config)
            .await
            .unwrap_err();

        assert!(matches!(err, ForwardError::SessionNotReady { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
