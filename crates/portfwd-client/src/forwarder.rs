//! Forward registry: local listeners keyed by remote target

use futures::future::join_all;
use portfwd_mux::Control;
use portfwd_proto::ForwardTarget;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::ForwarderConfig;
use crate::error::ForwardError;
use crate::transport::{self, PeerCommand, PeerProcess};
use crate::{bridge, incoming, session};

/// Snapshot of one registered forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    pub target: ForwardTarget,
    pub local_port: u16,
    pub active_connections: usize,
}

/// A bound listener and the task accepting on it
struct ForwardEntry {
    local_port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    active: Arc<AtomicUsize>,
}

impl ForwardEntry {
    /// Stop accepting and wait for the listener to be released
    ///
    /// Connections already bridged keep running.
    async fn close(mut self, target: &ForwardTarget) -> Result<(), ForwardError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match (&mut self.task).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ForwardError::ListenerClose {
                target: target.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: ForwarderConfig,
    span: Span,
    control: Control,
    entries: Mutex<HashMap<ForwardTarget, ForwardEntry>>,
    destroyed: AtomicBool,
    peer: tokio::sync::Mutex<Option<PeerProcess>>,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<ForwardTarget, ForwardEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forwards local TCP ports to targets reachable by the peer
///
/// Cheap to clone; all clones share one session and one registry.
#[derive(Clone)]
pub struct PortForwarder {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PortForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForwarder")
            .field("session", &self.inner.control.id())
            .field("forwards", &self.inner.entries().len())
            .finish()
    }
}

/// Builder for [`PortForwarder`]
///
/// Every terminal method establishes the session (including the readiness
/// handshake) before returning.
#[derive(Default)]
pub struct ForwarderBuilder {
    config: ForwarderConfig,
    span: Option<Span>,
}

impl ForwarderBuilder {
    pub fn config(mut self, config: ForwarderConfig) -> Self {
        self.config = config;
        self
    }

    /// Parent span for everything the forwarder logs
    ///
    /// Defaults to `info_span!("portfwd")`.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Spawn `command` and run the session over its stdin/stdout
    pub async fn spawn(self, command: PeerCommand) -> Result<PortForwarder, ForwardError> {
        let span = self.span.clone().unwrap_or_else(default_span);
        let peer = span.in_scope(|| transport::spawn(&command))?;

        if let Some(stderr) = peer.stderr {
            tokio::spawn(transport::pump_stderr(stderr).instrument(span.clone()));
        }

        self.span(span)
            .start(peer.pipe, Some(peer.process))
            .await
    }

    /// Run the session over a separate reader and writer
    pub async fn stdio<R, W>(self, reader: R, writer: W) -> Result<PortForwarder, ForwardError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.start(transport::StdioPipe::new(reader, writer), None)
            .await
    }

    /// Run the session over any duplex byte channel
    pub async fn connect<T>(self, io: T) -> Result<PortForwarder, ForwardError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.start(io, None).await
    }

    async fn start<T>(self, io: T, peer: Option<PeerProcess>) -> Result<PortForwarder, ForwardError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let span = self.span.unwrap_or_else(default_span);

        let established = session::establish(io, self.config.mux.clone(), &self.config.session)
            .instrument(span.clone())
            .await;

        let mut session = match established {
            Ok(session) => session,
            Err(e) => {
                if let Some(peer) = peer {
                    let _ = peer.kill().await;
                }
                return Err(e);
            }
        };

        let control = session.control();
        span.in_scope(|| info!(session = control.id(), "Session established"));

        let inner = Arc::new(Inner {
            config: self.config,
            span: span.clone(),
            control: control.clone(),
            entries: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
            peer: tokio::sync::Mutex::new(peer),
        });

        if let Some(incoming) = session.take_incoming() {
            tokio::spawn(incoming::run(incoming, Arc::downgrade(&inner)).instrument(span.clone()));
        }

        let weak = Arc::downgrade(&inner);
        tokio::spawn(
            async move {
                control.closed().await;
                let destroyed = weak
                    .upgrade()
                    .map_or(true, |inner| inner.destroyed.load(Ordering::SeqCst));
                if !destroyed {
                    warn!("Session to peer closed");
                }
            }
            .instrument(span),
        );

        Ok(PortForwarder { inner })
    }
}

fn default_span() -> Span {
    info_span!("portfwd")
}

impl PortForwarder {
    pub fn builder() -> ForwarderBuilder {
        ForwarderBuilder::default()
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Forward connections on a local port to `target`
    ///
    /// Binds `local_port` if given, otherwise the target's own port (TCP) or
    /// an ephemeral port (Unix). When that port is taken and no local port was
    /// requested, falls back to an ephemeral port. Returns the bound port; a
    /// target that is already forwarded returns its existing port.
    pub async fn add_port(
        &self,
        target: ForwardTarget,
        local_port: Option<u16>,
    ) -> Result<u16, ForwardError> {
        target.validate()?;
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(ForwardError::Destroyed);
        }
        if let Some(existing) = self.local_port(&target) {
            debug!(parent: &self.inner.span, %target, local_port = existing, "Already forwarded");
            return Ok(existing);
        }

        let listener = self.bind(&target, local_port).await?;
        let bound = listener
            .local_addr()
            .map_err(|source| ForwardError::Bind {
                port: local_port.unwrap_or(0),
                source,
            })?
            .port();

        let mut entries = self.inner.entries();
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(ForwardError::Destroyed);
        }
        // Lost a race with a concurrent add for the same target
        if let Some(existing) = entries.get(&target) {
            return Ok(existing.local_port);
        }

        let span = info_span!(parent: &self.inner.span, "forward", %target, local_port = bound);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let active = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(
            accept_loop(
                listener,
                target.clone(),
                self.inner.control.clone(),
                active.clone(),
                shutdown_rx,
            )
            .instrument(span),
        );

        entries.insert(
            target.clone(),
            ForwardEntry {
                local_port: bound,
                shutdown_tx: Some(shutdown_tx),
                task,
                active,
            },
        );
        drop(entries);

        info!(parent: &self.inner.span, %target, local_port = bound, "Forwarding");
        Ok(bound)
    }

    /// Stop forwarding `target`
    ///
    /// Returns `false` when nothing was registered for it. Connections already
    /// bridged are left to finish on their own.
    pub async fn remove_port(&self, target: &ForwardTarget) -> Result<bool, ForwardError> {
        let entry = self.inner.entries().remove(target);

        match entry {
            Some(entry) => {
                let local_port = entry.local_port;
                entry.close(target).await?;
                info!(parent: &self.inner.span, %target, local_port, "Stopped forwarding");
                Ok(true)
            }
            None => {
                debug!(parent: &self.inner.span, %target, "No forward to remove");
                Ok(false)
            }
        }
    }

    /// Tear everything down: listeners, session, then the peer process
    ///
    /// Never fails; individual errors are logged.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            debug!(parent: &self.inner.span, "Already destroyed");
            return;
        }

        let entries: Vec<_> = self.inner.entries().drain().collect();
        let results = join_all(entries.into_iter().map(|(target, entry)| async move {
            let result = entry.close(&target).await;
            (target, result)
        }))
        .await;

        for (target, result) in results {
            if let Err(e) = result {
                warn!(parent: &self.inner.span, %target, "Failed to close listener: {}", e);
            }
        }

        if let Err(e) = self.inner.control.close().await {
            debug!(parent: &self.inner.span, "Session close: {}", e);
        }

        if let Some(peer) = self.inner.peer.lock().await.take() {
            if let Err(e) = peer.kill().await {
                debug!(parent: &self.inner.span, "Peer process kill: {}", e);
            }
        }

        info!(parent: &self.inner.span, "Port forwarder destroyed");
    }

    /// Local port currently bound for `target`
    pub fn local_port(&self, target: &ForwardTarget) -> Option<u16> {
        self.inner.entries().get(target).map(|entry| entry.local_port)
    }

    pub fn forwards(&self) -> Vec<ForwardInfo> {
        let mut forwards: Vec<_> = self
            .inner
            .entries()
            .iter()
            .map(|(target, entry)| ForwardInfo {
                target: target.clone(),
                local_port: entry.local_port,
                active_connections: entry.active.load(Ordering::SeqCst),
            })
            .collect();
        forwards.sort_by_key(|info| info.local_port);
        forwards
    }

    /// Resolves once the session has ended (peer exit, EOF or `destroy`)
    pub async fn closed(&self) {
        self.inner.control.closed().await
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// The underlying session handle
    pub fn session(&self) -> &Control {
        &self.inner.control
    }

    /// Bind the listener, retrying once on an ephemeral port after a conflict
    async fn bind(
        &self,
        target: &ForwardTarget,
        local_port: Option<u16>,
    ) -> Result<TcpListener, ForwardError> {
        let host = self.inner.config.bind_host;
        let mut port = local_port.or(target.remote_port()).unwrap_or(0);

        loop {
            match TcpListener::bind(SocketAddr::new(host, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    if local_port.is_some() || port == 0 {
                        return Err(ForwardError::AddressInUse { port });
                    }
                    debug!(
                        parent: &self.inner.span,
                        %target, port, "Local port in use, using an ephemeral port"
                    );
                    port = 0;
                }
                Err(source) => return Err(ForwardError::Bind { port, source }),
            }
        }
    }
}

/// Accept local connections and bridge each one to `target`
async fn accept_loop(
    listener: TcpListener,
    target: ForwardTarget,
    control: Control,
    active: Arc<AtomicUsize>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => {
                let (socket, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);

                let control = control.clone();
                let target = target.clone();
                let active = active.clone();
                let span = tracing::debug_span!("conn", %peer_addr);

                tokio::spawn(
                    async move {
                        active.fetch_add(1, Ordering::SeqCst);
                        debug!("Accepted connection");
                        match bridge::run(&control, &target, socket).await {
                            Ok((sent, received)) => {
                                debug!(sent, received, "Connection closed")
                            }
                            Err(e) => debug!("Connection failed: {}", e),
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                    .instrument(span),
                );
            }
        }
    }

    debug!("Listener closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use portfwd_mux::Session;
    use std::time::Duration;

    async fn forwarder() -> (PortForwarder, Session) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let peer = Session::server(b, portfwd_mux::Config::default().without_keep_alive());
        let forwarder = PortForwarder::builder().connect(a).await.unwrap();
        (forwarder, peer)
    }

    #[tokio::test]
    async fn test_add_port_twice_returns_same_listener() {
        let (forwarder, _peer) = forwarder().await;
        let target = ForwardTarget::unix("/tmp/app.sock");

        let first = forwarder.add_port(target.clone(), None).await.unwrap();
        let second = forwarder.add_port(target.clone(), None).await.unwrap();

        assert_ne!(first, 0);
        assert_eq!(first, second);
        assert_eq!(forwarder.forwards().len(), 1);
    }

    #[tokio::test]
    async fn test_pinned_port_conflict_is_surfaced() {
        let (forwarder, _peer) = forwarder().await;
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let err = forwarder
            .add_port(ForwardTarget::tcp(9), Some(taken))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::AddressInUse { port } if port == taken));
        assert!(forwarder.forwards().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_survives_failed_listener_close() {
        let (forwarder, _peer) = forwarder().await;
        let healthy = forwarder
            .add_port(ForwardTarget::unix("/tmp/ok.sock"), None)
            .await
            .unwrap();

        // An accept task that already died with a panic
        let broken = ForwardEntry {
            local_port: 1,
            shutdown_tx: None,
            task: tokio::spawn(async { panic!("listener task failed") }),
            active: Arc::new(AtomicUsize::new(0)),
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        forwarder
            .inner
            .entries()
            .insert(ForwardTarget::unix("/tmp/broken.sock"), broken);

        forwarder.destroy().await;

        assert!(forwarder.forwards().is_empty());
        assert!(forwarder.session().is_closed());
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", healthy))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_add_port_after_destroy() {
        let (forwarder, _peer) = forwarder().await;
        forwarder.destroy().await;

        let err = forwarder
            .add_port(ForwardTarget::tcp(8080), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Destroyed));
    }

    #[tokio::test]
    async fn test_remove_port_reports_missing() {
        let (forwarder, _peer) = forwarder().await;
        let removed = forwarder
            .remove_port(&ForwardTarget::tcp(4242))
            .await
            .unwrap();
        assert!(!removed);
    }
}
