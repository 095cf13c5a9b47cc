//! Session management: frame dispatch, stream lifecycle and keep-alive

use futures::{SinkExt, StreamExt};
use portfwd_proto::{
    CodecError, Flags, Frame, FrameCodec, FrameType, GoAwayCode, Header, StreamId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::error::MuxError;
use crate::stream::{Stream, StreamState};

/// Which side of the session we are; decides stream ID parity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Opens odd stream IDs starting at 1
    Client,
    /// Opens even stream IDs starting at 2
    Server,
}

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Commands consumed by the writer task
pub(crate) enum Outbound {
    Frame(Frame),
    Close {
        code: GoAwayCode,
        done: oneshot::Sender<Result<(), MuxError>>,
    },
}

/// State shared by the session tasks, the control handle and every stream
pub(crate) struct Shared {
    /// Session ID for logging
    pub(crate) id: String,
    pub(crate) config: Config,
    outbound: mpsc::UnboundedSender<Outbound>,
    streams: Mutex<HashMap<StreamId, Arc<Mutex<StreamState>>>>,
    pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    next_stream_id: AtomicU32,
    next_ping_id: AtomicU32,
    /// Peer announced it is going away; no new outbound streams
    remote_go_away: AtomicBool,
    /// We announced we are going away; inbound streams are refused
    local_go_away: AtomicBool,
    /// Flips to true once when the session terminates
    shutdown: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| MuxError::SessionClosed)
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        lock(&self.streams).remove(&id);
    }

    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn stream(&self, id: StreamId) -> Option<Arc<Mutex<StreamState>>> {
        lock(&self.streams).get(&id).cloned()
    }

    /// Mark the session dead and fail every stream and pending ping
    fn terminate(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        debug!("[{}] Session terminated", self.id);

        let streams: Vec<_> = lock(&self.streams).drain().map(|(_, s)| s).collect();
        for state in streams {
            lock(&state).session_closed();
        }
        lock(&self.pings).clear();
    }

    fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        incoming: &mpsc::Sender<Stream>,
    ) -> Result<(), MuxError> {
        trace!(
            "[{}] Received frame: type={:?}, stream={}, flags={:#x}, len={}",
            self.id,
            frame.frame_type(),
            frame.stream_id(),
            frame.flags().bits(),
            frame.header.length
        );

        match frame.frame_type() {
            FrameType::Data | FrameType::WindowUpdate => self.handle_stream_frame(frame, incoming),
            FrameType::Ping => {
                self.handle_ping(frame.header);
                Ok(())
            }
            FrameType::GoAway => {
                self.handle_go_away(frame.header.length);
                Ok(())
            }
        }
    }

    fn handle_stream_frame(
        self: &Arc<Self>,
        frame: Frame,
        incoming: &mpsc::Sender<Stream>,
    ) -> Result<(), MuxError> {
        let id = frame.stream_id();
        let flags = frame.flags();

        let new_stream = if flags.has_syn() {
            self.accept_stream(id)?
        } else {
            None
        };

        let Some(state) = self.stream(id) else {
            if frame.frame_type() == FrameType::Data && !frame.body.is_empty() {
                trace!(
                    "[{}] Discarding {} bytes for unknown stream {}",
                    self.id,
                    frame.body.len(),
                    id
                );
            }
            return Ok(());
        };

        let finished = {
            let mut state = lock(&state);
            match frame.frame_type() {
                FrameType::Data => {
                    if !state.push_data(&frame.body) {
                        return Err(MuxError::WindowExceeded(id));
                    }
                }
                _ => state.add_send_credit(frame.header.length),
            }
            if flags.has_fin() {
                state.remote_fin();
            }
            if flags.has_rst() {
                state.remote_reset();
            }
            state.is_finished()
        };

        if finished {
            self.remove_stream(id);
        }

        if let Some(stream) = new_stream {
            match incoming.try_send(stream) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "[{}] Accept backlog exceeded, resetting stream {}",
                        self.id, id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("[{}] No acceptor, resetting stream {}", self.id, id);
                }
            }
        }

        Ok(())
    }

    /// Register a stream opened by the peer and acknowledge it
    fn accept_stream(self: &Arc<Self>, id: StreamId) -> Result<Option<Stream>, MuxError> {
        if self.local_go_away.load(Ordering::SeqCst) {
            debug!("[{}] Refusing stream {} while going away", self.id, id);
            let _ = self.send_frame(Frame::window_update(id, Flags::new().with_rst(), 0));
            return Ok(None);
        }

        let window = self.config.stream_window();
        let state = Arc::new(Mutex::new(StreamState::new(window)));
        {
            let mut streams = lock(&self.streams);
            if streams.contains_key(&id) {
                return Err(MuxError::DuplicateStream(id));
            }
            streams.insert(id, state.clone());
        }

        debug!("[{}] Accepted stream {}", self.id, id);
        let delta = window - portfwd_proto::INITIAL_STREAM_WINDOW;
        self.send_frame(Frame::window_update(id, Flags::new().with_ack(), delta))?;

        Ok(Some(Stream::new(id, state, self.clone())))
    }

    fn handle_ping(&self, header: Header) {
        if header.flags.has_syn() {
            let _ = self.send_frame(Frame::ping(Flags::new().with_ack(), header.length));
        } else if header.flags.has_ack() {
            if let Some(waiter) = lock(&self.pings).remove(&header.length) {
                let _ = waiter.send(());
            }
        }
    }

    fn handle_go_away(&self, code: u32) {
        self.remote_go_away.store(true, Ordering::SeqCst);
        match GoAwayCode::from_u32(code) {
            Some(GoAwayCode::Normal) => debug!("[{}] Peer is going away", self.id),
            Some(GoAwayCode::ProtocolError) => {
                error!("[{}] Peer reported a protocol error", self.id)
            }
            Some(GoAwayCode::InternalError) => {
                error!("[{}] Peer reported an internal error", self.id)
            }
            None => warn!("[{}] Peer sent unknown go away code {}", self.id, code),
        }
    }
}

/// Cloneable handle used to open streams, ping and close the session
#[derive(Clone)]
pub struct Control {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("session", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes a ping waiter when the caller gives up
struct PendingPing<'a> {
    shared: &'a Shared,
    opaque: u32,
}

impl Drop for PendingPing<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pings).remove(&self.opaque);
    }
}

impl Control {
    /// Session ID used in log lines
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Open a new outbound stream
    pub async fn open_stream(&self) -> Result<Stream, MuxError> {
        if self.shared.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        if self.shared.remote_go_away.load(Ordering::SeqCst) {
            return Err(MuxError::RemoteGoAway);
        }

        let id = self.shared.next_stream_id.fetch_add(2, Ordering::SeqCst);
        if id > u32::MAX - 2 {
            return Err(MuxError::StreamIdsExhausted);
        }

        let window = self.shared.config.stream_window();
        let state = Arc::new(Mutex::new(StreamState::new(window)));
        lock(&self.shared.streams).insert(id, state.clone());

        let delta = window - portfwd_proto::INITIAL_STREAM_WINDOW;
        if let Err(e) = self
            .shared
            .send_frame(Frame::window_update(id, Flags::new().with_syn(), delta))
        {
            self.shared.remove_stream(id);
            return Err(e);
        }

        debug!("[{}] Opened stream {}", self.shared.id, id);
        Ok(Stream::new(id, state, self.shared.clone()))
    }

    /// Round-trip a ping and return the measured latency
    pub async fn ping(&self) -> Result<Duration, MuxError> {
        if self.shared.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let opaque = self.shared.next_ping_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pings).insert(opaque, tx);
        let _pending = PendingPing {
            shared: &self.shared,
            opaque,
        };

        let started = Instant::now();
        self.shared
            .send_frame(Frame::ping(Flags::new().with_syn(), opaque))?;

        rx.await.map_err(|_| MuxError::SessionClosed)?;
        Ok(started.elapsed())
    }

    /// Send a normal go away, flush it and shut the transport down
    pub async fn close(&self) -> Result<(), MuxError> {
        if self.shared.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        self.shared.local_go_away.store(true, Ordering::SeqCst);

        let (done, rx) = oneshot::channel();
        let result = match self.shared.outbound.send(Outbound::Close {
            code: GoAwayCode::Normal,
            done,
        }) {
            Ok(()) => rx.await.unwrap_or(Err(MuxError::SessionClosed)),
            Err(_) => Err(MuxError::SessionClosed),
        };

        self.shared.terminate();
        result
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the session has terminated for any reason
    pub async fn closed(&self) {
        let mut rx = self.shared.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Streams currently tracked by the session
    pub fn num_streams(&self) -> usize {
        lock(&self.shared.streams).len()
    }
}

/// Receiver side for streams opened by the peer
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::Receiver<Stream>,
}

impl Incoming {
    /// Next stream opened by the peer, or `None` once the session is gone
    pub async fn accept(&mut self) -> Option<Stream> {
        self.rx.recv().await
    }
}

/// A multiplexed session over one duplex transport
#[derive(Debug)]
pub struct Session {
    control: Control,
    incoming: Option<Incoming>,
}

impl Session {
    /// Start a session, spawning its reader and writer tasks
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<T>(io: T, config: Config, mode: Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = format!("mux-{}", uuid::Uuid::new_v4());
        let (read_half, write_half) = tokio::io::split(io);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (shutdown, _) = watch::channel(false);

        let next_stream_id = match mode {
            Mode::Client => 1,
            Mode::Server => 2,
        };

        let shared = Arc::new(Shared {
            id,
            config,
            outbound: outbound_tx,
            streams: Mutex::new(HashMap::new()),
            pings: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(next_stream_id),
            next_ping_id: AtomicU32::new(0),
            remote_go_away: AtomicBool::new(false),
            local_go_away: AtomicBool::new(false),
            shutdown,
        });

        debug!("[{}] Starting {:?} session", shared.id, mode);

        let frames = FramedRead::new(read_half, FrameCodec::new());
        let sink = FramedWrite::new(write_half, FrameCodec::new());

        tokio::spawn(writer_task(shared.clone(), sink, outbound_rx));
        tokio::spawn(reader_task(shared.clone(), frames, incoming_tx));

        let control = Control { shared };
        if control.shared.config.enable_keep_alive {
            tokio::spawn(keep_alive_task(control.clone()));
        }

        Self {
            control,
            incoming: Some(Incoming { rx: incoming_rx }),
        }
    }

    pub fn client<T>(io: T, config: Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, config, Mode::Client)
    }

    pub fn server<T>(io: T, config: Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, config, Mode::Server)
    }

    pub fn control(&self) -> Control {
        self.control.clone()
    }

    /// Take the receiver for peer-opened streams; only the first call succeeds
    ///
    /// Until taken, inbound streams queue up to the accept backlog.
    pub fn take_incoming(&mut self) -> Option<Incoming> {
        self.incoming.take()
    }
}

/// Writer task - serializes frames onto the transport
async fn writer_task<T>(
    shared: Arc<Shared>,
    mut sink: FramedWrite<WriteHalf<T>, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) where
    T: AsyncRead + AsyncWrite,
{
    let write_timeout = shared.config.connection_write_timeout;
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        let command = tokio::select! {
            biased;
            command = rx.recv() => command,
            _ = shutdown.changed() => None,
        };

        match command {
            Some(Outbound::Frame(frame)) => {
                match tokio::time::timeout(write_timeout, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("[{}] Transport write error: {}", shared.id, e);
                        break;
                    }
                    Err(_) => {
                        error!(
                            "[{}] Transport write timed out after {:?}",
                            shared.id, write_timeout
                        );
                        break;
                    }
                }
            }
            Some(Outbound::Close { code, done }) => {
                let result = tokio::time::timeout(write_timeout, async {
                    sink.send(Frame::go_away(code)).await?;
                    sink.close().await?;
                    Ok::<_, CodecError>(())
                })
                .await;

                let result = match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(MuxError::from(e)),
                    Err(_) => Err(MuxError::Timeout),
                };
                let _ = done.send(result);
                break;
            }
            None => break,
        }
    }

    debug!("[{}] Writer task ended", shared.id);
    shared.terminate();
    let _ = sink.close().await;
}

/// Reader task - decodes frames and dispatches them to streams
async fn reader_task<T>(
    shared: Arc<Shared>,
    mut frames: FramedRead<ReadHalf<T>, FrameCodec>,
    incoming: mpsc::Sender<Stream>,
) where
    T: AsyncRead + AsyncWrite,
{
    let mut shutdown = shared.shutdown.subscribe();

    let failure = loop {
        tokio::select! {
            _ = shutdown.changed() => break None,
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    if let Err(e) = shared.handle_frame(frame, &incoming) {
                        break Some(e);
                    }
                }
                Some(Err(e)) => break Some(MuxError::from(e)),
                None => break Some(MuxError::ConnectionClosed),
            },
        }
    };

    let failed = failure.is_some();
    match failure {
        Some(MuxError::ConnectionClosed) => {
            debug!("[{}] Transport reached end of file", shared.id)
        }
        Some(e) if e.is_protocol_violation() => {
            error!("[{}] Protocol error, going away: {}", shared.id, e);
            let (done, _) = oneshot::channel();
            let _ = shared.outbound.send(Outbound::Close {
                code: GoAwayCode::ProtocolError,
                done,
            });
            // Give the writer a chance to flush the go away
            tokio::task::yield_now().await;
        }
        Some(e) => error!("[{}] Transport read error: {}", shared.id, e),
        None => {}
    }

    debug!("[{}] Reader task ended", shared.id);
    if failed {
        shared.terminate();
    }
}

/// Keep-alive task - pings the peer and terminates the session on failure
async fn keep_alive_task(control: Control) {
    let interval = control.shared.config.keep_alive_interval;
    let timeout = control.shared.config.connection_write_timeout;
    let mut shutdown = control.shared.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match tokio::time::timeout(timeout, control.ping()).await {
            Ok(Ok(rtt)) => trace!("[{}] Keep-alive ping {:?}", control.id(), rtt),
            Ok(Err(MuxError::SessionClosed)) => return,
            Ok(Err(e)) => {
                error!("[{}] Keep-alive failed: {}", control.id(), e);
                control.shared.terminate();
                return;
            }
            Err(_) => {
                error!("[{}] Keep-alive timed out after {:?}", control.id(), timeout);
                control.shared.terminate();
                return;
            }
        }
    }
}
