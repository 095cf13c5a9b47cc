//! Multiplexed stream handle

use bytes::{Bytes, BytesMut};
use portfwd_proto::{Flags, Frame, StreamId};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::session::{lock, Shared};

/// Largest data frame produced by a single write
const MAX_WRITE_CHUNK: usize = 64 * 1024;

/// Per-stream state shared between the handle and the session reader task
#[derive(Debug)]
pub(crate) struct StreamState {
    /// Data received but not yet read
    recv_buf: BytesMut,
    /// Bytes the peer may still send before waiting for credit
    recv_window: u32,
    /// Bytes read since the last window update was sent
    pending_credit: u32,
    /// Bytes we may still send before waiting for credit
    send_window: u32,
    local_fin: bool,
    remote_fin: bool,
    reset: bool,
    session_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamState {
    pub(crate) fn new(recv_window: u32) -> Self {
        Self {
            recv_buf: BytesMut::new(),
            recv_window,
            pending_credit: 0,
            send_window: portfwd_proto::INITIAL_STREAM_WINDOW,
            local_fin: false,
            remote_fin: false,
            reset: false,
            session_closed: false,
            read_waker: None,
            write_waker: None,
        }
    }

    /// Buffer inbound data; returns false if the peer overran its window
    pub(crate) fn push_data(&mut self, data: &[u8]) -> bool {
        let len = data.len() as u32;
        if len > self.recv_window {
            return false;
        }
        self.recv_window -= len;
        if !self.remote_fin && !self.reset {
            self.recv_buf.extend_from_slice(data);
        }
        self.wake_reader();
        true
    }

    pub(crate) fn add_send_credit(&mut self, delta: u32) {
        self.send_window = self.send_window.saturating_add(delta);
        self.wake_writer();
    }

    pub(crate) fn remote_fin(&mut self) {
        self.remote_fin = true;
        self.wake_reader();
    }

    pub(crate) fn remote_reset(&mut self) {
        self.reset = true;
        self.wake_reader();
        self.wake_writer();
    }

    pub(crate) fn session_closed(&mut self) {
        self.session_closed = true;
        self.wake_reader();
        self.wake_writer();
    }

    /// Nothing more can flow in either direction
    pub(crate) fn is_finished(&self) -> bool {
        self.reset || (self.local_fin && self.remote_fin)
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// A bidirectional stream within a [`Session`](crate::Session)
///
/// Shutting down the write side sends FIN (half-close); the read side keeps
/// delivering data until the peer sends FIN as well. Dropping the handle
/// before both directions have finished resets the stream, even when the
/// peer already half-closed.
pub struct Stream {
    id: StreamId,
    state: Arc<Mutex<StreamState>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("session", &self.shared.id)
            .field("id", &self.id)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(id: StreamId, state: Arc<Mutex<StreamState>>, shared: Arc<Shared>) -> Self {
        Self { id, state, shared }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Bytes that can be written before blocking on the peer's window
    pub fn send_window(&self) -> u32 {
        lock(&self.state).send_window
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut state = lock(&this.state);

        if !state.recv_buf.is_empty() {
            let n = buf.remaining().min(state.recv_buf.len());
            let chunk = state.recv_buf.split_to(n);
            buf.put_slice(&chunk);

            state.pending_credit += n as u32;
            let threshold = this.shared.config.stream_window() / 2;
            let update = if state.pending_credit >= threshold && !state.remote_fin && !state.reset
            {
                let delta = std::mem::take(&mut state.pending_credit);
                state.recv_window += delta;
                Some(delta)
            } else {
                None
            };
            drop(state);

            if let Some(delta) = update {
                trace!("[{}] Stream {} window update +{}", this.shared.id, this.id, delta);
                // A closed session surfaces on the next read
                let _ = this
                    .shared
                    .send_frame(Frame::window_update(this.id, Flags::new(), delta));
            }
            return Poll::Ready(Ok(()));
        }

        if state.remote_fin {
            return Poll::Ready(Ok(()));
        }
        if state.reset {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset by peer",
            )));
        }
        if state.session_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session closed",
            )));
        }

        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut state = lock(&this.state);

        if state.reset {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset",
            )));
        }
        if state.session_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            )));
        }
        if state.local_fin {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if state.send_window == 0 {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf
            .len()
            .min(state.send_window as usize)
            .min(MAX_WRITE_CHUNK);
        state.send_window -= n as u32;
        drop(state);

        this.shared
            .send_frame(Frame::data(
                this.id,
                Flags::new(),
                Bytes::copy_from_slice(&buf[..n]),
            ))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session closed"))?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut state = lock(&this.state);

        if state.local_fin || state.reset || state.session_closed {
            return Poll::Ready(Ok(()));
        }
        state.local_fin = true;
        let finished = state.is_finished();
        drop(state);

        trace!("[{}] Stream {} half-closed", this.shared.id, this.id);
        let sent = this
            .shared
            .send_frame(Frame::window_update(this.id, Flags::new().with_fin(), 0));

        if finished {
            this.shared.remove_stream(this.id);
        }

        Poll::Ready(
            sent.map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session closed")),
        )
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let mut state = lock(&self.state);

        let abandoned = !(state.reset || state.session_closed || state.is_finished());
        if abandoned {
            state.reset = true;
        }
        drop(state);

        if abandoned {
            trace!("[{}] Stream {} dropped unfinished, sending RST", self.shared.id, self.id);
            let _ = self.shared.send_frame(Frame::window_update(
                self.id,
                Flags::new().with_rst(),
                0,
            ));
        }

        self.shared.remove_stream(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_data_respects_window() {
        let mut state = StreamState::new(8);
        assert!(state.push_data(b"12345"));
        assert_eq!(state.recv_window, 3);
        assert!(!state.push_data(b"6789"));
    }

    #[test]
    fn test_finished_states() {
        let mut state = StreamState::new(8);
        assert!(!state.is_finished());

        state.local_fin = true;
        assert!(!state.is_finished());

        state.remote_fin();
        assert!(state.is_finished());

        let mut state = StreamState::new(8);
        state.remote_reset();
        assert!(state.is_finished());
    }

    #[test]
    fn test_send_credit_saturates() {
        let mut state = StreamState::new(8);
        state.add_send_credit(u32::MAX);
        assert_eq!(state.send_window, u32::MAX);
    }
}
