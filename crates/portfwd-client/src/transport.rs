//! Transport adapter: turns a peer process or a raw pipe pair into one duplex channel

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Command line of the peer process to spawn
#[derive(Debug, Clone)]
pub struct PeerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl PeerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A separate reader and writer presented as a single duplex channel
#[derive(Debug)]
pub struct StdioPipe<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> StdioPipe<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for StdioPipe<R, W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for StdioPipe<R, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

/// A spawned peer process, reaped by a supervising task
///
/// The task logs the exit status if the process ends on its own; [`kill`]
/// terminates it and waits for it.
///
/// [`kill`]: PeerProcess::kill
#[derive(Debug)]
pub struct PeerProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<Option<ExitStatus>>>,
}

impl PeerProcess {
    fn supervise(mut child: Child) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let task: JoinHandle<io::Result<Option<ExitStatus>>> = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    if status.success() {
                        info!(pid, "Peer process exited");
                    } else {
                        warn!(pid, %status, "Peer process exited with failure");
                    }
                    Ok::<_, io::Error>(Some(status))
                }
                _ = kill_rx => {
                    debug!(pid, "Killing peer process");
                    child.kill().await?;
                    Ok(None)
                }
            }
        });

        Self {
            pid,
            kill_tx: Some(kill_tx),
            task,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the process (if it is still running) and reap it
    pub async fn kill(mut self) -> Result<(), TransportError> {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }

        match (&mut self.task).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(e) => Err(TransportError::Io(io::Error::new(io::ErrorKind::Other, e))),
        }
    }
}

/// Pipes and supervisor of a freshly spawned peer
#[derive(Debug)]
pub struct SpawnedPeer {
    pub pipe: StdioPipe<ChildStdout, ChildStdin>,
    pub stderr: Option<ChildStderr>,
    pub process: PeerProcess,
}

/// Spawn the peer with piped stdio
///
/// stdin/stdout become the session transport; stderr is handed back for
/// [`pump_stderr`].
pub fn spawn(command: &PeerCommand) -> Result<SpawnedPeer, TransportError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
        program: command.program.clone(),
        source,
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or(TransportError::MissingPipe("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(TransportError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take();

    info!(
        pid = child.id(),
        program = %command.program,
        "Spawned peer process"
    );

    Ok(SpawnedPeer {
        pipe: StdioPipe::new(stdout, stdin),
        stderr,
        process: PeerProcess::supervise(child),
    })
}

/// Forward every line of the peer's stderr into tracing
///
/// stderr is diagnostic only; nothing read here affects the session.
pub async fn pump_stderr<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "portfwd::peer", "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "portfwd::peer", "Stopped reading peer stderr: {}", e);
                break;
            }
        }
    }
}
