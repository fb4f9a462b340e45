//! Newline-delimited text channel.
//!
//! Each message is one UTF-8 line. Requests are answered in order: the next
//! line from the process completes the oldest pending request. Lines that
//! arrive while nothing is pending are delivered through
//! [`LineChannel::take_incoming`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tether_types::{ChannelId, ProcessId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};

use crate::channel::{Channel, ChannelFactory, ChannelGate, ClosedFut};
use crate::error::ChannelError;
use crate::lock;
use crate::process::ProcessStdio;

type Reply = oneshot::Sender<Result<String, ChannelError>>;

/// Creates a [`LineChannel`] per launch.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineChannelFactory;

impl ChannelFactory for LineChannelFactory {
    type Channel = LineChannel;

    fn create(&self, id: ChannelId, pid: ProcessId, stdio: ProcessStdio) -> Arc<LineChannel> {
        if let Some(stderr) = stdio.stderr {
            tokio::spawn(forward_stderr(pid, stderr));
        }
        LineChannel::spawn(id, pid, stdio.stdin, stdio.stdout)
    }
}

/// A line-oriented channel over one process's stdin and stdout.
#[derive(Debug)]
pub struct LineChannel {
    inner: Arc<Inner>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

#[derive(Debug)]
struct Inner {
    pid: ProcessId,
    gate: ChannelGate,
    state: Mutex<LineState>,
    incoming_tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug)]
struct LineState {
    writer: Option<mpsc::UnboundedSender<String>>,
    pending: VecDeque<Reply>,
}

impl LineChannel {
    /// Start the reader and writer tasks. Must be called within a tokio runtime.
    pub fn spawn(
        id: ChannelId,
        pid: ProcessId,
        stdin: ChildStdin,
        stdout: ChildStdout,
    ) -> Arc<Self> {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            pid,
            gate: ChannelGate::new(id),
            state: Mutex::new(LineState {
                writer: Some(writer_tx),
                pending: VecDeque::new(),
            }),
            incoming_tx,
        });

        tokio::spawn(write_loop(Arc::clone(&inner), stdin, writer_rx));
        tokio::spawn(read_loop(Arc::clone(&inner), stdout));

        Arc::new(Self {
            inner,
            incoming: Mutex::new(Some(incoming_rx)),
        })
    }

    /// Send one line without waiting for a reply.
    pub fn send(&self, line: &str) -> Result<(), ChannelError> {
        self.inner.enqueue(line, None)
    }

    /// Send one line and wait for the next line the process writes back.
    ///
    /// Fails with [`ChannelError::Invalidated`] if the channel is invalidated
    /// (or the process closes stdout) before the reply arrives.
    pub async fn request(&self, line: &str) -> Result<String, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.inner.enqueue(line, Some(tx))?;
        rx.await
            .unwrap_or(Err(ChannelError::Invalidated(self.inner.gate.id())))
    }

    /// Receiver for lines that arrived while no request was pending.
    /// Returns `None` after the first call.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        lock(&self.incoming).take()
    }

    /// Number of requests waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }
}

impl Channel for LineChannel {
    fn id(&self) -> ChannelId {
        self.inner.gate.id()
    }

    fn pid(&self) -> ProcessId {
        self.inner.pid
    }

    fn invalidate(&self) {
        self.inner.invalidate();
    }

    fn is_invalidated(&self) -> bool {
        self.inner.gate.is_closed()
    }

    fn closed(&self) -> ClosedFut<'_> {
        Box::pin(self.inner.gate.closed())
    }
}

impl Drop for LineChannel {
    fn drop(&mut self) {
        self.inner.invalidate();
    }
}

impl Inner {
    fn enqueue(&self, line: &str, reply: Option<Reply>) -> Result<(), ChannelError> {
        if line.contains(['\n', '\r']) {
            return Err(ChannelError::InvalidMessage {
                reason: "message contains a line break",
            });
        }

        // Checked under the same lock `invalidate` takes: nothing accepted
        // here can be written after invalidation has returned.
        let mut state = lock(&self.state);
        self.gate.check()?;
        let writer = state
            .writer
            .as_ref()
            .ok_or(ChannelError::Invalidated(self.gate.id()))?;
        writer
            .send(line.to_string())
            .map_err(|_| ChannelError::Invalidated(self.gate.id()))?;
        if let Some(reply) = reply {
            state.pending.push_back(reply);
        }
        Ok(())
    }

    fn invalidate(&self) {
        let pending = {
            let mut state = lock(&self.state);
            if !self.gate.close() {
                return;
            }
            state.writer = None;
            std::mem::take(&mut state.pending)
        };

        tracing::debug!(
            channel = %self.gate.id(),
            pid = %self.pid,
            pending = pending.len(),
            "channel invalidated"
        );
        for reply in pending {
            let _ = reply.send(Err(ChannelError::Invalidated(self.gate.id())));
        }
    }

    fn deliver(&self, line: String) {
        let reply = lock(&self.state).pending.pop_front();
        match reply {
            Some(reply) => {
                let _ = reply.send(Ok(line));
            }
            None => {
                let _ = self.incoming_tx.send(line);
            }
        }
    }
}

async fn write_loop(
    inner: Arc<Inner>,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    loop {
        let line = tokio::select! {
            biased;
            () = inner.gate.closed() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let mut buf = line.into_bytes();
        buf.push(b'\n');
        let written = async {
            stdin.write_all(&buf).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(channel = %inner.gate.id(), pid = %inner.pid, "write error: {e}");
            inner.invalidate();
            break;
        }
    }
}

async fn read_loop(inner: Arc<Inner>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            biased;
            () = inner.gate.closed() => return,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => inner.deliver(line),
            Ok(None) => {
                tracing::debug!(channel = %inner.gate.id(), pid = %inner.pid, "process closed stdout");
                break;
            }
            Err(e) => {
                tracing::warn!(channel = %inner.gate.id(), pid = %inner.pid, "read error: {e}");
                break;
            }
        }
    }
    inner.invalidate();
}

async fn forward_stderr(pid: ProcessId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(pid = %pid, "stderr: {line}");
    }
}
