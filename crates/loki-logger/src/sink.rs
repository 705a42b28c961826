// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The write side of a logging session.
//!
//! [`LokiSink`] is what the host's logging facility writes into. Every write
//! appends one raw line to a buffer guarded by a single mutex. When the buffer
//! reaches the configured batch size it is snapshotted, cleared and handed to
//! the delivery queue without waiting; network I/O never happens on the
//! caller's thread.
//!
//! Nothing in the write path emits `tracing` events: the sink is commonly
//! installed as the writer of the host's own subscriber, and re-entering it
//! from inside a write would deadlock on the buffer lock.

use crate::error::Error;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

/// Raw lines of one batch on their way to the delivery worker.
pub(crate) type BatchSender = mpsc::Sender<Vec<String>>;

/// Secondary local output every accepted line is copied to.
pub type EchoWriter = Box<dyn Write + Send>;

#[derive(Debug)]
struct State {
    lines: Vec<String>,
    sender: Option<BatchSender>,
    closed: bool,
}

/// Buffer and queue handle shared by the sink, the scheduler and the session.
///
/// Append-and-check and snapshot-and-clear both happen under `state`'s lock.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<State>,
    batch_size: usize,
    cancel: CancellationToken,
    /// Signalled on every accepted write so a debouncing timer can restart.
    pub(crate) rearm: Notify,
    /// Lifetime total of size-triggered batches discarded on a full queue.
    dropped_batches: AtomicU64,
    /// Drops not yet reported by the scheduler.
    unreported_drops: AtomicU64,
}

impl Shared {
    pub(crate) fn new(batch_size: usize, sender: BatchSender, cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(State {
                lines: Vec::with_capacity(batch_size),
                sender: Some(sender),
                closed: false,
            }),
            batch_size,
            cancel,
            rearm: Notify::new(),
            dropped_batches: AtomicU64::new(0),
            unreported_drops: AtomicU64::new(0),
        }
    }

    /// Appends a line and dispatches the buffer if it reached the batch size.
    pub(crate) fn append(&self, line: String) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed || self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        state.lines.push(line);
        if state.lines.len() >= self.batch_size {
            let batch = std::mem::replace(&mut state.lines, Vec::with_capacity(self.batch_size));
            if let Some(sender) = state.sender.as_ref() {
                match sender.try_send(batch) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                        self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                        self.unreported_drops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        drop(state);

        self.rearm.notify_one();
        Ok(())
    }

    /// Snapshots and clears a non-empty buffer for a timer-driven flush.
    pub(crate) fn take_pending(&self) -> Option<(Vec<String>, BatchSender)> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.lines.is_empty() {
            return None;
        }
        let sender = state.sender.clone()?;
        Some((std::mem::take(&mut state.lines), sender))
    }

    /// Rejects further writes and hands back whatever is still buffered,
    /// together with the last queue handle.
    pub(crate) fn close(&self) -> (Vec<String>, Option<BatchSender>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        (std::mem::take(&mut state.lines), state.sender.take())
    }

    pub(crate) fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .len()
    }

    pub(crate) fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    /// Drops since the previous call. Does not affect [`Shared::dropped_batches`].
    pub(crate) fn take_unreported_drops(&self) -> u64 {
        self.unreported_drops.swap(0, Ordering::Relaxed)
    }
}

/// Output target handed to the host's logging facility.
///
/// Cheap to clone; all clones feed the same session. Implements
/// [`std::io::Write`] and [`MakeWriter`], so it can be passed directly to
/// `tracing_subscriber::fmt().with_writer(..)`.
#[derive(Clone)]
pub struct LokiSink {
    shared: Arc<Shared>,
    echo: Option<Arc<Mutex<EchoWriter>>>,
}

impl LokiSink {
    pub(crate) fn new(shared: Arc<Shared>, echo: Option<EchoWriter>) -> Self {
        Self {
            shared,
            echo: echo.map(|writer| Arc::new(Mutex::new(writer))),
        }
    }

    /// Buffers one log record. Fails only once the session has been cancelled.
    pub fn write_line(&self, buf: &[u8]) -> Result<usize, Error> {
        let line = String::from_utf8_lossy(buf);
        self.shared.append(line.clone().into_owned())?;

        if let Some(echo) = &self.echo {
            let mut writer = echo.lock().unwrap_or_else(PoisonError::into_inner);
            // Local visibility is best effort; a broken console must not fail the write.
            let _ = writeln!(writer, "{}", line.trim());
        }

        Ok(buf.len())
    }

    /// Number of lines buffered and not yet handed to delivery.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    /// Size-triggered batches discarded because the delivery queue was full.
    #[must_use]
    pub fn dropped_batches(&self) -> u64 {
        self.shared.dropped_batches()
    }
}

impl std::fmt::Debug for LokiSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LokiSink")
            .field("pending", &self.pending())
            .field("echo", &self.echo.is_some())
            .finish()
    }
}

impl Write for LokiSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self).flush()
    }

    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        (&*self).write_fmt(args)
    }
}

impl Write for &LokiSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_line(buf).map_err(io::Error::from)
    }

    /// Formats the whole record first so one `writeln!` buffers one line.
    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        let line = fmt::format(args);
        self.write_line(line.as_bytes())
            .map(|_| ())
            .map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(echo) = &self.echo {
            echo.lock().unwrap_or_else(PoisonError::into_inner).flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LokiSink {
    type Writer = &'a LokiSink;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}
