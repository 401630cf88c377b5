//! Dedicated writer task for the transport's write half.
//!
//! Frames are handed to a single task over an mpsc channel instead of
//! sharing the writer behind a mutex. The task batches whatever is ready,
//! writes and flushes once per batch, then reports completion to every
//! sender in the batch.
//!
//! # Architecture
//!
//! ```text
//! Pipeline   ─┐
//! Probe      ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► serial port
//! Reset      ─┘                                      │
//!               ◄──────── oneshot: written ──────────┘
//! ```

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, UnpiError};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Maximum frames to batch in a single flush.
const MAX_BATCH_SIZE: usize = 16;

/// An encoded frame waiting to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    pub bytes: Bytes,
    /// Notified after the batch holding this frame is flushed.
    done: Option<oneshot::Sender<Result<()>>>,
}

impl OutboundFrame {
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes, done: None }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Write `bytes` and wait until they are flushed to the transport.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        let (done, rx) = oneshot::channel();
        let frame = OutboundFrame {
            bytes,
            done: Some(done),
        };
        self.tx
            .send(frame)
            .await
            .map_err(|_| UnpiError::ConnectionClosed)?;
        rx.await.map_err(|_| UnpiError::ConnectionClosed)?
    }

    /// Queue a frame without waiting for it to be written.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                UnpiError::Protocol("writer channel full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => UnpiError::ConnectionClosed,
        })
    }

    /// Whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when every handle is dropped or a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// Main writer loop - receives frames and writes them to the transport.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                // all handles dropped
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        match write_batch(&mut writer, &batch).await {
            Ok(()) => {
                for frame in batch {
                    if let Some(done) = frame.done {
                        let _ = done.send(Ok(()));
                    }
                }
            }
            Err(e) => {
                tracing::error!("transport write failed: {}", e);
                for frame in batch {
                    if let Some(done) = frame.done {
                        let _ = done.send(Err(UnpiError::Io(std::io::Error::new(
                            e.kind(),
                            e.to_string(),
                        ))));
                    }
                }
                return Err(UnpiError::Io(e));
            }
        }
    }
}

async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for frame in batch {
        writer.write_all(&frame.bytes).await?;
    }
    writer.flush().await
}
