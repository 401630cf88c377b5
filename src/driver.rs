//! Driver builder and runtime loop.
//!
//! The [`DriverBuilder`] configures the driver. [`Driver`] manages the
//! lifecycle:
//! 1. Split the transport into read and write halves
//! 2. Spawn the writer task and the transmit queue
//! 3. Spawn the read loop feeding the dispatcher
//! 4. Drain stale replies with keepalive echoes
//!
//! # Example
//!
//! ```ignore
//! use unpi_client::{Args, Driver};
//!
//! #[tokio::main]
//! async fn main() -> unpi_client::Result<()> {
//!     let port = open_serial_port("/dev/ttyACM0")?;
//!     let driver = Driver::builder().start(port).await?;
//!
//!     let version = driver.sys_request("version", Args::empty()).await?;
//!     println!("{:?}", version);
//!
//!     let mut events = driver.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         if event.matches("ZDO", "stateChangeInd") {
//!             println!("{}", event.topic());
//!         }
//!     }
//!     driver.close().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{Args, Fields};
use crate::command::Command;
use crate::communicator::{CommunicatorConfig, Communicator};
use crate::error::{Result, UnpiError};
use crate::event::Event;
use crate::meta::{Ident, Registry};
use crate::pipeline::{echoed_value, Pipeline, PipelineConfig};
use crate::protocol::FrameBuffer;
use crate::queue::{QueueConfig, TxQueue};
use crate::writer::{spawn_writer_task, WriterConfig};

/// Default broadcast capacity for events.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default number of startup keepalive echoes.
pub const DEFAULT_DRAIN_ATTEMPTS: usize = 4;

/// Default pause between startup echoes.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Default transport read size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Builder for configuring and starting a [`Driver`].
pub struct DriverBuilder {
    registry: Option<Arc<Registry>>,
    communicator: CommunicatorConfig,
    pipeline: PipelineConfig,
    queue: QueueConfig,
    writer: WriterConfig,
    event_capacity: usize,
    drain_on_start: bool,
    drain_attempts: usize,
    drain_interval: Duration,
    read_buffer_size: usize,
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            communicator: CommunicatorConfig::default(),
            pipeline: PipelineConfig::default(),
            queue: QueueConfig::default(),
            writer: WriterConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            drain_on_start: true,
            drain_attempts: DEFAULT_DRAIN_ATTEMPTS,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Use these command definitions instead of the bundled ones.
    pub fn registry(mut self, registry: impl Into<Arc<Registry>>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    /// Subsystem that carries the keepalive echo.
    ///
    /// Default: `RCN`
    pub fn main_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.communicator.keepalive.subsystem = subsystem.into();
        self
    }

    pub fn communicator_config(mut self, config: CommunicatorConfig) -> Self {
        self.communicator = config;
        self
    }

    pub fn pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline = config;
        self
    }

    /// Set the maximum number of waiting requests.
    ///
    /// Default: 100
    pub fn max_queue_length(mut self, length: usize) -> Self {
        self.queue.max_queue_length = length;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 64
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer.channel_capacity = capacity;
        self
    }

    /// Set the event broadcast capacity.
    ///
    /// Slow subscribers lag past this many events.
    /// Default: 256
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Whether `start` probes the device before returning.
    ///
    /// Default: true
    pub fn drain_on_start(mut self, enabled: bool) -> Self {
        self.drain_on_start = enabled;
        self
    }

    /// Default: 4
    pub fn drain_attempts(mut self, attempts: usize) -> Self {
        self.drain_attempts = attempts;
        self
    }

    /// Default: 50 ms
    pub fn drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Default: 1024
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Build and start the driver on `io`.
    ///
    /// An unresponsive device does not fail the start; check
    /// [`Driver::is_ready`].
    pub async fn start<T>(self, io: T) -> Result<Driver>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(Registry::builtin()?),
        };
        let keepalive = &self.communicator.keepalive;
        let subsystem = registry.lookup_subsystem(keepalive.subsystem.as_str())?;
        registry.lookup_command(subsystem.id, keepalive.command.as_str())?;

        // 1. Split the transport
        let (reader, write_half) = tokio::io::split(io);

        // 2. Spawn writer task and transmit queue
        let (writer, writer_task) = spawn_writer_task(write_half, self.writer);
        let (queue, queue_task) = TxQueue::spawn(self.queue);

        let (events, _) = broadcast::channel(self.event_capacity.max(1));
        let comm = Arc::new(Communicator::new(
            registry.clone(),
            writer,
            events,
            self.communicator,
        ));
        let pipeline = Pipeline::new(comm.clone(), queue.clone(), self.pipeline);

        // 3. Spawn read loop
        let shutdown = CancellationToken::new();
        let reader_task = tokio::spawn({
            let comm = comm.clone();
            let shutdown = shutdown.clone();
            let size = self.read_buffer_size.max(1);
            async move {
                if let Err(e) = read_loop(reader, &comm, &shutdown, size).await {
                    tracing::error!("Read loop error: {}", e);
                    comm.fail_all(|| UnpiError::ConnectionClosed);
                }
            }
        });

        let driver = Driver {
            registry,
            comm,
            pipeline,
            queue,
            shutdown,
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            drain_attempts: self.drain_attempts,
            drain_interval: self.drain_interval,
            tasks: Mutex::new(Tasks {
                reader: Some(reader_task),
                writer: Some(writer_task),
                queue: Some(queue_task),
            }),
        };

        // 4. Drain stale replies
        if self.drain_on_start {
            if let Err(e) = driver.drain().await {
                tracing::warn!("device did not answer at startup: {}", e);
            }
        } else {
            driver.ready.store(true, Ordering::Release);
        }
        Ok(driver)
    }
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read frames from the transport and hand them to the dispatcher.
async fn read_loop<R>(
    mut reader: R,
    comm: &Communicator,
    shutdown: &CancellationToken,
    size: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_capacity(size);
    let mut buf = vec![0u8; size];

    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            tracing::info!("transport closed");
            comm.fail_all(|| UnpiError::ConnectionClosed);
            return Ok(());
        }

        for frame in frame_buffer.feed(&buf[..n]) {
            comm.receive(&frame);
        }
    }
}

struct Tasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<Result<()>>>,
    queue: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort(&mut self) {
        if let Some(task) = self.reader.take() {
            task.abort();
        }
        if let Some(task) = self.writer.take() {
            task.abort();
        }
        if let Some(task) = self.queue.take() {
            task.abort();
        }
    }
}

/// Snapshot of outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriverInfo {
    /// Requests waiting for a reply.
    pub pending: usize,
    /// Requests waiting for the queue.
    pub queued: usize,
}

/// A running driver.
pub struct Driver {
    registry: Arc<Registry>,
    comm: Arc<Communicator>,
    pipeline: Pipeline,
    queue: TxQueue,
    shutdown: CancellationToken,
    ready: AtomicBool,
    closed: AtomicBool,
    drain_attempts: usize,
    drain_interval: Duration,
    tasks: Mutex<Tasks>,
}

impl Driver {
    pub fn builder() -> DriverBuilder {
        DriverBuilder::new()
    }

    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether the device answered the last drain.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send keepalive echoes until one comes back with its own nonce.
    ///
    /// Replies echoing an earlier nonce of this drain are stale and
    /// trigger another attempt. Fails with `NotReady` when every attempt
    /// is used up.
    pub async fn drain(&self) -> Result<()> {
        let mut sent = Vec::with_capacity(self.drain_attempts);
        for attempt in 1..=self.drain_attempts {
            let nonce: u32 = rand::random();
            sent.push(nonce);
            let echo = self.pipeline.keepalive(nonce)?;

            match self.pipeline.execute(echo, false).await {
                Ok(fields) => match echoed_value(&fields) {
                    Ok(value) if value == nonce => {
                        tracing::debug!("device ready after {} echo(s)", attempt);
                        self.ready.store(true, Ordering::Release);
                        return Ok(());
                    }
                    Ok(value) if sent.contains(&value) => {
                        tracing::debug!("discarding stale echo {:#010x}", value);
                    }
                    Ok(value) => {
                        tracing::warn!("unexpected echo {:#010x} while draining", value);
                    }
                    Err(e) => tracing::warn!("bad echo while draining: {}", e),
                },
                Err(UnpiError::ConnectionClosed) => return Err(UnpiError::ConnectionClosed),
                Err(e) => tracing::debug!("drain attempt {} failed: {}", attempt, e),
            }
            tokio::time::sleep(self.drain_interval).await;
        }
        self.ready.store(false, Ordering::Release);
        Err(UnpiError::NotReady)
    }

    /// Send a request and wait for its outcome.
    ///
    /// SREQ resolves with the decoded reply. AREQ resolves with no fields
    /// once written (reset commands once the device reports the reset).
    pub async fn request<'a, 'b>(
        &self,
        subsystem: impl Into<Ident<'a>>,
        command: impl Into<Ident<'b>>,
        args: impl Into<Args>,
    ) -> Result<Fields> {
        let cmd = Command::with_args(&self.registry, subsystem, command, args)?;
        self.execute(cmd).await
    }

    /// Send a prepared command.
    pub async fn execute(&self, cmd: Command) -> Result<Fields> {
        if self.is_closed() {
            return Err(UnpiError::ConnectionClosed);
        }
        self.pipeline.execute(Arc::new(cmd), true).await
    }

    pub async fn sys_request(&self, command: &str, args: impl Into<Args>) -> Result<Fields> {
        self.request("SYS", command, args).await
    }

    pub async fn af_request(&self, command: &str, args: impl Into<Args>) -> Result<Fields> {
        self.request("AF", command, args).await
    }

    pub async fn zdo_request(&self, command: &str, args: impl Into<Args>) -> Result<Fields> {
        self.request("ZDO", command, args).await
    }

    pub async fn util_request(&self, command: &str, args: impl Into<Args>) -> Result<Fields> {
        self.request("UTIL", command, args).await
    }

    pub async fn rcn_request(&self, command: &str, args: impl Into<Args>) -> Result<Fields> {
        self.request("RCN", command, args).await
    }

    /// One keepalive probe outside the queue.
    pub async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(UnpiError::ConnectionClosed);
        }
        self.pipeline.ping().await
    }

    /// Subscribe to notifications and replies.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.comm.subscribe()
    }

    pub async fn info(&self) -> DriverInfo {
        DriverInfo {
            pending: self.comm.info().pending,
            queued: self.queue.info().await.queued,
        }
    }

    /// Abort all outstanding work and stop the background tasks.
    ///
    /// Every waiting caller is resolved. Calling this again does nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("closing driver");
        self.ready.store(false, Ordering::Release);
        self.shutdown.cancel();
        self.pipeline.abort();
        self.queue.clear().await;
        self.comm.fail_all(|| UnpiError::ConnectionClosed);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort();
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.pipeline.abort();
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort();
    }
}
