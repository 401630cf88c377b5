//! Serialized request execution with timeout recovery.
//!
//! Every command passes through the [`TxQueue`], so at most one exchange is
//! on the wire. A synchronous request that misses its soft deadline triggers
//! realignment: echo probes carrying random nonces are sent until one comes
//! back intact, then the original request is resent. The fatal deadline
//! bounds the whole exchange.
//!
//! ```text
//! execute ─► queue.begin ─► send ─► reply ───────────────────────► Ok
//!                             │
//!                        soft timeout
//!                             │
//!                             ├─► realign (echo nonce) ─► resend ─┐
//!                             └─► keep waiting for reply ◄────────┘
//!                                        │
//!                                   fatal timeout ─► FatalTimeout
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::{Fields, Value};
use crate::command::{Command, PendingKey};
use crate::communicator::Communicator;
use crate::error::{Result, UnpiError};
use crate::protocol::CmdType;
use crate::queue::TxQueue;

/// Default wait for a reply before realigning.
pub const DEFAULT_SOFT_TIMEOUT: Duration = Duration::from_millis(2200);

/// Default bound on a whole synchronous exchange.
pub const DEFAULT_FATAL_TIMEOUT: Duration = Duration::from_millis(8800);

/// Default number of echo probes per realignment.
pub const DEFAULT_REALIGN_ATTEMPTS: usize = 10;

/// Default wait for one echo probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(701);

/// Default wait when a ping joins an echo already in flight.
pub const DEFAULT_PIGGYBACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeouts and retry limits for request execution.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub soft_timeout: Duration,
    pub fatal_timeout: Duration,
    pub realign_attempts: usize,
    pub probe_timeout: Duration,
    pub piggyback_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            soft_timeout: DEFAULT_SOFT_TIMEOUT,
            fatal_timeout: DEFAULT_FATAL_TIMEOUT,
            realign_attempts: DEFAULT_REALIGN_ATTEMPTS,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            piggyback_timeout: DEFAULT_PIGGYBACK_TIMEOUT,
        }
    }
}

pub struct Pipeline {
    comm: Arc<Communicator>,
    queue: TxQueue,
    config: PipelineConfig,
    abort: Mutex<CancellationToken>,
}

impl Pipeline {
    pub fn new(comm: Arc<Communicator>, queue: TxQueue, config: PipelineConfig) -> Self {
        Self {
            comm,
            queue,
            config,
            abort: Mutex::new(CancellationToken::new()),
        }
    }

    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn abort_token(&self) -> CancellationToken {
        self.abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel every execution in progress or waiting for the queue.
    ///
    /// Later executions are unaffected.
    pub fn abort(&self) {
        let old = {
            let mut token = self.abort.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        old.cancel();
    }

    /// Run one command to completion.
    ///
    /// Reset commands first abort everything queued behind the current
    /// holder. The queue slot is released on every exit path.
    pub async fn execute(&self, cmd: Arc<Command>, logging: bool) -> Result<Fields> {
        let token = self.abort_token();

        if self.comm.is_reset(&cmd) {
            tracing::debug!("{} clears the transmit queue", cmd);
            self.queue.clear().await;
        }

        let slot = tokio::select! {
            _ = token.cancelled() => return Err(UnpiError::Cancelled),
            slot = self.queue.begin(cmd.ticket(), cmd.to_string()) => slot?,
        };

        let result = tokio::select! {
            _ = token.cancelled() => Err(UnpiError::Cancelled),
            result = self.run(&cmd, logging) => result,
        };
        slot.complete();
        result
    }

    async fn run(&self, cmd: &Arc<Command>, logging: bool) -> Result<Fields> {
        match cmd.cmd_type() {
            CmdType::Sreq => self.exchange(cmd, logging).await,
            _ => self.comm.send(cmd, logging).await,
        }
    }

    async fn exchange(&self, cmd: &Arc<Command>, logging: bool) -> Result<Fields> {
        let started = Instant::now();
        let mut exchange = self.comm.open_exchange(cmd, logging)?;
        if logging {
            tracing::trace!(target: "unpi::sreq", "==> {} {}", cmd, cmd.describe_args());
        }
        self.comm.transmit(cmd).await?;

        if let Ok(result) = tokio::time::timeout(self.config.soft_timeout, exchange.recv()).await {
            return result;
        }

        if self.comm.is_keepalive(cmd) {
            if logging {
                tracing::warn!(target: "unpi::srsp", "{} {} <=> ERROR (Timeout)", cmd, cmd.describe_args());
            }
            return Err(UnpiError::FatalTimeout("Echo Timeout".to_string()));
        }
        tracing::warn!(
            "{} got no reply within {:?}, realigning",
            cmd,
            self.config.soft_timeout
        );

        let recovery = async {
            self.realign().await?;
            self.comm.resend(cmd).await.map(|_| ())
        };
        tokio::pin!(recovery);

        let deadline = started + self.config.fatal_timeout;
        let outcome = tokio::time::timeout_at(deadline, async {
            let mut recovering = true;
            loop {
                tokio::select! {
                    result = exchange.recv() => return result,
                    result = &mut recovery, if recovering => {
                        recovering = false;
                        result?;
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    target: "unpi::srsp",
                    "{} {} <=> ERROR (Timeout)",
                    cmd,
                    cmd.describe_args()
                );
                Err(UnpiError::FatalTimeout(format!("{} timed out", cmd)))
            }
        }
    }

    /// Probe with random nonces until one echoes back.
    ///
    /// An echo already pending is joined instead of sending a second one.
    /// A mismatched echo means frames are being lost or reordered and
    /// fails with `Corruption`.
    pub async fn realign(&self) -> Result<()> {
        for attempt in 1..=self.config.realign_attempts {
            match self.echo_round().await {
                Ok((sent, value)) if value == sent => {
                    tracing::info!("realigned after {} probe(s)", attempt);
                    return Ok(());
                }
                Ok((sent, value)) => {
                    tracing::error!("echo mismatch: sent {:#010x}, got {:#010x}", sent, value);
                    return Err(UnpiError::Corruption {
                        sent,
                        received: value,
                    });
                }
                Err(UnpiError::Timeout) => {
                    tracing::debug!("realign probe {} timed out", attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(UnpiError::FatalTimeout(format!(
            "no echo after {} realignment probes",
            self.config.realign_attempts
        )))
    }

    /// Keepalive echo carrying `nonce`.
    pub fn keepalive(&self, nonce: u32) -> Result<Arc<Command>> {
        let keepalive = &self.comm.config().keepalive;
        Ok(Arc::new(Command::with_args(
            self.comm.registry(),
            keepalive.subsystem.as_str(),
            keepalive.command.as_str(),
            vec![Value::from(nonce)],
        )?))
    }

    fn keepalive_key(&self) -> Result<PendingKey> {
        let keepalive = &self.comm.config().keepalive;
        Ok(Command::new(
            self.comm.registry(),
            keepalive.subsystem.as_str(),
            keepalive.command.as_str(),
        )?
        .key())
    }

    /// Send one keepalive echo outside the queue and return its value.
    async fn echo(&self, nonce: u32) -> Result<u32> {
        let probe = self.keepalive(nonce)?;

        let mut exchange = self.comm.open_exchange(&probe, false)?;
        self.comm.transmit(&probe).await?;
        let fields = tokio::time::timeout(self.config.probe_timeout, exchange.recv())
            .await
            .map_err(|_| UnpiError::Timeout)??;
        echoed_value(&fields)
    }

    /// One echo round trip, returning the value sent and the value echoed.
    ///
    /// A pending keepalive is joined by resending its frame and waiting on
    /// its reply. Only when none is pending does a fresh nonce go out.
    async fn echo_round(&self) -> Result<(u32, u32)> {
        if let Some((pending, rx)) = self.comm.watch_pending(self.keepalive_key()?) {
            let sent = echoed_value(&pending.args())?;
            tracing::debug!("joining pending {}", pending);
            self.comm.transmit(&pending).await?;
            // a dropped watcher means the owner gave up on its echo
            let fields = match tokio::time::timeout(self.config.piggyback_timeout, rx).await {
                Ok(Ok(result)) => result?,
                Ok(Err(_)) | Err(_) => return Err(UnpiError::Timeout),
            };
            return Ok((sent, echoed_value(&fields)?));
        }

        let nonce: u32 = rand::random();
        Ok((nonce, self.echo(nonce).await?))
    }

    /// Liveness check.
    ///
    /// Joins an echo that is already pending by resending its frame,
    /// otherwise sends a fresh one.
    pub async fn ping(&self) -> Result<()> {
        let (sent, value) = self.echo_round().await?;
        if value != sent {
            return Err(UnpiError::Corruption {
                sent,
                received: value,
            });
        }
        Ok(())
    }
}

pub(crate) fn echoed_value(fields: &Fields) -> Result<u32> {
    fields
        .values()
        .next()
        .and_then(Value::as_u32)
        .ok_or_else(|| UnpiError::Parse("echo reply carries no value".to_string()))
}
