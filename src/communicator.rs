//! Dispatcher: pending-reply bookkeeping and inbound frame routing.
//!
//! The communicator owns the pending table. Each entry is a one-shot
//! completion handle keyed by subsystem and command id. Inbound frames are
//! decoded, matched against the table, and published as [`Event`]s.
//!
//! The table sits behind a `std::sync::Mutex` that is never held across an
//! await point. Frames are handed in by the single reader task, so the
//! table is mutated by one frame at a time.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use crate::codec::{Fields, Value};
use crate::command::{format_fields, Command, PendingKey, Ticket};
use crate::error::{Result, UnpiError};
use crate::event::Event;
use crate::meta::Registry;
use crate::protocol::{CmdType, Frame, SUBSYSTEM_MASK};
use crate::writer::WriterHandle;

/// Default bound on waiting for the reset indication after a reset command.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a transport write completing.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(1150);

/// Receives the reply of one pending request.
pub type ReplyReceiver = oneshot::Receiver<Result<Fields>>;

/// A `SUBSYS:command` pair designated for special handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandName {
    pub subsystem: String,
    pub command: String,
}

impl CommandName {
    pub fn new(subsystem: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            subsystem: subsystem.into(),
            command: command.into(),
        }
    }

    #[inline]
    pub fn matches(&self, subsystem: &str, command: &str) -> bool {
        self.subsystem == subsystem && self.command == command
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subsystem, self.command)
    }
}

/// Configuration for the communicator.
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Bound on waiting for the reset indication.
    pub reset_timeout: Duration,
    /// Bound on a frame being written and flushed.
    pub write_timeout: Duration,
    /// Echo command used for liveness and realignment probes.
    pub keepalive: CommandName,
    /// Notification the device sends after resetting.
    pub reset_indication: CommandName,
    /// Command names (any subsystem) that reset the device.
    pub reset_commands: Vec<String>,
    /// Reply the device sends when it rejects a request.
    pub generic_error: CommandName,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            keepalive: CommandName::new("RCN", "echo"),
            reset_indication: CommandName::new("SYS", "resetInd"),
            reset_commands: vec!["resetReq".to_string(), "systemReset".to_string()],
            generic_error: CommandName::new("RES0", "error"),
        }
    }
}

/// Snapshot of the pending table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommunicatorInfo {
    pub pending: usize,
}

struct PendingEntry {
    cmd: Arc<Command>,
    reply: oneshot::Sender<Result<Fields>>,
    /// Probes piggybacking on this request.
    watchers: Vec<oneshot::Sender<Result<Fields>>>,
    logging: bool,
}

impl PendingEntry {
    fn resolve(self, make: impl Fn() -> Result<Fields>) {
        for watcher in self.watchers {
            let _ = watcher.send(make());
        }
        let _ = self.reply.send(make());
    }
}

#[derive(Default)]
struct State {
    pending: Vec<PendingEntry>,
    /// Released by the reset indication.
    resetting: Option<oneshot::Sender<()>>,
    /// Synchronous exchange currently on the wire.
    sending: Option<(Ticket, String)>,
}

/// Routes replies to pending requests and notifications to subscribers.
pub struct Communicator {
    registry: Arc<Registry>,
    writer: WriterHandle,
    events: broadcast::Sender<Event>,
    config: CommunicatorConfig,
    state: Mutex<State>,
}

impl Communicator {
    pub fn new(
        registry: Arc<Registry>,
        writer: WriterHandle,
        events: broadcast::Sender<Event>,
        config: CommunicatorConfig,
    ) -> Self {
        Self {
            registry,
            writer,
            events,
            config,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether `cmd` is the keepalive probe.
    #[inline]
    pub fn is_keepalive(&self, cmd: &Command) -> bool {
        self.config.keepalive.matches(cmd.subsystem(), cmd.name())
    }

    /// Whether `cmd` resets the device.
    #[inline]
    pub fn is_reset(&self, cmd: &Command) -> bool {
        self.config.reset_commands.iter().any(|c| c == cmd.name())
    }

    /// Register a pending entry for `cmd`.
    ///
    /// Returns `None` when this same command object is already pending; the
    /// receiver handed out earlier stays valid. A distinct command for the
    /// same subsystem, command and kind is an error unless it is the
    /// keepalive.
    pub fn add_pending(&self, cmd: &Arc<Command>, logging: bool) -> Result<Option<ReplyReceiver>> {
        let keepalive = self.is_keepalive(cmd);
        let mut state = self.state();

        for entry in &state.pending {
            if entry.cmd.ticket() == cmd.ticket() {
                tracing::debug!("resending {}", cmd);
                return Ok(None);
            }
            if !keepalive && entry.cmd.key() == cmd.key() && entry.cmd.cmd_type() == cmd.cmd_type()
            {
                return Err(UnpiError::Protocol(format!("{} already pending", cmd)));
            }
        }

        let (reply, rx) = oneshot::channel();
        state.pending.push(PendingEntry {
            cmd: cmd.clone(),
            reply,
            watchers: Vec::new(),
            logging,
        });
        Ok(Some(rx))
    }

    /// Remove the entry for this command object without resolving it.
    ///
    /// Its receiver sees the channel close.
    pub fn remove_pending(&self, ticket: Ticket) -> bool {
        let mut state = self.state();
        let before = state.pending.len();
        state.pending.retain(|p| p.cmd.ticket() != ticket);
        state.pending.len() != before
    }

    /// Whether this command object still waits for a reply.
    pub fn is_pending(&self, ticket: Ticket) -> bool {
        self.state().pending.iter().any(|p| p.cmd.ticket() == ticket)
    }

    /// Follow the reply of an already pending request for `key`.
    ///
    /// Returns the pending command and a receiver that gets a copy of its
    /// outcome.
    pub fn watch_pending(&self, key: PendingKey) -> Option<(Arc<Command>, ReplyReceiver)> {
        let mut state = self.state();
        let entry = state.pending.iter_mut().find(|p| p.cmd.key() == key)?;
        let (tx, rx) = oneshot::channel();
        entry.watchers.push(tx);
        Some((entry.cmd.clone(), rx))
    }

    fn take_pending(&self, key: PendingKey) -> Option<PendingEntry> {
        let mut state = self.state();
        let idx = state.pending.iter().position(|p| p.cmd.key() == key)?;
        Some(state.pending.remove(idx))
    }

    /// Begin a synchronous exchange: claim the sending marker and register
    /// the pending entry.
    ///
    /// # Panics
    ///
    /// Panics if another non-keepalive synchronous exchange is in progress.
    /// Two overlapping exchanges mean the caller bypassed the transmit queue.
    pub fn open_exchange(self: &Arc<Self>, cmd: &Arc<Command>, logging: bool) -> Result<Exchange> {
        let claims_marker = cmd.cmd_type() == CmdType::Sreq && !self.is_keepalive(cmd);
        if claims_marker {
            let conflict = {
                let mut state = self.state();
                match &state.sending {
                    Some((ticket, label)) if *ticket != cmd.ticket() => Some(label.clone()),
                    _ => {
                        state.sending = Some((cmd.ticket(), cmd.to_string()));
                        None
                    }
                }
            };
            if let Some(current) = conflict {
                panic!("cannot send SREQ:{} while sending SREQ:{}", cmd, current);
            }
        }

        let mut exchange = Exchange {
            comm: self.clone(),
            cmd: cmd.clone(),
            rx: None,
            claims_marker,
        };
        exchange.rx = self.add_pending(cmd, logging)?;
        if exchange.rx.is_none() {
            return Err(UnpiError::Protocol(format!("{} is already in flight", cmd)));
        }
        Ok(exchange)
    }

    /// Write the command's frame, bounded by the write timeout.
    pub async fn transmit(&self, cmd: &Command) -> Result<()> {
        let frame = cmd.frame()?;
        match tokio::time::timeout(self.config.write_timeout, self.writer.send(frame)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("write of {} timed out", cmd);
                Err(UnpiError::Timeout)
            }
        }
    }

    /// Retransmit a command whose entry is still pending.
    ///
    /// The entry moves to the back of the table and keeps its receiver.
    /// Returns `false` without writing when the reply already arrived.
    pub async fn resend(&self, cmd: &Command) -> Result<bool> {
        {
            let mut state = self.state();
            let Some(idx) = state.pending.iter().position(|p| p.cmd.ticket() == cmd.ticket()) else {
                return Ok(false);
            };
            let entry = state.pending.remove(idx);
            state.pending.push(entry);
        }
        tracing::debug!("resending {} after realignment", cmd);
        self.transmit(cmd).await?;
        Ok(true)
    }

    /// Send a command.
    ///
    /// SREQ waits for the matching reply. AREQ returns once written, except
    /// reset commands, which wait for the reset indication.
    pub async fn send(self: &Arc<Self>, cmd: &Arc<Command>, logging: bool) -> Result<Fields> {
        match cmd.cmd_type() {
            CmdType::Sreq => {
                let mut exchange = self.open_exchange(cmd, logging)?;
                self.transmit(cmd).await?;
                exchange.recv().await
            }
            CmdType::Areq => {
                self.send_areq(cmd, logging).await?;
                Ok(Fields::new())
            }
            other => Err(UnpiError::Protocol(format!(
                "cannot send {} of type {}",
                cmd, other
            ))),
        }
    }

    async fn send_areq(&self, cmd: &Command, logging: bool) -> Result<()> {
        if logging {
            tracing::debug!(target: "unpi::areq", "==> {} {}", cmd, cmd.describe_args());
        }

        let reset = if self.is_reset(cmd) {
            let (tx, rx) = oneshot::channel();
            self.state().resetting = Some(tx);
            Some(rx)
        } else {
            None
        };

        if let Err(e) = self.transmit(cmd).await {
            if reset.is_some() {
                self.state().resetting = None;
            }
            return Err(e);
        }

        let Some(rx) = reset else {
            return Ok(());
        };
        match tokio::time::timeout(self.config.reset_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(UnpiError::ConnectionClosed),
            Err(_) => {
                self.state().resetting = None;
                tracing::warn!("no {} after {}", self.config.reset_indication, cmd);
                Err(UnpiError::Timeout)
            }
        }
    }

    /// Handle one inbound frame.
    pub fn receive(&self, frame: &Frame) {
        let checksum_valid = frame.is_valid();
        let suffix = if checksum_valid { "" } else { " (INVALID CHECKSUM)" };

        let (subsys_name, def) = match self
            .registry
            .lookup_subsystem(frame.subsystem())
            .and_then(|s| Ok((s.name.clone(), self.registry.lookup_command(s.id, frame.command())?.clone())))
        {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    target: "unpi::unknown",
                    "<== {} {}:{} {:02x?}{} ({})",
                    frame.cmd_type(),
                    frame.subsystem(),
                    frame.command(),
                    frame.payload(),
                    suffix,
                    e
                );
                return;
            }
        };

        let kind = frame.cmd_type();
        let parsed = def
            .params_for(kind)
            .and_then(|params| crate::codec::PayloadCodec::decode(params, frame.payload(), def.generic_rsp));

        match kind {
            CmdType::Srsp => {
                if self.config.generic_error.matches(&subsys_name, &def.name) {
                    match parsed {
                        Ok(fields) => self.receive_generic_error(&fields),
                        Err(e) => tracing::warn!(target: "unpi::srsp", "undecodable error reply: {}", e),
                    }
                    return;
                }

                let key = PendingKey {
                    subsystem: frame.subsystem(),
                    command: frame.command(),
                };
                let Some(entry) = self.take_pending(key) else {
                    let payload = match &parsed {
                        Ok(fields) => format_fields(fields),
                        Err(_) => "<unknown>".to_string(),
                    };
                    tracing::warn!(
                        target: "unpi::srsp",
                        "{}:{} {} <=> ERROR (NO-LISTENERS)",
                        subsys_name,
                        def.name,
                        payload
                    );
                    self.log_listeners();
                    self.publish(kind, &subsys_name, &def.name, parsed.ok(), checksum_valid);
                    return;
                };

                match parsed {
                    Ok(fields) => {
                        if entry.logging {
                            tracing::debug!(
                                target: "unpi::srsp",
                                "{} {} <=> {}{}",
                                entry.cmd,
                                entry.cmd.describe_args(),
                                format_fields(&fields),
                                suffix
                            );
                        }
                        if checksum_valid {
                            entry.resolve(|| Ok(fields.clone()));
                        } else {
                            entry.resolve(|| {
                                Err(UnpiError::InvalidChecksum {
                                    received: fields.clone(),
                                })
                            });
                        }
                        self.publish(kind, &subsys_name, &def.name, Some(fields), checksum_valid);
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "unpi::srsp",
                            "{} {} <=> ERROR ({}){}",
                            entry.cmd,
                            entry.cmd.describe_args(),
                            e,
                            suffix
                        );
                        let message = e.to_string();
                        if checksum_valid {
                            entry.resolve(|| Err(UnpiError::Parse(message.clone())));
                        } else {
                            entry.resolve(|| Err(UnpiError::InvalidChecksum { received: Fields::new() }));
                        }
                    }
                }
            }
            CmdType::Areq => {
                let fields = match parsed {
                    Ok(fields) => fields,
                    Err(e) => {
                        tracing::warn!(
                            target: "unpi::areq",
                            "<== {}:{} {:02x?}{} ({})",
                            subsys_name,
                            def.name,
                            frame.payload(),
                            suffix,
                            e
                        );
                        return;
                    }
                };
                tracing::debug!(
                    target: "unpi::areq",
                    "<== {}:{} {}{}",
                    subsys_name,
                    def.name,
                    format_fields(&fields),
                    suffix
                );

                if self.config.reset_indication.matches(&subsys_name, &def.name) {
                    self.handle_reset_indication();
                }
                self.publish(kind, &subsys_name, &def.name, Some(fields), checksum_valid);
            }
            other => {
                tracing::debug!(
                    target: "unpi::unknown",
                    "<== {} {}:{} {:02x?}{}",
                    other,
                    subsys_name,
                    def.name,
                    frame.payload(),
                    suffix
                );
            }
        }
    }

    fn receive_generic_error(&self, fields: &Fields) {
        let field = |name: &str| fields.get(name).and_then(Value::as_i64).unwrap_or(0) as u8;
        let code = field("errcode");
        let key = PendingKey {
            subsystem: field("typesubsys") & SUBSYSTEM_MASK,
            command: field("cmd"),
        };

        let (subsystem, command) = match self.registry.lookup_command(key.subsystem, key.command) {
            Ok(def) => {
                let subsys = self
                    .registry
                    .lookup_subsystem(key.subsystem)
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|_| key.subsystem.to_string());
                (subsys, def.name.clone())
            }
            Err(_) => (key.subsystem.to_string(), key.command.to_string()),
        };
        let reason = self
            .registry
            .enum_name("errcode", i64::from(code))
            .unwrap_or("Unknown")
            .to_string();

        let Some(entry) = self.take_pending(key) else {
            tracing::warn!(
                target: "unpi::srsp",
                "{}:{} <unknown> <=> ERROR (RES0-ERROR)",
                subsystem,
                command
            );
            return;
        };
        tracing::warn!(
            target: "unpi::srsp",
            "{} {} <=> ERROR (RES0-ERROR) {}",
            entry.cmd,
            entry.cmd.describe_args(),
            reason
        );
        entry.resolve(|| {
            Err(UnpiError::DeviceError {
                subsystem: subsystem.clone(),
                command: command.clone(),
                code,
                reason: reason.clone(),
            })
        });
    }

    fn handle_reset_indication(&self) {
        let (pending, resetting) = {
            let mut state = self.state();
            (std::mem::take(&mut state.pending), state.resetting.take())
        };
        if !pending.is_empty() {
            tracing::warn!("module reset, failing {} pending requests", pending.len());
        }
        for entry in pending {
            entry.resolve(|| Err(UnpiError::ModuleReset));
        }
        if let Some(resetting) = resetting {
            let _ = resetting.send(());
        }
    }

    fn publish(
        &self,
        kind: CmdType,
        subsystem: &str,
        command: &str,
        data: Option<Fields>,
        checksum_valid: bool,
    ) {
        let Some(data) = data else {
            return;
        };
        // no subscribers is fine
        let _ = self.events.send(Event {
            kind,
            subsystem: subsystem.to_string(),
            command: command.to_string(),
            data,
            checksum_valid,
        });
    }

    fn log_listeners(&self) {
        if !tracing::enabled!(target: "unpi::srsp", tracing::Level::DEBUG) {
            return;
        }
        let state = self.state();
        for (i, entry) in state.pending.iter().enumerate() {
            tracing::debug!(target: "unpi::srsp", ">> {}. {}", i + 1, entry.cmd);
        }
    }

    /// Reject every pending request and any reset wait.
    pub fn fail_all(&self, make: impl Fn() -> UnpiError) {
        let (pending, resetting) = {
            let mut state = self.state();
            (std::mem::take(&mut state.pending), state.resetting.take())
        };
        for entry in pending {
            entry.resolve(|| Err(make()));
        }
        drop(resetting);
    }

    pub fn info(&self) -> CommunicatorInfo {
        CommunicatorInfo {
            pending: self.state().pending.len(),
        }
    }

    /// Label of the synchronous exchange holding the sending marker.
    pub fn sending(&self) -> Option<String> {
        self.state().sending.as_ref().map(|(_, label)| label.clone())
    }

    /// Subscribe to notifications and replies.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

/// One synchronous exchange in progress.
///
/// Dropping it removes the pending entry if still present and releases the
/// sending marker, so both are cleaned up on every exit path.
pub struct Exchange {
    comm: Arc<Communicator>,
    cmd: Arc<Command>,
    rx: Option<ReplyReceiver>,
    claims_marker: bool,
}

impl Exchange {
    /// Wait for the reply.
    pub async fn recv(&mut self) -> Result<Fields> {
        match self.rx.as_mut() {
            Some(rx) => rx.await.map_err(|_| UnpiError::ConnectionClosed)?,
            None => Err(UnpiError::ConnectionClosed),
        }
    }

    #[inline]
    pub fn command(&self) -> &Arc<Command> {
        &self.cmd
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.comm.remove_pending(self.cmd.ticket());
        if self.claims_marker {
            let mut state = self.comm.state();
            if matches!(&state.sending, Some((ticket, _)) if *ticket == self.cmd.ticket()) {
                state.sending = None;
            }
        }
    }
}
