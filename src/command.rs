//! One protocol command invocation.
//!
//! A [`Command`] resolves its subsystem and command through the
//! [`Registry`], binds request arguments, and lazily builds its wire frame
//! exactly once. The same type parses replies and notifications for that
//! command.
//!
//! # Example
//!
//! ```
//! use unpi_client::{Command, Registry};
//!
//! let registry = Registry::builtin().unwrap();
//! let cmd = Command::with_args(&registry, "SYS", "osalNvRead", [("id", 3u16), ("offset", 0u16)]).unwrap();
//! let frame = cmd.frame().unwrap();
//! assert_eq!(frame[0], 0xFE);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::codec::{Args, Fields, PayloadCodec, Value};
use crate::error::{Result, UnpiError};
use crate::meta::{CommandDef, Ident, Registry};
use crate::protocol::{build_frame, CmdType, FRAME_OVERHEAD, HEADER_SIZE};

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// Identity of one command object.
///
/// Two commands for the same subsystem and command share a [`PendingKey`]
/// but never a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    /// Allocate a fresh ticket.
    pub fn next() -> Self {
        Ticket(NEXT_TICKET.fetch_add(1, Ordering::Relaxed))
    }
}

/// Slot key for reply correlation: subsystem id and command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub subsystem: u8,
    pub command: u8,
}

/// A resolved command with optional bound arguments.
#[derive(Debug)]
pub struct Command {
    ticket: Ticket,
    subsystem_id: u8,
    subsystem: String,
    def: Arc<CommandDef>,
    /// One slot per request parameter.
    args: Vec<Option<Value>>,
    frame: OnceLock<Bytes>,
}

impl Command {
    /// Resolve a command for parsing or for sending without arguments.
    pub fn new<'a, 'b>(
        registry: &Registry,
        subsystem: impl Into<Ident<'a>>,
        command: impl Into<Ident<'b>>,
    ) -> Result<Self> {
        let subsys = registry.lookup_subsystem(subsystem)?;
        let def = registry.lookup_command(subsys.id, command)?.clone();
        let args = vec![None; def.req.len()];
        Ok(Self {
            ticket: Ticket::next(),
            subsystem_id: subsys.id,
            subsystem: subsys.name.clone(),
            def,
            args,
            frame: OnceLock::new(),
        })
    }

    /// Resolve a command and bind request arguments.
    ///
    /// Positional values are assigned by index. Named values must cover
    /// every declared parameter, or the call fails with `MissingArgument`.
    pub fn with_args<'a, 'b>(
        registry: &Registry,
        subsystem: impl Into<Ident<'a>>,
        command: impl Into<Ident<'b>>,
        args: impl Into<Args>,
    ) -> Result<Self> {
        let mut cmd = Self::new(registry, subsystem, command)?;
        cmd.bind(args.into())?;
        Ok(cmd)
    }

    fn bind(&mut self, args: Args) -> Result<()> {
        match args {
            Args::Positional(values) => {
                for (slot, value) in self.args.iter_mut().zip(values) {
                    *slot = Some(value);
                }
            }
            Args::Named(mut fields) => {
                for (slot, param) in self.args.iter_mut().zip(&self.def.req) {
                    let value = fields.remove(&param.name).ok_or_else(|| {
                        UnpiError::MissingArgument {
                            command: format!("{}:{}", self.subsystem, self.def.name),
                            param: param.name.clone(),
                        }
                    })?;
                    *slot = Some(value);
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    #[inline]
    pub fn subsystem_id(&self) -> u8 {
        self.subsystem_id
    }

    #[inline]
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    #[inline]
    pub fn command_id(&self) -> u8 {
        self.def.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    #[inline]
    pub fn cmd_type(&self) -> CmdType {
        self.def.cmd_type
    }

    #[inline]
    pub fn def(&self) -> &Arc<CommandDef> {
        &self.def
    }

    #[inline]
    pub fn key(&self) -> PendingKey {
        PendingKey {
            subsystem: self.subsystem_id,
            command: self.def.id,
        }
    }

    /// Whether this is `subsystem:command`.
    pub fn is(&self, subsystem: &str, command: &str) -> bool {
        self.subsystem == subsystem && self.def.name == command
    }

    /// Bound argument values by parameter name.
    pub fn args(&self) -> Fields {
        self.def
            .req
            .iter()
            .zip(&self.args)
            .filter_map(|(param, value)| Some((param.name.clone(), value.clone()?)))
            .collect()
    }

    /// Complete wire frame for this command, built on first use.
    pub fn frame(&self) -> Result<Bytes> {
        if let Some(frame) = self.frame.get() {
            return Ok(frame.clone());
        }
        let payload = PayloadCodec::encode(&self.def.req, &self.args)?;
        let built = build_frame(self.def.cmd_type, self.subsystem_id, self.def.id, &payload)?;
        Ok(self.frame.get_or_init(|| built).clone())
    }

    /// Serialized payload without framing.
    pub fn payload(&self) -> Result<Bytes> {
        let frame = self.frame()?;
        Ok(frame.slice(HEADER_SIZE..frame.len() - (FRAME_OVERHEAD - HEADER_SIZE)))
    }

    /// Parse a reply (`SRSP`) or notification (`AREQ`) payload.
    pub fn parse(&self, kind: CmdType, payload: &[u8]) -> Result<Fields> {
        let params = self.def.params_for(kind)?;
        PayloadCodec::decode(params, payload, self.def.generic_rsp)
    }

    /// Bound arguments formatted for logs.
    pub fn describe_args(&self) -> String {
        format_fields(&self.args())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subsystem, self.def.name)
    }
}

/// `{a: 1, b: <0102>}` rendering for log lines.
pub(crate) fn format_fields(fields: &Fields) -> String {
    let inner: Vec<String> = fields.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
    format!("{{{}}}", inner.join(", "))
}
