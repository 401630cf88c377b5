//! Notifications published to subscribers.
//!
//! Every decoded AREQ and every SRSP the dispatcher sees is fanned out on a
//! `tokio::sync::broadcast` channel. Subscribers filter with
//! [`Event::matches`] or by [`Event::topic`].

use serde::Serialize;

use crate::codec::Fields;
use crate::protocol::CmdType;

/// One received notification or reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// `AREQ` for notifications, `SRSP` for replies.
    #[serde(serialize_with = "serialize_kind")]
    pub kind: CmdType,
    pub subsystem: String,
    /// Command name of the notification or reply.
    pub command: String,
    pub data: Fields,
    pub checksum_valid: bool,
}

fn serialize_kind<S: serde::Serializer>(kind: &CmdType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.as_str())
}

impl Event {
    /// `AREQ:<subsys>:<cmd>` or `SRSP:<subsys>:<cmd>`.
    pub fn topic(&self) -> String {
        let prefix = if self.kind == CmdType::Areq { "AREQ" } else { "SRSP" };
        format!("{}:{}:{}", prefix, self.subsystem, self.command)
    }

    #[inline]
    pub fn is_indication(&self) -> bool {
        self.kind == CmdType::Areq
    }

    /// Whether the event is for `subsystem:command`.
    #[inline]
    pub fn matches(&self, subsystem: &str, command: &str) -> bool {
        self.subsystem == subsystem && self.command == command
    }
}
