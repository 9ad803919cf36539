//! Typed payload decoding.
//!
//! Platforms decode envelopes in one of two ways: a static
//! [`DispatchTable`] from message tag to a fixed-schema parser, or a
//! [`FieldTree`] walk over schema-less protobuf where semantic fields are
//! located by number. Both produce [`DecodedMessage`]s.

mod dispatch;
mod fields;

pub use dispatch::{DispatchTable, ParseFn};
pub use fields::{FieldError, FieldTree, FieldValue, FieldWriter};

use std::fmt;

/// Tag used by the platform to identify a message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discriminator {
    Method(String),
    Code(u64),
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Method(method) => f.write_str(method),
            Self::Code(code) => write!(f, "{code}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    pub nickname: String,
    pub avatar: String,
    pub gender: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    /// The broadcast is over; the session should close.
    Ended,
    Other(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Chat {
        user: UserInfo,
        content: String,
    },
    Gift {
        user: UserInfo,
        gift_id: u64,
        gift_name: String,
        count: u64,
    },
    Like {
        user: UserInfo,
        count: u64,
        total: u64,
    },
    Enter {
        user: UserInfo,
        member_count: u64,
    },
    Follow {
        user: UserInfo,
        follow_count: u64,
    },
    RoomStats {
        online: Option<u64>,
        total_viewers: Option<String>,
        display: Option<String>,
    },
    Control {
        status: ControlStatus,
    },
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Chat,
    Gift,
    Like,
    Enter,
    Follow,
    RoomStats,
    Control,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub discriminator: Discriminator,
    /// Native message id, when the platform supplies one.
    pub message_id: Option<String>,
    pub timestamp_ms: Option<u64>,
    pub body: MessageBody,
}

impl DecodedMessage {
    #[must_use]
    pub const fn new(discriminator: Discriminator, body: MessageBody) -> Self {
        Self {
            discriminator,
            message_id: None,
            timestamp_ms: None,
            body,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self.body {
            MessageBody::Chat { .. } => MessageKind::Chat,
            MessageBody::Gift { .. } => MessageKind::Gift,
            MessageBody::Like { .. } => MessageKind::Like,
            MessageBody::Enter { .. } => MessageKind::Enter,
            MessageBody::Follow { .. } => MessageKind::Follow,
            MessageBody::RoomStats { .. } => MessageKind::RoomStats,
            MessageBody::Control { .. } => MessageKind::Control,
            MessageBody::Unknown => MessageKind::Unknown,
        }
    }

    #[must_use]
    pub fn user(&self) -> Option<&UserInfo> {
        match &self.body {
            MessageBody::Chat { user, .. }
            | MessageBody::Gift { user, .. }
            | MessageBody::Like { user, .. }
            | MessageBody::Enter { user, .. }
            | MessageBody::Follow { user, .. } => Some(user),
            _ => None,
        }
    }
}
