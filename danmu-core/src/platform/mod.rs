//! Per-platform wire protocols.
//!
//! A [`PlatformProtocol`] knows how to reach a platform's push service and
//! how to speak to it: which frames to send on entry, as keepalive and as
//! acknowledgement, how to unwrap inbound frames and how to turn their
//! payload into [`DecodedMessage`]s. The lifecycle manager is generic over
//! it.

mod douyin;
mod kuaishou;

pub use douyin::{DouyinProtocol, DOUYIN_PUSH_ENDPOINT};
pub use kuaishou::{KuaishouProtocol, KUAISHOU_PUSH_ENDPOINT};

use std::time::Duration;

use bytes::Bytes;

use crate::codec::{Envelope, FrameClass, FrameError, Framing};
use crate::collaborator::{ResolvedSession, SignRequest};
use crate::decoder::DecodedMessage;
use crate::error::Result;
use crate::heartbeat::Keepalive;
use crate::transport::ConnectRequest;

/// Per-connection inputs assembled by the lifecycle manager.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Identifier the caller asked for.
    pub room: String,
    pub session: ResolvedSession,
    /// Token from the signing collaborator, when the platform asked for one.
    pub signature: Option<String>,
    /// Number of reconnects preceding this connection.
    pub reconnect_count: u32,
}

pub trait PlatformProtocol: Send + Sync + 'static {
    /// Short lowercase platform name, copied into every event.
    fn name(&self) -> &'static str;

    fn framing(&self) -> Framing;

    fn default_heartbeat_interval(&self) -> Duration;

    /// Parameters to sign before connecting, or `None` when the platform
    /// needs no signature.
    fn sign_request(&self, session: &ResolvedSession) -> Option<SignRequest>;

    /// URL and headers for the push connection.
    fn connect_request(&self, ctx: &SessionContext) -> Result<ConnectRequest>;

    /// Frame to send once connected, if the platform expects one.
    fn entry_frame(&self, ctx: &SessionContext) -> Result<Option<Bytes>>;

    fn heartbeat_frame(&self) -> std::result::Result<Keepalive, FrameError>;

    /// Acknowledgement for an envelope with `needs_ack` set.
    fn ack_frame(&self, envelope: &Envelope) -> std::result::Result<Option<Bytes>, FrameError>;

    /// Unwrap one raw frame.
    fn decode_frame(&self, raw: &[u8]) -> std::result::Result<Envelope, FrameError>;

    /// Static kind → meaning table.
    fn classify(&self, envelope: &Envelope) -> FrameClass;

    /// Decode a push envelope. Malformed payloads yield nothing.
    fn decode_messages(&self, envelope: &Envelope) -> Vec<DecodedMessage>;

    /// Human-readable reason carried by an error envelope.
    fn describe_error(&self, envelope: &Envelope) -> String {
        format!("server error frame (kind {})", envelope.kind)
    }
}
