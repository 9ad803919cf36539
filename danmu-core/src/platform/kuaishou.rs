//! Live socket protocol: protobuf `SocketMessage` envelopes over websocket.
//! Feed payloads are walked by field number through [`FieldTree`], since
//! their schema is only known from observed traffic.

use std::time::Duration;

use bytes::Bytes;
use danmu_proto::kuaishou::{self as pb, compression_type, payload_type};
use prost::Message as _;
use rand::Rng;
use url::Url;

use super::{PlatformProtocol, SessionContext};
use crate::codec::{
    CbcCipher, CompressionMode, EncryptionMode, Envelope, EnvelopeSchema, FrameClass, FrameCodec,
    FrameError, Framing,
};
use crate::collaborator::{ResolvedSession, SignRequest};
use crate::decoder::{DecodedMessage, Discriminator, FieldTree, MessageBody, UserInfo};
use crate::error::{Error, Result};
use crate::heartbeat::Keepalive;
use crate::normalizer::now_millis;
use crate::transport::ConnectRequest;

pub const KUAISHOU_PUSH_ENDPOINT: &str = "wss://live-ws-pc.kuaishou.com/websocket";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const SIGN_PATH: &str = "/live_api/liveroom/websocketinfo";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

const AES_KEY: [u8; 16] = *b"PPbzKKL7NB15leYy";
const AES_IV: [u8; 16] = *b"JRODKJiolJ9xqso0";

/// Field numbers inside a feed push payload.
mod feed {
    pub const DISPLAY_WATCHING: u32 = 1;
    pub const DISPLAY_LIKES: u32 = 2;
    pub const ITEMS: u32 = 5;
}

/// Field numbers inside one feed item.
mod item {
    pub const USER: u32 = 2;
    pub const CONTENT: u32 = 3;
    pub const TYPE: u32 = 7;
    pub const GIFT_ID: u32 = 8;
    pub const GIFT_COUNT: u32 = 9;
    pub const GIFT_NAME: u32 = 10;

    pub const TYPE_COMMENT: u64 = 1;
    pub const TYPE_LIKE: u64 = 2;
    pub const TYPE_ENTER: u64 = 3;
    pub const TYPE_FOLLOW: u64 = 4;
    pub const TYPE_GIFT: u64 = 5;
}

/// Field numbers inside a feed item's user.
mod user {
    pub const ID: u32 = 1;
    pub const NICKNAME: u32 = 2;
    pub const AVATAR: u32 = 3;
}

/// `SocketMessage` envelope layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketMessageSchema;

impl EnvelopeSchema for SocketMessageSchema {
    fn parse(&self, body: &[u8]) -> std::result::Result<Envelope, FrameError> {
        let msg = pb::SocketMessage::decode(body)?;
        let kind = u32::try_from(msg.payload_type)
            .map_err(|_| FrameError::Corrupt(format!("negative payload type {}", msg.payload_type)))?;
        let encrypted = msg.encryption_type != 0 || msg.compression_type == compression_type::AES;

        Ok(Envelope {
            kind,
            compression: if msg.compression_type == compression_type::GZIP {
                CompressionMode::Gzip
            } else {
                CompressionMode::None
            },
            encryption: if encrypted {
                EncryptionMode::AesCbc
            } else {
                EncryptionMode::None
            },
            payload: Bytes::from(msg.payload),
            needs_ack: msg.need_ack,
            log_id: msg.log_id,
            ack_context: (!msg.ack_context.is_empty()).then(|| Bytes::from(msg.ack_context)),
            timestamp_ms: (msg.timestamp != 0).then_some(msg.timestamp),
        })
    }

    fn seal(&self, envelope: &Envelope) -> Vec<u8> {
        pb::SocketMessage {
            payload_type: i32::try_from(envelope.kind).unwrap_or_default(),
            compression_type: match envelope.compression {
                CompressionMode::Gzip => compression_type::GZIP,
                CompressionMode::None => compression_type::NONE,
            },
            encryption_type: i32::from(envelope.encryption == EncryptionMode::AesCbc),
            payload: envelope.payload.to_vec(),
            timestamp: envelope.timestamp_ms.unwrap_or_default(),
            log_id: envelope.log_id,
            need_ack: envelope.needs_ack,
            ack_context: envelope
                .ack_context
                .as_ref()
                .map(|ctx| ctx.to_vec())
                .unwrap_or_default(),
        }
        .encode_to_vec()
    }
}

pub struct KuaishouProtocol {
    codec: FrameCodec<SocketMessageSchema>,
    endpoint: String,
}

impl KuaishouProtocol {
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoint(KUAISHOU_PUSH_ENDPOINT)
    }

    #[must_use]
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            codec: FrameCodec::new(SocketMessageSchema, Framing::Message)
                .with_cipher(CbcCipher::new(AES_KEY, AES_IV)),
            endpoint: endpoint.into(),
        }
    }

    pub const fn codec(&self) -> &FrameCodec<SocketMessageSchema> {
        &self.codec
    }

    fn envelope(kind: i32, payload: Vec<u8>) -> Envelope {
        let mut envelope = Envelope::new(u32::try_from(kind).unwrap_or_default(), payload);
        envelope.timestamp_ms = Some(now_millis());
        envelope
    }
}

impl Default for KuaishouProtocol {
    fn default() -> Self {
        Self::new()
    }
}

fn page_id() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut rng = rand::thread_rng();
    let prefix: String = (0..16)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{prefix}_{}", now_millis())
}

impl PlatformProtocol for KuaishouProtocol {
    fn name(&self) -> &'static str {
        "kuaishou"
    }

    fn framing(&self) -> Framing {
        self.codec.framing()
    }

    fn default_heartbeat_interval(&self) -> Duration {
        HEARTBEAT_INTERVAL
    }

    fn sign_request(&self, session: &ResolvedSession) -> Option<SignRequest> {
        Some(SignRequest {
            url: SIGN_PATH.to_string(),
            query: vec![
                ("liveStreamId".to_string(), session.session_id.clone()),
                ("caver".to_string(), "2".to_string()),
            ],
            digest: None,
        })
    }

    fn connect_request(&self, ctx: &SessionContext) -> Result<ConnectRequest> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| Error::Config(format!("invalid push endpoint {}: {e}", self.endpoint)))?;
        let mut headers = vec![("user-agent".to_string(), USER_AGENT.to_string())];
        if let Some(cookie) = &ctx.session.cookies {
            headers.push(("cookie".to_string(), cookie.clone()));
        }
        Ok(ConnectRequest {
            url: url.into(),
            headers,
        })
    }

    fn entry_frame(&self, ctx: &SessionContext) -> Result<Option<Bytes>> {
        let token = ctx
            .signature
            .clone()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::Signature("entry requires a token".to_string()))?;
        let enter = pb::CsWebEnterRoom {
            token,
            live_stream_id: ctx.session.session_id.clone(),
            reconnect_count: ctx.reconnect_count,
            page_id: page_id(),
            ..pb::CsWebEnterRoom::default()
        };
        let frame = self
            .codec
            .encode_envelope(Self::envelope(payload_type::CS_ENTER_ROOM, enter.encode_to_vec()))?;
        Ok(Some(frame))
    }

    fn heartbeat_frame(&self) -> std::result::Result<Keepalive, FrameError> {
        let beat = pb::CsWebHeartbeat {
            timestamp: now_millis(),
        };
        self.codec
            .encode_envelope(Self::envelope(payload_type::CS_HEARTBEAT, beat.encode_to_vec()))
            .map(Keepalive::Frame)
    }

    fn ack_frame(&self, envelope: &Envelope) -> std::result::Result<Option<Bytes>, FrameError> {
        if !envelope.needs_ack {
            return Ok(None);
        }
        let ack = pb::CsWebAck {
            log_id: envelope.log_id.unwrap_or_default(),
            ack_context: envelope
                .ack_context
                .as_ref()
                .map(|ctx| ctx.to_vec())
                .unwrap_or_default(),
        };
        let mut frame = Self::envelope(payload_type::CS_ACK, ack.encode_to_vec());
        frame.log_id = envelope.log_id;
        self.codec.encode_envelope(frame).map(Some)
    }

    fn decode_frame(&self, raw: &[u8]) -> std::result::Result<Envelope, FrameError> {
        self.codec.decode(raw)
    }

    fn classify(&self, envelope: &Envelope) -> FrameClass {
        match i32::try_from(envelope.kind).unwrap_or_default() {
            payload_type::SC_FEED_PUSH => FrameClass::Push,
            payload_type::SC_HEARTBEAT_ACK => FrameClass::HeartbeatAck,
            payload_type::SC_ENTER_ROOM_ACK => FrameClass::EntryAck,
            payload_type::SC_ERROR => FrameClass::Error,
            payload_type::SC_LIVE_CLOSED => FrameClass::Closed,
            _ => FrameClass::Ignored,
        }
    }

    fn decode_messages(&self, envelope: &Envelope) -> Vec<DecodedMessage> {
        let feed = match FieldTree::parse(envelope.payload.clone()) {
            Ok(feed) => feed,
            Err(e) => {
                tracing::debug!(error = %e, "failed to walk feed payload");
                return Vec::new();
            }
        };

        let mut messages = Vec::new();

        let watching = feed.string(feed::DISPLAY_WATCHING);
        let likes = feed.string(feed::DISPLAY_LIKES);
        if watching.is_some() || likes.is_some() {
            let mut stats = DecodedMessage::new(
                Discriminator::Code(u64::from(envelope.kind)),
                MessageBody::RoomStats {
                    online: watching.as_deref().and_then(|w| w.parse().ok()),
                    total_viewers: watching,
                    display: likes,
                },
            );
            stats.timestamp_ms = envelope.timestamp_ms;
            messages.push(stats);
        }

        for entry in feed.trees(feed::ITEMS) {
            let mut message = decode_item(&entry);
            message.timestamp_ms = envelope.timestamp_ms;
            messages.push(message);
        }

        messages
    }

    fn describe_error(&self, envelope: &Envelope) -> String {
        match pb::ScWebError::decode(envelope.payload.as_ref()) {
            Ok(err) => format!("server error {}: {}", err.code, err.msg),
            Err(_) => "server error (undecodable payload)".to_string(),
        }
    }
}

fn decode_user(entry: &FieldTree) -> UserInfo {
    entry
        .tree(item::USER)
        .map(|user| UserInfo {
            id: user.string_or_default(user::ID),
            nickname: user.string_or_default(user::NICKNAME),
            avatar: user.string_or_default(user::AVATAR),
            gender: None,
        })
        .unwrap_or_default()
}

fn decode_item(entry: &FieldTree) -> DecodedMessage {
    let kind = entry.uint_or_default(item::TYPE);
    let user = decode_user(entry);
    let content = entry.string_or_default(item::CONTENT);

    let body = match kind {
        item::TYPE_COMMENT => MessageBody::Chat { user, content },
        item::TYPE_LIKE => MessageBody::Like {
            user,
            count: entry.uint(item::GIFT_COUNT).unwrap_or(1),
            total: 0,
        },
        item::TYPE_ENTER => MessageBody::Enter {
            user,
            member_count: 0,
        },
        item::TYPE_FOLLOW => MessageBody::Follow {
            user,
            follow_count: 0,
        },
        item::TYPE_GIFT => MessageBody::Gift {
            user,
            gift_id: entry.uint_or_default(item::GIFT_ID),
            gift_name: entry
                .string(item::GIFT_NAME)
                .filter(|name| !name.is_empty())
                .unwrap_or(content),
            count: entry.uint(item::GIFT_COUNT).unwrap_or(1),
        },
        other => {
            tracing::trace!(kind = other, "unrecognized feed item type");
            MessageBody::Unknown
        }
    };

    DecodedMessage::new(Discriminator::Code(kind), body)
}
