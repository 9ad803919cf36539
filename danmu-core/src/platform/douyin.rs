//! Webcast push protocol: protobuf `PushFrame` envelopes over websocket,
//! gzip-compressed `Response` bodies, and a fixed method-name dispatch
//! table over typed messages.

use std::time::Duration;

use bytes::Bytes;
use danmu_proto::douyin as pb;
use prost::Message as _;
use rand::Rng;
use url::Url;

use super::{PlatformProtocol, SessionContext};
use crate::codec::{
    CompressionMode, EncryptionMode, Envelope, EnvelopeSchema, FrameClass, FrameCodec, FrameError,
    Framing,
};
use crate::collaborator::{ResolvedSession, SignRequest};
use crate::decoder::{
    ControlStatus, DecodedMessage, Discriminator, DispatchTable, MessageBody, UserInfo,
};
use crate::error::{Error, Result};
use crate::heartbeat::Keepalive;
use crate::transport::ConnectRequest;

pub const DOUYIN_PUSH_ENDPOINT: &str = "wss://webcast100-ws-web-lq.douyin.com/webcast/im/push/v2/";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Control status announcing the end of the broadcast.
const CONTROL_STATUS_ENDED: i32 = 3;

pub const KIND_UNKNOWN: u32 = 0;
pub const KIND_MSG: u32 = 1;
pub const KIND_HEARTBEAT: u32 = 2;
pub const KIND_ACK: u32 = 3;
pub const KIND_CLOSE: u32 = 4;

/// `PushFrame.payload_type` ↔ envelope kind.
const PAYLOAD_TYPES: &[(&str, u32)] = &[
    ("msg", KIND_MSG),
    ("hb", KIND_HEARTBEAT),
    ("ack", KIND_ACK),
    ("close", KIND_CLOSE),
];

/// Query parameters covered by the connection signature, in hash order.
const SIGNED_PARAMS: &[&str] = &[
    "live_id",
    "aid",
    "version_code",
    "webcast_sdk_version",
    "room_id",
    "sub_room_id",
    "sub_channel_id",
    "did_rule",
    "user_unique_id",
    "device_platform",
    "device_type",
    "ac",
    "identity",
];

static DISPATCH: DispatchTable = DispatchTable::new(&[
    ("WebcastChatMessage", parse_chat),
    ("WebcastEmojiChatMessage", parse_emoji_chat),
    ("WebcastGiftMessage", parse_gift),
    ("WebcastLikeMessage", parse_like),
    ("WebcastMemberMessage", parse_member),
    ("WebcastSocialMessage", parse_social),
    ("WebcastRoomUserSeqMessage", parse_room_user_seq),
    ("WebcastRoomStatsMessage", parse_room_stats),
    ("WebcastControlMessage", parse_control),
    ("WebcastFansclubMessage", ignore),
    ("WebcastRoomRankMessage", ignore),
    ("WebcastRoomMessage", ignore),
    ("WebcastRoomStreamAdaptationMessage", ignore),
]);

fn kind_for(payload_type: &str) -> u32 {
    PAYLOAD_TYPES
        .iter()
        .find_map(|(name, kind)| (*name == payload_type).then_some(*kind))
        .unwrap_or(KIND_UNKNOWN)
}

fn payload_type_for(kind: u32) -> &'static str {
    PAYLOAD_TYPES
        .iter()
        .find_map(|(name, k)| (*k == kind).then_some(*name))
        .unwrap_or_default()
}

/// `PushFrame` envelope layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct PushFrameSchema;

impl EnvelopeSchema for PushFrameSchema {
    fn parse(&self, body: &[u8]) -> std::result::Result<Envelope, FrameError> {
        let frame = pb::PushFrame::decode(body)?;
        Ok(Envelope {
            kind: kind_for(&frame.payload_type),
            compression: if frame.payload_encoding == "gzip" {
                CompressionMode::Gzip
            } else {
                CompressionMode::None
            },
            encryption: EncryptionMode::None,
            payload: Bytes::from(frame.payload),
            needs_ack: false,
            log_id: Some(frame.log_id),
            ack_context: None,
            timestamp_ms: None,
        })
    }

    fn seal(&self, envelope: &Envelope) -> Vec<u8> {
        pb::PushFrame {
            log_id: envelope.log_id.unwrap_or_default(),
            payload_type: payload_type_for(envelope.kind).to_string(),
            payload_encoding: match envelope.compression {
                CompressionMode::Gzip => "gzip".to_string(),
                CompressionMode::None => String::new(),
            },
            payload: envelope.payload.to_vec(),
            ..pb::PushFrame::default()
        }
        .encode_to_vec()
    }

    /// The ack flag lives inside the decompressed `Response`.
    fn finish(&self, envelope: &mut Envelope) -> std::result::Result<(), FrameError> {
        if envelope.kind == KIND_MSG {
            let hint = pb::AckHint::decode(envelope.payload.as_ref())?;
            envelope.needs_ack = hint.need_ack;
            if hint.need_ack {
                envelope.ack_context = Some(Bytes::from(hint.internal_ext.into_bytes()));
            }
        }
        Ok(())
    }
}

pub struct DouyinProtocol {
    codec: FrameCodec<PushFrameSchema>,
    endpoint: String,
    /// Device id presented as `user_unique_id`; stable for the protocol's
    /// lifetime so that signed and sent parameters agree.
    device_id: String,
}

impl DouyinProtocol {
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoint(DOUYIN_PUSH_ENDPOINT)
    }

    #[must_use]
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let device_id = rand::thread_rng()
            .gen_range(7_000_000_000_000_000_000_u64..7_400_000_000_000_000_000)
            .to_string();
        Self {
            codec: FrameCodec::new(PushFrameSchema, Framing::Message),
            endpoint: endpoint.into(),
            device_id,
        }
    }

    pub const fn codec(&self) -> &FrameCodec<PushFrameSchema> {
        &self.codec
    }

    fn query(&self, room_id: &str) -> Vec<(String, String)> {
        let internal_ext = format!(
            "internal_src:dim|wss_push_room_id:{room_id}|wss_push_did:{}|first_req_ms:0|fetch_time:0|seq:1|wss_info:0-0-0-0|",
            self.device_id
        );
        [
            ("app_name", "douyin_web"),
            ("version_code", "180800"),
            ("webcast_sdk_version", "1.0.14-beta.0"),
            ("update_version_code", "1.0.14-beta.0"),
            ("compress", "gzip"),
            ("device_platform", "web"),
            ("cookie_enabled", "true"),
            ("browser_language", "zh-CN"),
            ("browser_platform", "Win32"),
            ("browser_name", "Mozilla"),
            ("browser_online", "true"),
            ("tz_name", "Asia/Shanghai"),
            ("internal_ext", internal_ext.as_str()),
            ("host", "https://live.douyin.com"),
            ("aid", "6383"),
            ("live_id", "1"),
            ("did_rule", "3"),
            ("endpoint", "live_pc"),
            ("support_wrds", "1"),
            ("user_unique_id", self.device_id.as_str()),
            ("im_path", "/webcast/im/fetch/"),
            ("identity", "audience"),
            ("need_persist_msg_count", "15"),
            ("room_id", room_id),
            ("heartbeatDuration", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }
}

impl Default for DouyinProtocol {
    fn default() -> Self {
        Self::new()
    }
}

/// Random `msToken` cookie value.
fn ms_token() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut rng = rand::thread_rng();
    (0..182)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// `md5("k1=v1,k2=v2,...")` over [`SIGNED_PARAMS`]; missing keys sign as
/// empty values.
fn signature_digest(query: &[(String, String)]) -> String {
    let joined = SIGNED_PARAMS
        .iter()
        .map(|key| {
            let value = query
                .iter()
                .find_map(|(k, v)| (k == key).then_some(v.as_str()))
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("{:x}", md5::compute(joined.as_bytes()))
}

impl PlatformProtocol for DouyinProtocol {
    fn name(&self) -> &'static str {
        "douyin"
    }

    fn framing(&self) -> Framing {
        self.codec.framing()
    }

    fn default_heartbeat_interval(&self) -> Duration {
        HEARTBEAT_INTERVAL
    }

    fn sign_request(&self, session: &ResolvedSession) -> Option<SignRequest> {
        let query = self.query(&session.session_id);
        let digest = signature_digest(&query);
        Some(SignRequest {
            url: self.endpoint.clone(),
            query,
            digest: Some(digest),
        })
    }

    fn connect_request(&self, ctx: &SessionContext) -> Result<ConnectRequest> {
        let mut query = self.query(&ctx.session.session_id);
        if let Some(signature) = &ctx.signature {
            query.push(("signature".to_string(), signature.clone()));
        }
        let url = Url::parse_with_params(&self.endpoint, &query)
            .map_err(|e| Error::Config(format!("invalid push endpoint {}: {e}", self.endpoint)))?;

        let mut cookie = ctx.session.cookies.clone().unwrap_or_default();
        if !cookie.contains("msToken=") {
            if !cookie.is_empty() {
                cookie.push_str("; ");
            }
            cookie.push_str("msToken=");
            cookie.push_str(&ms_token());
        }

        Ok(ConnectRequest {
            url: url.into(),
            headers: vec![
                ("cookie".to_string(), cookie),
                ("user-agent".to_string(), USER_AGENT.to_string()),
            ],
        })
    }

    /// The room id travels in the URL; nothing is sent on entry.
    fn entry_frame(&self, _ctx: &SessionContext) -> Result<Option<Bytes>> {
        Ok(None)
    }

    /// The `hb` push frame rides in a websocket ping.
    fn heartbeat_frame(&self) -> std::result::Result<Keepalive, FrameError> {
        self.codec
            .encode_envelope(Envelope::new(KIND_HEARTBEAT, Bytes::new()))
            .map(Keepalive::Ping)
    }

    fn ack_frame(&self, envelope: &Envelope) -> std::result::Result<Option<Bytes>, FrameError> {
        if !envelope.needs_ack {
            return Ok(None);
        }
        let mut ack = Envelope::new(KIND_ACK, envelope.ack_context.clone().unwrap_or_default());
        ack.log_id = envelope.log_id;
        self.codec.encode_envelope(ack).map(Some)
    }

    fn decode_frame(&self, raw: &[u8]) -> std::result::Result<Envelope, FrameError> {
        self.codec.decode(raw)
    }

    fn classify(&self, envelope: &Envelope) -> FrameClass {
        match envelope.kind {
            KIND_MSG => FrameClass::Push,
            KIND_HEARTBEAT => FrameClass::HeartbeatAck,
            KIND_CLOSE => FrameClass::Closed,
            _ => FrameClass::Ignored,
        }
    }

    fn decode_messages(&self, envelope: &Envelope) -> Vec<DecodedMessage> {
        let response = match pb::Response::decode(envelope.payload.as_ref()) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "failed to decode push response");
                return Vec::new();
            }
        };

        response
            .messages_list
            .into_iter()
            .filter_map(|message| {
                let mut decoded = DISPATCH.dispatch(&message.method, &message.payload)?;
                if decoded.message_id.is_none() && message.msg_id != 0 {
                    decoded.message_id = Some(message.msg_id.to_string());
                }
                Some(decoded)
            })
            .collect()
    }
}

fn user_info(user: Option<&pb::User>) -> UserInfo {
    let Some(user) = user else {
        return UserInfo::default();
    };
    let id = if !user.id_str.is_empty() {
        user.id_str.clone()
    } else if user.id != 0 {
        user.id.to_string()
    } else {
        String::new()
    };
    UserInfo {
        id,
        nickname: user.nick_name.clone(),
        avatar: String::new(),
        gender: Some(user.gender),
    }
}

fn decoded(common: Option<&pb::Common>, body: MessageBody) -> DecodedMessage {
    let mut message = DecodedMessage::new(
        Discriminator::Method(common.map(|c| c.method.clone()).unwrap_or_default()),
        body,
    );
    if let Some(common) = common {
        message.message_id = (common.msg_id != 0).then(|| common.msg_id.to_string());
        message.timestamp_ms = (common.create_time != 0).then_some(common.create_time);
    }
    message
}

type ParseResult = std::result::Result<Option<DecodedMessage>, prost::DecodeError>;

fn parse_chat(payload: &[u8]) -> ParseResult {
    let msg = pb::ChatMessage::decode(payload)?;
    let body = MessageBody::Chat {
        user: user_info(msg.user.as_ref()),
        content: msg.content,
    };
    Ok(Some(decoded(msg.common.as_ref(), body)))
}

fn parse_emoji_chat(payload: &[u8]) -> ParseResult {
    let msg = pb::EmojiChatMessage::decode(payload)?;
    let body = MessageBody::Chat {
        user: user_info(msg.user.as_ref()),
        content: msg.default_content,
    };
    Ok(Some(decoded(msg.common.as_ref(), body)))
}

fn parse_gift(payload: &[u8]) -> ParseResult {
    let msg = pb::GiftMessage::decode(payload)?;
    let (gift_id, gift_name) = msg
        .gift
        .as_ref()
        .map(|gift| (gift.id, gift.name.clone()))
        .unwrap_or((msg.gift_id, String::new()));
    let count = if msg.combo_count > 0 {
        msg.combo_count
    } else {
        msg.repeat_count
    };
    let body = MessageBody::Gift {
        user: user_info(msg.user.as_ref()),
        gift_id,
        gift_name,
        count,
    };
    Ok(Some(decoded(msg.common.as_ref(), body)))
}

fn parse_like(payload: &[u8]) -> ParseResult {
    let msg = pb::LikeMessage::decode(payload)?;
    let body = MessageBody::Like {
        user: user_info(msg.user.as_ref()),
        count: msg.count,
        total: msg.total,
    };
    Ok(Some(decoded(msg.common.as_ref(), body)))
}

fn parse_member(payload: &[u8]) -> ParseResult {
    let msg = pb::MemberMessage::decode(payload)?;
    let body = MessageBody::Enter {
        user: user_info(msg.user.as_ref()),
        member_count: msg.member_count,
    };
    Ok(Some(decoded(msg.common.as_ref(), body)))
}

fn parse_social(payload: &[u8]) -> ParseResult {
    let msg = pb::SocialMessage::decode(payload)?;
    let body = MessageBody::Follow {
        user: user_info(msg.user.as_ref()),
        follow_count: msg.follow_count,
    };
    Ok(Some(decoded(msg.common.as_ref(), body)))
}

fn parse_room_user_seq(payload: &[u8]) -> ParseResult {
    let msg = pb::RoomUserSeqMessage::decode(payload)?;
    let body = MessageBody::RoomStats {
        online: u64::try_from(msg.total).ok(),
        total_viewers: (!msg.total_pv_for_anchor.is_empty()).then_some(msg.total_pv_for_anchor),
        display: None,
    };
    Ok(Some(decoded(msg.common.as_ref(), body)))
}

fn parse_room_stats(payload: &[u8]) -> ParseResult {
    let msg = pb::RoomStatsMessage::decode(payload)?;
    let body = MessageBody::RoomStats {
        online: None,
        total_viewers: None,
        display: (!msg.display_long.is_empty()).then_some(msg.display_long),
    };
    Ok(Some(decoded(msg.common.as_ref(), body)))
}

fn parse_control(payload: &[u8]) -> ParseResult {
    let msg = pb::ControlMessage::decode(payload)?;
    let status = if msg.status == CONTROL_STATUS_ENDED {
        ControlStatus::Ended
    } else {
        ControlStatus::Other(i64::from(msg.status))
    };
    Ok(Some(decoded(msg.common.as_ref(), MessageBody::Control { status })))
}

fn ignore(_payload: &[u8]) -> ParseResult {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::gzip;

    fn user(id: u64, nick: &str) -> pb::User {
        pb::User {
            id,
            nick_name: nick.to_string(),
            ..pb::User::default()
        }
    }

    fn common(method: &str, msg_id: u64) -> pb::Common {
        pb::Common {
            method: method.to_string(),
            msg_id,
            create_time: 1_721_106_114_633,
            ..pb::Common::default()
        }
    }

    fn entry(method: &str, payload: Vec<u8>) -> pb::Message {
        pb::Message {
            method: method.to_string(),
            payload,
            ..pb::Message::default()
        }
    }

    /// A gzip `msg` push frame carrying `messages`.
    fn push_frame(messages: Vec<pb::Message>, need_ack: bool) -> Vec<u8> {
        let response = pb::Response {
            messages_list: messages,
            internal_ext: "internal_src:pushserver|first_req_ms:1".to_string(),
            need_ack,
            ..pb::Response::default()
        };
        pb::PushFrame {
            log_id: 42,
            payload_type: "msg".to_string(),
            payload_encoding: "gzip".to_string(),
            payload: gzip(&response.encode_to_vec()).unwrap(),
            ..pb::PushFrame::default()
        }
        .encode_to_vec()
    }

    #[test]
    fn test_decode_push_frame_with_ack() {
        let protocol = DouyinProtocol::new();
        let raw = push_frame(Vec::new(), true);

        let envelope = protocol.decode_frame(&raw).unwrap();
        assert_eq!(protocol.classify(&envelope), FrameClass::Push);
        assert!(envelope.needs_ack);
        assert_eq!(envelope.log_id, Some(42));

        let ack = protocol.ack_frame(&envelope).unwrap().unwrap();
        let ack = pb::PushFrame::decode(ack.as_ref()).unwrap();
        assert_eq!(ack.payload_type, "ack");
        assert_eq!(ack.log_id, 42);
        assert_eq!(ack.payload, b"internal_src:pushserver|first_req_ms:1");
    }

    #[test]
    fn test_no_ack_when_not_requested() {
        let protocol = DouyinProtocol::new();
        let envelope = protocol.decode_frame(&push_frame(Vec::new(), false)).unwrap();
        assert!(!envelope.needs_ack);
        assert!(protocol.ack_frame(&envelope).unwrap().is_none());
    }

    #[test]
    fn test_dispatch_table_decodes_known_methods() {
        let chat = pb::ChatMessage {
            common: Some(common("WebcastChatMessage", 7001)),
            user: Some(user(11, "Alice")),
            content: "hello".to_string(),
        };
        let gift = pb::GiftMessage {
            common: Some(common("WebcastGiftMessage", 7002)),
            combo_count: 5,
            user: Some(user(12, "Bob")),
            gift: Some(pb::GiftStruct {
                id: 685,
                name: "小心心".to_string(),
                ..pb::GiftStruct::default()
            }),
            ..pb::GiftMessage::default()
        };
        let raw = push_frame(
            vec![
                entry("WebcastChatMessage", chat.encode_to_vec()),
                entry("WebcastUnheardOfMessage", vec![1, 2, 3]),
                entry("WebcastGiftMessage", gift.encode_to_vec()),
                entry("WebcastRoomRankMessage", Vec::new()),
            ],
            false,
        );

        let protocol = DouyinProtocol::new();
        let envelope = protocol.decode_frame(&raw).unwrap();
        let messages = protocol.decode_messages(&envelope);

        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0].discriminator,
            Discriminator::Method("WebcastChatMessage".into())
        );
        assert_eq!(messages[0].message_id.as_deref(), Some("7001"));
        assert_eq!(messages[0].timestamp_ms, Some(1_721_106_114_633));
        match &messages[0].body {
            MessageBody::Chat { user, content } => {
                assert_eq!(user.id, "11");
                assert_eq!(user.nickname, "Alice");
                assert_eq!(content, "hello");
            }
            other => panic!("unexpected body {other:?}"),
        }
        match &messages[1].body {
            MessageBody::Gift {
                gift_id,
                gift_name,
                count,
                ..
            } => {
                assert_eq!(*gift_id, 685);
                assert_eq!(gift_name, "小心心");
                assert_eq!(*count, 5);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_control_status_ended() {
        let control = pb::ControlMessage {
            common: None,
            status: CONTROL_STATUS_ENDED,
        };
        let messages = protocol_messages(vec![entry(
            "WebcastControlMessage",
            control.encode_to_vec(),
        )]);
        assert_eq!(
            messages[0].body,
            MessageBody::Control {
                status: ControlStatus::Ended
            }
        );
        assert_eq!(
            messages[0].discriminator,
            Discriminator::Method("WebcastControlMessage".into())
        );
    }

    #[test]
    fn test_malformed_message_is_skipped() {
        let chat = pb::ChatMessage {
            content: "still here".to_string(),
            ..pb::ChatMessage::default()
        };
        let messages = protocol_messages(vec![
            entry("WebcastChatMessage", vec![0x0a, 0xff]),
            entry("WebcastChatMessage", chat.encode_to_vec()),
        ]);
        assert_eq!(messages.len(), 1);
    }

    fn protocol_messages(messages: Vec<pb::Message>) -> Vec<DecodedMessage> {
        let protocol = DouyinProtocol::new();
        let envelope = protocol.decode_frame(&push_frame(messages, false)).unwrap();
        protocol.decode_messages(&envelope)
    }

    #[test]
    fn test_heartbeat_frame() {
        let Keepalive::Ping(frame) = DouyinProtocol::new().heartbeat_frame().unwrap() else {
            panic!("heartbeat must be sent as a ping");
        };
        let frame = pb::PushFrame::decode(frame.as_ref()).unwrap();
        assert_eq!(frame.payload_type, "hb");
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_signature_digest_covers_ordered_params() {
        let protocol = DouyinProtocol::new();
        let session = ResolvedSession::new("7392091211001140287");
        let request = protocol.sign_request(&session).unwrap();

        let expected = format!(
            "live_id=1,aid=6383,version_code=180800,webcast_sdk_version=1.0.14-beta.0,\
             room_id=7392091211001140287,sub_room_id=,sub_channel_id=,did_rule=3,\
             user_unique_id={},device_platform=web,device_type=,ac=,identity=audience",
            protocol.device_id
        );
        assert_eq!(
            request.digest.as_deref(),
            Some(format!("{:x}", md5::compute(expected.as_bytes())).as_str())
        );
    }

    #[test]
    fn test_connect_request_carries_signature_and_cookie() {
        let protocol = DouyinProtocol::new();
        let ctx = SessionContext {
            room: "live.douyin.com/123".into(),
            session: ResolvedSession {
                session_id: "7392091211001140287".into(),
                cookies: Some("ttwid=abc".into()),
            },
            signature: Some("sig-token".into()),
            reconnect_count: 0,
        };

        let request = protocol.connect_request(&ctx).unwrap();
        let url = Url::parse(&request.url).unwrap();
        let pairs: Vec<_> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("room_id".into(), "7392091211001140287".into())));
        assert_eq!(pairs.last(), Some(&("signature".into(), "sig-token".into())));

        let cookie = &request.headers[0].1;
        assert!(cookie.starts_with("ttwid=abc; msToken="));
        assert_eq!(cookie.len(), "ttwid=abc; msToken=".len() + 182);
        assert!(protocol.entry_frame(&ctx).unwrap().is_none());
    }
}
