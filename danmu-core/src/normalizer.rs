//! Maps decoded platform messages onto the platform-independent event
//! record handed to consumers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::LikePolicy;
use crate::decoder::{ControlStatus, DecodedMessage, MessageBody, UserInfo};

pub const DEFAULT_COLOR: &str = "#FFFFFF";
pub const GIFT_COLOR: &str = "#FF0000";
pub const SOCIAL_COLOR: &str = "#00FF00";
pub const DEFAULT_FONT_SIZE: u32 = 25;
pub const SMALL_FONT_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Danmaku,
    Gift,
    Enter,
    Follow,
    Like,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Danmaku => "danmaku",
            Self::Gift => "gift",
            Self::Enter => "enter",
            Self::Follow => "follow",
            Self::Like => "like",
        }
    }
}

/// Consumer-facing event. `content` and `username` are never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    /// Seconds since the client started, rounded to milliseconds.
    pub relative_time: f64,
    pub user_id: String,
    pub username: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub color: String,
    pub font_size: u32,
    pub platform: String,
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Room-level figures carried by stats messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub online: Option<u64>,
    pub total_viewers: Option<String>,
    pub display: Option<String>,
}

/// Receives the side effects of messages that produce no event.
pub trait RoomObserver: Send + Sync {
    fn on_room_stats(&self, _stats: &RoomStats) {}

    fn on_stream_ended(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RoomObserver for NoopObserver {}

#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub platform: String,
    pub room_id: String,
    /// Client start time, in milliseconds since the epoch.
    pub started_at_ms: u64,
    pub like_policy: LikePolicy,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    context: NormalizeContext,
}

impl Normalizer {
    #[must_use]
    pub const fn new(context: NormalizeContext) -> Self {
        Self { context }
    }

    pub const fn context(&self) -> &NormalizeContext {
        &self.context
    }

    /// Normalize one message. Control and stats messages are reported to
    /// `observer` and never produce an event.
    pub fn normalize(
        &self,
        message: DecodedMessage,
        observer: &dyn RoomObserver,
    ) -> Option<NormalizedEvent> {
        let timestamp_ms = message.timestamp_ms.unwrap_or_else(now_millis);
        let message_id = message.message_id;

        let draft = match message.body {
            MessageBody::Chat { user, content } => {
                if content.trim().is_empty() {
                    return None;
                }
                Draft::new(user, content, EventKind::Danmaku, DEFAULT_COLOR, DEFAULT_FONT_SIZE)
            }
            MessageBody::Gift {
                user,
                gift_id,
                gift_name,
                count,
            } => {
                let count = count.max(1);
                let content = format!("赠送 {gift_name} x{count}");
                let mut draft =
                    Draft::new(user, content, EventKind::Gift, GIFT_COLOR, DEFAULT_FONT_SIZE);
                draft.extra.insert("gift_name".into(), gift_name.into());
                draft.extra.insert("gift_count".into(), count.into());
                if gift_id != 0 {
                    draft.extra.insert("gift_id".into(), gift_id.to_string().into());
                }
                draft
            }
            MessageBody::Like { user, count, total } => {
                if self.context.like_policy == LikePolicy::Drop {
                    return None;
                }
                let count = count.max(1);
                let content = format!("点了{count}个赞");
                let mut draft =
                    Draft::new(user, content, EventKind::Like, DEFAULT_COLOR, SMALL_FONT_SIZE);
                draft.extra.insert("like_count".into(), count.into());
                if total > 0 {
                    draft.extra.insert("like_total".into(), total.into());
                }
                draft
            }
            MessageBody::Enter { user, member_count } => {
                let gender = user.gender;
                let mut draft = Draft::new(
                    user,
                    "进入直播间".to_string(),
                    EventKind::Enter,
                    SOCIAL_COLOR,
                    SMALL_FONT_SIZE,
                );
                if let Some(gender) = gender {
                    draft.extra.insert("gender".into(), gender.into());
                }
                if member_count > 0 {
                    draft.extra.insert("member_count".into(), member_count.into());
                }
                draft
            }
            MessageBody::Follow { user, follow_count } => {
                let mut draft = Draft::new(
                    user,
                    "关注了主播".to_string(),
                    EventKind::Follow,
                    SOCIAL_COLOR,
                    SMALL_FONT_SIZE,
                );
                if follow_count > 0 {
                    draft.extra.insert("follow_count".into(), follow_count.into());
                }
                draft
            }
            MessageBody::RoomStats {
                online,
                total_viewers,
                display,
            } => {
                observer.on_room_stats(&RoomStats {
                    online,
                    total_viewers,
                    display,
                });
                return None;
            }
            MessageBody::Control { status } => {
                if status == ControlStatus::Ended {
                    observer.on_stream_ended();
                }
                return None;
            }
            MessageBody::Unknown => return None,
        };

        self.finish(draft, message_id, timestamp_ms)
    }

    fn finish(
        &self,
        draft: Draft,
        message_id: Option<String>,
        timestamp_ms: u64,
    ) -> Option<NormalizedEvent> {
        let Draft {
            user,
            content,
            kind,
            color,
            font_size,
            extra,
        } = draft;

        let username = if user.nickname.is_empty() {
            user.id.clone()
        } else {
            user.nickname
        };
        if username.is_empty() {
            tracing::trace!(kind = kind.as_str(), "dropping event without user identity");
            return None;
        }

        let id = message_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}_{timestamp_ms}", user.id));

        Some(NormalizedEvent {
            id,
            timestamp_ms,
            relative_time: relative_seconds(timestamp_ms, self.context.started_at_ms),
            user_id: user.id,
            username,
            content,
            kind,
            color: color.to_string(),
            font_size,
            platform: self.context.platform.clone(),
            room_id: self.context.room_id.clone(),
            extra,
        })
    }
}

struct Draft {
    user: UserInfo,
    content: String,
    kind: EventKind,
    color: &'static str,
    font_size: u32,
    extra: Map<String, Value>,
}

impl Draft {
    fn new(
        user: UserInfo,
        content: String,
        kind: EventKind,
        color: &'static str,
        font_size: u32,
    ) -> Self {
        Self {
            user,
            content,
            kind,
            color,
            font_size,
            extra: Map::new(),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn relative_seconds(timestamp_ms: u64, started_at_ms: u64) -> f64 {
    let seconds = (timestamp_ms as f64 - started_at_ms as f64) / 1000.0;
    (seconds * 1000.0).round() / 1000.0
}

#[must_use]
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
