//! Webcast push frame and per-method payload messages.

/// Outer websocket frame. `payload` is gzip-compressed when
/// `payload_encoding == "gzip"`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushFrame {
    #[prost(uint64, tag = "1")]
    pub seq_id: u64,
    #[prost(uint64, tag = "2")]
    pub log_id: u64,
    #[prost(uint64, tag = "3")]
    pub service: u64,
    #[prost(uint64, tag = "4")]
    pub method: u64,
    #[prost(message, repeated, tag = "5")]
    pub headers_list: ::prost::alloc::vec::Vec<HeadersList>,
    #[prost(string, tag = "6")]
    pub payload_encoding: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub payload_type: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "8")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeadersList {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}

/// Decompressed body of a `msg` push frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(message, repeated, tag = "1")]
    pub messages_list: ::prost::alloc::vec::Vec<Message>,
    #[prost(string, tag = "2")]
    pub cursor: ::prost::alloc::string::String,
    #[prost(uint64, tag = "3")]
    pub fetch_interval: u64,
    #[prost(uint64, tag = "4")]
    pub now: u64,
    #[prost(string, tag = "5")]
    pub internal_ext: ::prost::alloc::string::String,
    #[prost(uint32, tag = "6")]
    pub fetch_type: u32,
    #[prost(uint64, tag = "8")]
    pub heartbeat_duration: u64,
    #[prost(bool, tag = "9")]
    pub need_ack: bool,
    #[prost(string, tag = "10")]
    pub push_server: ::prost::alloc::string::String,
}

/// The ack-relevant subset of [`Response`], read without decoding the
/// message list.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AckHint {
    #[prost(string, tag = "5")]
    pub internal_ext: ::prost::alloc::string::String,
    #[prost(bool, tag = "9")]
    pub need_ack: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(string, tag = "1")]
    pub method: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, tag = "3")]
    pub msg_id: i64,
    #[prost(int32, tag = "4")]
    pub msg_type: i32,
    #[prost(int64, tag = "5")]
    pub offset: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Common {
    #[prost(string, tag = "1")]
    pub method: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub msg_id: u64,
    #[prost(uint64, tag = "3")]
    pub room_id: u64,
    #[prost(uint64, tag = "4")]
    pub create_time: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub short_id: u64,
    #[prost(string, tag = "3")]
    pub nick_name: ::prost::alloc::string::String,
    #[prost(uint32, tag = "4")]
    pub gender: u32,
    #[prost(string, tag = "1028")]
    pub id_str: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
    #[prost(message, optional, tag = "1")]
    pub common: ::core::option::Option<Common>,
    #[prost(message, optional, tag = "2")]
    pub user: ::core::option::Option<User>,
    #[prost(string, tag = "3")]
    pub content: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmojiChatMessage {
    #[prost(message, optional, tag = "1")]
    pub common: ::core::option::Option<Common>,
    #[prost(message, optional, tag = "2")]
    pub user: ::core::option::Option<User>,
    #[prost(int64, tag = "3")]
    pub emoji_id: i64,
    #[prost(string, tag = "5")]
    pub default_content: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GiftStruct {
    #[prost(string, tag = "2")]
    pub describe: ::prost::alloc::string::String,
    #[prost(uint64, tag = "5")]
    pub id: u64,
    #[prost(bool, tag = "10")]
    pub combo: bool,
    #[prost(uint32, tag = "12")]
    pub diamond_count: u32,
    #[prost(string, tag = "16")]
    pub name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GiftMessage {
    #[prost(message, optional, tag = "1")]
    pub common: ::core::option::Option<Common>,
    #[prost(uint64, tag = "2")]
    pub gift_id: u64,
    #[prost(uint64, tag = "4")]
    pub group_count: u64,
    #[prost(uint64, tag = "5")]
    pub repeat_count: u64,
    #[prost(uint64, tag = "6")]
    pub combo_count: u64,
    #[prost(message, optional, tag = "7")]
    pub user: ::core::option::Option<User>,
    #[prost(message, optional, tag = "8")]
    pub to_user: ::core::option::Option<User>,
    #[prost(uint32, tag = "9")]
    pub repeat_end: u32,
    #[prost(message, optional, tag = "15")]
    pub gift: ::core::option::Option<GiftStruct>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LikeMessage {
    #[prost(message, optional, tag = "1")]
    pub common: ::core::option::Option<Common>,
    #[prost(uint64, tag = "2")]
    pub count: u64,
    #[prost(uint64, tag = "3")]
    pub total: u64,
    #[prost(message, optional, tag = "5")]
    pub user: ::core::option::Option<User>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberMessage {
    #[prost(message, optional, tag = "1")]
    pub common: ::core::option::Option<Common>,
    #[prost(message, optional, tag = "2")]
    pub user: ::core::option::Option<User>,
    #[prost(uint64, tag = "3")]
    pub member_count: u64,
    #[prost(uint64, tag = "10")]
    pub action: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SocialMessage {
    #[prost(message, optional, tag = "1")]
    pub common: ::core::option::Option<Common>,
    #[prost(message, optional, tag = "2")]
    pub user: ::core::option::Option<User>,
    #[prost(uint64, tag = "3")]
    pub share_type: u64,
    #[prost(uint64, tag = "4")]
    pub action: u64,
    #[prost(uint64, tag = "6")]
    pub follow_count: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomUserSeqMessage {
    #[prost(message, optional, tag = "1")]
    pub common: ::core::option::Option<Common>,
    #[prost(int64, tag = "3")]
    pub total: i64,
    #[prost(string, tag = "4")]
    pub pop_str: ::prost::alloc::string::String,
    #[prost(int64, tag = "7")]
    pub total_user: i64,
    #[prost(string, tag = "11")]
    pub total_pv_for_anchor: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomStatsMessage {
    #[prost(message, optional, tag = "1")]
    pub common: ::core::option::Option<Common>,
    #[prost(string, tag = "2")]
    pub display_short: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub display_long: ::prost::alloc::string::String,
    #[prost(int64, tag = "5")]
    pub display_value: i64,
    #[prost(int64, tag = "9")]
    pub total: i64,
}

/// `status == 3` signals that the broadcast has ended.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlMessage {
    #[prost(message, optional, tag = "1")]
    pub common: ::core::option::Option<Common>,
    #[prost(int32, tag = "2")]
    pub status: i32,
}
