//! Live socket outer frame and client-originated payloads.
//!
//! Server feed payloads are not declared here: their layout drifts between
//! releases, so they are walked by field number instead.

/// Payload type discriminators carried in [`SocketMessage::payload_type`].
pub mod payload_type {
    pub const CS_HEARTBEAT: i32 = 1;
    pub const CS_USER_EXIT: i32 = 2;
    pub const CS_ACK: i32 = 3;
    pub const SC_HEARTBEAT_ACK: i32 = 101;
    pub const SC_ERROR: i32 = 103;
    pub const CS_ENTER_ROOM: i32 = 200;
    pub const SC_ENTER_ROOM_ACK: i32 = 300;
    pub const SC_FEED_PUSH: i32 = 310;
    pub const SC_LIVE_CLOSED: i32 = 340;
}

/// Values of [`SocketMessage::compression_type`].
pub mod compression_type {
    pub const NONE: i32 = 1;
    pub const GZIP: i32 = 2;
    pub const AES: i32 = 3;
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SocketMessage {
    #[prost(int32, tag = "1")]
    pub payload_type: i32,
    #[prost(int32, tag = "2")]
    pub compression_type: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub timestamp: u64,
    #[prost(uint64, optional, tag = "5")]
    pub log_id: ::core::option::Option<u64>,
    #[prost(bool, tag = "6")]
    pub need_ack: bool,
    #[prost(int32, tag = "7")]
    pub encryption_type: i32,
    #[prost(bytes = "vec", tag = "8")]
    pub ack_context: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CsWebEnterRoom {
    #[prost(string, tag = "1")]
    pub token: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub live_stream_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub reconnect_count: u32,
    #[prost(uint32, tag = "4")]
    pub last_error_code: u32,
    #[prost(string, tag = "5")]
    pub exp_tag: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub attach: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub page_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CsWebHeartbeat {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
}

/// Acknowledges a push that requested confirmation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CsWebAck {
    #[prost(uint64, tag = "1")]
    pub log_id: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub ack_context: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScWebError {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub msg: ::prost::alloc::string::String,
}
