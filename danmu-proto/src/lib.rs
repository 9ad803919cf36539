//! Danmu Protocol Definitions
//!
//! Protobuf messages spoken by the supported live-chat push services.
//! The schemas are declared by hand with `prost` derives, so building the
//! workspace does not require `protoc`.

// Webcast push service (fixed schema, method-name dispatch)
pub mod douyin;

// Live socket service (outer frame only; feed payloads are walked dynamically)
pub mod kuaishou;
