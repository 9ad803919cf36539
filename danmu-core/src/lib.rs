// danmu-core - Live-chat push protocol client engine
//
// Layers, inbound:
// - transport/   - byte-message connections (websocket, optional CONNECT proxy)
// - codec/       - framing, decryption, decompression into envelopes
// - platform/    - per-platform envelope schema and message decoding
// - decoder/     - decoded message model, dispatch table, field walker
// - normalizer   - platform-independent events
// - buffer       - bounded FIFO drained by the caller
//
// client.rs drives all of it and owns the reconnection policy.

pub mod buffer;
pub mod client;
pub mod codec;
pub mod collaborator;
pub mod config;
pub mod decoder;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod normalizer;
pub mod platform;
pub mod transport;
pub mod util;

// Re-exports for convenience
pub use buffer::{EventBuffer, DEFAULT_BUFFER_CAPACITY};
pub use client::{ConnectionState, LiveChatClient, RoomSnapshot, TerminalStatus};
pub use codec::{FrameCodec, FrameError};
pub use collaborator::{
    RequestSigner, ResolvedSession, SessionResolver, SignRequest, StaticSession, StaticSigner,
};
pub use config::{ClientConfig, Config, LikePolicy};
pub use decoder::{DecodedMessage, MessageBody};
pub use error::{Error, Result};
pub use heartbeat::{HeartbeatScheduler, Keepalive};
pub use logging::init_logging;
pub use normalizer::{EventKind, NormalizedEvent, RoomObserver, RoomStats};
pub use platform::{DouyinProtocol, KuaishouProtocol, PlatformProtocol};
pub use transport::{Transport, WebSocketTransport};
