//! Default collaborators for the live-chat client: room discovery over HTTP
//! and request signing through an external script runtime.

pub mod douyin;
pub mod error;
pub mod script;

pub use douyin::{extract_room_id, DouyinRoomResolver, DOUYIN_LIVE_BASE};
pub use error::ProviderError;
pub use script::ScriptSigner;
