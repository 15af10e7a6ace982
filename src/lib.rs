// fix-engine: FIX 4.4 session-layer protocol engine.
// Exposes modules for integration testing; re-exports the pieces an
// embedding application actually needs (`Engine`, `EngineConfig`, `EngineError`).

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;

pub use config::{load_config_from_path, load_config_from_str, EngineConfig, Role};
pub use connection::{ConnectionHandler, ConnectionState, HandlerRole, Transport};
pub use engine::{ConnectionId, Engine};
pub use error::EngineError;

pub use fix_codec::{Codec, CodecError};
pub use fix_journal::{Direction, JournalError, Journaler};
pub use fix_message::Message;
pub use fix_protocol::{msgtype, tags, ProtocolDictionary, Tag, BEGIN_STRING};
pub use fix_session::Session;
