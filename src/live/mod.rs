//! Real-time voice sessions with the Gemini Live service

pub mod protocol;
pub mod transport;

pub use protocol::{LiveSetup, ServerMessage};
pub use transport::{GeminiLiveConnector, LiveConnection, LiveConnector, LiveSender, TransportError, TransportEvent};
