//! The Peer Exchange component (spec.md §4.D): wire framing for the peer
//! protocol plus the per-connection state machine that turns it into the
//! `Available`/`Want`/`Fragment` event interface.

pub mod codec;
pub mod message;
pub mod session;

pub use message::{Block, ExtensionBits, Handshake, Message, MessageId, PROTOCOL_STRING};
pub use session::{Event, PeerSession, Status};
