//! Platform-agnostic protocol model for XMPP (Jingle) calls.
//!
//! Nothing in this crate performs I/O: it holds the addressing, session
//! description, candidate and capability types that the runtime crate
//! exchanges with the signaling channel and the media engine.

pub mod candidate;
pub mod features;
pub mod jid;
pub mod sdp;
pub mod types;

pub use candidate::{Candidate, CandidateType};
pub use jid::{Jid, JidError};
pub use sdp::{SdpError, SessionDescription};
