//! Call signaling and media negotiation for XMPP (Jingle) voice/video calls.
//!
//! This module establishes, negotiates and tears down 1:1 calls. An outgoing
//! call may be offered to several endpoints of the remote party at once and
//! converges on the first one that answers.
//!
//! # Architecture
//!
//! - [`CallManager`]: entry point; places and reports calls, checks device
//!   permissions and routes inbound signals
//! - [`CallContext`]: per-account registry of live calls and sessions
//! - [`CallHandle`]: front-end of one call, which runs as an actor task
//! - [`SignalingSession`]: negotiation with a single remote endpoint
//! - [`ConnectionAdapter`] & [`ConnectionEventSink`]: boundary to the media
//!   engine's peer transport
//! - [`CallState`] & [`SessionState`]: the two state machines
//!
//! # Collaborators
//!
//! The XMPP stack, the media engine and the UI are external. They plug in
//! through the traits in [`traits`](self::traits): capability and relay
//! discovery, media devices, the signaling transport, the peer connection
//! factory and the presentation delegate.

mod adapter;
mod call;
mod context;
mod error;
mod manager;
mod session;
mod signaling;
mod state;
pub mod traits;


pub use adapter::{ConnectionAdapter, ConnectionEvent, ConnectionEventSink, IceConnectionState, ice_servers};
pub use call::{CallHandle, CallInfo, CallSnapshot};
pub use context::CallContext;
pub use error::CallError;
pub use manager::{CallManager, CallManagerConfig, CallOptions};
pub use session::SignalingSession;
pub use signaling::{
    DescriptionKind, InboundSignal, JingleAction, RemoteDescription, SessionKey, SignalPayload,
};
pub use state::{CallState, CallTransition, InvalidTransition, SessionState, SessionTransition};
