//! Roomlink media session server
//!
//! Hosts rooms of WebRTC participants on top of a media-routing engine.
//!
//! ## Architecture
//!
//! - **`SessionRegistry`**: room id to live `Session`, worker placement
//! - **`Session`**: one router, its peers and broadcasters, speaker observers
//! - **`Peer`**: a WebSocket participant and the engine objects it owns
//! - **`Broadcaster`**: an HTTP-driven participant without a channel
//! - **`NetworkThrottle`**: the process-wide network impairment cell
//!
//! Peers talk the request/response/notification protocol in [`protocol`];
//! [`connection::serve_peer`] drives one peer's inbound stream.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = SessionRegistry::new(context, workers)?;
//! let (session, peer) = registry.connect_peer(&room_id, peer_id, None, channel).await?;
//! serve_peer(session, peer, inbound).await;
//! ```

pub mod broadcaster;
pub mod channel;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
mod fanout;
pub mod manager;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod throttle;
pub mod types;

pub use broadcaster::Broadcaster;
pub use channel::{ChannelError, PeerChannel};
pub use config::SfuConfig;
pub use connection::serve_peer;
pub use error::{AdmissionError, ProtocolError, SessionError, SessionResult};
pub use manager::{CreateRoomRequest, RegistryStats, RoomCreated, SessionRegistry};
pub use peer::Peer;
pub use session::{Session, SessionContext, SessionOptions, SessionState};
pub use throttle::NetworkThrottle;
pub use types::{BroadcasterId, MediaKind, PeerId, RoomId};
