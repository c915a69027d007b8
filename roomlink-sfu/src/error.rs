use thiserror::Error;

use crate::engine::EngineError;
use crate::throttle::ThrottleError;

/// Errors reported back to a peer as a signaling error response
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Peer not yet joined")]
    NotJoined,

    #[error("Peer already joined")]
    AlreadyJoined,

    #[error("Transport with id \"{0}\" not found")]
    TransportNotFound(String),

    #[error("Producer with id \"{0}\" not found")]
    ProducerNotFound(String),

    #[error("Consumer with id \"{0}\" not found")]
    ConsumerNotFound(String),

    #[error("DataProducer with id \"{0}\" not found")]
    DataProducerNotFound(String),

    #[error("DataConsumer with id \"{0}\" not found")]
    DataConsumerNotFound(String),

    #[error("unknown request.method \"{0}\"")]
    UnknownMethod(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Peer closed")]
    PeerClosed,

    #[error("Operation NOT allowed. Invalid secret.")]
    Forbidden,

    #[error("Network throttle failed: {0}")]
    Throttle(String),

    #[error("{context}: {source}")]
    Engine {
        context: String,
        #[source]
        source: EngineError,
    },
}

impl ProtocolError {
    pub fn engine(context: impl Into<String>) -> impl FnOnce(EngineError) -> Self {
        let context = context.into();
        move |source| Self::Engine { context, source }
    }

    /// Error code carried in the response frame
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::NotJoined | Self::AlreadyJoined | Self::InvalidRequest(_) | Self::Malformed(_) => 400,
            Self::Forbidden => 403,
            Self::TransportNotFound(_)
            | Self::ProducerNotFound(_)
            | Self::ConsumerNotFound(_)
            | Self::DataProducerNotFound(_)
            | Self::DataConsumerNotFound(_) => 404,
            Self::UnknownMethod(_) | Self::PeerClosed | Self::Throttle(_) | Self::Engine { .. } => 500,
        }
    }
}

impl From<ThrottleError> for ProtocolError {
    fn from(err: ThrottleError) -> Self {
        match err {
            ThrottleError::Forbidden => Self::Forbidden,
            ThrottleError::Backend(message) => Self::Throttle(message),
        }
    }
}

/// Reasons a WebSocket connection is refused before it becomes a peer
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Missing connection parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Room {room_id} is full ({max_peers} peers)")]
    RoomFull { room_id: String, max_peers: u32 },

    #[error("Room {0} is closing")]
    RoomClosed(String),

    #[error("Room unavailable: {0}")]
    Unavailable(#[from] SessionError),
}

/// Errors of the HTTP-facing room and broadcaster operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Room with id \"{0}\" not found")]
    RoomNotFound(String),

    #[error("Room with id \"{0}\" already exists")]
    RoomAlreadyExists(String),

    #[error("Room {0} is closed")]
    RoomClosed(String),

    #[error("Broadcaster with id \"{0}\" not found")]
    BroadcasterNotFound(String),

    #[error("Broadcaster with id \"{0}\" already exists")]
    BroadcasterAlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No media workers available")]
    NoWorkers,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{context}: {source}")]
    Engine {
        context: String,
        #[source]
        source: EngineError,
    },
}

impl SessionError {
    pub fn engine(context: impl Into<String>) -> impl FnOnce(EngineError) -> Self {
        let context = context.into();
        move |source| Self::Engine { context, source }
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
