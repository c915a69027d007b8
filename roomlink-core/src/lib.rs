pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod notification;

pub use config::Config;
pub use error::{Error, Result};
pub use notification::{NotificationSink, PeerEvent, PeerEventKind};
