//! Server health tracking and room placement

pub mod health_monitor;
pub mod scheduler;

pub use health_monitor::{HealthMonitor, HealthCheckConfig};
pub use scheduler::{
    ForwardRoomBody, HttpRoomForwarder, PlaceRoomRequest, Placement, PlacementScheduler, RoomForwarder,
};
