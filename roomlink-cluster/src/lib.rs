//! Placement side of roomlink
//!
//! The balancer keeps a capacity ledger of media servers, places new rooms
//! on the server with the most free capacity and checks servers for health.

pub mod discovery;
pub mod error;
pub mod ledger;

pub use discovery::{
    HealthMonitor, HealthCheckConfig, HttpRoomForwarder, PlaceRoomRequest, Placement, PlacementScheduler,
    RoomForwarder,
};
pub use error::{Error, Result};
pub use ledger::{CapacityLedger, MemoryLedger, RedisLedger, RoomLedgerEntry, ServerRecord};
