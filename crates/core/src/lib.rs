// Core types and functionality for Waypoint workflow graphs

pub mod error;
pub mod state;
pub mod steps;
pub mod storage;
pub mod types;
pub mod workflow;

pub use error::WaypointError;
pub use types::*;
