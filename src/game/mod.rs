//! Sailboat simulation modules

pub mod autopilot;
pub mod boat;
pub mod forces;
pub mod map;
pub mod physics;
pub mod session;
pub mod simulation;
pub mod snapshot;
pub mod wind;

pub use simulation::{
    AdminError, AuthError, Command, JoinAccepted, Simulation, SimulationHandle, SimulationRunner,
};
pub use snapshot::{Snapshot, SnapshotServer};
