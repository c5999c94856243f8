//! Data directory persistence

pub mod files;

pub use files::{Contact, FileStore, LoadedSimulation, PersistenceError, SimFile};

#[cfg(test)]
pub(crate) use files::fixtures;
