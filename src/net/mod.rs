//! TCP protocol for interactive clients

pub mod codec;
pub mod handler;
pub mod protocol;
pub mod registry;

pub use handler::serve;
