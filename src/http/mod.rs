//! Passive monitor endpoint

pub mod routes;

pub use routes::build_router;
