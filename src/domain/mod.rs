//! Domain layer
//!
//! Entities, job request payloads and the ports adapters implement.

pub mod model;
pub mod ports;
pub mod requests;

pub use model::*;
pub use ports::*;
pub use requests::*;
