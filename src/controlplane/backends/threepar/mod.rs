//! SAN array backend (3PAR WSAPI)

pub mod api;
pub mod client;
pub mod driver;
pub mod types;

pub use client::{DelayRange, SanClient, SanClientConfig};
pub use driver::ThreeParDriver;
