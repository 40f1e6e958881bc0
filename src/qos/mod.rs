//! QoS assignment
//!
//! - [`curve`]: capacity curve and the per-instance specification cache
//! - [`engine`]: volume-set based rule and group allocation

pub mod curve;
pub mod engine;

pub use curve::{capacity_gb, limits_for, QosLimits, SpecCache};
pub use engine::{QosEngine, QosRule, QosTarget};
