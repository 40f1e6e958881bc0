//! Object-storage (RBD) backend
//!
//! Disks and images are RBD images in the `disk` and `image` pools of one
//! cluster per disk category.

pub mod cli;
pub mod cluster;
pub mod driver;
pub mod images;
pub mod memory;

pub use cli::{RbdCli, RbdCliConfig};
pub use cluster::{Pool, RbdCluster};
pub use driver::{CephClusterConfig, CephDriver};
pub use memory::MemoryRbdCluster;
