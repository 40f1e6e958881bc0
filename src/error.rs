//! Error types for the EBS orchestrator
//!
//! Provides structured error types for the SAN and RBD protocol clients,
//! QoS assignment, the orchestration layer and the job dispatch pipeline.

use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // SAN Not-Found / Idempotency Conditions
    // =========================================================================
    #[error("Volume does not exist: {name}")]
    VolumeNotFound { name: String },

    #[error("QoS rule does not exist: {name}")]
    QosRuleNotFound { name: String },

    #[error("QoS rule already exists: {name}")]
    QosRuleExists { name: String },

    #[error("Volume set does not exist: {name}")]
    VolumeSetNotFound { name: String },

    #[error("Volume {volume} is not a member of set {set}")]
    VolumeNotInSet { set: String, volume: String },

    #[error("Volume {volume} is already a member of set {set}")]
    VolumeAlreadyInSet { set: String, volume: String },

    #[error("Image not found: {name}")]
    ImageNotFound { name: String },

    #[error("Snapshot not found: {name}")]
    SnapshotNotFound { name: String },

    // =========================================================================
    // SAN Protocol Errors
    // =========================================================================
    #[error("SAN request failed with HTTP {status}: code {code} - {desc}")]
    San { status: u16, code: i64, desc: String },

    #[error("SAN array still busy after {attempts} attempts")]
    SanBusy { attempts: u32 },

    #[error("SAN session could not be re-established after {attempts} attempts")]
    SanSessionExpired { attempts: u32 },

    #[error("SAN task {task_id} failed")]
    SanTaskFailed { task_id: i64 },

    #[error("SAN task {task_id} still running after {elapsed_ms} ms")]
    SanTaskTimeout { task_id: i64, elapsed_ms: u64 },

    #[error("SAN cluster not configured: {cluster_id}")]
    SanClusterNotFound { cluster_id: String },

    // =========================================================================
    // RBD Errors
    // =========================================================================
    #[error("RBD command failed: {command} - {reason}")]
    RbdCommand { command: String, reason: String },

    #[error("RBD object already exists: {name}")]
    RbdExists { name: String },

    #[error("No RBD cluster configured for category: {category}")]
    RbdClusterNotConfigured { category: String },

    #[error("Cross-cluster copy unavailable: {source_category} -> {dest_category}")]
    CrossClusterCopyUnavailable {
        source_category: String,
        dest_category: String,
    },

    // =========================================================================
    // QoS Errors
    // =========================================================================
    #[error("Invalid disk size for QoS: {size_gb} GiB")]
    InvalidSize { size_gb: u64 },

    #[error("No disk specification for instance code: {code}")]
    InvalidInstanceCode { code: String },

    #[error("No QoS level covers capacity {capacity_gb} GiB")]
    QosLevelNotFound { capacity_gb: u64 },

    // =========================================================================
    // Data / Consistency Errors
    // =========================================================================
    #[error("Disk not found: {disk_id}")]
    DiskNotFound { disk_id: String },

    #[error("Invalid export for disk {disk_id} on {cvk_name}")]
    InvalidExport { disk_id: String, cvk_name: String },

    #[error("Attach information does not exist for disk {disk_id}")]
    AttachInformationNotExists { disk_id: String },

    #[error("Unsupported storage type: {0}")]
    UnsupportedStorageType(String),

    #[error("Disk {disk_id} is busy in state {state}")]
    DiskBusy { disk_id: String, state: String },

    #[error("Disk {disk_id} was mapped on the placeholder LUN again on {cvk_name}")]
    SentinelLun { disk_id: String, cvk_name: String },

    #[error("Backend succeeded but state was not recorded for {disk_id}: {reason}")]
    Inconsistent { disk_id: String, reason: String },

    // =========================================================================
    // Dispatch Errors
    // =========================================================================
    #[error("Job decode failed for action {action}: {reason}")]
    JobDecode { action: String, reason: String },

    #[error("Job {action} timed out after {secs}s")]
    JobTimeout { action: String, secs: u64 },

    #[error("Queue error: {0}")]
    Queue(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Notification failed: {endpoint} - {reason}")]
    Notification { endpoint: String, reason: String },

    // =========================================================================
    // Transport / Parse Errors
    // =========================================================================
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy used by the orchestration layer to decide
/// retry versus terminal versus ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Benign on delete/remove paths
    NotFound,
    /// Backend temporarily unavailable, retrying may succeed
    Transient,
    /// Backend rejected the operation
    Terminal,
    /// Surfaced to the request layer, never retried
    Consistency,
    /// Persistence, queue, transport or parse failures
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Terminal => write!(f, "terminal"),
            ErrorKind::Consistency => write!(f, "consistency"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::VolumeNotFound { .. }
            | Error::QosRuleNotFound { .. }
            | Error::VolumeSetNotFound { .. }
            | Error::VolumeNotInSet { .. }
            | Error::ImageNotFound { .. }
            | Error::SnapshotNotFound { .. } => ErrorKind::NotFound,

            Error::SanBusy { .. }
            | Error::SanSessionExpired { .. }
            | Error::Http(_)
            | Error::JobTimeout { .. }
            | Error::SanTaskTimeout { .. }
            | Error::SentinelLun { .. } => ErrorKind::Transient,

            Error::San { .. }
            | Error::SanTaskFailed { .. }
            | Error::RbdCommand { .. }
            | Error::RbdExists { .. }
            | Error::QosRuleExists { .. }
            | Error::VolumeAlreadyInSet { .. }
            | Error::CrossClusterCopyUnavailable { .. } => ErrorKind::Terminal,

            Error::DiskNotFound { .. }
            | Error::InvalidExport { .. }
            | Error::AttachInformationNotExists { .. }
            | Error::UnsupportedStorageType(_)
            | Error::DiskBusy { .. }
            | Error::Inconsistent { .. }
            | Error::InvalidSize { .. }
            | Error::InvalidInstanceCode { .. }
            | Error::QosLevelNotFound { .. }
            | Error::SanClusterNotFound { .. }
            | Error::RbdClusterNotConfigured { .. } => ErrorKind::Consistency,

            _ => ErrorKind::Internal,
        }
    }

    /// Check if this error is a benign not-found condition
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Terminal)
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
