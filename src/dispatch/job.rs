//! Job envelope
//!
//! Wire shape `{"Action": .., "Detail": {..}, "Retry": n}`. The action stays
//! a string so unknown actions still decode and can be dropped with a log
//! line instead of poisoning the queue.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! actions {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Operations the orchestrator accepts through the queue
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Action {
            $($variant),+
        }

        impl Action {
            pub const ALL: &'static [Action] = &[$(Action::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Action::$variant => $name),+
                }
            }
        }

        impl FromStr for Action {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(Action::$variant),)+
                    other => Err(Error::JobDecode {
                        action: other.to_string(),
                        reason: "unknown action".to_string(),
                    }),
                }
            }
        }
    };
}

actions! {
    CreateDisk => "CreateDisk",
    CreateDisks => "CreateDisks",
    DeleteDisk => "DeleteDisk",
    DeleteDisks => "DeleteDisks",
    CreateSnapshot => "CreateSnapshot",
    DeleteSnapshot => "DeleteSnapshot",
    CreateImage => "CreateImage",
    DeleteImage => "DeleteImage",
    ResetDisk => "ResetDisk",
    ReInitDisk => "ReInitDisk",
    ResizeDisk => "ResizeDisk",
    ResizeDisks => "ResizeDisks",
    Export => "Export",
    CancelExport => "CancelExport",
    AddDiskQos => "AddDiskQoS",
    RemoveDiskQos => "RemoveDiskQoS",
    UpdateDiskQos => "UpdateDiskQoS",
}

impl Action {
    /// Failed jobs of these actions go back on the queue
    pub fn is_requeued(&self) -> bool {
        matches!(self, Action::Export | Action::CancelExport)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Detail")]
    pub detail: serde_json::Value,
    /// Earlier attempts of this job
    #[serde(rename = "Retry", default)]
    pub retry: u32,
}

impl Job {
    pub fn new<T: Serialize>(action: Action, detail: &T) -> Result<Self> {
        Ok(Self {
            action: action.as_str().to_string(),
            detail: serde_json::to_value(detail)?,
            retry: 0,
        })
    }

    /// Known action, if any
    pub fn action(&self) -> Option<Action> {
        self.action.parse().ok()
    }

    /// Typed request carried by this job
    pub fn detail<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.detail).map_err(|e| Error::JobDecode {
            action: self.action.clone(),
            reason: e.to_string(),
        })
    }

    /// Correlation id of the carried request, when it has one
    pub fn request_id(&self) -> &str {
        self.detail
            .get("request_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    /// The same job, one attempt later
    pub fn next_attempt(&self) -> Self {
        Self {
            retry: self.retry + 1,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::JobDecode {
            action: String::new(),
            reason: e.to_string(),
        })
    }
}
