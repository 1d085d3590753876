use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallError, CallResult};
use crate::internal::data_types::ParticipantId;
use crate::internal::history::DEFAULT_HISTORY_CAPACITY;
use crate::media::RetryPolicy;

pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 30;

/// every field has a default, so a config file only needs the overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    /// this client's participant id. incoming calls from it are echoes
    pub local_id: ParticipantId,
    pub local_display_name: String,
    pub ring_timeout_secs: u64,
    pub history_capacity: usize,
    /// JSON history file. history is kept in memory when unset
    pub history_path: Option<PathBuf>,
    /// render target id = prefix + participant id
    pub video_target_prefix: String,
    pub playback_retry: RetryPolicy,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            local_id: String::new(),
            local_display_name: "Me".into(),
            ring_timeout_secs: DEFAULT_RING_TIMEOUT_SECS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_path: None,
            video_target_prefix: "video-".into(),
            playback_retry: RetryPolicy::default(),
        }
    }
}

impl CallConfig {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            ..Default::default()
        }
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn target_for(&self, participant: &str) -> String {
        format!("{}{}", self.video_target_prefix, participant)
    }

    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    pub(crate) fn validate(&self) -> CallResult<()> {
        if self.local_id.is_empty() {
            return Err(CallError::InvalidConfig("localId must be set".into()));
        }
        Ok(())
    }
}
