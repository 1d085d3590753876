use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// uniquely identifies participants
pub type ParticipantId = String;

/// the chat conversation a call belongs to
pub type ConversationId = String;

/// names a render surface (DOM element id, native view tag, ...)
pub type TargetId = String;

/// label shown while the caller's display metadata is unknown
pub const UNKNOWN_CALLER: &str = "Unknown caller";

/// assigned by whichever side initiates the call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// allocates a fresh id for an outgoing call
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

impl CallType {
    pub fn has_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl FromStr for CallType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            _ => bail!("invalid call type: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum Topology {
    /// media flows directly between the two participants
    #[serde(rename = "p2p")]
    #[display(fmt = "p2p")]
    PeerToPeer,
    /// media is relayed by a selective forwarding unit
    #[serde(rename = "sfu")]
    #[display(fmt = "sfu")]
    Sfu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    #[display(fmt = "idle")]
    Idle,
    #[display(fmt = "ringing-out")]
    RingingOut,
    #[display(fmt = "ringing-in")]
    RingingIn,
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "in-call")]
    InCall,
    #[display(fmt = "ended")]
    Ended,
}

impl CallStatus {
    /// true for every state that counts as "the" active call
    pub fn is_active(&self) -> bool {
        !matches!(self, CallStatus::Idle | CallStatus::Ended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// display metadata for whoever started the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl CallerInfo {
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: UNKNOWN_CALLER.into(),
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_local: bool,
}

impl Participant {
    pub fn remote(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            avatar_url: None,
            is_local: false,
        }
    }

    pub fn local(id: &str, display_name: &str) -> Self {
        Self {
            is_local: true,
            ..Self::remote(id, display_name)
        }
    }
}

impl From<&CallerInfo> for Participant {
    fn from(caller: &CallerInfo) -> Self {
        Self {
            id: caller.id.clone(),
            display_name: caller.display_name.clone(),
            avatar_url: caller.avatar_url.clone(),
            is_local: false,
        }
    }
}

/// the call owned by the Controller. only the Controller mutates it
pub(crate) struct CallSession {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub call_type: CallType,
    pub topology: Topology,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub caller: CallerInfo,
    pub room_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// monotonic counterpart of start_time, used for the duration
    pub connected_at: Option<Instant>,
}

impl CallSession {
    pub fn duration_secs(&self) -> u64 {
        self.connected_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn snapshot(&self, participants: Vec<ParticipantId>) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id.clone(),
            conversation_id: self.conversation_id.clone(),
            call_type: self.call_type,
            topology: self.topology,
            direction: self.direction,
            status: self.status,
            caller: self.caller.clone(),
            room_id: self.room_id.clone(),
            participants,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// read-only view of the current call, handed to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub call_type: CallType,
    pub topology: Topology,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub caller: CallerInfo,
    pub room_id: Option<String>,
    /// join order, local participant first
    pub participants: Vec<ParticipantId>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}
