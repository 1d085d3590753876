use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::internal::data_types::*;
use crate::internal::registry::LayoutBucket;
use crate::media::{MediaSource, MediaStream};

/// payload of `call:incoming`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub initiator_id: ParticipantId,
    #[serde(rename = "type")]
    pub call_type: CallType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// signals received from the remote side, for a call that already exists.
/// `call:incoming` arrives through the IncomingCallFeed instead
pub enum SignalingEvent {
    /// the callee accepted our outgoing call
    RemoteAccepted { call_id: CallId },
    /// the callee rejected our outgoing call
    RemoteRejected { call_id: CallId },
    /// the other side hung up (or the caller gave up before we answered)
    RemoteHangup { call_id: CallId },
    /// media negotiation finished
    MediaConnected { call_id: CallId },
    ConnectionLost { call_id: CallId },
    ParticipantJoined {
        call_id: CallId,
        participant: Participant,
    },
    ParticipantLeft {
        call_id: CallId,
        participant_id: ParticipantId,
    },
    /// a remote stream or SFU track became available for a participant
    TrackAdded {
        call_id: CallId,
        participant_id: ParticipantId,
        source: MediaSource,
    },
    TrackRemoved {
        call_id: CallId,
        participant_id: ParticipantId,
    },
    /// unrecoverable signaling error. `None` applies to whatever call is active
    Fatal {
        call_id: Option<CallId>,
        reason: String,
    },
}

impl SignalingEvent {
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            SignalingEvent::RemoteAccepted { call_id }
            | SignalingEvent::RemoteRejected { call_id }
            | SignalingEvent::RemoteHangup { call_id }
            | SignalingEvent::MediaConnected { call_id }
            | SignalingEvent::ConnectionLost { call_id }
            | SignalingEvent::ParticipantJoined { call_id, .. }
            | SignalingEvent::ParticipantLeft { call_id, .. }
            | SignalingEvent::TrackAdded { call_id, .. }
            | SignalingEvent::TrackRemoved { call_id, .. } => Some(call_id),
            SignalingEvent::Fatal { call_id, .. } => call_id.as_ref(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalingEvent::RemoteAccepted { .. } => "remote-accepted",
            SignalingEvent::RemoteRejected { .. } => "remote-rejected",
            SignalingEvent::RemoteHangup { .. } => "remote-hangup",
            SignalingEvent::MediaConnected { .. } => "media-connected",
            SignalingEvent::ConnectionLost { .. } => "connection-lost",
            SignalingEvent::ParticipantJoined { .. } => "participant-joined",
            SignalingEvent::ParticipantLeft { .. } => "participant-left",
            SignalingEvent::TrackAdded { .. } => "track-added",
            SignalingEvent::TrackRemoved { .. } => "track-removed",
            SignalingEvent::Fatal { .. } => "fatal",
        }
    }
}

/// signals this layer emits. the host forwards them over its socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum OutgoingSignal {
    #[serde(rename = "call:dial", rename_all = "camelCase")]
    Dial {
        call_id: CallId,
        conversation_id: ConversationId,
        #[serde(rename = "type")]
        call_type: CallType,
        topology: Topology,
    },
    #[serde(rename = "call:accept", rename_all = "camelCase")]
    Accept { call_id: CallId },
    #[serde(rename = "call:reject", rename_all = "camelCase")]
    Reject { call_id: CallId },
    #[serde(rename = "call:hangup", rename_all = "camelCase")]
    Hangup { call_id: CallId },
}

/// everything the Controller tells its host about
#[derive(Debug, Clone, PartialEq)]
pub enum EmittedEvents {
    /// must be forwarded to the signaling transport
    Signal(OutgoingSignal),
    /// show the incoming call prompt
    IncomingCall {
        call_id: CallId,
        call_type: CallType,
        caller: CallerInfo,
    },
    /// caller metadata finished resolving (may be the placeholder)
    CallerResolved { call_id: CallId, caller: CallerInfo },
    StateChanged { call_id: CallId, status: CallStatus },
    ParticipantsChanged {
        call_id: CallId,
        participants: Vec<ParticipantId>,
    },
    LayoutChanged {
        call_id: CallId,
        layout: LayoutBucket,
    },
    /// the call could not proceed. `reason` is meant for the user
    CallFailed { call_id: CallId, reason: String },
}

/// results of deferred work, applied by the Controller when they arrive
pub(crate) enum InternalEvent {
    RingExpired {
        call_id: CallId,
    },
    CallerResolved {
        call_id: CallId,
        caller: CallerInfo,
    },
    LocalMedia {
        call_id: CallId,
        result: Result<Arc<MediaStream>, String>,
    },
    PlaybackRetryDue {
        target: TargetId,
        generation: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_payload_uses_wire_names() {
        let json = r#"{"callId":"c1","conversationId":"conv","initiatorId":"bob","type":"video"}"#;
        let call: IncomingCall = serde_json::from_str(json).unwrap();
        assert_eq!(call.call_id, CallId::from("c1"));
        assert_eq!(call.call_type, CallType::Video);
        assert_eq!(call.room_id, None);
    }

    #[test]
    fn outgoing_signals_are_tagged() {
        let accept = OutgoingSignal::Accept {
            call_id: CallId::from("c1"),
        };
        assert_eq!(
            serde_json::to_string(&accept).unwrap(),
            r#"{"event":"call:accept","callId":"c1"}"#
        );

        let dial = OutgoingSignal::Dial {
            call_id: CallId::from("c2"),
            conversation_id: "conv".into(),
            call_type: CallType::Audio,
            topology: Topology::Sfu,
        };
        let value = serde_json::to_value(&dial).unwrap();
        assert_eq!(value["event"], "call:dial");
        assert_eq!(value["conversationId"], "conv");
        assert_eq!(value["type"], "audio");
        assert_eq!(value["topology"], "sfu");
    }
}
