use anyhow::{bail, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{
    MIME_TYPE_AV1, MIME_TYPE_G722, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU,
    MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

/// represents the MIME types from webrtc::api::media_engine
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum MimeType {
    #[display(fmt = "{MIME_TYPE_H264}")]
    H264,
    #[display(fmt = "{MIME_TYPE_VP8}")]
    VP8,
    #[display(fmt = "{MIME_TYPE_VP9}")]
    VP9,
    #[display(fmt = "{MIME_TYPE_AV1}")]
    AV1,
    #[display(fmt = "{MIME_TYPE_OPUS}")]
    OPUS,
    #[display(fmt = "{MIME_TYPE_G722}")]
    G722,
    // also known as G.711 µ-law
    #[display(fmt = "{MIME_TYPE_PCMU}")]
    PCMU,
    // also known as G.711 A-law
    #[display(fmt = "{MIME_TYPE_PCMA}")]
    PCMA,
}

impl MimeType {
    /// matching is case insensitive, as in webrtc-rs
    pub fn from_string(s: &str) -> Result<Self> {
        let candidates = [
            MimeType::H264,
            MimeType::VP8,
            MimeType::VP9,
            MimeType::AV1,
            MimeType::OPUS,
            MimeType::G722,
            MimeType::PCMU,
            MimeType::PCMA,
        ];
        match candidates
            .into_iter()
            .find(|m| m.to_string().eq_ignore_ascii_case(s))
        {
            Some(m) => Ok(m),
            None => bail!("invalid mime type: {}", s),
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self {
            MimeType::H264 | MimeType::VP8 | MimeType::VP9 | MimeType::AV1 => TrackKind::Video,
            _ => TrackKind::Audio,
        }
    }

    /// capability used when creating a local track for this codec
    pub fn capability(&self) -> RTCRtpCodecCapability {
        let (clock_rate, channels) = match self {
            MimeType::OPUS => (48000, 2),
            MimeType::G722 | MimeType::PCMU | MimeType::PCMA => (8000, 1),
            _ => (90000, 0),
        };
        RTCRtpCodecCapability {
            mime_type: self.to_string(),
            clock_rate,
            channels,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(MimeType::from_string("audio/opus").unwrap(), MimeType::OPUS);
        assert_eq!(MimeType::from_string("video/vp8").unwrap(), MimeType::VP8);
        assert!(MimeType::from_string("video/h265").is_err());
    }

    #[test]
    fn kinds() {
        assert_eq!(MimeType::OPUS.kind(), TrackKind::Audio);
        assert_eq!(MimeType::AV1.kind(), TrackKind::Video);
    }

    #[test]
    fn opus_capability() {
        let cap = MimeType::OPUS.capability();
        assert_eq!(cap.mime_type, MIME_TYPE_OPUS);
        assert_eq!(cap.clock_rate, 48000);
        assert_eq!(cap.channels, 2);
    }
}
