use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::internal::data_types::{CallType, TargetId};

mod binder;
mod codec;
mod native;
mod retry;

pub use binder::{BindOutcome, MediaTrackBinder};
pub use codec::{MimeType, TrackKind};
pub use native::{AttachedView, NativeViewBackend, ViewRegistry};
pub use retry::{RetryPolicy, RetryState, RetryTrigger};

pub enum MediaTrack {
    /// captured on this device. the host writes RTP packets into it
    Local(Arc<TrackLocalStaticRTP>),
    /// received over a peer-to-peer connection
    Remote(Arc<TrackRemote>),
}

pub struct StreamTrack {
    pub kind: TrackKind,
    pub mime_type: MimeType,
    pub track: MediaTrack,
}

/// a group of tracks rendered together (one participant's audio + video)
pub struct MediaStream {
    id: String,
    tracks: Vec<StreamTrack>,
}

impl MediaStream {
    pub fn new(id: &str, tracks: Vec<StreamTrack>) -> Self {
        Self {
            id: id.to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[StreamTrack] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    pub fn local_tracks(&self) -> impl Iterator<Item = &Arc<TrackLocalStaticRTP>> {
        self.tracks.iter().filter_map(|t| match &t.track {
            MediaTrack::Local(track) => Some(track),
            MediaTrack::Remote(_) => None,
        })
    }
}

/// a remote track delivered by an SFU. these come with their own attach/detach
/// primitive which replaces generic stream assignment
pub trait SfuTrack: Send + Sync {
    fn sid(&self) -> &str;
    fn attach(&self, target: &TargetId) -> Result<()>;
    fn detach(&self, target: &TargetId);
}

#[derive(Clone)]
pub enum MediaSource {
    Local(Arc<MediaStream>),
    Remote(Arc<MediaStream>),
    Sfu(Arc<dyn SfuTrack>),
}

impl MediaSource {
    /// reference identity, never a deep comparison
    pub fn same_source(&self, other: &MediaSource) -> bool {
        match (self, other) {
            (MediaSource::Local(a), MediaSource::Local(b))
            | (MediaSource::Remote(a), MediaSource::Remote(b)) => Arc::ptr_eq(a, b),
            (MediaSource::Sfu(a), MediaSource::Sfu(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            MediaSource::Local(s) => format!("local stream {}", s.id()),
            MediaSource::Remote(s) => format!("remote stream {}", s.id()),
            MediaSource::Sfu(t) => format!("sfu track {}", t.sid()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindOptions {
    /// flip horizontally, for the local preview
    pub mirror: bool,
    /// don't play audio, for the local preview
    pub muted: bool,
}

impl BindOptions {
    pub fn local_preview() -> Self {
        Self {
            mirror: true,
            muted: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// refused by the platform's autoplay policy. worth retrying
    Blocked,
    Failed(String),
}

/// platform specific rendering, picked once when the binder is built
pub trait RenderBackend: Send {
    /// generic stream assignment. SFU tracks never go through here
    fn attach(&mut self, target: &TargetId, stream: &Arc<MediaStream>, options: &BindOptions)
        -> Result<()>;
    fn detach(&mut self, target: &TargetId);
    /// option change on an unchanged source
    fn apply_options(&mut self, _target: &TargetId, _options: &BindOptions) {}
    fn play(&mut self, _target: &TargetId) -> Result<(), PlaybackError> {
        Ok(())
    }
    /// web-style surfaces need an explicit play that autoplay policy may refuse.
    /// native views render as soon as they're attached
    fn autoplay_gated(&self) -> bool {
        false
    }
}

/// renders nothing. for servers, tests and the CLI
pub struct HeadlessBackend;

impl RenderBackend for HeadlessBackend {
    fn attach(
        &mut self,
        target: &TargetId,
        stream: &Arc<MediaStream>,
        _options: &BindOptions,
    ) -> Result<()> {
        log::debug!("headless attach of {} to {}", stream.id(), target);
        Ok(())
    }

    fn detach(&mut self, target: &TargetId) {
        log::debug!("headless detach of {}", target);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPlatform {
    Native,
    Headless,
}

/// web backends live with the host (they need a DOM) and are passed in directly
pub fn create_render_backend(platform: RenderPlatform) -> (Box<dyn RenderBackend>, Option<ViewRegistry>) {
    match platform {
        RenderPlatform::Native => {
            let backend = NativeViewBackend::new();
            let views = backend.views();
            (Box::new(backend), Some(views))
        }
        RenderPlatform::Headless => (Box::new(HeadlessBackend), None),
    }
}

/// acquires camera/microphone media for a call
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn acquire(&self, call_type: CallType) -> Result<Arc<MediaStream>>;
    /// stops capture. runs in the background after the call ended
    async fn release(&self, _stream: Arc<MediaStream>) {}
}

/// creates local RTP tracks (opus, plus VP8 for video calls). the host feeds
/// captured and packetized media into `MediaStream::local_tracks`
pub struct RtpCaptureProvider {
    audio: MimeType,
    video: MimeType,
}

impl Default for RtpCaptureProvider {
    fn default() -> Self {
        Self {
            audio: MimeType::OPUS,
            video: MimeType::VP8,
        }
    }
}

impl RtpCaptureProvider {
    pub fn new(audio: MimeType, video: MimeType) -> Result<Self> {
        if audio.kind() != TrackKind::Audio || video.kind() != TrackKind::Video {
            bail!("mismatched codecs: audio={}, video={}", audio, video);
        }
        Ok(Self { audio, video })
    }

    fn track(mime_type: MimeType, stream_id: &str) -> StreamTrack {
        let track = TrackLocalStaticRTP::new(
            mime_type.capability(),
            format!("{}-{}", stream_id, mime_type.kind()),
            stream_id.to_string(),
        );
        StreamTrack {
            kind: mime_type.kind(),
            mime_type,
            track: MediaTrack::Local(Arc::new(track)),
        }
    }
}

#[async_trait]
impl MediaProvider for RtpCaptureProvider {
    async fn acquire(&self, call_type: CallType) -> Result<Arc<MediaStream>> {
        let stream_id = format!("local-{}", uuid::Uuid::new_v4());
        let mut tracks = vec![Self::track(self.audio, &stream_id)];
        if call_type.has_video() {
            tracks.push(Self::track(self.video, &stream_id));
        }
        Ok(Arc::new(MediaStream::new(&stream_id, tracks)))
    }

    async fn release(&self, stream: Arc<MediaStream>) {
        log::debug!(
            "released local stream {} ({} tracks)",
            stream.id(),
            stream.local_tracks().count()
        );
    }
}
