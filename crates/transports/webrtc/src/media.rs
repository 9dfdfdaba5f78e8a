//! Local media description and the capture collaborator

use crate::config::MediaConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// One track of a media stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub kind: TrackKind,
    /// Device or track label
    pub label: String,
}

/// A set of tracks attached to, or received from, a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, kind: TrackKind, label: impl Into<String>) -> Self {
        self.tracks.push(MediaTrack {
            kind,
            label: label.into(),
        });
        self
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Video)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Audio)
    }
}

/// Provider of local media
///
/// Acquisition is asynchronous and may fail with [`Error::CaptureFailed`],
/// which prevents a call from starting.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream>;
}

/// Capture provider producing labelled placeholder tracks
///
/// Yields one track per requested kind. Used by the loopback CLI and tests
/// where no camera or microphone is available.
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    video_label: String,
    audio_label: String,
    fail_with: Option<String>,
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self {
            video_label: "Synthetic Camera".to_string(),
            audio_label: "Synthetic Microphone".to_string(),
            fail_with: None,
        }
    }
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture that always fails with the given reason (e.g. permission denied)
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fail_with: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        if let Some(reason) = &self.fail_with {
            return Err(Error::CaptureFailed(reason.clone()));
        }

        if !constraints.requests_any() {
            return Err(Error::CaptureFailed(
                "constraints request neither audio nor video".to_string(),
            ));
        }

        let mut stream = MediaStream::new(uuid::Uuid::new_v4().to_string());
        if constraints.video {
            stream = stream.with_track(TrackKind::Video, self.video_label.clone());
        }
        if constraints.audio {
            stream = stream.with_track(TrackKind::Audio, self.audio_label.clone());
        }

        debug!(stream_id = %stream.id, tracks = stream.tracks.len(), "Acquired synthetic media");
        for track in &stream.tracks {
            info!("Using {} device: {}", track.kind, track.label);
        }

        Ok(stream)
    }
}
