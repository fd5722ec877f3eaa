//! Speech Pipeline Boundary
//!
//! Capture, transcription and synthesis live outside the core. The session runtime
//! only sees this trait, so a browser over a WebSocket, a local audio device or a
//! test double can all sit behind it.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Recorded audio, as produced by the capturing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl AudioBlob {
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            data,
            mime_type: mime_type.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpeechError {
    /// The user (or platform) refused microphone access.
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("speech operation canceled")]
    Canceled,
    #[error("speech pipeline failure: {0}")]
    Failed(String),
}

/// Ends a running capture from outside.
///
/// `stop` keeps what was recorded so far; `discard` throws it away and the capture
/// resolves with [`SpeechError::Canceled`].
#[derive(Debug, Clone, Default)]
pub struct CaptureControl {
    stop: CancellationToken,
    discard: CancellationToken,
}

impl CaptureControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn discard(&self) {
        self.discard.cancel();
    }

    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub async fn discarded(&self) {
        self.discard.cancelled().await
    }
}

#[async_trait]
pub trait SpeechPipeline: Send + Sync {
    /// Records until `control` is stopped or `limit` elapses, whichever comes
    /// first, and returns what was recorded. `None` means no cap.
    async fn capture(
        &self,
        limit: Option<Duration>,
        control: CaptureControl,
    ) -> Result<AudioBlob, SpeechError>;

    async fn transcribe(&self, audio: AudioBlob) -> Result<String, SpeechError>;

    /// Speaks `text`, resolving when playback ends. Triggering `cancel` cuts the
    /// playback short and resolves with [`SpeechError::Canceled`].
    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> Result<(), SpeechError>;
}

/// Suppresses a second synthesis of the same text inside a short window.
#[derive(Debug)]
pub struct SpeechDeduper {
    window: Duration,
    last: Option<(String, Instant)>,
}

impl SpeechDeduper {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Records `text` as spoken at `now` unless it duplicates the previous line.
    pub fn admit(&mut self, text: &str, now: Instant) -> bool {
        if let Some((previous, at)) = &self.last {
            if previous == text && now.saturating_duration_since(*at) < self.window {
                return false;
            }
        }
        self.last = Some((text.to_string(), now));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_identical_text_within_window_is_suppressed() {
        let mut deduper = SpeechDeduper::new(Duration::from_secs(5));
        let start = Instant::now();

        assert!(deduper.admit("What is a heap?", start));
        assert!(!deduper.admit("What is a heap?", start + Duration::from_secs(4)));
        assert!(deduper.admit("What is a heap?", start + Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_text_is_always_admitted() {
        let mut deduper = SpeechDeduper::new(Duration::from_secs(5));
        let now = Instant::now();
        assert!(deduper.admit("one", now));
        assert!(deduper.admit("two", now));
        assert!(deduper.admit("one", now));
    }
}
