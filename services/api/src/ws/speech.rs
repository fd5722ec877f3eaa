//! The browser as the session's audio device.
//!
//! Every synthesis or capture becomes a `speak`/`start_capture` request with a
//! fresh id. The matching client reply resolves the waiting call through a
//! oneshot channel kept in `pending`.

use super::protocol::{CaptureFailure, ServerMessage};
use crate::transcription::Transcriber;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use study_buddy_core::{AudioBlob, CaptureControl, SpeechError, SpeechPipeline};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a stopped recording may take to arrive.
const CAPTURE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// What the browser reported for a request.
#[derive(Debug)]
pub enum DeviceOutcome {
    SpeechEnded,
    Captured(AudioBlob),
    Failed(SpeechError),
}

impl From<CaptureFailure> for SpeechError {
    fn from(reason: CaptureFailure) -> Self {
        match reason {
            CaptureFailure::PermissionDenied => SpeechError::PermissionDenied,
            CaptureFailure::Unavailable => {
                SpeechError::Failed("microphone unavailable".to_string())
            }
        }
    }
}

pub struct BrowserSpeech {
    outbound: mpsc::UnboundedSender<ServerMessage>,
    transcriber: Arc<dyn Transcriber>,
    pending: Mutex<HashMap<u64, oneshot::Sender<DeviceOutcome>>>,
    next_id: AtomicU64,
}

impl BrowserSpeech {
    pub fn new(
        outbound: mpsc::UnboundedSender<ServerMessage>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        Self {
            outbound,
            transcriber,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Completes the request `id`. Returns false for unknown or finished ids.
    pub fn resolve(&self, id: u64, outcome: DeviceOutcome) -> bool {
        let sender = self.lock_pending().remove(&id);
        match sender {
            Some(sender) => sender.send(outcome).is_ok(),
            None => {
                debug!(id, "Reply for an unknown device request");
                false
            }
        }
    }

    /// Fails every outstanding request, e.g. when the socket closes.
    pub fn disconnect(&self) {
        let drained: Vec<_> = self.lock_pending().drain().collect();
        for (_, sender) in drained {
            let _ = sender.send(DeviceOutcome::Failed(SpeechError::Failed(
                "client disconnected".to_string(),
            )));
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<DeviceOutcome>>> {
        // A poisoned map still holds valid senders.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self) -> (u64, oneshot::Receiver<DeviceOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);
        (id, rx)
    }

    fn forget(&self, id: u64) {
        self.lock_pending().remove(&id);
    }

    fn send(&self, message: ServerMessage) -> Result<(), SpeechError> {
        self.outbound
            .send(message)
            .map_err(|_| SpeechError::Failed("client disconnected".to_string()))
    }
}

fn closed() -> SpeechError {
    SpeechError::Failed("client disconnected".to_string())
}

fn into_capture(outcome: Result<DeviceOutcome, oneshot::error::RecvError>) -> Result<AudioBlob, SpeechError> {
    match outcome {
        Ok(DeviceOutcome::Captured(audio)) => Ok(audio),
        Ok(DeviceOutcome::Failed(e)) => Err(e),
        Ok(DeviceOutcome::SpeechEnded) => Err(SpeechError::Failed(
            "speech_ended sent for a capture".to_string(),
        )),
        Err(_) => Err(closed()),
    }
}

#[async_trait]
impl SpeechPipeline for BrowserSpeech {
    async fn capture(
        &self,
        limit: Option<Duration>,
        control: CaptureControl,
    ) -> Result<AudioBlob, SpeechError> {
        let (id, mut rx) = self.register();
        let max_ms = limit.map(|l| l.as_millis() as u64);
        if let Err(e) = self.send(ServerMessage::StartCapture { id, max_ms }) {
            self.forget(id);
            return Err(e);
        }

        let deadline = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            outcome = &mut rx => return into_capture(outcome),
            _ = control.discarded() => {
                self.forget(id);
                let _ = self.send(ServerMessage::DiscardCapture { id });
                debug!(id, "Capture discarded");
                return Err(SpeechError::Canceled);
            }
            _ = control.stopped() => debug!(id, "Capture stopped"),
            _ = deadline => debug!(id, "Capture reached its limit"),
        }

        // Ask for whatever was recorded so far and wait briefly for it.
        self.send(ServerMessage::StopCapture { id })?;
        match tokio::time::timeout(CAPTURE_FLUSH_TIMEOUT, rx).await {
            Ok(outcome) => into_capture(outcome),
            Err(_) => {
                self.forget(id);
                warn!(id, "Browser never delivered the stopped recording");
                Err(SpeechError::Failed("recording was not delivered".to_string()))
            }
        }
    }

    async fn transcribe(&self, audio: AudioBlob) -> Result<String, SpeechError> {
        if audio.is_empty() {
            return Ok(String::new());
        }
        self.transcriber
            .transcribe(audio)
            .await
            .map_err(|e| SpeechError::Failed(format!("{e:#}")))
    }

    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> Result<(), SpeechError> {
        let (id, rx) = self.register();
        if let Err(e) = self.send(ServerMessage::Speak {
            id,
            text: text.to_string(),
        }) {
            self.forget(id);
            return Err(e);
        }

        tokio::select! {
            outcome = rx => match outcome {
                Ok(DeviceOutcome::SpeechEnded) => Ok(()),
                Ok(DeviceOutcome::Failed(e)) => Err(e),
                Ok(DeviceOutcome::Captured(_)) => Err(SpeechError::Failed(
                    "capture_complete sent for speech".to_string(),
                )),
                Err(_) => Err(closed()),
            },
            _ = cancel.cancelled() => {
                self.forget(id);
                let _ = self.send(ServerMessage::StopSpeaking { id });
                Err(SpeechError::Canceled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTranscriber;

    #[async_trait]
    impl Transcriber for EchoTranscriber {
        async fn transcribe(&self, audio: AudioBlob) -> anyhow::Result<String> {
            Ok(String::from_utf8(audio.data)?)
        }
    }

    fn speech() -> (Arc<BrowserSpeech>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(BrowserSpeech::new(tx, Arc::new(EchoTranscriber))), rx)
    }

    #[tokio::test]
    async fn test_synthesis_resolves_on_speech_ended() {
        let (speech, mut outbound) = speech();
        let task = {
            let speech = speech.clone();
            tokio::spawn(async move { speech.synthesize("hello", CancellationToken::new()).await })
        };

        let Some(ServerMessage::Speak { id, text }) = outbound.recv().await else {
            panic!("expected a speak request");
        };
        assert_eq!(text, "hello");
        assert!(speech.resolve(id, DeviceOutcome::SpeechEnded));
        assert_eq!(task.await.unwrap(), Ok(()));
        assert!(!speech.resolve(id, DeviceOutcome::SpeechEnded));
    }

    #[tokio::test]
    async fn test_canceled_synthesis_tells_the_browser_to_stop() {
        let (speech, mut outbound) = speech();
        let cancel = CancellationToken::new();
        let task = {
            let speech = speech.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { speech.synthesize("hello", cancel).await })
        };

        let Some(ServerMessage::Speak { id, .. }) = outbound.recv().await else {
            panic!("expected a speak request");
        };
        cancel.cancel();
        assert_eq!(task.await.unwrap(), Err(SpeechError::Canceled));
        assert_eq!(outbound.recv().await, Some(ServerMessage::StopSpeaking { id }));
    }

    #[tokio::test]
    async fn test_stopped_capture_waits_for_the_recording() {
        let (speech, mut outbound) = speech();
        let control = CaptureControl::new();
        let task = {
            let speech = speech.clone();
            let control = control.clone();
            tokio::spawn(async move { speech.capture(None, control).await })
        };

        let Some(ServerMessage::StartCapture { id, max_ms }) = outbound.recv().await else {
            panic!("expected a capture request");
        };
        assert_eq!(max_ms, None);
        control.stop();
        assert_eq!(outbound.recv().await, Some(ServerMessage::StopCapture { id }));

        let audio = AudioBlob::new(b"what is a heap".to_vec(), "audio/webm");
        assert!(speech.resolve(id, DeviceOutcome::Captured(audio.clone())));
        let captured = task.await.unwrap().unwrap();
        assert_eq!(captured, audio);
        assert_eq!(speech.transcribe(captured).await.unwrap(), "what is a heap");
    }

    #[tokio::test]
    async fn test_discarded_capture_never_asks_for_the_recording() {
        let (speech, mut outbound) = speech();
        let control = CaptureControl::new();
        let task = {
            let speech = speech.clone();
            let control = control.clone();
            tokio::spawn(async move { speech.capture(None, control).await })
        };

        let Some(ServerMessage::StartCapture { id, .. }) = outbound.recv().await else {
            panic!("expected a capture request");
        };
        control.discard();
        assert_eq!(task.await.unwrap(), Err(SpeechError::Canceled));
        assert_eq!(outbound.recv().await, Some(ServerMessage::DiscardCapture { id }));

        // A recording uploaded anyway is ignored.
        let late = AudioBlob::new(b"never mind".to_vec(), "audio/webm");
        assert!(!speech.resolve(id, DeviceOutcome::Captured(late)));
    }

    #[tokio::test]
    async fn test_permission_failure_is_reported_as_such() {
        let (speech, mut outbound) = speech();
        let task = {
            let speech = speech.clone();
            tokio::spawn(async move {
                speech
                    .capture(Some(Duration::from_secs(5)), CaptureControl::new())
                    .await
            })
        };

        let Some(ServerMessage::StartCapture { id, max_ms }) = outbound.recv().await else {
            panic!("expected a capture request");
        };
        assert_eq!(max_ms, Some(5000));
        speech.resolve(
            id,
            DeviceOutcome::Failed(CaptureFailure::PermissionDenied.into()),
        );
        assert_eq!(task.await.unwrap(), Err(SpeechError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_disconnect_fails_outstanding_requests() {
        let (speech, mut outbound) = speech();
        let task = {
            let speech = speech.clone();
            tokio::spawn(async move { speech.synthesize("hello", CancellationToken::new()).await })
        };
        outbound.recv().await;
        speech.disconnect();
        assert!(matches!(task.await.unwrap(), Err(SpeechError::Failed(_))));
    }

    #[tokio::test]
    async fn test_empty_recording_skips_transcription() {
        let (speech, _outbound) = speech();
        let text = speech
            .transcribe(AudioBlob::new(Vec::new(), "audio/webm"))
            .await
            .unwrap();
        assert!(text.is_empty());
    }
}
