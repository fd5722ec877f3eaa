//! Speech-to-text over the OpenAI-compatible audio endpoint.

use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{AudioInput, CreateTranscriptionRequestArgs},
};
use async_trait::async_trait;
use study_buddy_core::AudioBlob;
use tracing::debug;

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: AudioBlob) -> Result<String>;
}

pub struct OpenAITranscriber {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAITranscriber {
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl Transcriber for OpenAITranscriber {
    async fn transcribe(&self, audio: AudioBlob) -> Result<String> {
        let file_name = file_name_for(&audio.mime_type);
        let bytes = audio.data.len();
        let request = CreateTranscriptionRequestArgs::default()
            .file(AudioInput::from_vec_u8(file_name, audio.data))
            .model(&self.model)
            .build()
            .context("Failed to build transcription request")?;

        let response = self
            .client
            .audio()
            .transcribe(request)
            .await
            .context("Transcription request failed")?;
        debug!(bytes, chars = response.text.len(), "Transcription received");
        Ok(response.text)
    }
}

/// The endpoint infers the container from the upload's file extension.
fn file_name_for(mime_type: &str) -> String {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    let extension = match essence {
        "audio/ogg" => "ogg",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        _ => "webm",
    };
    format!("capture.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_follows_mime_type() {
        assert_eq!(file_name_for("audio/webm;codecs=opus"), "capture.webm");
        assert_eq!(file_name_for("audio/mp4"), "capture.m4a");
        assert_eq!(file_name_for("audio/wav"), "capture.wav");
        assert_eq!(file_name_for(""), "capture.webm");
    }
}
