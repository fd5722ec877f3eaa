//! Manages the WebSocket connection lifecycle for a study session.

use super::{
    protocol::{ClientMessage, ServerMessage},
    speech::{BrowserSpeech, DeviceOutcome},
};
use crate::state::AppState;
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{sync::Arc, time::Duration};
use study_buddy_core::{
    AudioBlob, QuestionSet, SessionConfig, SessionEvent, SessionHandle, SpeechError, StudySession,
};
use tokio::sync::mpsc;
use tracing::{Instrument, error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// The first message must be `init`; it carries the questions and starts the
/// study session. The connection then relays session events to the browser and
/// browser input to the session until either side goes away.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New WebSocket connection. Awaiting initialization...");
    let (mut socket_tx, mut socket_rx) = socket.split();

    let init = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => parse_init(&text, state.config.session_config()),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let (questions, session_config) = match init {
        Ok(init) => init,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let speech = Arc::new(BrowserSpeech::new(outbound_tx, state.transcriber.clone()));
    let (handle, events) = match StudySession::start(
        session_config,
        questions,
        state.gateway.clone(),
        speech.clone(),
    ) {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "Could not start study session");
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let session_id = Uuid::new_v4();
    tracing::Span::current().record("session_id", &session_id.to_string());
    state.sessions.insert(session_id, handle.clone()).await;
    let live_sessions = state.sessions.len().await;
    info!(live_sessions, "Study session registered");

    if send_msg(&mut socket_tx, ServerMessage::Initialized { session_id })
        .await
        .is_err()
    {
        error!("Failed to send Initialized message to client.");
    } else {
        let connection_span = tracing::info_span!("study_connection", %session_id);
        let connection = Connection {
            handle: handle.clone(),
            speech: speech.clone(),
            socket_tx,
            socket_rx,
            events,
            outbound: outbound_rx,
        };
        if let Err(e) = connection.run().instrument(connection_span).await {
            error!(error = ?e, "Study connection terminated with error.");
        }
    }

    state.sessions.remove(&session_id).await;
    speech.disconnect();
    let _ = handle.shutdown().await;
    info!("WebSocket connection closed and study session terminated.");
}

/// Parses the `init` message into the material and timings of a session.
fn parse_init(text: &str, defaults: SessionConfig) -> Result<(QuestionSet, SessionConfig)> {
    let ClientMessage::Init {
        questions,
        study_minutes,
        break_minutes,
    } = serde_json::from_str::<ClientMessage>(text)?
    else {
        return Err(anyhow!("First message must be `init`"));
    };

    if questions.is_empty() {
        return Err(anyhow!("`init` must carry at least one question"));
    }
    let study = match study_minutes {
        Some(0) => return Err(anyhow!("`study_minutes` must be greater than zero")),
        Some(m) => Duration::from_secs(m * 60),
        None => defaults.study_duration,
    };
    let rest = match break_minutes {
        Some(0) => return Err(anyhow!("`break_minutes` must be greater than zero")),
        Some(m) => Duration::from_secs(m * 60),
        None => defaults.break_duration,
    };

    info!(questions = questions.len(), ?study, ?rest, "Starting study session");
    Ok((QuestionSet::new(questions), defaults.with_pomodoro(study, rest)))
}

struct Connection {
    handle: SessionHandle,
    speech: Arc<BrowserSpeech>,
    socket_tx: SplitSink<WebSocket, Message>,
    socket_rx: SplitStream<WebSocket>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Connection {
    /// The main event loop for an active study connection.
    async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                msg_result = self.socket_rx.next() => {
                    match msg_result {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ClientMessage>(&text) {
                                Ok(msg) => {
                                    if !self.handle_client_message(msg).await? {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "Ignoring unparseable client message."),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Client closed the connection.");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Error receiving from client WebSocket: {:?}", e);
                            break;
                        }
                    }
                },
                Some(event) = self.events.recv() => {
                    send_msg(&mut self.socket_tx, event.into()).await?;
                },
                Some(request) = self.outbound.recv() => {
                    send_msg(&mut self.socket_tx, request).await?;
                },
                else => break,
            }
        }
        Ok(())
    }

    /// Returns false once the session can no longer be reached.
    async fn handle_client_message(&mut self, msg: ClientMessage) -> Result<bool> {
        match msg {
            ClientMessage::Init { .. } => warn!("Ignoring repeated `init`."),
            ClientMessage::BeginUserQuestion => match self.handle.begin_user_question().await {
                Ok(Ok(accepted)) => info!(epoch = accepted.epoch, "User question started"),
                Ok(Err(rejection)) => {
                    send_msg(
                        &mut self.socket_tx,
                        ServerMessage::Notice {
                            message: format!("Can't take a question right now: {rejection}"),
                        },
                    )
                    .await?;
                }
                Err(_) => return Ok(false),
            },
            ClientMessage::StopUserQuestion => {
                if self.handle.stop_user_question().await.is_err() {
                    return Ok(false);
                }
            }
            ClientMessage::CancelUserQuestion => {
                if self.handle.cancel_user_question().await.is_err() {
                    return Ok(false);
                }
            }
            ClientMessage::SpeechEnded { id } => {
                self.speech.resolve(id, DeviceOutcome::SpeechEnded);
            }
            ClientMessage::CaptureComplete {
                id,
                audio_base64,
                mime_type,
            } => {
                let outcome = match STANDARD.decode(audio_base64.trim()) {
                    Ok(data) => DeviceOutcome::Captured(AudioBlob::new(data, mime_type)),
                    Err(e) => {
                        warn!(id, error = %e, "Recording was not valid base64");
                        DeviceOutcome::Failed(SpeechError::Failed(
                            "recording was not valid base64".to_string(),
                        ))
                    }
                };
                self.speech.resolve(id, outcome);
            }
            ClientMessage::CaptureFailed { id, reason } => {
                warn!(id, ?reason, "Browser could not record");
                self.speech.resolve(id, DeviceOutcome::Failed(reason.into()));
            }
        }
        Ok(true)
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
