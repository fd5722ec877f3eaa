use super::{SessionCommand, SessionCounters, SessionSnapshot};
use crate::config::SessionConfig;
use crate::events::{SessionEvent, Speaker};
use crate::gateway::{AiGateway, AnswerContext, ConversationContext, QuestionSet, Reply};
use crate::memory::{ConversationLedger, ConversationTurn, TopicMemory, fallback_summary};
use crate::pomodoro::{PhaseChange, PomodoroCoordinator, PomodoroPhase};
use crate::scheduler::{ProactiveScheduler, SchedulerDecision};
use crate::speech::{AudioBlob, CaptureControl, SpeechDeduper, SpeechError, SpeechPipeline};
use crate::turn::{
    Accepted, Epoch, SuspendReason, TurnKind, TurnMachine, TurnOrigin, TurnRejection, TurnState,
};
use crate::watchdog::InactivityWatchdog;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spoken in place of anything the gateway or the speech pipeline failed to produce.
pub const FALLBACK_UTTERANCE: &str =
    "Sorry, I could not understand that. Could you please repeat?";

const MICROPHONE_DENIED_NOTICE: &str =
    "Microphone access was denied. Allow it in your browser to talk with your study buddy.";

const POMODORO_TICK: Duration = Duration::from_secs(1);

/// The result of one piece of asynchronous work started for a turn.
enum Completion {
    InitialDelayElapsed,
    Proposed(anyhow::Result<SchedulerDecision>),
    RevealDue,
    Spoken(Result<(), SpeechError>),
    Captured(Result<AudioBlob, SpeechError>),
    Transcribed(Result<String, SpeechError>),
    Replied(anyhow::Result<Reply>),
    Answered(anyhow::Result<String>),
    HoldElapsed,
}

enum Internal {
    /// Tagged with the epoch it was started under; stale ones are dropped.
    Turn { epoch: Epoch, completion: Completion },
    /// Summaries are never stale: a resolved topic always lands in memory.
    Summarized {
        summary: anyhow::Result<String>,
        history: Vec<ConversationTurn>,
    },
    ArmElapsed { generation: u64 },
    AnnouncementDone {
        generation: u64,
        result: Result<(), SpeechError>,
    },
}

/// Turn audio that was due while an announcement was still playing.
enum Deferred {
    Speech {
        epoch: Epoch,
        text: String,
        cancel: CancellationToken,
    },
    Capture {
        epoch: Epoch,
        limit: Option<Duration>,
        control: CaptureControl,
    },
}

enum AfterSpeech {
    AwaitReply,
    Hold(Duration),
}

/// A resolved topic re-arms the scheduler once both its summary has landed and
/// its final line has been held.
#[derive(Default)]
struct Conclusion {
    summarized: bool,
    held: bool,
}

#[derive(Default)]
struct UserTurn {
    interrupted_question: Option<String>,
    history: Vec<ConversationTurn>,
    question: Option<String>,
}

pub(super) struct SessionRuntime {
    config: SessionConfig,
    machine: TurnMachine,
    ledger: ConversationLedger,
    topics: TopicMemory,
    scheduler: ProactiveScheduler,
    watchdog: InactivityWatchdog,
    pomodoro: PomodoroCoordinator,
    counters: SessionCounters,
    last_activity: Instant,
    questions: QuestionSet,
    gateway: Arc<dyn AiGateway>,
    speech: Arc<dyn SpeechPipeline>,
    events: mpsc::UnboundedSender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
    deduper: SpeechDeduper,
    speech_cancel: Option<CancellationToken>,
    capture: Option<CaptureControl>,
    announcement_cancel: Option<CancellationToken>,
    announcement_generation: u64,
    deferred: Option<Deferred>,
    after_speech: Option<AfterSpeech>,
    after_hold: Option<Duration>,
    conclusion: Option<Conclusion>,
    user_turn: Option<UserTurn>,
    shown_question: Option<String>,
}

impl SessionRuntime {
    pub(super) fn new(
        config: SessionConfig,
        questions: QuestionSet,
        gateway: Arc<dyn AiGateway>,
        speech: Arc<dyn SpeechPipeline>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            machine: TurnMachine::new(),
            ledger: ConversationLedger::new(),
            topics: TopicMemory::new(),
            scheduler: ProactiveScheduler::new(),
            watchdog: InactivityWatchdog::new(config.watchdog_poll, config.inactivity_threshold),
            pomodoro: PomodoroCoordinator::new(config.study_duration, config.break_duration),
            counters: SessionCounters {
                conversation_count: 0,
                completed_session_count: 0,
            },
            last_activity: Instant::now(),
            deduper: SpeechDeduper::new(config.duplicate_speech_window),
            questions,
            gateway,
            speech,
            events,
            internal_tx,
            internal_rx: Some(internal_rx),
            speech_cancel: None,
            capture: None,
            announcement_cancel: None,
            announcement_generation: 0,
            deferred: None,
            after_speech: None,
            after_hold: None,
            conclusion: None,
            user_turn: None,
            shown_question: None,
            config,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let Some(mut internal_rx) = self.internal_rx.take() else {
            return;
        };
        let poll = self.watchdog.poll_interval();
        let mut watchdog_tick = time::interval_at(Instant::now() + poll, poll);
        watchdog_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pomodoro_tick = time::interval_at(Instant::now() + POMODORO_TICK, POMODORO_TICK);

        info!(questions = self.questions.len(), "Study session started");
        self.last_activity = Instant::now();
        self.arm_scheduler(Duration::ZERO);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(internal) = internal_rx.recv() => self.handle_internal(internal),
                _ = watchdog_tick.tick() => self.check_inactivity(),
                _ = pomodoro_tick.tick() => self.tick_pomodoro(POMODORO_TICK),
            }
        }

        self.cancel_activity();
        if let Some(token) = self.announcement_cancel.take() {
            token.cancel();
        }
        info!(
            cycles = self.counters.conversation_count,
            topics = self.topics.summaries().len(),
            "Study session ended"
        );
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::RequestTurn { kind, reply } => {
                let result = self.request_turn(kind);
                let _ = reply.send(result);
            }
            SessionCommand::StopUserQuestion => self.stop_user_question(),
            SessionCommand::CancelUserQuestion => self.cancel_user_question(),
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Turn { epoch, completion } => {
                if !self.machine.is_current(epoch) {
                    debug!(epoch, current = self.machine.epoch(), "Discarding stale result");
                    return;
                }
                self.handle_completion(epoch, completion);
            }
            Internal::Summarized { summary, history } => self.on_summarized(summary, history),
            Internal::ArmElapsed { generation } => self.on_arm_elapsed(generation),
            Internal::AnnouncementDone { generation, result } => {
                if generation != self.announcement_generation {
                    return;
                }
                if let Err(e) = result {
                    debug!(error = %e, "Announcement did not finish");
                }
                self.announcement_cancel = None;
                self.resume_deferred();
            }
        }
    }

    fn handle_completion(&mut self, epoch: Epoch, completion: Completion) {
        let origin = self
            .machine
            .state()
            .origin()
            .unwrap_or(TurnOrigin::Proactive);
        match completion {
            Completion::InitialDelayElapsed => {
                if self.transition(epoch, TurnState::Generating(TurnOrigin::Proactive)) {
                    self.propose(epoch);
                }
            }
            Completion::Proposed(Ok(decision)) => self.on_proposed(epoch, decision),
            Completion::Proposed(Err(e)) => {
                warn!(error = ?e, "Proactive question proposal failed");
                self.speak_fallback(epoch, origin);
            }
            Completion::RevealDue => self.on_reveal(epoch),
            Completion::Spoken(result) => self.on_spoken(epoch, origin, result),
            Completion::Captured(result) => self.on_captured(epoch, origin, result),
            Completion::Transcribed(result) => self.on_transcribed(epoch, origin, result),
            Completion::Replied(Ok(reply)) => self.on_reply(epoch, reply),
            Completion::Replied(Err(e)) => {
                warn!(error = ?e, "Conversation continuation failed");
                self.speak_fallback(epoch, origin);
            }
            Completion::Answered(Ok(answer)) => self.on_answer(epoch, answer),
            Completion::Answered(Err(e)) => {
                warn!(error = ?e, "Answering the user question failed");
                self.speak_fallback(epoch, origin);
            }
            Completion::HoldElapsed => self.on_hold_elapsed(epoch, origin),
        }
    }

    // --- Turn admission ---

    fn request_turn(&mut self, kind: TurnKind) -> Result<Accepted, TurnRejection> {
        let accepted = match self.machine.request_turn(kind) {
            Ok(accepted) => accepted,
            Err(rejection) => {
                debug!(?kind, %rejection, "Turn request rejected");
                return Err(rejection);
            }
        };
        info!(?kind, epoch = accepted.epoch, state = %accepted.state, "Turn accepted");
        self.last_activity = Instant::now();
        self.emit_state();
        match kind {
            TurnKind::UserInitiated => self.start_user_turn(accepted),
            TurnKind::Proactive | TurnKind::Inactivity => self.start_proactive_turn(accepted),
        }
        Ok(accepted)
    }

    fn start_proactive_turn(&mut self, accepted: Accepted) {
        self.scheduler.disarm();
        self.conclusion = None;
        self.after_hold = None;
        self.ledger.clear();
        if accepted.state == TurnState::AwaitingInitialDelay {
            self.after(
                accepted.epoch,
                self.config.initial_delay,
                Completion::InitialDelayElapsed,
            );
        } else {
            self.propose(accepted.epoch);
        }
    }

    fn start_user_turn(&mut self, accepted: Accepted) {
        let mut turn = UserTurn::default();
        if let Some(preempted) = accepted.preempted {
            self.cancel_activity();
            if let Some(decision) = self.scheduler.discard() {
                info!(question = %decision.question, "Discarded pending decision for a user question");
            }
            turn.interrupted_question = self.shown_question.clone();
            turn.history = self.ledger.drain();
            self.hide_question();
            info!(%preempted, "User question preempted the proactive turn");
        }
        self.scheduler.disarm();
        self.conclusion = None;
        self.after_hold = None;
        self.user_turn = Some(turn);
        self.start_capture(accepted.epoch, None);
    }

    fn stop_user_question(&mut self) {
        if self.machine.state() != TurnState::Listening(TurnOrigin::UserInitiated) {
            debug!(state = %self.machine.state(), "Ignoring stop outside a user question");
            return;
        }
        if matches!(self.deferred, Some(Deferred::Capture { .. })) {
            // Released before the microphone ever opened: nothing was asked.
            info!("User question stopped before recording began");
            self.abandon_turn(TurnOrigin::UserInitiated);
            return;
        }
        if let Some(capture) = &self.capture {
            capture.stop();
        }
    }

    fn cancel_user_question(&mut self) {
        match self.machine.state() {
            TurnState::Listening(TurnOrigin::UserInitiated)
            | TurnState::Transcribing(TurnOrigin::UserInitiated) => {
                info!("User question canceled");
                self.abandon_turn(TurnOrigin::UserInitiated);
            }
            state => debug!(%state, "Ignoring cancel outside a user question"),
        }
    }

    // --- Proactive cycle ---

    fn propose(&mut self, epoch: Epoch) {
        self.counters.conversation_count += 1;
        let cycle = self.counters.conversation_count;
        let gateway = self.gateway.clone();
        let questions = self.questions.clone();
        let summaries = self.topics.summaries().to_vec();
        debug!(cycle, covered = summaries.len(), "Requesting proactive question");
        self.spawn_turn(epoch, async move {
            Completion::Proposed(gateway.propose_question(&questions, cycle, &summaries).await)
        });
    }

    fn on_proposed(&mut self, epoch: Epoch, decision: SchedulerDecision) {
        if !self.transition(epoch, TurnState::AwaitingReveal) {
            return;
        }
        let target = decision.target_topic_id.clone();
        if let Some(target) = &target {
            if self.questions.find(target).is_none() {
                warn!(%target, "Proposal targets a question that is not in the material");
            }
        }
        let delay = self.scheduler.withhold(epoch, decision);
        info!(topic = ?target, ?delay, "Proactive question ready");
        self.after(epoch, delay, Completion::RevealDue);
    }

    fn on_reveal(&mut self, epoch: Epoch) {
        let Some(decision) = self.scheduler.reveal(epoch) else {
            return;
        };
        self.machine.mark_initial_question_asked();
        self.ledger.clear();
        self.ledger.push_ai(decision.question.clone());
        self.shown_question = Some(decision.question.clone());
        self.emit(SessionEvent::QuestionShown {
            target_topic_id: decision.target_topic_id,
            question: decision.question.clone(),
        });
        self.enter_speaking(
            epoch,
            TurnOrigin::Proactive,
            decision.question,
            AfterSpeech::AwaitReply,
        );
    }

    fn on_reply(&mut self, epoch: Epoch, reply: Reply) {
        let text = reply.response_text.trim().to_string();
        if text.is_empty() {
            warn!("Conversation continuation came back empty");
            self.speak_fallback(epoch, TurnOrigin::Proactive);
            return;
        }
        self.ledger.push_ai(text.clone());

        if !reply.topic_resolved {
            self.enter_speaking(epoch, TurnOrigin::Proactive, text, AfterSpeech::AwaitReply);
            return;
        }

        let history = self.ledger.drain();
        info!(turns = history.len(), "Topic resolved");
        self.conclusion = Some(Conclusion::default());
        self.after_hold = None;
        let gateway = self.gateway.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let summary = gateway.summarize(&history).await;
            let _ = tx.send(Internal::Summarized { summary, history });
        });

        let hold = self.config.proactive_hold(&text);
        self.enter_speaking(epoch, TurnOrigin::Proactive, text, AfterSpeech::Hold(hold));
    }

    fn on_summarized(&mut self, summary: anyhow::Result<String>, history: Vec<ConversationTurn>) {
        let summary = match summary {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) => fallback_summary(&history),
            Err(e) => {
                warn!(error = ?e, "Topic summarization failed; using a local summary");
                fallback_summary(&history)
            }
        };
        info!(%summary, "Topic added to memory");
        self.topics.append(summary.clone());
        self.emit(SessionEvent::TopicConcluded { summary });
        if let Some(conclusion) = self.conclusion.as_mut() {
            conclusion.summarized = true;
        }
        self.rearm_after_conclusion();
    }

    fn rearm_after_conclusion(&mut self) {
        if let Some(Conclusion {
            summarized: true,
            held: true,
        }) = self.conclusion
        {
            self.conclusion = None;
            self.arm_scheduler(self.config.topic_grace);
        }
    }

    // --- User question ---

    fn on_answer(&mut self, epoch: Epoch, answer: String) {
        let answer = answer.trim().to_string();
        if answer.is_empty() {
            warn!("Answer came back empty");
            self.speak_fallback(epoch, TurnOrigin::UserInitiated);
            return;
        }
        let question = self
            .user_turn
            .as_ref()
            .and_then(|t| t.question.clone())
            .unwrap_or_default();
        self.ledger.push_user_question(question, answer.clone());
        self.after_hold = Some(self.config.user_grace);
        let hold = self.config.answer_hold(&answer);
        self.enter_speaking(epoch, TurnOrigin::UserInitiated, answer, AfterSpeech::Hold(hold));
    }

    // --- Speech ---

    fn enter_speaking(&mut self, epoch: Epoch, origin: TurnOrigin, text: String, after: AfterSpeech) {
        if !self.transition(epoch, TurnState::Speaking(origin)) {
            return;
        }
        self.after_speech = Some(after);
        self.emit(SessionEvent::Utterance {
            speaker: Speaker::Ai,
            text: text.clone(),
        });
        if !self.deduper.admit(&text, Instant::now()) {
            debug!("Suppressing duplicate synthesis");
            self.post(epoch, Completion::Spoken(Ok(())));
            return;
        }
        let cancel = CancellationToken::new();
        self.speech_cancel = Some(cancel.clone());
        if self.announcement_cancel.is_some() {
            debug!("Holding synthesis until the announcement ends");
            self.deferred = Some(Deferred::Speech {
                epoch,
                text,
                cancel,
            });
            return;
        }
        self.synthesize(epoch, text, cancel);
    }

    fn synthesize(&self, epoch: Epoch, text: String, cancel: CancellationToken) {
        let speech = self.speech.clone();
        self.spawn_turn(epoch, async move {
            Completion::Spoken(speech.synthesize(&text, cancel).await)
        });
    }

    fn on_spoken(&mut self, epoch: Epoch, origin: TurnOrigin, result: Result<(), SpeechError>) {
        self.speech_cancel = None;
        let after = self.after_speech.take();
        if let Err(e) = &result {
            if *e != SpeechError::Canceled {
                warn!(error = %e, "Synthesis failed");
                if matches!(after, Some(AfterSpeech::AwaitReply)) {
                    // The question never reached the user; wind the turn down.
                    self.emit(SessionEvent::Utterance {
                        speaker: Speaker::Ai,
                        text: FALLBACK_UTTERANCE.to_string(),
                    });
                    self.ledger.clear();
                    self.after_hold = Some(self.grace_for(origin));
                    let hold = self.hold_for(origin, FALLBACK_UTTERANCE);
                    self.enter_hold(epoch, origin, hold);
                    return;
                }
            }
        }
        match after {
            Some(AfterSpeech::AwaitReply) => {
                if self.transition(epoch, TurnState::AwaitingUserReply)
                    && self.transition(epoch, TurnState::Listening(TurnOrigin::Proactive))
                {
                    self.start_capture(epoch, Some(self.config.reply_capture_limit));
                }
            }
            Some(AfterSpeech::Hold(hold)) => self.enter_hold(epoch, origin, hold),
            None => warn!("Speech finished without a follow-up"),
        }
    }

    fn speak_fallback(&mut self, epoch: Epoch, origin: TurnOrigin) {
        if origin == TurnOrigin::Proactive {
            self.ledger.clear();
        }
        self.conclusion = None;
        self.after_hold = Some(self.grace_for(origin));
        let hold = self.hold_for(origin, FALLBACK_UTTERANCE);
        self.enter_speaking(
            epoch,
            origin,
            FALLBACK_UTTERANCE.to_string(),
            AfterSpeech::Hold(hold),
        );
    }

    /// Plays a phase announcement. Turn audio that comes due while it plays is
    /// deferred until it ends.
    fn announce(&mut self, text: &'static str) {
        if !matches!(self.deferred, Some(Deferred::Speech { .. })) {
            if let Some(token) = self.speech_cancel.take() {
                token.cancel();
            }
        }
        if let Some(token) = self.announcement_cancel.take() {
            token.cancel();
        }
        self.announcement_generation += 1;
        let generation = self.announcement_generation;
        self.emit(SessionEvent::Utterance {
            speaker: Speaker::Ai,
            text: text.to_string(),
        });
        let cancel = CancellationToken::new();
        self.announcement_cancel = Some(cancel.clone());
        let speech = self.speech.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = speech.synthesize(text, cancel).await;
            let _ = tx.send(Internal::AnnouncementDone { generation, result });
        });
    }

    fn resume_deferred(&mut self) {
        match self.deferred.take() {
            Some(Deferred::Speech {
                epoch,
                text,
                cancel,
            }) if self.machine.is_current(epoch) => self.synthesize(epoch, text, cancel),
            Some(Deferred::Capture {
                epoch,
                limit,
                control,
            }) if self.machine.is_current(epoch) => self.open_microphone(epoch, limit, control),
            Some(_) => debug!("Dropping deferred audio from an earlier turn"),
            None => {}
        }
    }

    // --- Listening ---

    fn start_capture(&mut self, epoch: Epoch, limit: Option<Duration>) {
        let control = CaptureControl::new();
        self.capture = Some(control.clone());
        if self.announcement_cancel.is_some() {
            debug!("Holding the microphone until the announcement ends");
            self.deferred = Some(Deferred::Capture {
                epoch,
                limit,
                control,
            });
            return;
        }
        self.open_microphone(epoch, limit, control);
    }

    fn open_microphone(&self, epoch: Epoch, limit: Option<Duration>, control: CaptureControl) {
        let speech = self.speech.clone();
        self.spawn_turn(epoch, async move {
            Completion::Captured(speech.capture(limit, control).await)
        });
    }

    fn on_captured(&mut self, epoch: Epoch, origin: TurnOrigin, result: Result<AudioBlob, SpeechError>) {
        self.capture = None;
        match result {
            Ok(audio) if audio.is_empty() => self.on_transcribed(epoch, origin, Ok(String::new())),
            Ok(audio) => {
                if self.transition(epoch, TurnState::Transcribing(origin)) {
                    let speech = self.speech.clone();
                    self.spawn_turn(epoch, async move {
                        Completion::Transcribed(speech.transcribe(audio).await)
                    });
                }
            }
            Err(SpeechError::PermissionDenied) => {
                warn!("Microphone permission denied");
                self.emit(SessionEvent::Notice {
                    message: MICROPHONE_DENIED_NOTICE.to_string(),
                });
                self.abandon_turn(origin);
            }
            Err(e) => {
                warn!(error = %e, "Capture failed");
                self.speak_fallback(epoch, origin);
            }
        }
    }

    fn on_transcribed(&mut self, epoch: Epoch, origin: TurnOrigin, result: Result<String, SpeechError>) {
        let text = match result {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "Transcription failed");
                self.speak_fallback(epoch, origin);
                return;
            }
        };

        if text.is_empty() {
            match origin {
                TurnOrigin::Proactive => info!("No reply heard; ending the proactive turn"),
                TurnOrigin::UserInitiated => info!("Empty user question; treating it as canceled"),
            }
            self.abandon_turn(origin);
            return;
        }

        self.last_activity = Instant::now();
        self.emit(SessionEvent::Utterance {
            speaker: Speaker::User,
            text: text.clone(),
        });

        match origin {
            TurnOrigin::Proactive => {
                self.ledger.record_reply(text);
                if !self.transition(epoch, TurnState::Generating(TurnOrigin::Proactive)) {
                    return;
                }
                let gateway = self.gateway.clone();
                let history = self.ledger.turns().to_vec();
                let context = ConversationContext {
                    questions: self.questions.clone(),
                    topic_summaries: self.topics.summaries().to_vec(),
                };
                self.spawn_turn(epoch, async move {
                    Completion::Replied(gateway.continue_conversation(&history, &context).await)
                });
            }
            TurnOrigin::UserInitiated => {
                if !self.transition(epoch, TurnState::Generating(TurnOrigin::UserInitiated)) {
                    return;
                }
                let turn = self.user_turn.get_or_insert_with(UserTurn::default);
                turn.question = Some(text.clone());
                let mut history = turn.history.clone();
                history.extend_from_slice(self.ledger.turns());
                let context = AnswerContext {
                    questions: self.questions.clone(),
                    interrupted_question: turn.interrupted_question.clone(),
                    history,
                    question: text,
                };
                let gateway = self.gateway.clone();
                self.spawn_turn(epoch, async move {
                    Completion::Answered(gateway.answer_question(&context).await)
                });
            }
        }
    }

    // --- Holding and idling ---

    fn enter_hold(&mut self, epoch: Epoch, origin: TurnOrigin, hold: Duration) {
        if self.transition(epoch, TurnState::Holding(origin)) {
            self.after(epoch, hold, Completion::HoldElapsed);
        }
    }

    fn on_hold_elapsed(&mut self, epoch: Epoch, origin: TurnOrigin) {
        if let Err(e) = self.machine.finish(epoch) {
            warn!(error = %e, "Hold ended outside of a hold");
            return;
        }
        self.emit_state();
        self.hide_question();
        self.ledger.clear();
        if origin == TurnOrigin::UserInitiated {
            self.user_turn = None;
        }
        if let Some(grace) = self.after_hold.take() {
            self.arm_scheduler(grace);
        }
        if let Some(conclusion) = self.conclusion.as_mut() {
            conclusion.held = true;
        }
        self.rearm_after_conclusion();
    }

    /// Drops the running turn without speaking. Proactive turns leave liveness to
    /// the watchdog; user turns hand back to the scheduler after the user grace.
    fn abandon_turn(&mut self, origin: TurnOrigin) {
        self.cancel_activity();
        self.machine.abort();
        self.emit_state();
        self.hide_question();
        self.after_speech = None;
        self.after_hold = None;
        match origin {
            TurnOrigin::Proactive => {
                self.ledger.clear();
                self.scheduler.discard();
                self.conclusion = None;
            }
            TurnOrigin::UserInitiated => {
                self.user_turn = None;
                self.arm_scheduler(self.config.user_grace);
            }
        }
    }

    // --- Scheduler and watchdog ---

    fn arm_scheduler(&mut self, delay: Duration) {
        let generation = self.scheduler.arm();
        debug!(generation, delay_ms = delay.as_millis() as u64, "Scheduler armed");
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(Internal::ArmElapsed { generation });
        });
    }

    fn on_arm_elapsed(&mut self, generation: u64) {
        if !self.scheduler.fire(generation) {
            return;
        }
        if !self.scheduler.may_request(&self.machine) {
            debug!(state = %self.machine.state(), "Scheduler fired while busy; skipping");
            return;
        }
        let _ = self.request_turn(TurnKind::Proactive);
    }

    fn check_inactivity(&mut self) {
        if self
            .watchdog
            .should_fire(Instant::now(), self.last_activity, &self.machine)
        {
            info!("Inactivity threshold crossed");
            let _ = self.request_turn(TurnKind::Inactivity);
        }
    }

    // --- Pomodoro ---

    fn tick_pomodoro(&mut self, dt: Duration) {
        let Some(change) = self.pomodoro.tick(dt) else {
            return;
        };
        match change {
            PhaseChange::BreakStarted { completed_sessions } => {
                info!(completed_sessions, "Study phase complete; starting a break");
                self.machine.suspend(SuspendReason::Break);
                self.scheduler.disarm();
                if self.machine.state().origin() == Some(TurnOrigin::Proactive) {
                    self.cancel_activity();
                    let interrupted = self.machine.abort();
                    if let Some(decision) = self.scheduler.discard() {
                        debug!(question = %decision.question, "Discarded pending decision for the break");
                    }
                    self.ledger.clear();
                    self.conclusion = None;
                    self.after_speech = None;
                    self.after_hold = None;
                    info!(%interrupted, "Break interrupted the proactive turn");
                }
                self.hide_question();
                self.counters.completed_session_count = completed_sessions;
                self.emit_state();
                self.emit(SessionEvent::PhaseChanged {
                    phase: PomodoroPhase::Break,
                });
                self.emit(SessionEvent::SessionCompleted { completed_sessions });
            }
            PhaseChange::StudyResumed => {
                info!("Break over; resuming study");
                self.machine.resume();
                self.emit_state();
                self.emit(SessionEvent::PhaseChanged {
                    phase: PomodoroPhase::Study,
                });
                self.arm_scheduler(self.config.user_grace);
            }
        }
        self.announce(change.announcement());
    }

    // --- Helpers ---

    fn transition(&mut self, epoch: Epoch, next: TurnState) -> bool {
        match self.machine.advance(epoch, next) {
            Ok(()) => {
                self.emit_state();
                true
            }
            Err(e) => {
                warn!(error = %e, "Turn transition refused");
                false
            }
        }
    }

    fn grace_for(&self, origin: TurnOrigin) -> Duration {
        match origin {
            TurnOrigin::Proactive => self.config.topic_grace,
            TurnOrigin::UserInitiated => self.config.user_grace,
        }
    }

    fn hold_for(&self, origin: TurnOrigin, text: &str) -> Duration {
        match origin {
            TurnOrigin::Proactive => self.config.proactive_hold(text),
            TurnOrigin::UserInitiated => self.config.answer_hold(text),
        }
    }

    fn cancel_activity(&mut self) {
        self.deferred = None;
        if let Some(token) = self.speech_cancel.take() {
            token.cancel();
        }
        if let Some(capture) = self.capture.take() {
            capture.discard();
        }
    }

    fn hide_question(&mut self) {
        if self.shown_question.take().is_some() {
            self.emit(SessionEvent::QuestionHidden);
        }
    }

    fn emit_state(&self) {
        self.emit(SessionEvent::StateChanged {
            state: self.machine.state(),
            suspended: self.machine.suspended(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // The presenter may have gone away; the session keeps running regardless.
        let _ = self.events.send(event);
    }

    fn spawn_turn<F>(&self, epoch: Epoch, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let completion = work.await;
            let _ = tx.send(Internal::Turn { epoch, completion });
        });
    }

    fn after(&self, epoch: Epoch, delay: Duration, completion: Completion) {
        self.spawn_turn(epoch, async move {
            time::sleep(delay).await;
            completion
        });
    }

    fn post(&self, epoch: Epoch, completion: Completion) {
        let _ = self.internal_tx.send(Internal::Turn { epoch, completion });
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.machine.state(),
            suspended: self.machine.suspended(),
            phase: self.pomodoro.phase(),
            phase_remaining_secs: self.pomodoro.remaining().as_secs(),
            counters: self.counters,
            seconds_since_activity: Instant::now()
                .saturating_duration_since(self.last_activity)
                .as_secs(),
            ledger: self.ledger.turns().to_vec(),
            topic_summaries: self.topics.summaries().to_vec(),
            decision_pending: self.scheduler.has_pending(),
        }
    }
}
