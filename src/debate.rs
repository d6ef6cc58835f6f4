// Debate orchestrator: drives RAG -> N x (Proposer, Skeptic) ->
// Synthesizer -> score -> persist as one totally-ordered event sequence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::DebateConfig;
use crate::error::{InferenceError, StoreError};
use crate::llm_client::{ChatBackend, ChatMessage};
use crate::prompts::{self, PromptSet};
use crate::templates::{TemplateRef, TemplateStore};
use crate::trace_store::{DebateTrace, ModelSet, Round, Timing, TraceStore};

/// Wire-level sentinels the Skeptic is prompted to emit. The termination
/// predicate matches these byte-exactly; the default Skeptic prompt embeds
/// them, and a test pins the two together.
pub const READY_SENTINEL: &str = "READY_TO_CONCLUDE";
pub const CRITICAL_SENTINEL: &str = "SEVERITY: CRITICAL";

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Recorded when the scorer replied but nothing parseable came back.
const NEUTRAL_SCORE: u8 = 5;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum DebateEvent {
    RagStarted,
    RagCompleted {
        templates: Vec<TemplateRef>,
    },
    RoundStarted {
        round: u32,
    },
    ProposerStarted {
        round: u32,
    },
    ProposerDelta {
        round: u32,
        text: String,
    },
    ProposerCompleted {
        round: u32,
        text: String,
        duration_ms: u64,
    },
    SkepticStarted {
        round: u32,
    },
    SkepticDelta {
        round: u32,
        text: String,
    },
    SkepticCompleted {
        round: u32,
        text: String,
        duration_ms: u64,
    },
    EarlyStop {
        round: u32,
    },
    SynthesisStarted,
    SynthesisDelta {
        text: String,
    },
    SynthesisCompleted {
        text: String,
        duration_ms: u64,
    },
    Completed {
        trace: DebateTrace,
    },
    Failed {
        message: String,
        kind: String,
        round: Option<u32>,
    },
}

impl DebateEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// Events a slow consumer must still receive; everything else may be
    /// shed under back-pressure.
    pub fn must_deliver(&self) -> bool {
        self.is_terminal() || matches!(self, Self::EarlyStop { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    StopEarly,
    StopAtMax,
    Continue,
}

/// Termination predicate over the Skeptic's round text.
pub(crate) fn termination_verdict(
    skeptic_text: &str,
    round: u32,
    min_rounds: u32,
    max_rounds: u32,
) -> Verdict {
    if skeptic_text.contains(READY_SENTINEL) {
        return Verdict::StopEarly;
    }
    if round >= max_rounds {
        return Verdict::StopAtMax;
    }
    if round >= min_rounds && !skeptic_text.contains(CRITICAL_SENTINEL) {
        return Verdict::StopEarly;
    }
    Verdict::Continue
}

pub struct Orchestrator {
    backend: Arc<dyn ChatBackend>,
    templates: Arc<TemplateStore>,
    store: Arc<TraceStore>,
    prompts: Arc<PromptSet>,
    embed_model: String,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        templates: Arc<TemplateStore>,
        store: Arc<TraceStore>,
        prompts: Arc<PromptSet>,
        embed_model: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            templates,
            store,
            prompts,
            embed_model: embed_model.into(),
        }
    }

    /// Start one debate. Returns the single-consumer event sequence; the
    /// debate itself runs on its own task and never unwinds past it.
    pub fn run(
        &self,
        trace_id: String,
        query: String,
        config: DebateConfig,
        cancel: watch::Receiver<bool>,
    ) -> mpsc::Receiver<DebateEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let ctx = DebateContext {
            backend: self.backend.clone(),
            templates: self.templates.clone(),
            store: self.store.clone(),
            prompts: self.prompts.clone(),
            embed_model: self.embed_model.clone(),
            trace_id,
            query,
            config,
            cancel,
        };
        tokio::spawn(drive(ctx, tx));
        rx
    }
}

async fn drive(ctx: DebateContext, tx: mpsc::Sender<DebateEvent>) {
    let debate_id = ctx.trace_id.clone();
    match ctx.run_debate(&tx).await {
        Ok(()) => {
            tracing::info!(debate = %debate_id, "debate finished");
        }
        Err(failure) if failure.kind == "abandoned" => {
            tracing::debug!(debate = %debate_id, "event consumer dropped, stopping debate");
        }
        Err(failure) => {
            tracing::warn!(
                debate = %debate_id,
                kind = failure.kind,
                round = ?failure.round,
                error = %failure.message,
                "debate failed"
            );
            let _ = tx
                .send(DebateEvent::Failed {
                    message: failure.message,
                    kind: failure.kind.to_string(),
                    round: failure.round,
                })
                .await;
        }
    }
}

struct DebateContext {
    backend: Arc<dyn ChatBackend>,
    templates: Arc<TemplateStore>,
    store: Arc<TraceStore>,
    prompts: Arc<PromptSet>,
    embed_model: String,
    trace_id: String,
    query: String,
    config: DebateConfig,
    cancel: watch::Receiver<bool>,
}

#[derive(Debug)]
struct Failure {
    kind: &'static str,
    message: String,
    round: Option<u32>,
}

impl Failure {
    fn inference(err: InferenceError, round: Option<u32>) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            round,
        }
    }

    fn store(err: StoreError) -> Self {
        Self {
            kind: "store",
            message: err.to_string(),
            round: None,
        }
    }

    fn cancelled(round: Option<u32>) -> Self {
        Self {
            kind: "cancelled",
            message: "debate cancelled".to_string(),
            round,
        }
    }

    fn abandoned() -> Self {
        Self {
            kind: "abandoned",
            message: "event consumer dropped".to_string(),
            round: None,
        }
    }
}

enum StreamRole {
    Proposer(u32),
    Skeptic(u32),
    Synthesizer,
}

impl StreamRole {
    fn delta_event(&self, text: String) -> DebateEvent {
        match *self {
            Self::Proposer(round) => DebateEvent::ProposerDelta { round, text },
            Self::Skeptic(round) => DebateEvent::SkepticDelta { round, text },
            Self::Synthesizer => DebateEvent::SynthesisDelta { text },
        }
    }

    fn round(&self) -> Option<u32> {
        match *self {
            Self::Proposer(round) | Self::Skeptic(round) => Some(round),
            Self::Synthesizer => None,
        }
    }
}

impl DebateContext {
    async fn run_debate(&self, tx: &mpsc::Sender<DebateEvent>) -> Result<(), Failure> {
        let debate_start = Instant::now();
        let created_at = Utc::now();
        let deadline = Duration::from_secs(self.config.per_call_timeout_secs);

        emit(tx, DebateEvent::RagStarted).await?;
        let rag_start = Instant::now();
        let templates = self
            .templates
            .search(
                &self.query,
                self.config.rag_top_k,
                self.config.similarity_floor,
            )
            .await
            .map_err(|err| Failure::inference(err, None))?;
        let rag_ms = elapsed_ms(rag_start);
        for template in &templates {
            self.templates.record_use(&template.id).await;
        }
        emit(
            tx,
            DebateEvent::RagCompleted {
                templates: templates.clone(),
            },
        )
        .await?;

        let mut rounds: Vec<Round> = Vec::new();
        let mut rounds_ms: Vec<u64> = Vec::new();
        let mut early_stopped = false;

        for round in 1..=self.config.max_rounds {
            self.check_cancel(Some(round))?;
            emit(tx, DebateEvent::RoundStarted { round }).await?;
            let round_start = Instant::now();

            emit(tx, DebateEvent::ProposerStarted { round }).await?;
            let messages =
                prompts::proposer_messages(&self.prompts, &self.query, &templates, &rounds);
            let (proposer_text, proposer_ms) = self
                .stream_role(
                    tx,
                    messages,
                    &self.config.proposer_model,
                    self.config.proposer_temp,
                    deadline,
                    StreamRole::Proposer(round),
                )
                .await?;
            emit(
                tx,
                DebateEvent::ProposerCompleted {
                    round,
                    text: proposer_text.clone(),
                    duration_ms: proposer_ms,
                },
            )
            .await?;

            emit(tx, DebateEvent::SkepticStarted { round }).await?;
            let messages = prompts::skeptic_messages(
                &self.prompts,
                &self.query,
                &rounds,
                &proposer_text,
                round,
                self.config.max_rounds,
            );
            let (skeptic_text, skeptic_ms) = self
                .stream_role(
                    tx,
                    messages,
                    &self.config.skeptic_model,
                    self.config.skeptic_temp,
                    deadline,
                    StreamRole::Skeptic(round),
                )
                .await?;
            emit(
                tx,
                DebateEvent::SkepticCompleted {
                    round,
                    text: skeptic_text.clone(),
                    duration_ms: skeptic_ms,
                },
            )
            .await?;

            rounds.push(Round {
                round,
                proposer_text,
                skeptic_text: skeptic_text.clone(),
                proposer_duration_ms: proposer_ms,
                skeptic_duration_ms: skeptic_ms,
            });
            rounds_ms.push(elapsed_ms(round_start));

            match termination_verdict(
                &skeptic_text,
                round,
                self.config.min_rounds,
                self.config.max_rounds,
            ) {
                Verdict::StopEarly => {
                    early_stopped = true;
                    emit(tx, DebateEvent::EarlyStop { round }).await?;
                    break;
                }
                Verdict::StopAtMax => break,
                Verdict::Continue => {}
            }
        }

        self.check_cancel(None)?;
        emit(tx, DebateEvent::SynthesisStarted).await?;
        let messages = prompts::synthesizer_messages(&self.prompts, &self.query, &rounds);
        let (final_answer, synthesis_ms) = self
            .stream_role(
                tx,
                messages,
                &self.config.synthesizer_model,
                self.config.synthesizer_temp,
                deadline,
                StreamRole::Synthesizer,
            )
            .await?;
        emit(
            tx,
            DebateEvent::SynthesisCompleted {
                text: final_answer.clone(),
                duration_ms: synthesis_ms,
            },
        )
        .await?;

        let auto_score = self.auto_score(&final_answer, deadline).await;

        let total_rounds = rounds.len() as u32;
        let mut trace = DebateTrace {
            id: self.trace_id.clone(),
            created_at,
            query: self.query.clone(),
            templates_used: templates.iter().map(|t| t.id.clone()).collect(),
            rounds,
            final_answer,
            total_rounds,
            early_stopped,
            auto_score,
            user_rating: None,
            models: ModelSet {
                proposer: self.config.proposer_model.clone(),
                skeptic: self.config.skeptic_model.clone(),
                synthesizer: self.config.synthesizer_model.clone(),
                embedding: self.embed_model.clone(),
            },
            timing: Timing {
                total_ms: 0,
                rag_ms,
                rounds_ms,
                synthesis_ms,
            },
        };
        trace.timing.total_ms = elapsed_ms(debate_start);

        self.store.save(&trace).map_err(Failure::store)?;
        emit(tx, DebateEvent::Completed { trace }).await?;
        Ok(())
    }

    /// Relay one streamed generation, accumulating the full text. Honors
    /// cancellation between deltas.
    async fn stream_role(
        &self,
        tx: &mpsc::Sender<DebateEvent>,
        messages: Vec<ChatMessage>,
        model: &str,
        temperature: f32,
        deadline: Duration,
        role: StreamRole,
    ) -> Result<(String, u64), Failure> {
        let start = Instant::now();
        let mut deltas = self
            .backend
            .stream_chat(model, messages, temperature, deadline);

        let mut text = String::new();
        while let Some(item) = deltas.recv().await {
            self.check_cancel(role.round())?;
            let delta = item.map_err(|err| Failure::inference(err, role.round()))?;
            text.push_str(&delta);
            emit(tx, role.delta_event(delta)).await?;
        }
        Ok((text, elapsed_ms(start)))
    }

    /// Non-streaming quality score. Never fatal: a failed call records no
    /// score, an unparseable reply records the neutral default.
    async fn auto_score(&self, final_answer: &str, deadline: Duration) -> Option<u8> {
        let messages = prompts::scorer_messages(&self.prompts, &self.query, final_answer);
        let reply = match self
            .backend
            .chat(&self.config.synthesizer_model, messages, 0.0, deadline)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(debate = %self.trace_id, error = %err, "auto-score call failed, leaving score unset");
                return None;
            }
        };

        match parse_score(&reply) {
            Some(score) => Some(score),
            None => {
                tracing::warn!(debate = %self.trace_id, "auto-score reply unparseable, recording neutral default");
                Some(NEUTRAL_SCORE)
            }
        }
    }

    fn check_cancel(&self, round: Option<u32>) -> Result<(), Failure> {
        if *self.cancel.borrow() {
            Err(Failure::cancelled(round))
        } else {
            Ok(())
        }
    }
}

async fn emit(tx: &mpsc::Sender<DebateEvent>, event: DebateEvent) -> Result<(), Failure> {
    tx.send(event).await.map_err(|_| Failure::abandoned())
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Extract a 1..=10 score from the scorer's reply: first a JSON object
/// with an integer `score`, then a numeric-keyword heuristic.
pub(crate) fn parse_score(text: &str) -> Option<u8> {
    parse_score_json(text)
        .or_else(|| parse_score_heuristic(text))
        .map(|score| score.clamp(1, 10) as u8)
}

fn parse_score_json(text: &str) -> Option<i64> {
    for (index, _) in text.char_indices().filter(|(_, ch)| *ch == '{') {
        let mut stream =
            serde_json::Deserializer::from_str(&text[index..]).into_iter::<serde_json::Value>();
        if let Some(Ok(value)) = stream.next() {
            if let Some(score) = value.get("score").and_then(|v| v.as_i64()) {
                return Some(score);
            }
        }
    }
    None
}

fn parse_score_heuristic(text: &str) -> Option<i64> {
    let lower = text.to_ascii_lowercase();
    if let Some(pos) = lower.find("score") {
        if let Some(n) = first_integer(&lower[pos + "score".len()..]) {
            return Some(n);
        }
    }
    // Last resort: the first standalone small integer reads as the grade.
    lower
        .split(|ch: char| !ch.is_ascii_digit())
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<i64>().ok())
        .find(|n| (1..=10).contains(n))
}

fn first_integer(text: &str) -> Option<i64> {
    let digits: String = text
        .chars()
        .skip_while(|ch| !ch.is_ascii_digit())
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::testing::{ScriptedBackend, ScriptedReply};

    fn config(min_rounds: u32, max_rounds: u32) -> DebateConfig {
        DebateConfig {
            min_rounds,
            max_rounds,
            per_call_timeout_secs: 5,
            ..DebateConfig::default()
        }
    }

    struct Fixture {
        backend: Arc<ScriptedBackend>,
        store: Arc<TraceStore>,
        orchestrator: Orchestrator,
        _dir: tempfile::TempDir,
    }

    fn fixture(replies: Vec<ScriptedReply>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(replies));
        let store = Arc::new(TraceStore::open(dir.path().join("traces.db")).unwrap());
        let templates = Arc::new(TemplateStore::new(
            backend.clone() as Arc<dyn ChatBackend>,
            "embed",
        ));
        let orchestrator = Orchestrator::new(
            backend.clone() as Arc<dyn ChatBackend>,
            templates,
            store.clone(),
            Arc::new(PromptSet::default()),
            "embed",
        );
        Fixture {
            backend,
            store,
            orchestrator,
            _dir: dir,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<DebateEvent>) -> Vec<DebateEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn event_names(events: &[DebateEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|event| match event {
                DebateEvent::RagStarted => "rag_started",
                DebateEvent::RagCompleted { .. } => "rag_completed",
                DebateEvent::RoundStarted { .. } => "round_started",
                DebateEvent::ProposerStarted { .. } => "proposer_started",
                DebateEvent::ProposerDelta { .. } => "proposer_delta",
                DebateEvent::ProposerCompleted { .. } => "proposer_completed",
                DebateEvent::SkepticStarted { .. } => "skeptic_started",
                DebateEvent::SkepticDelta { .. } => "skeptic_delta",
                DebateEvent::SkepticCompleted { .. } => "skeptic_completed",
                DebateEvent::EarlyStop { .. } => "early_stop",
                DebateEvent::SynthesisStarted => "synthesis_started",
                DebateEvent::SynthesisDelta { .. } => "synthesis_delta",
                DebateEvent::SynthesisCompleted { .. } => "synthesis_completed",
                DebateEvent::Completed { .. } => "completed",
                DebateEvent::Failed { .. } => "failed",
            })
            .collect()
    }

    fn idle_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[test]
    fn termination_truth_table() {
        // Sentinel wins regardless of bounds.
        assert_eq!(termination_verdict(READY_SENTINEL, 1, 2, 5), Verdict::StopEarly);
        // Max rounds reached.
        assert_eq!(
            termination_verdict(CRITICAL_SENTINEL, 5, 1, 5),
            Verdict::StopAtMax
        );
        // Past min rounds with no critical marker.
        assert_eq!(
            termination_verdict("minor quibbles only", 2, 2, 5),
            Verdict::StopEarly
        );
        // Below min rounds always continues without the readiness sentinel.
        assert_eq!(
            termination_verdict("minor quibbles only", 1, 2, 5),
            Verdict::Continue
        );
        // Critical marker holds the debate open.
        assert_eq!(
            termination_verdict(CRITICAL_SENTINEL, 2, 1, 5),
            Verdict::Continue
        );
    }

    #[test]
    fn parse_score_handles_json_and_fallbacks() {
        assert_eq!(parse_score(r#"{"score": 8, "reasoning": "solid"}"#), Some(8));
        assert_eq!(
            parse_score("Here is my verdict:\n```json\n{\"score\": 6}\n```"),
            Some(6)
        );
        // Clamped into range.
        assert_eq!(parse_score(r#"{"score": 42}"#), Some(10));
        assert_eq!(parse_score(r#"{"score": 0}"#), Some(1));
        // Keyword heuristic.
        assert_eq!(parse_score("I'd score this a 7 out of 10."), Some(7));
        assert_eq!(parse_score("Rating: 9/10, well argued"), Some(9));
        // Nothing numeric.
        assert_eq!(parse_score("no numbers here"), None);
        assert_eq!(parse_score(""), None);
    }

    #[tokio::test]
    async fn early_stop_on_readiness_sentinel() {
        // Round 1 skeptic holds the debate open; round 2 signals readiness.
        let fx = fixture(vec![
            ScriptedReply::Text("first proposal".into()),
            ScriptedReply::Text(format!("weak spot. {CRITICAL_SENTINEL}")),
            ScriptedReply::Text("second proposal".into()),
            ScriptedReply::Text(format!("looks good now. {READY_SENTINEL}")),
            ScriptedReply::Text("final answer".into()),
            ScriptedReply::Text(r#"{"score": 9, "reasoning": "great"}"#.into()),
        ]);

        let rx = fx.orchestrator.run(
            "t1".into(),
            "a question".into(),
            config(1, 3),
            idle_cancel(),
        );
        let events = collect(rx).await;

        let names = event_names(&events);
        assert_eq!(names.iter().filter(|n| **n == "round_started").count(), 2);
        assert!(names.contains(&"early_stop"));
        assert_eq!(*names.last().unwrap(), "completed");

        let Some(DebateEvent::Completed { trace }) = events.last() else {
            panic!("expected completed event");
        };
        assert!(trace.early_stopped);
        assert_eq!(trace.total_rounds, 2);
        assert!(trace.rounds[1].skeptic_text.contains(READY_SENTINEL));
        assert_eq!(trace.auto_score, Some(9));
        assert_eq!(trace.timing.rounds_ms.len(), 2);

        // Persisted atomically with the same shape.
        let persisted = fx.store.get("t1").unwrap().unwrap();
        assert_eq!(persisted.total_rounds, 2);
        assert_eq!(persisted.rounds.len(), 2);

        // No round 3 was ever started: two rounds of two roles, then the
        // synthesizer and the scorer.
        let calls = fx
            .backend
            .chat_calls
            .load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(calls, 6);
    }

    #[tokio::test]
    async fn runs_to_max_rounds_when_critical_persists() {
        let critical = || ScriptedReply::Text(format!("still broken. {CRITICAL_SENTINEL}"));
        let fx = fixture(vec![
            ScriptedReply::Text("p1".into()),
            critical(),
            ScriptedReply::Text("p2".into()),
            critical(),
            ScriptedReply::Text("answer".into()),
            ScriptedReply::Text(r#"{"score": 5}"#.into()),
        ]);

        let rx = fx
            .orchestrator
            .run("t1".into(), "q".into(), config(1, 2), idle_cancel());
        let events = collect(rx).await;

        let names = event_names(&events);
        assert_eq!(names.iter().filter(|n| **n == "round_started").count(), 2);
        assert!(!names.contains(&"early_stop"));
        assert_eq!(
            names.iter().filter(|n| **n == "synthesis_completed").count(),
            1
        );

        let Some(DebateEvent::Completed { trace }) = events.last() else {
            panic!("expected completed event");
        };
        assert!(!trace.early_stopped);
        assert_eq!(trace.total_rounds, 2);
    }

    #[tokio::test]
    async fn deltas_concatenate_to_completed_text() {
        let fx = fixture(vec![
            ScriptedReply::Text("a proposal that streams across multiple chunks".into()),
            ScriptedReply::Text(format!("fine. {READY_SENTINEL}")),
            ScriptedReply::Text("the synthesized answer".into()),
            ScriptedReply::Text(r#"{"score": 7}"#.into()),
        ]);

        let rx = fx
            .orchestrator
            .run("t1".into(), "q".into(), config(1, 3), idle_cancel());
        let events = collect(rx).await;

        let mut streamed = String::new();
        let mut completed = None;
        for event in &events {
            match event {
                DebateEvent::ProposerDelta { round: 1, text } => streamed.push_str(text),
                DebateEvent::ProposerCompleted { round: 1, text, .. } => {
                    completed = Some(text.clone());
                }
                _ => {}
            }
        }
        assert_eq!(Some(streamed), completed);
    }

    #[tokio::test]
    async fn backend_failure_mid_round_fails_without_persisting() {
        let fx = fixture(vec![
            ScriptedReply::Text("p1".into()),
            ScriptedReply::Text(format!("needs work. {CRITICAL_SENTINEL}")),
            ScriptedReply::FailAfter {
                prefix: "partial second".into(),
                error: InferenceError::Timeout,
            },
        ]);

        let rx = fx
            .orchestrator
            .run("t1".into(), "q".into(), config(2, 3), idle_cancel());
        let events = collect(rx).await;

        let names = event_names(&events);
        assert_eq!(*names.last().unwrap(), "failed");
        assert!(!names.contains(&"completed"));
        assert!(names.contains(&"proposer_delta"));

        let Some(DebateEvent::Failed { kind, round, .. }) = events.last() else {
            panic!("expected failed event");
        };
        assert_eq!(kind, "timeout");
        assert_eq!(*round, Some(2));

        assert!(fx.store.get("t1").unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_emits_failed_and_skips_persistence() {
        let fx = fixture(vec![ScriptedReply::Text("p1".into())]);
        let (cancel_tx, cancel_rx) = watch::channel(true);

        let rx = fx
            .orchestrator
            .run("t1".into(), "q".into(), config(1, 3), cancel_rx);
        let events = collect(rx).await;
        drop(cancel_tx);

        let Some(DebateEvent::Failed { kind, .. }) = events.last() else {
            panic!("expected failed event");
        };
        assert_eq!(kind, "cancelled");
        assert!(fx.store.get("t1").unwrap().is_none());
    }

    #[tokio::test]
    async fn scorer_call_failure_is_not_fatal() {
        let fx = fixture(vec![
            ScriptedReply::Text("p1".into()),
            ScriptedReply::Text(format!("ok. {READY_SENTINEL}")),
            ScriptedReply::Text("answer".into()),
            ScriptedReply::FailBefore(InferenceError::BackendUnreachable("gone".into())),
        ]);

        let rx = fx
            .orchestrator
            .run("t1".into(), "q".into(), config(1, 2), idle_cancel());
        let events = collect(rx).await;

        let Some(DebateEvent::Completed { trace }) = events.last() else {
            panic!("expected completed event");
        };
        assert_eq!(trace.auto_score, None);
    }

    #[tokio::test]
    async fn unparseable_score_records_neutral_default() {
        let fx = fixture(vec![
            ScriptedReply::Text("p1".into()),
            ScriptedReply::Text(format!("ok. {READY_SENTINEL}")),
            ScriptedReply::Text("answer".into()),
            ScriptedReply::Text("utterly unquantifiable".into()),
        ]);

        let rx = fx
            .orchestrator
            .run("t1".into(), "q".into(), config(1, 2), idle_cancel());
        let events = collect(rx).await;

        let Some(DebateEvent::Completed { trace }) = events.last() else {
            panic!("expected completed event");
        };
        assert_eq!(trace.auto_score, Some(NEUTRAL_SCORE));
    }

    #[tokio::test]
    async fn event_order_matches_the_documented_sequence() {
        let fx = fixture(vec![
            ScriptedReply::Text("p1".into()),
            ScriptedReply::Text(format!("done. {READY_SENTINEL}")),
            ScriptedReply::Text("answer".into()),
            ScriptedReply::Text(r#"{"score": 8}"#.into()),
        ]);

        let rx = fx
            .orchestrator
            .run("t1".into(), "q".into(), config(1, 2), idle_cancel());
        let events = collect(rx).await;
        let names = event_names(&events);

        // Collapse delta runs so the skeleton is comparable.
        let mut skeleton: Vec<&str> = Vec::new();
        for name in names {
            if skeleton.last() == Some(&name) && name.ends_with("_delta") {
                continue;
            }
            skeleton.push(name);
        }
        assert_eq!(
            skeleton,
            vec![
                "rag_started",
                "rag_completed",
                "round_started",
                "proposer_started",
                "proposer_delta",
                "proposer_completed",
                "skeptic_started",
                "skeptic_delta",
                "skeptic_completed",
                "early_stop",
                "synthesis_started",
                "synthesis_delta",
                "synthesis_completed",
                "completed",
            ]
        );
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = DebateEvent::ProposerDelta {
            round: 2,
            text: "chunk".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "proposer_delta");
        assert_eq!(json["round"], 2);

        let event = DebateEvent::SynthesisCompleted {
            text: "t".into(),
            duration_ms: 12,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["durationMs"], 12);
    }
}
