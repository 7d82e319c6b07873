//! Feedback Controller - Compose, Generate, Evaluate, Retry
//!
//! CRITICAL: composition defects are FATAL on the spot. Regenerating a
//! deterministic composition reproduces the same defect.
//!
//! Every candidate produced by every attempt ends up in the `RunRecord`,
//! whatever the terminal state.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::assets::AssetRegistry;
use crate::composer::{compose, compose_raw, ComposeOptions, PromptBundle, MAX_LEAK_GUARD};
use crate::error::ComposeError;
use crate::evaluation::{evaluate_batch, CandidateEvaluator, FidelityScore, ViolationKind};
use crate::generation::{CancelToken, Candidate, GenerationParams, Generator};
use crate::hashing::sha256_hex;
use crate::spec::DiagramSpec;
use crate::templates::Template;
use crate::ENGINE_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Composing,
    Generating,
    Evaluating,
    Accepted,
    Exhausted,
    Fatal,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Exhausted | Self::Fatal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Composing => "COMPOSING",
            Self::Generating => "GENERATING",
            Self::Evaluating => "EVALUATING",
            Self::Accepted => "ACCEPTED",
            Self::Exhausted => "EXHAUSTED",
            Self::Fatal => "FATAL",
        }
    }

    /// CLI exit code for a terminal state.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::Exhausted => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Composed,
    CompositionFailed,
    CandidatesProduced,
    NoCandidates,
    Evaluated { clean: bool },
    Cancelled { has_candidates: bool },
}

/// Pure transition function. `attempts_used` counts generation attempts
/// already made, including the one that produced `event`.
///
/// Terminal states absorb every event; events that do not apply to the
/// current state leave it unchanged.
pub fn transition(state: RunState, event: RunEvent, attempts_used: u32, max_attempts: u32) -> RunState {
    use RunEvent::*;
    use RunState::*;

    if state.is_terminal() {
        return state;
    }
    let budget_left = attempts_used < max_attempts;

    match (state, event) {
        (_, Cancelled { has_candidates: true }) => Exhausted,
        (_, Cancelled { has_candidates: false }) => Fatal,
        (Composing, Composed) => Generating,
        (Composing | Generating, CompositionFailed) => Fatal,
        (Generating, CandidatesProduced) => Evaluating,
        (Generating, NoCandidates) if budget_left => Generating,
        (Generating, NoCandidates) => Exhausted,
        (Evaluating, Evaluated { clean: true }) => Accepted,
        (Evaluating, Evaluated { clean: false }) if budget_left => Generating,
        (Evaluating, Evaluated { clean: false }) => Exhausted,
        (other, _) => other,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    /// `attempt-NN-candidate-MM`
    pub id: String,
    pub attempt: u32,
    pub index: usize,
    pub content_hash: String,
    pub mime_type: String,
    pub score: FidelityScore,
    pub accepted: bool,
    /// Path of the stored artifact, relative to the run directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(skip)]
    pub candidate: Candidate,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub number: u32,
    pub input_hash: String,
    pub prompt_hash: String,
    pub leak_guard: u8,
    pub candidates: Vec<CandidateRecord>,
    pub failures: Vec<String>,
    #[serde(skip)]
    pub prompt_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalState {
    Accepted { candidate_id: String },
    Exhausted { best_candidate_ids: Vec<String> },
    Fatal { reason: String },
}

/// Durable audit trail of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub run_name: String,
    pub engine_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_hash: Option<String>,
    pub max_attempts: u32,
    pub state: RunState,
    pub history: Vec<RunState>,
    pub terminal: Option<TerminalState>,
    pub attempts: Vec<AttemptRecord>,
}

impl RunRecord {
    fn start(run_name: &str, max_attempts: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            run_name: run_name.to_string(),
            engine_version: ENGINE_VERSION.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            input_hash: None,
            max_attempts,
            state: RunState::Composing,
            history: vec![RunState::Composing],
            terminal: None,
            attempts: vec![],
        }
    }

    fn advance(&mut self, next: RunState) {
        if next != self.state || next == RunState::Generating {
            info!(run = self.run_name.as_str(), from = self.state.as_str(), to = next.as_str(); "Run state changed");
        }
        self.state = next;
        self.history.push(next);
    }

    fn finish(mut self) -> Self {
        self.terminal = Some(match self.state {
            RunState::Accepted => TerminalState::Accepted {
                candidate_id: self.accepted().map(|c| c.id.clone()).unwrap_or_default(),
            },
            RunState::Exhausted => TerminalState::Exhausted {
                best_candidate_ids: self.best_candidates().iter().map(|c| c.id.clone()).collect(),
            },
            _ => TerminalState::Fatal { reason: "run ended without a terminal state".to_string() },
        });
        self.finished_at = Some(Utc::now());
        self
    }

    fn finish_fatal(mut self, reason: String) -> Self {
        error!(run = self.run_name.as_str(), reason = reason.as_str(); "Run failed");
        self.advance(RunState::Fatal);
        self.terminal = Some(TerminalState::Fatal { reason });
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn candidates(&self) -> impl Iterator<Item = &CandidateRecord> {
        self.attempts.iter().flat_map(|a| a.candidates.iter())
    }

    pub fn accepted(&self) -> Option<&CandidateRecord> {
        self.candidates().find(|c| c.accepted)
    }

    /// Every candidate sharing the best rank, oldest first.
    pub fn best_candidates(&self) -> Vec<&CandidateRecord> {
        let Some(best) = self.candidates().map(|c| c.score.rank()).min() else {
            return vec![];
        };
        self.candidates().filter(|c| c.score.rank() == best).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub max_attempts: u32,
    pub params: GenerationParams,
    pub compose: ComposeOptions,
    /// Raise the leak guard after an attempt with FILENAME_LEAK.
    pub strengthen_on_retry: bool,
    /// Compose from a raw prompt instead of a diagram spec.
    pub raw: bool,
}

pub struct FeedbackController<'a, G: ?Sized, E: ?Sized> {
    generator: &'a G,
    evaluator: &'a E,
    cancel: CancelToken,
}

impl<'a, G, E> FeedbackController<'a, G, E>
where
    G: Generator + ?Sized,
    E: CandidateEvaluator + ?Sized,
{
    pub fn new(generator: &'a G, evaluator: &'a E) -> Self {
        Self { generator, evaluator, cancel: CancelToken::new() }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn compose(
        &self,
        spec: &DiagramSpec,
        template: &Template,
        registry: &AssetRegistry,
        options: &ControllerOptions,
        leak_guard: u8,
    ) -> Result<PromptBundle, ComposeError> {
        let compose_options = ComposeOptions { leak_guard, ..options.compose.clone() };
        if options.raw {
            compose_raw(template, registry, &compose_options)
        } else {
            compose(spec, template, registry, &compose_options)
        }
    }

    /// Run the loop to a terminal state.
    pub fn drive(
        &self,
        run_name: &str,
        spec: &DiagramSpec,
        template: &Template,
        registry: &AssetRegistry,
        options: &ControllerOptions,
    ) -> RunRecord {
        let max_attempts = options.max_attempts.max(1);
        let mut record = RunRecord::start(run_name, max_attempts);
        info!(run = run_name, max_attempts = max_attempts; "Starting run");

        let mut leak_guard = options.compose.leak_guard;
        let mut bundle = match self.compose(spec, template, registry, options, leak_guard) {
            Ok(bundle) => bundle,
            Err(e) => return record.finish_fatal(e.to_string()),
        };
        record.input_hash = Some(bundle.input_hash.clone());
        record.advance(transition(record.state, RunEvent::Composed, 0, max_attempts));

        let mut attempts = 0u32;
        let mut strengthen = false;

        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled(record);
            }
            attempts += 1;

            if strengthen && leak_guard < MAX_LEAK_GUARD {
                leak_guard += 1;
                info!(run = run_name, leak_guard = leak_guard; "Strengthening file-name instruction");
                bundle = match self.compose(spec, template, registry, options, leak_guard) {
                    Ok(bundle) => bundle,
                    Err(e) => return record.finish_fatal(e.to_string()),
                };
            }

            let batch = self.generator.generate(&bundle, &options.params, &self.cancel);
            let scores = evaluate_batch(self.evaluator, &batch.candidates, spec, registry);
            let accepted_at = scores.iter().position(FidelityScore::is_clean);
            strengthen = options.strengthen_on_retry
                && scores.iter().any(|s| s.has(ViolationKind::FilenameLeak));

            let candidates: Vec<CandidateRecord> = batch
                .candidates
                .into_iter()
                .zip(scores)
                .enumerate()
                .map(|(pos, (candidate, score))| CandidateRecord {
                    id: format!("attempt-{:02}-candidate-{:02}", attempts, candidate.index + 1),
                    attempt: attempts,
                    index: candidate.index,
                    content_hash: sha256_hex(&candidate.bytes),
                    mime_type: candidate.mime_type.clone(),
                    accepted: accepted_at == Some(pos),
                    score,
                    artifact: None,
                    candidate,
                })
                .collect();
            let produced = !candidates.is_empty();

            for c in &candidates {
                info!(
                    run = run_name,
                    candidate = c.id.as_str(),
                    errors = c.score.error_count(),
                    violations = c.score.violations.len();
                    "Candidate scored"
                );
            }

            record.attempts.push(AttemptRecord {
                number: attempts,
                input_hash: bundle.input_hash.clone(),
                prompt_hash: bundle.prompt_hash.clone(),
                leak_guard: bundle.leak_guard,
                candidates,
                failures: batch.failures.iter().map(|f| f.to_string()).collect(),
                prompt_text: bundle.text.clone(),
            });

            if self.cancel.is_cancelled() {
                return self.cancelled(record);
            }

            if !produced {
                warn!(run = run_name, attempt = attempts; "Provider produced no candidates");
                record.advance(transition(record.state, RunEvent::NoCandidates, attempts, max_attempts));
            } else {
                record.advance(transition(record.state, RunEvent::CandidatesProduced, attempts, max_attempts));
                record.advance(transition(
                    record.state,
                    RunEvent::Evaluated { clean: accepted_at.is_some() },
                    attempts,
                    max_attempts,
                ));
            }

            match record.state {
                RunState::Generating => continue,
                RunState::Accepted | RunState::Exhausted => return record.finish(),
                _ => return record.finish_fatal("controller reached an unexpected state".to_string()),
            }
        }
    }

    fn cancelled(&self, mut record: RunRecord) -> RunRecord {
        warn!(run = record.run_name.as_str(); "Run cancelled");
        let has_candidates = record.candidates().next().is_some();
        let next = transition(
            record.state,
            RunEvent::Cancelled { has_candidates },
            record.attempts.len() as u32,
            record.max_attempts,
        );
        if next == RunState::Fatal {
            return record.finish_fatal("cancelled before any candidate was produced".to_string());
        }
        record.advance(next);
        record.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunEvent::*;
    use RunState::*;

    #[test]
    fn test_composition_outcomes() {
        assert_eq!(transition(Composing, Composed, 0, 3), Generating);
        assert_eq!(transition(Composing, CompositionFailed, 0, 3), Fatal);
    }

    #[test]
    fn test_generation_outcomes() {
        assert_eq!(transition(Generating, CandidatesProduced, 1, 3), Evaluating);
        assert_eq!(transition(Generating, NoCandidates, 1, 3), Generating);
        assert_eq!(transition(Generating, NoCandidates, 3, 3), Exhausted);
    }

    #[test]
    fn test_evaluation_outcomes() {
        assert_eq!(transition(Evaluating, Evaluated { clean: true }, 3, 3), Accepted);
        assert_eq!(transition(Evaluating, Evaluated { clean: false }, 1, 3), Generating);
        assert_eq!(transition(Evaluating, Evaluated { clean: false }, 1, 1), Exhausted);
    }

    #[test]
    fn test_cancellation() {
        assert_eq!(transition(Generating, Cancelled { has_candidates: true }, 1, 3), Exhausted);
        assert_eq!(transition(Composing, Cancelled { has_candidates: false }, 0, 3), Fatal);
    }

    #[test]
    fn test_terminal_states_absorb() {
        for terminal in [Accepted, Exhausted, Fatal] {
            assert_eq!(transition(terminal, Composed, 0, 3), terminal);
            assert_eq!(transition(terminal, Cancelled { has_candidates: false }, 0, 3), terminal);
        }
    }

    #[test]
    fn test_inapplicable_event_keeps_state() {
        assert_eq!(transition(Composing, Evaluated { clean: true }, 0, 3), Composing);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Accepted.exit_code(), 0);
        assert_eq!(Exhausted.exit_code(), 1);
        assert_eq!(Fatal.exit_code(), 2);
    }
}
