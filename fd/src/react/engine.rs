//! ReactLoop - the round-by-round thought/action/observation driver
//!
//! Each round builds a prompt from the goal and accumulated observations,
//! obtains a structured decision from the agent (with format repair),
//! optionally passes it through a reviewer, dispatches the action, and
//! evaluates the stop conditions:
//!
//! - success stop: action in `complete_actions` with a successful result
//! - fail stop: action in `fail_actions` or a `fail` stop request
//! - escalation: a result requesting `escalate`
//! - reviewer exhaustion: too many consecutive rejections
//! - convergence: two consecutive rounds with no new information
//! - stuck: the configured count of no-progress rounds
//! - budget: `max_rounds` reached

use handlebars::Handlebars;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::actions::{ActionContext, ActionRegistry, ActionResult, StopReason};

use super::agent::{Agent, Reviewer};
use super::decision::{DECISION_SHAPE, Decision, parse_decision};
use super::snapshot::{RoundSnapshot, SnapshotKind, SnapshotSink, excerpt};

const ROUND_TEMPLATE: &str = "\
{{goal}}

Round {{round}} of {{max_rounds}}.

Available actions:
{{#each actions}}- {{this.name}}: {{this.description}}
{{/each}}
{{#if observations}}
Observations so far:
{{#each observations}}{{this}}
{{/each}}{{/if}}
Respond with exactly one JSON object:
{\"thought\": \"<reasoning>\", \"action\": \"<ACTION_NAME>\", \"params\": { ... }}";

const REPAIR_TEMPLATE: &str = "\
Your previous response could not be used: {{error}} (offending field: {{field}}).
Respond again with exactly one JSON object of this shape and nothing else:
{{shape}}";

/// Stop-condition configuration
#[derive(Debug, Clone)]
pub struct StopConditions {
    pub complete_actions: Vec<String>,
    pub fail_actions: Vec<String>,
    pub max_rounds: u32,
    /// Stop when two consecutive rounds produce no new information
    pub on_convergence: bool,
    /// Stop after this many rounds without progress
    pub on_stuck: Option<u32>,
    /// Stop after this many consecutive reviewer rejections
    pub max_rejections: Option<u32>,
}

impl Default for StopConditions {
    fn default() -> Self {
        Self {
            complete_actions: vec!["COMPLETE".to_string()],
            fail_actions: vec!["FAIL".to_string()],
            max_rounds: 10,
            on_convergence: false,
            on_stuck: None,
            max_rejections: None,
        }
    }
}

/// Format-repair budget
#[derive(Debug, Clone)]
pub struct FormatFix {
    pub max_retries: u32,
}

impl Default for FormatFix {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReactConfig {
    pub stop: StopConditions,
    pub format_fix: FormatFix,
    /// Reset the agent's session at the start of every round
    pub fresh_session_per_round: bool,
}

/// How a loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactStatus {
    Complete,
    Failed,
    Escalated,
    RejectionsExhausted,
    Converged,
    Stuck,
    Budget,
    MalformedDecision,
}

/// One recorded round
#[derive(Debug, Clone)]
pub struct ReActIteration {
    pub round: u32,
    pub thought: String,
    pub action: String,
    pub params: serde_json::Value,
    pub result: ActionResult,
}

/// Final outcome of a loop
#[derive(Debug, Clone)]
pub struct ReactOutcome {
    pub status: ReactStatus,
    pub rounds: u32,
    pub last_observation: Option<String>,
    pub last_error: Option<String>,
    pub iterations: Vec<ReActIteration>,
}

impl ReactOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == ReactStatus::Complete
    }
}

/// Result of trying to obtain one structured decision
enum DecisionAttempt {
    Parsed(Decision),
    /// Repair budget exhausted; carries the last parse error
    Malformed(super::decision::DecisionError),
    /// Transport failure from the agent
    AgentError(eyre::Report),
}

/// The loop runtime for one agent
pub struct ReactLoop {
    agent: Arc<dyn Agent>,
    registry: Arc<ActionRegistry>,
    reviewer: Option<Arc<dyn Reviewer>>,
    config: ReactConfig,
    snapshots: Option<Arc<dyn SnapshotSink>>,
    templates: Handlebars<'static>,
}

impl ReactLoop {
    pub fn new(agent: Arc<dyn Agent>, registry: Arc<ActionRegistry>, config: ReactConfig) -> Self {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        // Static templates cannot fail to parse.
        let _ = templates.register_template_string("round", ROUND_TEMPLATE);
        let _ = templates.register_template_string("repair", REPAIR_TEMPLATE);
        Self {
            agent,
            registry,
            reviewer: None,
            config,
            snapshots: None,
            templates,
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn with_snapshots(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshots = Some(sink);
        self
    }

    fn snapshot(&self, snapshot: RoundSnapshot) {
        if let Some(sink) = &self.snapshots {
            sink.record(&snapshot);
        }
    }

    fn render_round_prompt(&self, goal: &str, round: u32, observations: &[String]) -> String {
        let actions: Vec<serde_json::Value> = self
            .registry
            .list()
            .into_iter()
            .map(|spec| json!({"name": spec.name, "description": spec.description}))
            .collect();
        self.templates
            .render(
                "round",
                &json!({
                    "goal": goal,
                    "round": round,
                    "max_rounds": self.config.stop.max_rounds,
                    "actions": actions,
                    "observations": observations,
                }),
            )
            .unwrap_or_else(|_| goal.to_string())
    }

    fn render_repair_prompt(&self, error: &super::decision::DecisionError) -> String {
        self.templates
            .render(
                "repair",
                &json!({"error": error.to_string(), "field": error.field(), "shape": DECISION_SHAPE}),
            )
            .unwrap_or_else(|_| DECISION_SHAPE.to_string())
    }

    /// Obtain a parseable decision, re-prompting on malformed output up
    /// to the format-fix budget.
    async fn obtain_decision(&self, prompt: &str, round: u32) -> DecisionAttempt {
        let mut raw = match self.agent.generate(prompt).await {
            Ok(raw) => raw,
            Err(e) => return DecisionAttempt::AgentError(eyre::eyre!(e)),
        };

        let mut attempts = 0;
        loop {
            match parse_decision(&raw) {
                Ok(decision) => return DecisionAttempt::Parsed(decision),
                Err(parse_err) => {
                    if attempts >= self.config.format_fix.max_retries {
                        return DecisionAttempt::Malformed(parse_err);
                    }
                    attempts += 1;
                    debug!(round, attempt = attempts, error = %parse_err, "format repair");
                    self.snapshot(RoundSnapshot {
                        agent_id: self.agent.id().to_string(),
                        round,
                        kind: SnapshotKind::FormatRepair,
                        thought_excerpt: excerpt(&raw),
                        action: None,
                        params: None,
                        observation: None,
                        error: Some(parse_err.to_string()),
                        duration_ms: 0,
                        timestamp: chrono::Utc::now(),
                    });
                    let repair = self.render_repair_prompt(&parse_err);
                    raw = match self.agent.generate(&repair).await {
                        Ok(raw) => raw,
                        Err(e) => return DecisionAttempt::AgentError(eyre::eyre!(e)),
                    };
                }
            }
        }
    }

    /// Drive the loop over `goal` until a stop condition fires.
    ///
    /// Agent transport failures (kernel errors after the bridge's retry
    /// policy) surface as `Err`; everything else is an outcome.
    pub async fn run(&self, goal: &str, ctx: &ActionContext) -> eyre::Result<ReactOutcome> {
        info!(agent_id = %self.agent.id(), max_rounds = self.config.stop.max_rounds, "react loop starting");

        let mut observations: Vec<String> = Vec::new();
        let mut iterations: Vec<ReActIteration> = Vec::new();
        let mut rejection_streak: u32 = 0;
        let mut last_signature: Option<String> = None;
        let mut repeat_count: u32 = 0;
        let mut round: u32 = 0;

        let outcome = |status: ReactStatus, rounds: u32, observations: &[String], error: Option<String>, iterations: Vec<ReActIteration>| ReactOutcome {
            status,
            rounds,
            last_observation: observations.last().cloned(),
            last_error: error,
            iterations,
        };

        loop {
            round += 1;
            if self.config.fresh_session_per_round && round > 1 {
                debug!(round, "resetting agent session for fresh round");
                self.agent.reset().await;
            }

            let prompt = self.render_round_prompt(goal, round, &observations);
            let round_started = Instant::now();

            let decision = match self.obtain_decision(&prompt, round).await {
                DecisionAttempt::Parsed(decision) => decision,
                DecisionAttempt::Malformed(parse_err) => {
                    warn!(round, error = %parse_err, "format repair exhausted");
                    return Ok(outcome(
                        ReactStatus::MalformedDecision,
                        round,
                        &observations,
                        Some(format!("MalformedDecision: {}", parse_err)),
                        iterations,
                    ));
                }
                DecisionAttempt::AgentError(agent_err) => return Err(agent_err),
            };

            debug!(round, action = %decision.action, "decision");

            // Unknown actions are recorded as failed observations and
            // count toward stuck detection.
            if !self.registry.has(&decision.action) {
                let error = format!("UnknownAction: {}", decision.action);
                observations.push(error.clone());
                let signature = format!("{}|{}", decision.action, error);
                repeat_count = if last_signature.as_deref() == Some(&signature) {
                    repeat_count + 1
                } else {
                    0
                };
                last_signature = Some(signature);
                iterations.push(ReActIteration {
                    round,
                    thought: decision.thought.clone(),
                    action: decision.action.clone(),
                    params: decision.params.clone(),
                    result: ActionResult::error(error.clone()),
                });
                self.snapshot(RoundSnapshot {
                    agent_id: self.agent.id().to_string(),
                    round,
                    kind: SnapshotKind::Thought,
                    thought_excerpt: excerpt(&decision.thought),
                    action: Some(decision.action.clone()),
                    params: Some(decision.params.clone()),
                    observation: None,
                    error: Some(error),
                    duration_ms: round_started.elapsed().as_millis() as u64,
                    timestamp: chrono::Utc::now(),
                });
                if let Some(stopped) = self.check_passive_stops(round, repeat_count, rejection_streak) {
                    return Ok(outcome(stopped, round, &observations, None, iterations));
                }
                continue;
            }

            // Reviewer gate.
            if let Some(reviewer) = &self.reviewer {
                let verdict = reviewer.review(&decision).await;
                if !verdict.approved {
                    rejection_streak += 1;
                    let note = format!("Reviewer rejected {}: {}", decision.action, verdict.reason);
                    observations.push(note.clone());

                    let signature = format!("{}|{}", decision.action, verdict.reason);
                    repeat_count = if last_signature.as_deref() == Some(&signature) {
                        repeat_count + 1
                    } else {
                        0
                    };
                    last_signature = Some(signature);

                    self.snapshot(RoundSnapshot {
                        agent_id: self.agent.id().to_string(),
                        round,
                        kind: SnapshotKind::Thought,
                        thought_excerpt: excerpt(&decision.thought),
                        action: Some(decision.action.clone()),
                        params: Some(decision.params.clone()),
                        observation: None,
                        error: Some(note),
                        duration_ms: round_started.elapsed().as_millis() as u64,
                        timestamp: chrono::Utc::now(),
                    });

                    if let Some(max) = self.config.stop.max_rejections
                        && rejection_streak >= max
                    {
                        info!(round, rejection_streak, "reviewer rejections exhausted");
                        return Ok(outcome(
                            ReactStatus::RejectionsExhausted,
                            round,
                            &observations,
                            None,
                            iterations,
                        ));
                    }
                    if let Some(stopped) = self.check_passive_stops(round, repeat_count, rejection_streak) {
                        return Ok(outcome(stopped, round, &observations, None, iterations));
                    }
                    continue;
                }
                rejection_streak = 0;
            }

            // Dispatch.
            let result = self.registry.execute(&decision.action, decision.params.clone(), ctx).await;
            let duration_ms = round_started.elapsed().as_millis() as u64;

            let observation_text = result.observation_or_error();
            if !observation_text.is_empty() {
                observations.push(format!("[{}] {}", decision.action, observation_text));
            }

            let signature = format!("{}|{}", decision.action, observation_text);
            repeat_count = if last_signature.as_deref() == Some(&signature) {
                repeat_count + 1
            } else {
                0
            };
            last_signature = Some(signature);

            self.snapshot(RoundSnapshot {
                agent_id: self.agent.id().to_string(),
                round,
                kind: SnapshotKind::Thought,
                thought_excerpt: excerpt(&decision.thought),
                action: Some(decision.action.clone()),
                params: Some(decision.params.clone()),
                observation: result.observation.clone(),
                error: result.error.clone(),
                duration_ms,
                timestamp: chrono::Utc::now(),
            });

            iterations.push(ReActIteration {
                round,
                thought: decision.thought.clone(),
                action: decision.action.clone(),
                params: decision.params.clone(),
                result: result.clone(),
            });

            // Terminal stop conditions, in order.
            if self.config.stop.complete_actions.contains(&decision.action) && result.success {
                info!(round, action = %decision.action, "loop complete");
                return Ok(outcome(ReactStatus::Complete, round, &observations, None, iterations));
            }
            if self.config.stop.fail_actions.contains(&decision.action)
                || result.stop_reason == Some(StopReason::Fail)
            {
                info!(round, action = %decision.action, "loop failed");
                return Ok(outcome(
                    ReactStatus::Failed,
                    round,
                    &observations,
                    result.error.clone(),
                    iterations,
                ));
            }
            if result.stop_reason == Some(StopReason::Escalate) {
                info!(round, action = %decision.action, "loop escalating");
                return Ok(outcome(
                    ReactStatus::Escalated,
                    round,
                    &observations,
                    result.error.clone(),
                    iterations,
                ));
            }
            if let Some(stopped) = self.check_passive_stops(round, repeat_count, rejection_streak) {
                return Ok(outcome(stopped, round, &observations, None, iterations));
            }
        }
    }

    /// Convergence, stuck, and budget stops (checked after every round)
    fn check_passive_stops(&self, round: u32, repeat_count: u32, _rejection_streak: u32) -> Option<ReactStatus> {
        if self.config.stop.on_convergence && repeat_count >= 1 {
            info!(round, "convergence detected");
            return Some(ReactStatus::Converged);
        }
        if let Some(stuck_limit) = self.config.stop.on_stuck
            && repeat_count >= stuck_limit
        {
            info!(round, repeat_count, "stuck detected");
            return Some(ReactStatus::Stuck);
        }
        if round >= self.config.stop.max_rounds {
            info!(round, "round budget exhausted");
            return Some(ReactStatus::Budget);
        }
        None
    }
}
