//! Workflow execution
//!
//! Runs a [`WorkflowPlan`] phase by phase through the dispatcher. Step
//! failures are captured per slot and never abort sibling steps. A failed
//! step in a `required` phase stops the remaining phases, whose fixed steps
//! are reported as skipped. Runs can be cancelled between phases; the
//! phases not yet started are reported as skipped the same way.
//!
//! Step keys are expected to be unique within a run. A repeated key replaces
//! the earlier slot and is logged.

use crate::context::RelayContext;
use crate::dispatcher::Dispatcher;
use crate::ledger::{TaskLedger, WorkflowRun, WorkflowRunStatus};
use crate::orchestration::aggregate::{AggregatedResults, SectionOutcome};
use crate::orchestration::plan::{ExecutionMode, StepSpec, WorkflowPlan};
use crate::{Error, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Configuration for workflow execution
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Per-step timeout when the step does not set one
    pub default_timeout: Duration,
    /// Upper bound on concurrent dispatches in a parallel phase
    pub max_parallel: usize,
    /// Honour `StepSpec::cached`
    pub use_cache: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            max_parallel: 8,
            use_cache: true,
        }
    }
}

/// Result of executing a plan
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub run: WorkflowRun,
    pub sections: AggregatedResults,
}

struct ActiveRun {
    run: WorkflowRun,
    cancel: CancellationToken,
}

pub struct WorkflowOrchestrator {
    dispatcher: Arc<Dispatcher>,
    ledger: Option<Arc<dyn TaskLedger>>,
    config: OrchestratorConfig,
    active_runs: Arc<RwLock<HashMap<Uuid, ActiveRun>>>,
}

impl WorkflowOrchestrator {
    pub fn new(context: &RelayContext, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            ledger: context.ledger.clone(),
            config: OrchestratorConfig {
                default_timeout: context.settings.task_timeout(),
                max_parallel: context.settings.agent.max_parallel,
                use_cache: true,
            },
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Execute every phase of `plan` and aggregate the sections
    pub async fn execute(&self, plan: &WorkflowPlan, input: Value) -> WorkflowOutcome {
        let mut run = WorkflowRun::new(plan.name.clone(), input);
        run.status = WorkflowRunStatus::Running;
        run.started_at = Some(Utc::now());
        let run_id = run.run_id;

        let cancel = CancellationToken::new();
        self.active_runs.write().await.insert(
            run_id,
            ActiveRun {
                run: run.clone(),
                cancel: cancel.clone(),
            },
        );
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.create_run(&run).await {
                warn!(run_id = %run_id, error = %e, "Failed to record workflow run");
            }
        }
        info!(run_id = %run_id, workflow = %plan.name, "Workflow started");

        let mut sections = AggregatedResults::new();
        let mut halted: Option<String> = None;
        let mut cancelled = false;

        for phase in plan.phases() {
            if halted.is_none() && cancel.is_cancelled() {
                info!(run_id = %run_id, phase = %phase.name(), "Workflow cancelled; skipping remaining phases");
                cancelled = true;
                halted = Some("workflow cancelled".to_string());
            }

            let steps = phase.steps(&sections);
            if let Some(reason) = &halted {
                for step in steps {
                    insert_section(
                        &mut sections,
                        step.key,
                        SectionOutcome::Skipped {
                            reason: reason.clone(),
                        },
                    );
                }
                continue;
            }

            let outcomes = match phase.mode() {
                ExecutionMode::Sequential => {
                    let mut outcomes = Vec::with_capacity(steps.len());
                    for step in steps {
                        outcomes.push(self.run_step(step).await);
                    }
                    outcomes
                }
                ExecutionMode::Parallel => self.run_parallel(steps).await,
            };

            let phase_failed = outcomes.iter().any(|(_, outcome)| !outcome.is_success());
            for (key, outcome) in outcomes {
                if let Some(result) = outcome.task_result() {
                    run.task_ids.push(result.task_id);
                }
                insert_section(&mut sections, key, outcome);
            }
            self.update_active(run_id, &run).await;

            if phase_failed && phase.is_required() {
                warn!(run_id = %run_id, phase = %phase.name(), "Required phase failed; skipping remaining phases");
                halted = Some(format!("required phase '{}' failed", phase.name()));
            }
        }

        run.status = if cancelled {
            WorkflowRunStatus::Cancelled
        } else if halted.is_some() {
            WorkflowRunStatus::Failed
        } else {
            WorkflowRunStatus::from_children(sections.iter().filter_map(|(_, s)| s.child_status()))
        };
        run.error = match run.status {
            WorkflowRunStatus::Cancelled => Some("workflow cancelled".to_string()),
            WorkflowRunStatus::Failed => Some(
                halted.unwrap_or_else(|| "no section completed successfully".to_string()),
            ),
            _ => None,
        };
        run.results = sections.to_value();
        run.completed_at = Some(Utc::now());

        self.active_runs.write().await.remove(&run_id);
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.update_run(&run).await {
                warn!(run_id = %run_id, error = %e, "Failed to record workflow outcome");
            }
        }

        let summary = sections.summary();
        info!(
            run_id = %run_id,
            workflow = %plan.name,
            status = %run.status,
            successful = summary.successful,
            failed = summary.failed,
            "Workflow finished"
        );
        WorkflowOutcome { run, sections }
    }

    /// Dispatch independent steps concurrently and aggregate them in order
    pub async fn fan_out(&self, steps: Vec<StepSpec>) -> AggregatedResults {
        let mut sections = AggregatedResults::new();
        for (key, outcome) in self.run_parallel(steps).await {
            insert_section(&mut sections, key, outcome);
        }
        sections
    }

    async fn run_parallel(&self, steps: Vec<StepSpec>) -> Vec<(String, SectionOutcome)> {
        stream::iter(steps.into_iter().map(|step| self.run_step(step)))
            .buffered(self.config.max_parallel.max(1))
            .collect()
            .await
    }

    async fn run_step(&self, step: StepSpec) -> (String, SectionOutcome) {
        let timeout = step.timeout.unwrap_or(self.config.default_timeout);
        let outcome = if step.cached && self.config.use_cache {
            self.dispatcher
                .dispatch_cached(&step.agent_type, &step.operation_name, step.input_data, timeout)
                .await
        } else {
            self.dispatcher
                .dispatch(&step.agent_type, &step.operation_name, step.input_data, timeout)
                .await
        };

        let outcome = match outcome {
            Ok(result) => SectionOutcome::from_result(result),
            Err(e) => {
                warn!(step = %step.key, error = %e, "Step dispatch failed");
                SectionOutcome::Failed {
                    error: e.to_string(),
                    result: None,
                }
            }
        };
        (step.key, outcome)
    }

    async fn update_active(&self, run_id: Uuid, run: &WorkflowRun) {
        if let Some(active) = self.active_runs.write().await.get_mut(&run_id) {
            active.run.task_ids = run.task_ids.clone();
        }
    }

    /// Snapshot of a run still executing
    pub async fn get_run_status(&self, run_id: Uuid) -> Option<WorkflowRun> {
        self.active_runs
            .read()
            .await
            .get(&run_id)
            .map(|active| active.run.clone())
    }

    /// Stop an active run before its next phase
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        if let Some(active) = self.active_runs.write().await.get_mut(&run_id) {
            active.cancel.cancel();
            active.run.status = WorkflowRunStatus::Cancelled;
            info!(run_id = %run_id, "Workflow cancellation requested");
            Ok(())
        } else {
            Err(Error::not_found("workflow_run", run_id.to_string()))
        }
    }

    pub async fn list_active_runs(&self) -> Vec<WorkflowRun> {
        self.active_runs
            .read()
            .await
            .values()
            .map(|active| active.run.clone())
            .collect()
    }
}

fn insert_section(sections: &mut AggregatedResults, key: String, outcome: SectionOutcome) {
    if sections.get(&key).is_some() {
        warn!(step = %key, "Duplicate step key; replacing the earlier section");
    }
    sections.insert(key, outcome);
}
