//! Workflow orchestration
//!
//! Composes dispatcher calls into multi-phase pipelines.
//!
//! # Architecture
//!
//! ```text
//! WorkflowPlan (phases of StepSpecs)
//!     |
//!     v
//! WorkflowOrchestrator ----> Dispatcher (cached) ----> workers
//!     |
//!     v
//! AggregatedResults (ordered sections, failed slots as {"error": ...})
//!     |
//!     v
//! WorkflowRun (ledger)
//! ```
//!
//! A phase runs its steps either one after another or concurrently. Phases
//! always run in order, and a derived phase builds its steps from the
//! sections collected so far, which is how one phase feeds the next.
//!
//! # Examples
//!
//! ```rust,no_run
//! use agent_relay_core::orchestration::{Phase, StepSpec, WorkflowOrchestrator, WorkflowPlan};
//! use serde_json::json;
//!
//! async fn example(orchestrator: &WorkflowOrchestrator) {
//!     let plan = WorkflowPlan::new("quick_research")
//!         .phase(
//!             Phase::sequential(
//!                 "overview",
//!                 vec![StepSpec::new("business_overview", "due_diligence", "business_overview_report")
//!                     .input("ticker", json!("AAPL"))],
//!             )
//!             .required(),
//!         )
//!         .phase(Phase::sequential(
//!             "risk",
//!             vec![StepSpec::new("risk", "risk_analysis", "risk_assessment")
//!                 .input("ticker", json!("AAPL"))],
//!         ));
//!
//!     let outcome = orchestrator.execute(&plan, json!({"ticker": "AAPL"})).await;
//!     println!("{}", outcome.run.status);
//! }
//! ```

pub mod aggregate;
pub mod plan;
pub mod workflow;

pub use aggregate::{AggregatedResults, AggregationSummary, SectionOutcome};
pub use plan::{ExecutionMode, Phase, StepSpec, WorkflowPlan};
pub use workflow::{OrchestratorConfig, WorkflowOrchestrator, WorkflowOutcome};
