//! Workflow plans: phases of dispatch steps

use crate::orchestration::aggregate::AggregatedResults;
use crate::task::InputData;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// One dispatch inside a phase, stored under `key` in the aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub key: String,
    pub agent_type: String,
    pub operation_name: String,
    pub input_data: InputData,
    /// Overrides the orchestrator's default timeout
    pub timeout: Option<Duration>,
    /// Reuse an identical dispatch from the cache window
    pub cached: bool,
}

impl StepSpec {
    pub fn new<K, A, O>(key: K, agent_type: A, operation_name: O) -> Self
    where
        K: Into<String>,
        A: Into<String>,
        O: Into<String>,
    {
        Self {
            key: key.into(),
            agent_type: agent_type.into(),
            operation_name: operation_name.into(),
            input_data: InputData::new(),
            timeout: None,
            cached: true,
        }
    }

    pub fn input<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.input_data.insert(key.into(), value);
        self
    }

    pub fn with_input(mut self, input_data: InputData) -> Self {
        self.input_data.extend(input_data);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cached = false;
        self
    }
}

/// How the steps of a phase are issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// Builds a phase's steps from the sections collected by earlier phases
pub type DeriveSteps = Arc<dyn Fn(&AggregatedResults) -> Vec<StepSpec> + Send + Sync>;

#[derive(Clone)]
enum PhaseSteps {
    Fixed(Vec<StepSpec>),
    Derived(DeriveSteps),
}

#[derive(Clone)]
pub struct Phase {
    name: String,
    mode: ExecutionMode,
    required: bool,
    steps: PhaseSteps,
}

impl Phase {
    pub fn sequential<S: Into<String>>(name: S, steps: Vec<StepSpec>) -> Self {
        Self::fixed(name, ExecutionMode::Sequential, steps)
    }

    pub fn parallel<S: Into<String>>(name: S, steps: Vec<StepSpec>) -> Self {
        Self::fixed(name, ExecutionMode::Parallel, steps)
    }

    fn fixed<S: Into<String>>(name: S, mode: ExecutionMode, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.into(),
            mode,
            required: false,
            steps: PhaseSteps::Fixed(steps),
        }
    }

    /// Phase whose steps depend on earlier results
    pub fn derived<S, F>(name: S, mode: ExecutionMode, derive: F) -> Self
    where
        S: Into<String>,
        F: Fn(&AggregatedResults) -> Vec<StepSpec> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            mode,
            required: false,
            steps: PhaseSteps::Derived(Arc::new(derive)),
        }
    }

    /// Any failed step in this phase stops the remaining phases
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn steps(&self, completed: &AggregatedResults) -> Vec<StepSpec> {
        match &self.steps {
            PhaseSteps::Fixed(steps) => steps.clone(),
            PhaseSteps::Derived(derive) => derive(completed),
        }
    }
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("required", &self.required)
            .finish()
    }
}

/// Named, ordered list of phases
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    pub name: String,
    phases: Vec<Phase>,
}

impl WorkflowPlan {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }
}
