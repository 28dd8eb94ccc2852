//! Stage dependency graph and its ready-node executor.
//!
//! Nodes whose dependencies are settled start immediately, so independent nodes run in
//! parallel. A failure stops new `AllSucceeded` nodes from starting; `AllDone` nodes still run
//! once their dependencies settle, which is how cleanup stages are expressed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::context::RunContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; never below 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Wait before the next attempt once attempt number `failed_attempt` (1-based) failed.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        self.backoff
            .delay_for_attempt(failed_attempt.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerRule {
    /// Run only when every dependency succeeded and nothing else in the run failed.
    AllSucceeded,
    /// Run once every dependency settled, whatever the outcome.
    AllDone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub rows: Option<u64>,
    pub detail: String,
}

impl StageReport {
    pub fn rows(rows: u64, detail: impl Into<String>) -> Self {
        Self {
            rows: Some(rows),
            detail: detail.into(),
        }
    }

    pub fn detail(detail: impl Into<String>) -> Self {
        Self {
            rows: None,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &RunContext) -> anyhow::Result<StageReport>;
}

pub struct Node {
    stage: Arc<dyn Stage>,
    depends_on: Vec<&'static str>,
    retry: RetryPolicy,
    trigger: TriggerRule,
}

impl Node {
    pub fn new(stage: Arc<dyn Stage>) -> Self {
        Self {
            stage,
            depends_on: Vec::new(),
            retry: RetryPolicy::none(),
            trigger: TriggerRule::AllSucceeded,
        }
    }

    pub fn after(mut self, deps: &[&'static str]) -> Self {
        self.depends_on.extend_from_slice(deps);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerRule) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn name(&self) -> &'static str {
        self.stage.name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageOutcome {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: &'static str,
    pub outcome: StageOutcome,
    pub attempts: u32,
    pub rows: Option<u64>,
    pub detail: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("stage `{0}` is declared twice")]
    DuplicateStage(&'static str),
    #[error("stage `{stage}` depends on unknown stage `{dependency}`")]
    UnknownDependency {
        stage: &'static str,
        dependency: &'static str,
    },
    #[error("stage graph contains a cycle through {0:?}")]
    Cycle(Vec<&'static str>),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("stage `{stage}` failed after {attempts} attempt(s)")]
    StageFailed {
        stage: &'static str,
        attempts: u32,
        records: Vec<StageRecord>,
        #[source]
        source: anyhow::Error,
    },
    #[error("stage task panicked or was cancelled")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Validated, acyclic set of nodes.
pub struct StageGraph {
    nodes: Vec<Node>,
}

impl std::fmt::Debug for StageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|n| (n.name(), &n.depends_on)))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Done(StageOutcome),
}

type AttemptResult = (usize, u32, anyhow::Result<StageReport>);

impl StageGraph {
    pub fn new(nodes: Vec<Node>) -> Result<Self, GraphError> {
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.name()) {
                return Err(GraphError::DuplicateStage(node.name()));
            }
        }
        for node in &nodes {
            if let Some(dependency) = node.depends_on.iter().find(|d| !seen.contains(*d)) {
                return Err(GraphError::UnknownDependency {
                    stage: node.name(),
                    dependency: *dependency,
                });
            }
        }

        // Kahn's algorithm: anything left with a non-zero in-degree sits on a cycle.
        let mut in_degree: HashMap<&str, usize> =
            nodes.iter().map(|n| (n.name(), n.depends_on.len())).collect();
        let mut queue: VecDeque<&str> = nodes
            .iter()
            .filter(|n| n.depends_on.is_empty())
            .map(|n| n.name())
            .collect();
        while let Some(done) = queue.pop_front() {
            for node in nodes.iter().filter(|n| n.depends_on.contains(&done)) {
                let degree = in_degree.get_mut(node.name()).expect("node registered");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(node.name());
                }
            }
        }
        let cyclic: Vec<&'static str> = nodes
            .iter()
            .filter(|n| in_degree[n.name()] > 0)
            .map(|n| n.name())
            .collect();
        if !cyclic.is_empty() {
            return Err(GraphError::Cycle(cyclic));
        }

        Ok(Self { nodes })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.nodes.iter().map(Node::name).collect()
    }

    pub async fn execute(&self, ctx: Arc<RunContext>) -> Result<Vec<StageRecord>, RunError> {
        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name(), i))
            .collect();
        let mut states = vec![NodeState::Pending; self.nodes.len()];
        let mut records: Vec<StageRecord> = Vec::with_capacity(self.nodes.len());
        let mut first_failure: Option<(usize, u32, anyhow::Error)> = None;
        let mut running: JoinSet<AttemptResult> = JoinSet::new();

        loop {
            // Settling a node as skipped can make others decidable, so scan until stable.
            let mut changed = true;
            while changed {
                changed = false;
                for (i, node) in self.nodes.iter().enumerate() {
                    if states[i] != NodeState::Pending {
                        continue;
                    }
                    let dep_states: Vec<NodeState> = node
                        .depends_on
                        .iter()
                        .map(|d| states[index[d]])
                        .collect();
                    if dep_states
                        .iter()
                        .any(|s| matches!(s, NodeState::Pending | NodeState::Running))
                    {
                        continue;
                    }
                    let all_succeeded = dep_states
                        .iter()
                        .all(|s| *s == NodeState::Done(StageOutcome::Succeeded));
                    let runnable = match node.trigger {
                        TriggerRule::AllDone => true,
                        TriggerRule::AllSucceeded => all_succeeded && first_failure.is_none(),
                    };
                    changed = true;
                    if runnable {
                        states[i] = NodeState::Running;
                        let stage = Arc::clone(&node.stage);
                        let retry = node.retry;
                        let ctx = Arc::clone(&ctx);
                        running.spawn(async move {
                            let (attempts, result) = run_with_retry(stage, retry, ctx).await;
                            (i, attempts, result)
                        });
                    } else {
                        info!(stage = node.name(), "skipping stage; upstream did not succeed");
                        states[i] = NodeState::Done(StageOutcome::Skipped);
                        records.push(StageRecord {
                            stage: node.name(),
                            outcome: StageOutcome::Skipped,
                            attempts: 0,
                            rows: None,
                            detail: String::new(),
                        });
                    }
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (i, attempts, result) = joined?;
            let stage = self.nodes[i].name();
            match result {
                Ok(report) => {
                    states[i] = NodeState::Done(StageOutcome::Succeeded);
                    records.push(StageRecord {
                        stage,
                        outcome: StageOutcome::Succeeded,
                        attempts,
                        rows: report.rows,
                        detail: report.detail,
                    });
                }
                Err(err) => {
                    error!(stage, attempts, error = %format!("{err:#}"), "stage failed");
                    states[i] = NodeState::Done(StageOutcome::Failed);
                    records.push(StageRecord {
                        stage,
                        outcome: StageOutcome::Failed,
                        attempts,
                        rows: None,
                        detail: format!("{err:#}"),
                    });
                    if first_failure.is_none() {
                        first_failure = Some((i, attempts, err));
                    }
                }
            }
        }

        match first_failure {
            Some((i, attempts, source)) => Err(RunError::StageFailed {
                stage: self.nodes[i].name(),
                attempts,
                records,
                source,
            }),
            None => Ok(records),
        }
    }
}

async fn run_with_retry(
    stage: Arc<dyn Stage>,
    retry: RetryPolicy,
    ctx: Arc<RunContext>,
) -> (u32, anyhow::Result<StageReport>) {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let span = info_span!("stage", name = stage.name(), attempt, run_id = %ctx.run_id);
        match run_attempt(Arc::clone(&stage), Arc::clone(&ctx))
            .instrument(span)
            .await
        {
            Ok(report) => {
                info!(stage = stage.name(), attempt, detail = %report.detail, "stage succeeded");
                return (attempt, Ok(report));
            }
            Err(err) if attempt < max_attempts => {
                let delay = retry.delay_after(attempt);
                warn!(
                    stage = stage.name(),
                    attempt,
                    max_attempts,
                    retry_in_secs = delay.as_secs_f64(),
                    error = %format!("{err:#}"),
                    "stage attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return (attempt, Err(err)),
        }
    }
}

/// Runs one attempt on its own task so a panic surfaces as a failed attempt instead of
/// tearing down the executor and its `AllDone` cleanup.
async fn run_attempt(stage: Arc<dyn Stage>, ctx: Arc<RunContext>) -> anyhow::Result<StageReport> {
    let name = stage.name();
    let handle = tokio::spawn(async move { stage.run(&ctx).await }.in_current_span());
    match handle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(anyhow::anyhow!("stage `{name}` panicked")),
        Err(err) => Err(anyhow::Error::new(err).context(format!("stage `{name}` was cancelled"))),
    }
}
