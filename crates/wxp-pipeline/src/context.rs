use std::sync::Mutex;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;
use wxp_core::Observation;

/// Lifecycle of the per-run staging table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StagingState {
    Absent,
    Creating,
    Created,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub entities_requested: usize,
    pub entities_fetched: usize,
    pub bronze_rows: usize,
    pub silver_rows: usize,
    pub staged_rows: u64,
    pub merged_rows: u64,
    pub pruned_rows: u64,
    pub silver_sha256: Option<String>,
}

/// State shared by the stages of a single run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    observations: Mutex<Option<Vec<Observation>>>,
    staging: Mutex<StagingState>,
    merged_at: Mutex<Option<DateTime<Utc>>>,
    counters: Mutex<RunCounters>,
}

impl RunContext {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            observations: Mutex::new(None),
            staging: Mutex::new(StagingState::Absent),
            merged_at: Mutex::new(None),
            counters: Mutex::new(RunCounters::default()),
        }
    }

    pub fn put_observations(&self, observations: Vec<Observation>) {
        *self.observations.lock().expect("observations lock poisoned") = Some(observations);
    }

    /// Hands the extracted observations to the single downstream consumer.
    pub fn take_observations(&self) -> anyhow::Result<Vec<Observation>> {
        match self
            .observations
            .lock()
            .expect("observations lock poisoned")
            .take()
        {
            Some(observations) => Ok(observations),
            None => bail!("no extracted observations available for this run"),
        }
    }

    pub fn staging_state(&self) -> StagingState {
        *self.staging.lock().expect("staging lock poisoned")
    }

    /// Moves the staging table to `to`, failing if it is not currently in one of `from`.
    pub fn transition_staging(&self, from: &[StagingState], to: StagingState) -> anyhow::Result<()> {
        let mut state = self.staging.lock().expect("staging lock poisoned");
        if !from.contains(&*state) {
            bail!("staging table is {:?}, expected one of {:?}", *state, from);
        }
        debug!(from = ?*state, to = ?to, "staging transition");
        *state = to;
        Ok(())
    }

    pub fn reset_staging(&self) {
        *self.staging.lock().expect("staging lock poisoned") = StagingState::Absent;
    }

    pub fn mark_merged(&self, at: DateTime<Utc>) {
        *self.merged_at.lock().expect("merge time lock poisoned") = Some(at);
    }

    pub fn merged_at(&self) -> Option<DateTime<Utc>> {
        *self.merged_at.lock().expect("merge time lock poisoned")
    }

    pub fn update_counters(&self, f: impl FnOnce(&mut RunCounters)) {
        let mut counters = self.counters.lock().expect("counters lock poisoned");
        f(&mut *counters);
    }

    pub fn counters(&self) -> RunCounters {
        self.counters.lock().expect("counters lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observations_are_handed_over_once() {
        let ctx = RunContext::new(Uuid::new_v4(), Utc::now());
        assert!(ctx.take_observations().is_err());
        ctx.put_observations(Vec::new());
        assert!(ctx.take_observations().expect("first take").is_empty());
        assert!(ctx.take_observations().is_err());
    }

    #[test]
    fn staging_transitions_are_checked() {
        let ctx = RunContext::new(Uuid::new_v4(), Utc::now());
        assert_eq!(ctx.staging_state(), StagingState::Absent);
        assert!(ctx
            .transition_staging(&[StagingState::Created], StagingState::Loading)
            .is_err());
        ctx.transition_staging(&[StagingState::Absent], StagingState::Creating)
            .expect("creating");
        ctx.transition_staging(&[StagingState::Creating], StagingState::Created)
            .expect("created");
        ctx.reset_staging();
        assert_eq!(ctx.staging_state(), StagingState::Absent);
    }
}
