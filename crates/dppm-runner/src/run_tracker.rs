use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use dppm_core::RunState;

/// Tracks in-flight runs so they can be listed and cancelled by id.
pub struct RunTracker {
    active: HashMap<String, ActiveRun>,
}

/// An in-progress orchestration run.
pub struct ActiveRun {
    pub run_id: String,
    pub owner: String,
    pub goal: String,
    pub state: RunState,
    pub started_at: Instant,
    pub cancel: CancellationToken,
}

/// Serializable snapshot of an active run.
#[derive(Debug, Serialize)]
pub struct ActiveRunSnapshot {
    pub run_id: String,
    pub owner: String,
    pub goal: String,
    pub state: String,
    pub elapsed_seconds: u64,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
        }
    }

    pub fn insert(&mut self, run: ActiveRun) {
        self.active.insert(run.run_id.clone(), run);
    }

    pub fn remove(&mut self, run_id: &str) {
        self.active.remove(run_id);
    }

    pub fn set_state(&mut self, run_id: &str, state: RunState) {
        if let Some(run) = self.active.get_mut(run_id) {
            run.state = state;
        }
    }

    /// Signal the run's token. Returns false for unknown ids.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.active.get(run_id) {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn snapshot(&self) -> Vec<ActiveRunSnapshot> {
        self.active
            .values()
            .map(|r| ActiveRunSnapshot {
                run_id: r.run_id.clone(),
                owner: r.owner.clone(),
                goal: r.goal.clone(),
                state: r.state.as_str().to_string(),
                elapsed_seconds: r.started_at.elapsed().as_secs(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: &str) -> ActiveRun {
        ActiveRun {
            run_id: id.into(),
            owner: "u".into(),
            goal: "g".into(),
            state: RunState::Decomposing,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn insert_update_remove() {
        let mut t = RunTracker::new();
        t.insert(run("a"));
        t.insert(run("b"));
        assert_eq!(t.active_count(), 2);

        t.set_state("a", RunState::Executing);
        let snap = t.snapshot();
        let a = snap.iter().find(|s| s.run_id == "a").unwrap();
        assert_eq!(a.state, "executing");

        t.remove("a");
        assert_eq!(t.active_count(), 1);
    }

    #[test]
    fn cancel_signals_token() {
        let mut t = RunTracker::new();
        let r = run("a");
        let token = r.cancel.clone();
        t.insert(r);
        assert!(t.cancel("a"));
        assert!(token.is_cancelled());
        assert!(!t.cancel("missing"));
    }
}
