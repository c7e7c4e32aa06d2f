use std::collections::{HashMap, HashSet};

use tracing::debug;

use dppm_core::{DppmError, ExecutionPhase, MergedPlan, MiniPlan, Subtask};

/// Group subtasks into dependency phases (Kahn's algorithm).
///
/// Phase 0 holds every subtask without dependencies; phase `n` holds those
/// whose dependencies all sit in earlier phases. Within a phase, subtasks
/// keep their declaration order. Unknown dependencies and cycles are errors.
pub fn topological_phases(subtasks: &[Subtask]) -> Result<Vec<ExecutionPhase>, String> {
    let ids: HashSet<&str> = subtasks.iter().map(|s| s.id.as_str()).collect();
    for s in subtasks {
        for dep in &s.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(format!("subtask '{}' depends on unknown '{dep}'", s.id));
            }
        }
    }

    let mut placed: HashSet<&str> = HashSet::new();
    let mut phases = Vec::new();

    while placed.len() < subtasks.len() {
        let ready: Vec<String> = subtasks
            .iter()
            .filter(|s| !placed.contains(s.id.as_str()))
            .filter(|s| s.depends_on.iter().all(|d| placed.contains(d.as_str())))
            .map(|s| s.id.clone())
            .collect();

        if ready.is_empty() {
            let stuck: Vec<&str> = subtasks
                .iter()
                .map(|s| s.id.as_str())
                .filter(|id| !placed.contains(id))
                .collect();
            return Err(format!("dependency cycle among: {}", stuck.join(", ")));
        }

        for id in &ready {
            if let Some(s) = subtasks.iter().find(|s| &s.id == id) {
                placed.insert(s.id.as_str());
            }
        }
        phases.push(ExecutionPhase {
            index: phases.len(),
            subtask_ids: ready,
        });
    }

    Ok(phases)
}

/// Longest dependency chain, weighted by complexity. Ties go to the chain
/// ending at the earliest-declared subtask.
pub fn critical_path(subtasks: &[Subtask], phases: &[ExecutionPhase]) -> Vec<String> {
    let by_id: HashMap<&str, &Subtask> = subtasks.iter().map(|s| (s.id.as_str(), s)).collect();
    // id -> (chain weight, predecessor on the chain)
    let mut best: HashMap<&str, (u32, Option<&str>)> = HashMap::new();

    for phase in phases {
        for id in &phase.subtask_ids {
            let Some(&s) = by_id.get(id.as_str()) else {
                continue;
            };
            let mut pred: Option<&str> = None;
            let mut pred_weight = 0;
            for dep in &s.depends_on {
                if let Some((w, _)) = best.get(dep.as_str()) {
                    if pred.is_none() || *w > pred_weight {
                        pred = Some(dep.as_str());
                        pred_weight = *w;
                    }
                }
            }
            best.insert(s.id.as_str(), (pred_weight + u32::from(s.complexity), pred));
        }
    }

    let mut end: Option<(&str, u32)> = None;
    for s in subtasks {
        if let Some((w, _)) = best.get(s.id.as_str()) {
            if end.map_or(true, |(_, bw)| *w > bw) {
                end = Some((s.id.as_str(), *w));
            }
        }
    }

    let mut path = Vec::new();
    let mut cursor = end.map(|(id, _)| id);
    while let Some(id) = cursor {
        path.push(id.to_string());
        cursor = best.get(id).and_then(|(_, p)| *p);
    }
    path.reverse();
    path
}

/// Sum over phases of the slowest subtask in each phase.
pub fn total_estimated_secs(subtasks: &[Subtask], phases: &[ExecutionPhase]) -> u64 {
    phases
        .iter()
        .map(|phase| {
            phase
                .subtask_ids
                .iter()
                .filter_map(|id| subtasks.iter().find(|s| &s.id == id))
                .map(|s| s.estimated_duration().as_secs())
                .max()
                .unwrap_or(0)
        })
        .sum()
}

/// Recompute the derived fields of a plan after subtasks were added.
pub fn refresh(plan: &mut MergedPlan) -> Result<(), String> {
    plan.phases = topological_phases(&plan.subtasks)?;
    plan.critical_path = critical_path(&plan.subtasks, &plan.phases);
    plan.total_estimated_secs = total_estimated_secs(&plan.subtasks, &plan.phases);
    Ok(())
}

/// Combines per-subtask mini-plans into one dependency-ordered plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanMerger;

impl PlanMerger {
    pub fn merge(
        &self,
        goal: &str,
        subtasks: &[Subtask],
        mini_plans: Vec<MiniPlan>,
    ) -> Result<MergedPlan, DppmError> {
        let phases = topological_phases(subtasks).map_err(DppmError::Merge)?;

        let mut by_id: HashMap<String, MiniPlan> = mini_plans
            .into_iter()
            .map(|p| (p.subtask_id.clone(), p))
            .collect();
        let mut ordered = Vec::with_capacity(subtasks.len());
        for s in subtasks {
            let plan = by_id
                .remove(&s.id)
                .ok_or_else(|| DppmError::Merge(format!("no mini-plan for subtask '{}'", s.id)))?;
            ordered.push(plan);
        }

        let mut tools: Vec<String> = Vec::new();
        let mut risks: Vec<String> = Vec::new();
        for plan in &ordered {
            for t in &plan.tools {
                if !tools.contains(t) {
                    tools.push(t.clone());
                }
            }
            for r in &plan.risks {
                if !risks.contains(r) {
                    risks.push(r.clone());
                }
            }
        }

        let critical_path = critical_path(subtasks, &phases);
        let total_estimated_secs = total_estimated_secs(subtasks, &phases);
        debug!(
            phases = phases.len(),
            total_estimated_secs,
            critical = %critical_path.join(" -> "),
            "plans merged"
        );

        Ok(MergedPlan {
            goal: goal.to_string(),
            subtasks: subtasks.to_vec(),
            mini_plans: ordered,
            phases,
            tools,
            risks,
            total_estimated_secs,
            critical_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use dppm_core::{Domain, PlanStep};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn subtask(id: &str, deps: &[&str], complexity: u8) -> Subtask {
        Subtask {
            id: id.into(),
            title: id.into(),
            description: String::new(),
            domain: Domain::General,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            complexity,
            optional: false,
        }
    }

    fn mini(id: &str, tools: &[&str], risks: &[&str]) -> MiniPlan {
        MiniPlan {
            subtask_id: id.into(),
            steps: vec![PlanStep::new(format!("do {id}"), "done")],
            tools: tools.iter().map(|t| t.to_string()).collect(),
            risks: risks.iter().map(|r| r.to_string()).collect(),
            alternative: None,
            placeholder: false,
            provider: None,
        }
    }

    fn phase_ids(phases: &[ExecutionPhase]) -> Vec<Vec<String>> {
        phases.iter().map(|p| p.subtask_ids.clone()).collect()
    }

    #[test]
    fn diamond_phases() {
        let subtasks = vec![
            subtask("a", &[], 1),
            subtask("b", &["a"], 1),
            subtask("c", &["a"], 1),
            subtask("d", &["b", "c"], 1),
        ];
        let phases = topological_phases(&subtasks).unwrap();
        assert_eq!(
            phase_ids(&phases),
            vec![vec!["a"], vec!["b", "c"], vec!["d"]]
        );
        assert_eq!(phases[2].index, 2);
    }

    #[test]
    fn independent_subtasks_share_phase_zero() {
        let subtasks = vec![subtask("x", &[], 1), subtask("y", &[], 1), subtask("z", &[], 1)];
        let phases = topological_phases(&subtasks).unwrap();
        assert_eq!(phase_ids(&phases), vec![vec!["x", "y", "z"]]);
    }

    #[test]
    fn cycle_is_rejected() {
        let subtasks = vec![subtask("a", &["b"], 1), subtask("b", &["a"], 1)];
        let err = topological_phases(&subtasks).unwrap_err();
        assert!(err.contains("cycle"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let subtasks = vec![subtask("a", &["ghost"], 1)];
        assert!(topological_phases(&subtasks).unwrap_err().contains("ghost"));
    }

    #[test]
    fn critical_path_follows_heaviest_chain() {
        let subtasks = vec![
            subtask("a", &[], 2),
            subtask("b", &["a"], 1),
            subtask("c", &["a"], 5),
            subtask("d", &["b", "c"], 1),
        ];
        let phases = topological_phases(&subtasks).unwrap();
        assert_eq!(critical_path(&subtasks, &phases), vec!["a", "c", "d"]);
    }

    #[test]
    fn duration_sums_slowest_per_phase() {
        let subtasks = vec![
            subtask("a", &[], 2),
            subtask("b", &[], 4),
            subtask("c", &["a", "b"], 1),
        ];
        let phases = topological_phases(&subtasks).unwrap();
        assert_eq!(total_estimated_secs(&subtasks, &phases), 4 * 60 + 60);
    }

    #[test]
    fn merge_orders_plans_and_dedups() {
        let subtasks = vec![subtask("a", &[], 1), subtask("b", &["a"], 1)];
        let plans = vec![
            mini("b", &["web", "files"], &["slow api"]),
            mini("a", &["web"], &["slow api", "bad data"]),
        ];
        let merged = PlanMerger.merge("goal", &subtasks, plans).unwrap();
        assert_eq!(merged.mini_plans[0].subtask_id, "a");
        assert_eq!(merged.mini_plans[1].subtask_id, "b");
        assert_eq!(merged.tools, vec!["web", "files"]);
        assert_eq!(merged.risks, vec!["slow api", "bad data"]);
        assert_eq!(merged.critical_path, vec!["a", "b"]);
        assert_eq!(merged.total_estimated_secs, 120);
    }

    #[test]
    fn merge_requires_every_mini_plan() {
        let subtasks = vec![subtask("a", &[], 1), subtask("b", &[], 1)];
        let err = PlanMerger
            .merge("goal", &subtasks, vec![mini("a", &[], &[])])
            .unwrap_err();
        assert!(matches!(err, DppmError::Merge(_)));
    }

    #[test]
    fn merge_rejects_cycle() {
        let subtasks = vec![subtask("a", &["b"], 1), subtask("b", &["a"], 1)];
        let err = PlanMerger
            .merge("goal", &subtasks, vec![mini("a", &[], &[]), mini("b", &[], &[])])
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    /// Random DAG of 1..=12 subtasks, each depending on a random subset of
    /// earlier ones, declared in shuffled order.
    fn random_dag(rng: &mut StdRng) -> Vec<Subtask> {
        let n = rng.gen_range(1..=12);
        let mut subtasks: Vec<Subtask> = (0..n)
            .map(|i| {
                let deps: Vec<String> = (0..i)
                    .filter(|_| rng.gen_bool(0.3))
                    .map(|j| format!("s{j}"))
                    .collect();
                let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                subtask(&format!("s{i}"), &deps, rng.gen_range(1..=5))
            })
            .collect();
        subtasks.shuffle(rng);
        subtasks
    }

    #[test]
    fn generated_dags_place_dependencies_in_earlier_phases() {
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let subtasks = random_dag(&mut rng);
            let plans = subtasks.iter().map(|s| mini(&s.id, &[], &[])).collect();
            let plan = PlanMerger.merge("goal", &subtasks, plans).unwrap();

            let placed: usize = plan.phases.iter().map(|p| p.subtask_ids.len()).sum();
            assert_eq!(placed, subtasks.len(), "seed {seed}");
            for (i, phase) in plan.phases.iter().enumerate() {
                assert_eq!(phase.index, i, "seed {seed}");
            }

            for s in &subtasks {
                let at = plan.phase_of(&s.id).unwrap();
                let deps: Vec<usize> = s
                    .depends_on
                    .iter()
                    .map(|d| plan.phase_of(d).unwrap())
                    .collect();
                for dep_at in &deps {
                    assert!(*dep_at < at, "seed {seed}: {} runs before a dependency", s.id);
                }
                // Each subtask runs as early as its dependencies allow.
                let earliest = deps.iter().max().map_or(0, |d| d + 1);
                assert_eq!(at, earliest, "seed {seed}: {} placed late", s.id);
            }

            for pair in plan.critical_path.windows(2) {
                let next = plan.subtask(&pair[1]).unwrap();
                assert!(next.depends_on.contains(&pair[0]), "seed {seed}");
            }
        }
    }

    #[test]
    fn refresh_picks_up_new_subtask() {
        let subtasks = vec![subtask("a", &[], 1)];
        let mut plan = PlanMerger
            .merge("goal", &subtasks, vec![mini("a", &[], &[])])
            .unwrap();
        plan.subtasks.push(subtask("m", &[], 3));
        plan.mini_plans.push(mini("m", &[], &[]));
        refresh(&mut plan).unwrap();
        assert_eq!(phase_ids(&plan.phases), vec![vec!["a", "m"]]);
        assert_eq!(plan.total_estimated_secs, 180);
    }
}
