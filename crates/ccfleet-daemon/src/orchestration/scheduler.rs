//! Task dependency analysis and phase scheduling.
//!
//! Tasks form a DAG through `depends_on` edges. [`compute_phases`] places
//! every task one phase after its latest dependency, so tasks sharing a phase
//! never depend on each other. [`PhaseScheduler`] persists the resulting plan,
//! answers readiness queries, and guards edge insertion against cycles.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::storage::{
    Database, DatabaseError, ExecutionPhaseRow, PhaseStatus, TaskRow, TaskStatus, TaskType,
    UnknownVariant,
};

/// Only this edge kind takes part in scheduling.
const DEPENDS_ON: &str = "depends_on";

/// Shortest title that counts as a mention inside another task's text.
const MIN_MENTION_LEN: usize = 4;

/// Errors from dependency analysis and scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Cyclic dependency detected: {}", task_ids.join(" -> "))]
    CyclicDependency { task_ids: Vec<String> },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Project not found: {id}")]
    ProjectNotFound { id: String },

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Phase {phase} not found in project {project_id}")]
    PhaseNotFound { project_id: String, phase: i64 },

    #[error("Invalid stored data: {0}")]
    InvalidData(#[from] UnknownVariant),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Advisory phase for tasks that have no dependency edges at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalPhase {
    Setup,
    Development,
    Testing,
    Deploy,
}

impl From<TaskType> for CanonicalPhase {
    fn from(task_type: TaskType) -> Self {
        match task_type {
            TaskType::Setup | TaskType::Database => Self::Setup,
            TaskType::Backend | TaskType::Frontend | TaskType::General => Self::Development,
            TaskType::Test => Self::Testing,
            TaskType::Deploy => Self::Deploy,
        }
    }
}

/// One computed phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedPhase {
    /// 1-based, matching the persisted phase rows.
    pub number: i64,
    pub name: String,
    pub task_ids: Vec<String>,
}

/// Heuristic placement for an unconnected task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeuristicPhase {
    pub task_id: String,
    pub phase: CanonicalPhase,
}

/// Result of [`PhaseScheduler::analyze`].
#[derive(Debug, Clone, Serialize)]
pub struct PhasePlan {
    pub project_id: String,
    pub phases: Vec<PlannedPhase>,
    pub heuristic: Vec<HeuristicPhase>,
}

/// Compute the 0-based phase of every task.
///
/// `edges` are `(task, depends_on)` pairs. Fails on the first cycle found,
/// naming it from its entry task back to itself, and on edges that reference
/// tasks outside `task_ids`.
pub fn compute_phases(
    task_ids: &[String],
    edges: &[(String, String)],
) -> Result<HashMap<String, u32>, SchedulerError> {
    let known: HashSet<&str> = task_ids.iter().map(String::as_str).collect();

    let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
    for (task, dep) in edges {
        for id in [task, dep] {
            if !known.contains(id.as_str()) {
                return Err(SchedulerError::Validation {
                    message: format!("Dependency {task} -> {dep} references unknown task '{id}'"),
                });
            }
        }
        deps.entry(task.as_str()).or_default().push(dep.as_str());
    }

    let mut memo: HashMap<&str, u32> = HashMap::new();
    for id in task_ids {
        visit(id, &deps, &mut memo)?;
    }

    Ok(memo
        .into_iter()
        .map(|(id, phase)| (id.to_string(), phase))
        .collect())
}

/// Depth-first phase assignment from `root` with an explicit stack.
fn visit<'a>(
    root: &'a str,
    deps: &HashMap<&'a str, Vec<&'a str>>,
    memo: &mut HashMap<&'a str, u32>,
) -> Result<(), SchedulerError> {
    if memo.contains_key(root) {
        return Ok(());
    }

    // (task, next dependency index, phase so far)
    let mut stack: Vec<(&'a str, usize, u32)> = vec![(root, 0, 0)];
    let mut on_path: HashMap<&'a str, usize> = HashMap::from([(root, 0)]);

    while let Some(frame) = stack.last_mut() {
        let (id, next, phase) = *frame;
        let pending = deps.get(id).map(Vec::as_slice).unwrap_or_default();

        if let Some(&dep) = pending.get(next) {
            frame.1 += 1;
            if let Some(&dep_phase) = memo.get(dep) {
                frame.2 = phase.max(dep_phase + 1);
            } else if let Some(&pos) = on_path.get(dep) {
                let mut task_ids: Vec<String> =
                    stack[pos..].iter().map(|(s, _, _)| (*s).to_string()).collect();
                task_ids.push(dep.to_string());
                return Err(SchedulerError::CyclicDependency { task_ids });
            } else {
                on_path.insert(dep, stack.len());
                stack.push((dep, 0, 0));
            }
        } else {
            stack.pop();
            on_path.remove(id);
            memo.insert(id, phase);
            if let Some(parent) = stack.last_mut() {
                parent.2 = parent.2.max(phase + 1);
            }
        }
    }
    Ok(())
}

/// Find a dependency chain `from -> ... -> to`, if one exists.
fn find_path(deps: &HashMap<String, Vec<String>>, from: &str, to: &str) -> Option<Vec<String>> {
    let mut came_from: HashMap<&str, &str> = HashMap::new();
    let mut queue: VecDeque<&str> = VecDeque::from([from]);
    let mut seen: HashSet<&str> = HashSet::from([from]);

    while let Some(node) = queue.pop_front() {
        if node == to {
            let mut path = vec![node.to_string()];
            let mut cur = node;
            while let Some(&prev) = came_from.get(cur) {
                path.push(prev.to_string());
                cur = prev;
            }
            path.reverse();
            return Some(path);
        }
        for next in deps.get(node).into_iter().flatten() {
            if seen.insert(next.as_str()) {
                came_from.insert(next.as_str(), node);
                queue.push_back(next.as_str());
            }
        }
    }
    None
}

/// Lowercased words long enough to be meaningful in a title.
fn title_words(title: &str) -> HashSet<String> {
    title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= MIN_MENTION_LEN)
        .map(str::to_lowercase)
        .collect()
}

/// Types a task of `task_type` usually waits for, and whether the two titles
/// must share a word for the link to apply.
const fn type_predecessors(task_type: TaskType) -> (&'static [TaskType], bool) {
    match task_type {
        TaskType::Test => (&[TaskType::Backend, TaskType::Frontend], true),
        TaskType::Deploy => (&[TaskType::Test], false),
        TaskType::Backend => (&[TaskType::Database], false),
        TaskType::Database => (&[TaskType::Setup], false),
        TaskType::Setup | TaskType::Frontend | TaskType::General => (&[], false),
    }
}

/// Persisted phase scheduler for a set of projects.
pub struct PhaseScheduler {
    db: Database,
    /// Serializes edge mutations so the cycle check and insert are atomic.
    edges: Mutex<()>,
}

impl PhaseScheduler {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            edges: Mutex::new(()),
        }
    }

    /// Compute and persist the project's phase plan.
    ///
    /// Nothing is written when the graph is invalid.
    pub async fn analyze(&self, project_id: &str) -> Result<PhasePlan, SchedulerError> {
        self.ensure_project(project_id).await?;
        let tasks = self.db.list_tasks(project_id).await?;
        let edges = self.project_edges(project_id).await?;

        let task_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let depth = compute_phases(&task_ids, &edges)?;

        let phase_count = depth.values().max().map_or(0, |max| *max as usize + 1);
        let mut phases: Vec<PlannedPhase> = (1..=phase_count)
            .map(|n| {
                let number = i64::try_from(n).unwrap_or(i64::MAX);
                PlannedPhase {
                    number,
                    name: format!("Phase {number}"),
                    task_ids: Vec::new(),
                }
            })
            .collect();
        let mut task_phases = Vec::with_capacity(tasks.len());
        for id in &task_ids {
            let d = depth.get(id).copied().unwrap_or(0) as usize;
            if let Some(phase) = phases.get_mut(d) {
                phase.task_ids.push(id.clone());
                task_phases.push((id.clone(), phase.number));
            }
        }

        let connected: HashSet<&str> = edges
            .iter()
            .flat_map(|(a, b)| [a.as_str(), b.as_str()])
            .collect();
        let mut heuristic = Vec::new();
        for task in &tasks {
            if !connected.contains(task.id.as_str()) {
                let task_type: TaskType = task.task_type.parse()?;
                heuristic.push(HeuristicPhase {
                    task_id: task.id.clone(),
                    phase: task_type.into(),
                });
            }
        }

        let names: Vec<String> = phases.iter().map(|p| p.name.clone()).collect();
        self.db
            .replace_execution_phases(project_id, &task_phases, &names)
            .await?;

        info!(
            project_id,
            tasks = tasks.len(),
            phases = phases.len(),
            "Dependency analysis complete"
        );

        Ok(PhasePlan {
            project_id: project_id.to_string(),
            phases,
            heuristic,
        })
    }

    /// Pending or queued tasks whose dependencies have all completed.
    pub async fn ready_tasks(&self, project_id: &str) -> Result<Vec<TaskRow>, SchedulerError> {
        self.ensure_project(project_id).await?;
        let tasks = self.db.list_tasks(project_id).await?;
        let edges = self.project_edges(project_id).await?;

        let mut status: HashMap<&str, TaskStatus> = HashMap::with_capacity(tasks.len());
        for task in &tasks {
            status.insert(task.id.as_str(), task.status.parse()?);
        }
        let mut blocked: HashSet<&str> = HashSet::new();
        for (task, dep) in &edges {
            if status.get(dep.as_str()) != Some(&TaskStatus::Completed) {
                blocked.insert(task.as_str());
            }
        }

        let ready = tasks
            .iter()
            .filter(|t| {
                matches!(
                    status.get(t.id.as_str()),
                    Some(TaskStatus::Pending | TaskStatus::Queued)
                ) && !blocked.contains(t.id.as_str())
            })
            .cloned()
            .collect();
        Ok(ready)
    }

    /// Dependencies of `task_id` that have not completed.
    pub async fn unsatisfied_dependencies(
        &self,
        task_id: &str,
    ) -> Result<Vec<String>, SchedulerError> {
        self.task(task_id).await?;
        let mut pending = Vec::new();
        for edge in self.db.list_task_dependencies(task_id).await? {
            if edge.kind != DEPENDS_ON {
                continue;
            }
            let dep = self.task(&edge.depends_on_task_id).await?;
            if dep.status.parse::<TaskStatus>()? != TaskStatus::Completed {
                pending.push(dep.id);
            }
        }
        Ok(pending)
    }

    /// Add `task_id -> depends_on`. Returns `false` if the edge already
    /// existed.
    pub async fn add_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
    ) -> Result<bool, SchedulerError> {
        if task_id == depends_on {
            return Err(SchedulerError::Validation {
                message: format!("Task {task_id} cannot depend on itself"),
            });
        }
        let task = self.task(task_id).await?;
        let dep = self.task(depends_on).await?;
        if task.project_id != dep.project_id {
            return Err(SchedulerError::Validation {
                message: format!(
                    "Task {task_id} (project {}) cannot depend on task {depends_on} (project {})",
                    task.project_id, dep.project_id
                ),
            });
        }

        let _guard = self.edges.lock().await;
        let graph = self.dependency_map(&task.project_id).await?;
        if let Some(path) = find_path(&graph, depends_on, task_id) {
            let mut task_ids = vec![task_id.to_string()];
            task_ids.extend(path);
            return Err(SchedulerError::CyclicDependency { task_ids });
        }

        let added = self.db.add_task_dependency(task_id, depends_on, false).await?;
        if added {
            info!(task_id, depends_on, "Dependency added");
        }
        Ok(added)
    }

    /// Remove `task_id -> depends_on`. Returns `false` if it did not exist.
    pub async fn remove_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
    ) -> Result<bool, SchedulerError> {
        let _guard = self.edges.lock().await;
        let removed = self.db.remove_task_dependency(task_id, depends_on).await?;
        if removed {
            info!(task_id, depends_on, "Dependency removed");
        }
        Ok(removed)
    }

    /// Guess missing edges from task titles and types.
    ///
    /// A task depends on another when its description or instruction
    /// mentions the other's title, or when type ordering suggests it. Edges
    /// that exist already or would close a cycle are skipped. Returns the
    /// number of edges added.
    pub async fn estimate_dependencies(&self, project_id: &str) -> Result<usize, SchedulerError> {
        self.ensure_project(project_id).await?;
        let _guard = self.edges.lock().await;

        let tasks = self.db.list_tasks(project_id).await?;
        let mut graph = self.dependency_map(project_id).await?;

        let mut types = Vec::with_capacity(tasks.len());
        for task in &tasks {
            types.push(task.task_type.parse::<TaskType>()?);
        }
        let words: Vec<HashSet<String>> = tasks.iter().map(|t| title_words(&t.title)).collect();
        let texts: Vec<String> = tasks
            .iter()
            .map(|t| format!("{} {}", t.description, t.instruction).to_lowercase())
            .collect();

        let mut candidates: Vec<(usize, usize)> = Vec::new();
        for (i, task) in tasks.iter().enumerate() {
            for (j, other) in tasks.iter().enumerate() {
                if i == j {
                    continue;
                }
                let title = other.title.trim().to_lowercase();
                let mentioned = title.len() >= MIN_MENTION_LEN && texts[i].contains(&title);

                let (predecessors, needs_shared_word) = type_predecessors(types[i]);
                let ordered = predecessors.contains(&types[j])
                    && (!needs_shared_word || !words[i].is_disjoint(&words[j]));

                if mentioned || ordered {
                    candidates.push((i, j));
                }
            }
        }

        let mut added = 0;
        for (i, j) in candidates {
            let (task, dep) = (&tasks[i].id, &tasks[j].id);
            if graph.get(task).is_some_and(|d| d.contains(dep)) {
                continue;
            }
            if find_path(&graph, dep, task).is_some() {
                debug!(task_id = %task, depends_on = %dep, "Skipping estimated edge that would close a cycle");
                continue;
            }
            if self.db.add_task_dependency(task, dep, true).await? {
                graph.entry(task.clone()).or_default().push(dep.clone());
                added += 1;
            }
        }

        info!(project_id, added, "Dependency estimation complete");
        Ok(added)
    }

    /// Recompute each phase's status from its member tasks and return the
    /// phases.
    pub async fn refresh_phase_status(
        &self,
        project_id: &str,
    ) -> Result<Vec<ExecutionPhaseRow>, SchedulerError> {
        let tasks = self.db.list_tasks(project_id).await?;
        let phases = self.db.list_execution_phases(project_id).await?;

        let mut changed = false;
        for phase in &phases {
            let mut members = Vec::new();
            for task in tasks.iter().filter(|t| t.phase == Some(phase.phase_number)) {
                members.push(task.status.parse::<TaskStatus>()?);
            }
            let Some(next) = phase_status(&members) else {
                continue;
            };
            if phase.status != next.as_str() {
                self.db
                    .update_phase_status(project_id, phase.phase_number, next.as_str())
                    .await?;
                debug!(project_id, phase = phase.phase_number, status = %next, "Phase status changed");
                changed = true;
            }
        }

        if changed {
            Ok(self.db.list_execution_phases(project_id).await?)
        } else {
            Ok(phases)
        }
    }

    /// Record the quality gate verdict for a phase.
    pub async fn record_quality_gate(
        &self,
        project_id: &str,
        phase: i64,
        passed: bool,
    ) -> Result<(), SchedulerError> {
        if !self.db.set_quality_gate(project_id, phase, passed).await? {
            return Err(SchedulerError::PhaseNotFound {
                project_id: project_id.to_string(),
                phase,
            });
        }
        info!(project_id, phase, passed, "Quality gate recorded");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn ensure_project(&self, id: &str) -> Result<(), SchedulerError> {
        match self.db.get_project(id).await {
            Ok(_) => Ok(()),
            Err(DatabaseError::NotFound(_)) => {
                Err(SchedulerError::ProjectNotFound { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn task(&self, id: &str) -> Result<TaskRow, SchedulerError> {
        self.db.get_task(id).await.map_err(|e| match e {
            DatabaseError::NotFound(_) => SchedulerError::TaskNotFound { id: id.to_string() },
            other => other.into(),
        })
    }

    async fn project_edges(&self, project_id: &str) -> Result<Vec<(String, String)>, SchedulerError> {
        Ok(self
            .db
            .list_project_dependencies(project_id)
            .await?
            .into_iter()
            .filter(|e| e.kind == DEPENDS_ON)
            .map(|e| (e.task_id, e.depends_on_task_id))
            .collect())
    }

    async fn dependency_map(
        &self,
        project_id: &str,
    ) -> Result<HashMap<String, Vec<String>>, SchedulerError> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (task, dep) in self.project_edges(project_id).await? {
            map.entry(task).or_default().push(dep);
        }
        Ok(map)
    }
}

/// Phase status implied by its members' statuses; `None` for empty phases.
fn phase_status(members: &[TaskStatus]) -> Option<PhaseStatus> {
    if members.is_empty() {
        return None;
    }
    let status = if members.contains(&TaskStatus::Failed) {
        PhaseStatus::Failed
    } else if members.iter().all(|s| *s == TaskStatus::Completed) {
        PhaseStatus::Completed
    } else if members
        .iter()
        .any(|s| matches!(s, TaskStatus::Running | TaskStatus::Completed))
    {
        PhaseStatus::Running
    } else {
        PhaseStatus::Pending
    };
    Some(status)
}
