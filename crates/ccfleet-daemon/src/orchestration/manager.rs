//! Instance manager: ties the registry to worktrees and terminals.
//!
//! [`InstanceManager`] is the only component that decides instance status
//! in response to side effects:
//! - child creation: readiness check, registry record, worktree, agent PTY
//! - process exits and analyzer state changes, applied by one sequential
//!   signal loop so callbacks never race on registry state
//! - termination (signals the process, the exit is observed later)
//! - maintenance: cleanup of finished instances and their worktrees
//!
//! Everything the UI needs to know is published as a [`FleetEvent`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ccfleet_core::classify::{ActionNeeded, AgentState, RuleSet};
use ccfleet_core::config::Config;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::monitor::{MonitorConfig, MonitorEvent, OutputAnalyzer, StateChange};
use crate::storage::{Database, DatabaseError, TaskStatus};
use crate::terminal::{SessionSpec, TerminalError, TerminalEvent, TerminalMultiplexer};
use crate::worktree::{Worktree, WorktreeError, WorktreeManager};

use super::instance::{Instance, InstanceStatus, NewInstance};
use super::registry::{InstanceRegistry, RegistryError, TerminateOutcome};
use super::scheduler::{PhaseScheduler, SchedulerError};

/// Broadcast buffer for fleet events.
const EVENT_CAPACITY: usize = 1024;

/// Terminal size given to agent processes.
const AGENT_COLS: u16 = 120;
const AGENT_ROWS: u16 = 40;

/// Errors from the instance manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task {task_id} is not ready: waiting on {}", waiting_on.join(", "))]
    TaskNotReady {
        task_id: String,
        waiting_on: Vec<String>,
    },

    #[error("Task {task_id} cannot be started from status {status}")]
    TaskNotStartable { task_id: String, status: String },

    #[error("Worktree creation failed for instance {instance_id}: {source}")]
    WorktreeCreationFailed {
        instance_id: String,
        source: WorktreeError,
    },

    #[error("Agent process failed to start for instance {instance_id}: {source}")]
    ProcessSpawnFailed {
        instance_id: String,
        source: TerminalError,
    },
}

/// How agents are launched and observed.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Agent executable.
    pub agent_bin: PathBuf,
    /// Arguments placed before the instruction.
    pub agent_args: Vec<String>,
    pub monitor: MonitorConfig,
    pub rules: Arc<RuleSet>,
}

impl ManagerConfig {
    /// Build from the daemon configuration, compiling custom classifier
    /// rules ahead of the built-in ones.
    pub fn from_config(config: &Config) -> ccfleet_core::Result<Self> {
        Ok(Self {
            agent_bin: config.daemon.agent_bin.clone(),
            agent_args: config.daemon.agent_args.clone(),
            monitor: MonitorConfig::from(&config.monitor),
            rules: Arc::new(RuleSet::with_custom(&config.monitor.rules)?),
        })
    }
}

/// Events published to UI subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    TerminalOutput {
        session_id: String,
        instance_id: Option<String>,
        data: String,
    },
    SessionCreated {
        session_id: String,
        instance_id: Option<String>,
        pid: Option<u32>,
    },
    SessionExited {
        session_id: String,
        instance_id: Option<String>,
        code: Option<u32>,
        signal: Option<String>,
    },
    AgentStateChanged {
        instance_id: String,
        previous: AgentState,
        current: AgentState,
        at_ms: i64,
    },
    WaitingForInput {
        instance_id: String,
        context: String,
    },
    ResponseComplete {
        instance_id: String,
        action_needed: Option<ActionNeeded>,
        context: String,
    },
    InstanceStatusChanged {
        instance_id: String,
        project_id: String,
        status: InstanceStatus,
    },
    InstanceError {
        instance_id: String,
        message: String,
    },
}

impl FleetEvent {
    fn status_changed(instance: &Instance) -> Self {
        Self::InstanceStatusChanged {
            instance_id: instance.id.clone(),
            project_id: instance.project_id.clone(),
            status: instance.status,
        }
    }
}

/// Messages applied to the registry by the signal loop.
#[derive(Debug, Clone)]
pub enum InstanceSignal {
    ProcessExited {
        instance_id: String,
        code: Option<u32>,
        signal: Option<String>,
    },
    AgentState {
        instance_id: String,
        change: StateChange,
    },
}

/// A child instance whose agent is running.
#[derive(Debug, Clone, Serialize)]
pub struct ChildLaunch {
    pub instance: Instance,
    pub worktree: Worktree,
    pub session_id: String,
}

/// Result of a maintenance cleanup pass.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub instances: Vec<Instance>,
    pub worktrees_removed: usize,
}

/// Live agent process of an instance.
struct InstanceSession {
    session_id: String,
    _analyzer: Arc<OutputAnalyzer>,
}

type InstanceSessions = Arc<RwLock<HashMap<String, InstanceSession>>>;

/// Terminal connection id owned by an instance's agent.
pub fn connection_id(instance_id: &str) -> String {
    format!("instance:{instance_id}")
}

/// Coordinates instance lifecycles across the registry, worktrees, and
/// terminals.
pub struct InstanceManager {
    registry: Arc<InstanceRegistry>,
    scheduler: Arc<PhaseScheduler>,
    worktrees: WorktreeManager,
    terminals: Arc<TerminalMultiplexer>,
    config: ManagerConfig,
    events: broadcast::Sender<FleetEvent>,
    signals: mpsc::UnboundedSender<InstanceSignal>,
    sessions: InstanceSessions,
}

impl InstanceManager {
    /// Create the manager and start its signal loop. Must be called inside a
    /// Tokio runtime.
    pub fn new(
        db: Database,
        worktrees: WorktreeManager,
        terminals: Arc<TerminalMultiplexer>,
        config: ManagerConfig,
    ) -> Self {
        let registry = Arc::new(InstanceRegistry::new(db.clone()));
        let scheduler = Arc::new(PhaseScheduler::new(db));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let sessions: InstanceSessions = Arc::new(RwLock::new(HashMap::new()));

        let worker = SignalWorker {
            registry: Arc::clone(&registry),
            scheduler: Arc::clone(&scheduler),
            events: events.clone(),
            sessions: Arc::clone(&sessions),
        };
        tokio::spawn(worker.run(signal_rx));

        Self {
            registry,
            scheduler,
            worktrees,
            terminals,
            config,
            events,
            signals,
            sessions,
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &PhaseScheduler {
        &self.scheduler
    }

    pub fn terminals(&self) -> &TerminalMultiplexer {
        &self.terminals
    }

    pub const fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Publish an event from outside the manager, e.g. operator terminals.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }

    /// Register a parent instance. The operator drives it directly, so it
    /// is running as soon as it exists.
    pub async fn create_parent_instance(&self, project_id: &str) -> Result<Instance, ManagerError> {
        let instance = self
            .registry
            .create_instance(NewInstance::Parent {
                project_id: project_id.to_string(),
            })
            .await?;
        let instance = self
            .registry
            .update_status(&instance.id, InstanceStatus::Running)
            .await?;
        self.publish(FleetEvent::status_changed(&instance));
        Ok(instance)
    }

    /// Start an agent for `task_id` in a fresh worktree under
    /// `parent_instance_id`.
    ///
    /// The agent receives `instruction`, or the task's stored instruction
    /// when none is given.
    pub async fn create_child_instance(
        &self,
        parent_instance_id: &str,
        task_id: &str,
        instruction: Option<&str>,
    ) -> Result<ChildLaunch, ManagerError> {
        let parent = self.registry.get(parent_instance_id).await.map_err(|e| match e {
            RegistryError::InstanceNotFound { id } => RegistryError::ParentNotFound { id },
            other => other,
        })?;

        let waiting_on = self.scheduler.unsatisfied_dependencies(task_id).await?;
        if !waiting_on.is_empty() {
            return Err(ManagerError::TaskNotReady {
                task_id: task_id.to_string(),
                waiting_on,
            });
        }

        let project = self
            .registry
            .db()
            .get_project(&parent.project_id)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound(_) => RegistryError::ProjectNotFound {
                    id: parent.project_id.clone(),
                },
                other => other.into(),
            })?;
        let task = self.registry.db().get_task(task_id).await?;
        if !matches!(
            task.status.parse::<TaskStatus>(),
            Ok(TaskStatus::Pending | TaskStatus::Queued)
        ) {
            return Err(ManagerError::TaskNotStartable {
                task_id: task.id,
                status: task.status,
            });
        }
        let repo = PathBuf::from(&project.working_directory);
        let plan = self.worktrees.plan(&repo, task_id)?;

        let instance = self
            .registry
            .create_instance(NewInstance::Child {
                project_id: project.id.clone(),
                parent_instance_id: parent.id.clone(),
                task_id: Some(task_id.to_string()),
                worktree_path: Some(plan.path.to_string_lossy().into_owned()),
            })
            .await?;
        self.publish(FleetEvent::status_changed(&instance));

        let worktree = match self.worktrees.create(&plan).await {
            Ok(worktree) => worktree,
            Err(source) => {
                self.fail_launch(&instance, format!("worktree creation failed: {source}"))
                    .await;
                return Err(ManagerError::WorktreeCreationFailed {
                    instance_id: instance.id,
                    source,
                });
            }
        };

        let instruction = instruction.unwrap_or(&task.instruction);
        let (analyzer, monitor_rx) =
            OutputAnalyzer::new(Arc::clone(&self.config.rules), self.config.monitor.clone());
        let analyzer = Arc::new(analyzer);
        let spec = self.agent_spec(&instance, &worktree.path, instruction, Arc::clone(&analyzer));

        let handle = match self
            .terminals
            .create_session(&connection_id(&instance.id), spec)
            .await
        {
            Ok(handle) => handle,
            Err(source) => {
                self.fail_launch(&instance, format!("agent failed to start: {source}"))
                    .await;
                if let Err(e) = self.worktrees.remove(&repo, &worktree.path).await {
                    warn!(instance_id = %instance.id, error = %e, "Failed to remove worktree after spawn failure");
                }
                return Err(ManagerError::ProcessSpawnFailed {
                    instance_id: instance.id,
                    source,
                });
            }
        };

        let instance = match self.mark_launched(&instance, task_id, handle.pid).await {
            Ok(instance) => instance,
            Err(e) => {
                self.terminals.destroy(&handle.session_id).await;
                self.fail_launch(&instance, format!("failed to record launch: {e}"))
                    .await;
                return Err(e);
            }
        };

        self.sessions.write().await.insert(
            instance.id.clone(),
            InstanceSession {
                session_id: handle.session_id.clone(),
                _analyzer: analyzer,
            },
        );
        self.publish(FleetEvent::SessionCreated {
            session_id: handle.session_id.clone(),
            instance_id: Some(instance.id.clone()),
            pid: handle.pid,
        });
        self.publish(FleetEvent::status_changed(&instance));

        tokio::spawn(forward_terminal(
            instance.id.clone(),
            handle.session_id.clone(),
            handle.events,
            self.events.clone(),
            self.signals.clone(),
        ));
        tokio::spawn(forward_monitor(
            instance.id.clone(),
            monitor_rx,
            self.events.clone(),
            self.signals.clone(),
        ));

        info!(
            instance_id = %instance.id,
            task_id,
            worktree = %worktree.path.display(),
            session_id = %handle.session_id,
            "Child instance launched"
        );

        Ok(ChildLaunch {
            instance,
            worktree,
            session_id: handle.session_id,
        })
    }

    /// Terminate an instance (and, with `force`, its active children) and
    /// signal their agents. Exits are observed asynchronously.
    pub async fn terminate_instance(
        &self,
        id: &str,
        force: bool,
    ) -> Result<TerminateOutcome, ManagerError> {
        let outcome = self.registry.terminate(id, force).await?;
        if let TerminateOutcome::Terminated { instance, cascaded } = &outcome {
            for instance_id in cascaded.iter().chain(std::iter::once(&instance.id)) {
                self.terminals
                    .destroy_connection(&connection_id(instance_id))
                    .await;
                let terminated = self.registry.get(instance_id).await?;
                if let Some(task_id) = terminated.task_id() {
                    self.release_task(&terminated.project_id, task_id).await;
                }
                self.publish(FleetEvent::status_changed(&terminated));
            }
        }
        Ok(outcome)
    }

    /// Apply a progress report from an agent. Completion also completes
    /// the instance's task.
    pub async fn report_progress(&self, id: &str, percent: i64) -> Result<Instance, ManagerError> {
        let before = self.registry.get(id).await?;
        let instance = self.registry.update_progress(id, percent).await?;
        if instance.status != before.status {
            if instance.status == InstanceStatus::Completed
                && let Some(task_id) = instance.task_id()
            {
                self.registry
                    .db()
                    .update_task_status(task_id, TaskStatus::Completed.as_str(), None)
                    .await?;
                self.refresh_phases(&instance.project_id).await;
            }
            self.publish(FleetEvent::status_changed(&instance));
        }
        Ok(instance)
    }

    /// Soft-delete finished instances older than `max_age_hours` and remove
    /// their worktrees.
    pub async fn cleanup(&self, max_age_hours: u64) -> Result<CleanupReport, ManagerError> {
        let instances = self.registry.cleanup(max_age_hours).await?;
        let mut worktrees_removed = 0;

        for instance in &instances {
            self.sessions.write().await.remove(&instance.id);
            let Some(path) = instance.worktree_path() else {
                continue;
            };
            let project = match self.registry.db().get_project(&instance.project_id).await {
                Ok(project) => project,
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Cannot resolve repository for worktree cleanup");
                    continue;
                }
            };
            match self
                .worktrees
                .remove(Path::new(&project.working_directory), Path::new(path))
                .await
            {
                Ok(true) => worktrees_removed += 1,
                Ok(false) => debug!(instance_id = %instance.id, path, "Worktree already gone"),
                Err(e) => warn!(instance_id = %instance.id, path, error = %e, "Failed to remove worktree"),
            }
        }

        if !instances.is_empty() {
            info!(
                instances = instances.len(),
                worktrees_removed, "Maintenance cleanup complete"
            );
        }
        Ok(CleanupReport {
            instances,
            worktrees_removed,
        })
    }

    /// Report instances idle for `max_idle_minutes`, terminating them when
    /// `terminate` is set.
    pub async fn reap_stale(
        &self,
        max_idle_minutes: u64,
        terminate: bool,
    ) -> Result<Vec<Instance>, ManagerError> {
        let stale = self.registry.find_stale(max_idle_minutes).await?;
        for instance in &stale {
            warn!(
                instance_id = %instance.id,
                status = %instance.status,
                updated_at = instance.updated_at,
                "Stale instance"
            );
            if terminate
                && let Err(e) = self.terminate_instance(&instance.id, true).await
            {
                warn!(instance_id = %instance.id, error = %e, "Failed to terminate stale instance");
            }
        }
        Ok(stale)
    }

    /// Session id of an instance's running agent.
    pub async fn session_of(&self, instance_id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(instance_id)
            .map(|s| s.session_id.clone())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn agent_spec(
        &self,
        instance: &Instance,
        worktree: &Path,
        instruction: &str,
        analyzer: Arc<OutputAnalyzer>,
    ) -> SessionSpec {
        let mut args = self.config.agent_args.clone();
        if !instruction.is_empty() {
            args.push(instruction.to_string());
        }
        let mut spec = SessionSpec::shell(worktree)
            .with_command(self.config.agent_bin.to_string_lossy(), args)
            .with_size(AGENT_COLS, AGENT_ROWS)
            .with_analyzer(analyzer);
        spec.env.push(("CCFLEET_INSTANCE_ID".into(), instance.id.clone()));
        spec.env
            .push(("CCFLEET_PROJECT_ID".into(), instance.project_id.clone()));
        if let Some(task_id) = instance.task_id() {
            spec.env.push(("CCFLEET_TASK_ID".into(), task_id.to_string()));
        }
        spec
    }

    async fn mark_launched(
        &self,
        instance: &Instance,
        task_id: &str,
        pid: Option<u32>,
    ) -> Result<Instance, ManagerError> {
        self.registry.set_pid(&instance.id, pid).await?;
        let instance = self
            .registry
            .update_status(&instance.id, InstanceStatus::Running)
            .await?;
        self.registry
            .db()
            .update_task_status(task_id, TaskStatus::Running.as_str(), Some(&instance.id))
            .await?;
        self.refresh_phases(&instance.project_id).await;
        Ok(instance)
    }

    async fn fail_launch(&self, instance: &Instance, message: String) {
        error!(instance_id = %instance.id, %message, "Instance launch failed");
        match self
            .registry
            .update_status(&instance.id, InstanceStatus::Failed)
            .await
        {
            Ok(failed) => self.publish(FleetEvent::status_changed(&failed)),
            Err(e) => warn!(instance_id = %instance.id, error = %e, "Failed to mark instance failed"),
        }
        self.publish(FleetEvent::InstanceError {
            instance_id: instance.id.clone(),
            message,
        });
    }

    /// Put a task whose agent was terminated back in the queue.
    async fn release_task(&self, project_id: &str, task_id: &str) {
        let db = self.registry.db();
        match db.get_task(task_id).await {
            Ok(task) if task.status == TaskStatus::Running.as_str() => {
                if let Err(e) = db
                    .update_task_status(task_id, TaskStatus::Pending.as_str(), None)
                    .await
                {
                    warn!(task_id, error = %e, "Failed to release task");
                }
                self.refresh_phases(project_id).await;
            }
            Ok(_) => {}
            Err(e) => warn!(task_id, error = %e, "Failed to load task"),
        }
    }

    async fn refresh_phases(&self, project_id: &str) {
        if let Err(e) = self.scheduler.refresh_phase_status(project_id).await {
            warn!(project_id, error = %e, "Failed to refresh phase status");
        }
    }
}

/// Forward an agent's terminal events and report its exit.
async fn forward_terminal(
    instance_id: String,
    session_id: String,
    mut events: broadcast::Receiver<TerminalEvent>,
    fleet: broadcast::Sender<FleetEvent>,
    signals: mpsc::UnboundedSender<InstanceSignal>,
) {
    let (code, signal) = loop {
        match events.recv().await {
            Ok(TerminalEvent::Output(bytes)) => {
                let _ = fleet.send(FleetEvent::TerminalOutput {
                    session_id: session_id.clone(),
                    instance_id: Some(instance_id.clone()),
                    data: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
            Ok(TerminalEvent::Exited { code, signal }) => break (code, signal),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(instance_id = %instance_id, skipped, "Agent output lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break (None, None),
        }
    };

    let _ = fleet.send(FleetEvent::SessionExited {
        session_id,
        instance_id: Some(instance_id.clone()),
        code,
        signal: signal.clone(),
    });
    let _ = signals.send(InstanceSignal::ProcessExited {
        instance_id,
        code,
        signal,
    });
}

/// Forward analyzer events until the analyzer is dropped.
async fn forward_monitor(
    instance_id: String,
    mut rx: mpsc::UnboundedReceiver<MonitorEvent>,
    fleet: broadcast::Sender<FleetEvent>,
    signals: mpsc::UnboundedSender<InstanceSignal>,
) {
    while let Some(event) = rx.recv().await {
        let published = match event {
            MonitorEvent::StateChanged(change) => {
                let _ = signals.send(InstanceSignal::AgentState {
                    instance_id: instance_id.clone(),
                    change,
                });
                FleetEvent::AgentStateChanged {
                    instance_id: instance_id.clone(),
                    previous: change.previous,
                    current: change.current,
                    at_ms: change.at_ms,
                }
            }
            MonitorEvent::WaitingForInput { context } => FleetEvent::WaitingForInput {
                instance_id: instance_id.clone(),
                context,
            },
            MonitorEvent::ResponseComplete {
                action_needed,
                context,
            } => FleetEvent::ResponseComplete {
                instance_id: instance_id.clone(),
                action_needed,
                context,
            },
        };
        let _ = fleet.send(published);
    }
}

/// Sequential consumer of [`InstanceSignal`]s.
struct SignalWorker {
    registry: Arc<InstanceRegistry>,
    scheduler: Arc<PhaseScheduler>,
    events: broadcast::Sender<FleetEvent>,
    sessions: InstanceSessions,
}

impl SignalWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<InstanceSignal>) {
        while let Some(signal) = rx.recv().await {
            if let Err(e) = self.apply(signal).await {
                warn!(error = %e, "Failed to apply instance signal");
            }
        }
        debug!("Instance signal loop stopped");
    }

    async fn apply(&self, signal: InstanceSignal) -> Result<(), ManagerError> {
        match signal {
            InstanceSignal::ProcessExited {
                instance_id,
                code,
                signal,
            } => self.on_exit(&instance_id, code, signal).await,
            InstanceSignal::AgentState {
                instance_id,
                change,
            } => self.on_state(&instance_id, change).await,
        }
    }

    async fn on_exit(
        &self,
        id: &str,
        code: Option<u32>,
        signal: Option<String>,
    ) -> Result<(), ManagerError> {
        self.sessions.write().await.remove(id);

        let instance = self.registry.get(id).await?;
        if instance.status.is_terminal() || instance.deleted_at.is_some() {
            debug!(instance_id = %id, status = %instance.status, "Agent exited after instance finished");
            return Ok(());
        }

        let success = code == Some(0) && signal.is_none();
        let (instance, task_status) = if success {
            (
                self.registry.update_progress(id, 100).await?,
                TaskStatus::Completed,
            )
        } else {
            (
                self.registry
                    .update_status(id, InstanceStatus::Failed)
                    .await?,
                TaskStatus::Failed,
            )
        };
        info!(instance_id = %id, code = ?code, signal = ?signal, status = %instance.status, "Agent exited");

        if let Some(task_id) = instance.task_id() {
            self.registry
                .db()
                .update_task_status(task_id, task_status.as_str(), None)
                .await?;
            if let Err(e) = self.scheduler.refresh_phase_status(&instance.project_id).await {
                warn!(project_id = %instance.project_id, error = %e, "Failed to refresh phase status");
            }
        }

        let _ = self.events.send(FleetEvent::status_changed(&instance));
        if !success {
            let reason = match (signal, code) {
                (Some(signal), _) => format!("agent killed by signal {signal}"),
                (None, Some(code)) => format!("agent exited with code {code}"),
                (None, None) => "agent exited with unknown status".to_string(),
            };
            let _ = self.events.send(FleetEvent::InstanceError {
                instance_id: id.to_string(),
                message: reason,
            });
        }
        Ok(())
    }

    async fn on_state(&self, id: &str, change: StateChange) -> Result<(), ManagerError> {
        let instance = self.registry.get(id).await?;
        let next = match (instance.status, change.current) {
            (InstanceStatus::Running, AgentState::WaitingInput) => InstanceStatus::Waiting,
            (InstanceStatus::Waiting, current) if current != AgentState::WaitingInput => {
                InstanceStatus::Running
            }
            (status, _) if status.is_active() => {
                self.registry.touch(id).await?;
                return Ok(());
            }
            _ => return Ok(()),
        };

        let instance = self.registry.update_status(id, next).await?;
        let _ = self.events.send(FleetEvent::status_changed(&instance));
        Ok(())
    }
}
