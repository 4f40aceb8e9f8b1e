//! Agent instance orchestration.
//!
//! - [`InstanceRegistry`]: persisted instance lifecycle under per-project
//!   parallelism quotas.
//! - [`PhaseScheduler`]: task dependency analysis, readiness, and phases.
//! - [`InstanceManager`]: launches agents in worktrees and applies their
//!   exits and state changes to the registry.

pub mod instance;
pub mod manager;
pub mod quota;
pub mod registry;
pub mod scheduler;

pub use instance::{Instance, InstanceRole, InstanceStatus, NewInstance};
pub use manager::{
    ChildLaunch, CleanupReport, FleetEvent, InstanceManager, InstanceSignal, ManagerConfig,
    ManagerError, connection_id,
};
pub use quota::ProjectLocks;
pub use registry::{DeleteOutcome, InstanceRegistry, RegistryError, TerminateOutcome};
pub use scheduler::{
    CanonicalPhase, HeuristicPhase, PhasePlan, PhaseScheduler, PlannedPhase, SchedulerError,
    compute_phases,
};
