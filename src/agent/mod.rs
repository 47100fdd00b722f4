// Agent runtime
//
// The agent runs unattended cycles: sweep the local /24, report what it
// finds, pull the current website and software policy from the backend and
// enforce it. Cycles never overlap and a failed cycle never stops the loop.

mod config;
mod daemon;
mod scheduler;

pub use config::{
    AgentConfig, AgentSettings, BackendConfig, CacheSettings, EnforcementSettings, LocationConfig,
    LoggingConfig, ScanSettings,
};
pub use daemon::{Agent, CyclePhase, CycleReport, run_agent_daemon};
pub use scheduler::CycleScheduler;
