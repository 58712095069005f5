//! Wireless mesh emulation over container fleets.
//!
//! Provides container discovery, node mobility with distance-dependent
//! loss, end-to-end loss composition along live kernel routes, and
//! `tc` HTB/netem script synthesis applied inside each container so that
//! real traffic sees the emulated radio channel.

pub mod applier;
pub mod config;
pub mod discovery;
pub mod impairment;
pub mod loss;
pub mod node;
pub mod route;
pub mod runtime;
pub mod scenario;
pub mod simulation;
pub mod snapshot;
pub mod topology;

pub mod test_util;

pub use applier::{Applier, ApplyReport, MeasuredRoute, NodeOutcome};
pub use config::SimConfig;
pub use loss::{LossModel, StepLossTable};
pub use node::Node;
pub use route::{RouteInfo, RouteOutcome};
pub use runtime::{ContainerRuntime, DockerRuntime, ExecOutput};
pub use simulation::Simulation;
pub use topology::Topology;

/// Result type used throughout this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by discovery, resolution, shaping and persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node {node}: {reason}")]
    Discovery { node: String, reason: String },

    #[error("route query failed on node {node}: {reason}")]
    RouteQuery { node: usize, reason: String },

    #[error("routing cycle from {src} to {dst} via {path:?}")]
    RoutingCycle {
        src: usize,
        dst: usize,
        path: Vec<usize>,
    },

    #[error("shaping failed on node {node} (exit {exit_code:?}): {stderr}")]
    ShapingApply {
        node: usize,
        exit_code: Option<i64>,
        stderr: String,
    },

    #[error("exec in container {container} timed out after {timeout_ms}ms")]
    ExecTimeout { container: String, timeout_ms: u64 },

    #[error("invalid snapshot: {0}")]
    Snapshot(String),

    #[error("unsupported snapshot version {0}")]
    SnapshotVersion(u32),

    #[error("snapshot holds {persisted} nodes but {discovered} routers were discovered")]
    SnapshotMismatch { persisted: usize, discovered: usize },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("unknown node id {0}")]
    UnknownNode(usize),

    #[error("invalid placement for node {id}: ({x}, {y})")]
    InvalidPlacement { id: usize, x: f64, y: f64 },

    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
