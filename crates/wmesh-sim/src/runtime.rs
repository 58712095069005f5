//! Container runtime boundary.
//!
//! Every query or mutation of the emulated fleet reduces to "list labelled
//! containers" or "run this command inside container X". [`DockerRuntime`]
//! implements both over the Docker Engine API.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    container::{ListContainersOptions, LogOutput},
    exec::{CreateExecOptions, StartExecResults},
    Docker,
};
use futures::StreamExt;

use crate::discovery::ContainerRecord;
use crate::{Error, Result};

/// Captured result of one exec call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running containers matching a `key=value` label filter.
    async fn list_containers(&self, label_filter: &str) -> Result<Vec<ContainerRecord>>;

    /// Runs `cmd` inside `container` and waits for it to exit.
    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput>;
}

/// Docker Engine backend.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the local defaults (`DOCKER_HOST` or the unix socket)
    /// and verifies the daemon answers.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, label_filter: &str) -> Result<Vec<ContainerRecord>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label_filter.to_string()]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                let id = s.id?;
                let name = s
                    .names
                    .and_then(|names| names.into_iter().next())
                    .unwrap_or_else(|| id.clone());
                Some(ContainerRecord {
                    id,
                    name,
                    labels: s.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut out = ExecOutput::default();
        let started = self.docker.start_exec(&exec.id, None).await?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(msg) = output.next().await {
                match msg? {
                    LogOutput::StdOut { message } => {
                        out.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        out.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        out.exit_code = inspect.exit_code;
        if out.exit_code.is_none() {
            return Err(Error::Other(anyhow::anyhow!(
                "exec in {} finished without an exit code",
                container
            )));
        }
        Ok(out)
    }
}
