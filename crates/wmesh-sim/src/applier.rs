//! Fleet-wide execution of shaping scripts and measurement commands.
//!
//! Calls to different containers run concurrently, bounded by the worker
//! count. Calls to the same container are serialised so two scripts never
//! interleave on one node. Every call carries a deadline; a timeout is a
//! failure of that node only.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;

use crate::config::ApplierConfig;
use crate::impairment::TcScript;
use crate::runtime::{ContainerRuntime, ExecOutput};
use crate::{Error, Result};

/// One command destined for one node's container.
#[derive(Debug, Clone)]
pub struct NodeJob {
    pub node: usize,
    pub container: String,
    pub cmd: Vec<String>,
}

/// Per-node result of a fleet operation.
#[derive(Debug)]
pub struct NodeOutcome {
    pub node: usize,
    pub container: String,
    pub result: Result<()>,
}

/// Which nodes succeeded and which failed, in node order.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub outcomes: Vec<NodeOutcome>,
}

impl ApplyReport {
    pub fn succeeded(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.node)
            .collect()
    }

    pub fn failed(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.node)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for o in &self.outcomes {
            match &o.result {
                Ok(()) => writeln!(f, "node {:>3} {:<20} ok", o.node, o.container)?,
                Err(e) => writeln!(f, "node {:>3} {:<20} FAILED: {}", o.node, o.container, e)?,
            }
        }
        write!(
            f,
            "{} ok, {} failed",
            self.succeeded().len(),
            self.failed().len()
        )
    }
}

/// Route and loss observed by `ping -R` from inside a node.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredRoute {
    /// Record-route addresses in order.
    pub hops: Vec<Ipv4Addr>,
    /// Node id for each hop, when the address belongs to a known node.
    pub node_hops: Vec<Option<usize>>,
    pub loss_percent: Option<f32>,
}

pub struct Applier {
    runtime: Arc<dyn ContainerRuntime>,
    workers: usize,
    exec_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Applier {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, cfg: &ApplierConfig) -> Self {
        Self {
            runtime,
            workers: cfg.workers.max(1),
            exec_timeout: cfg.exec_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    fn lock_for(&self, container: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(container.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Runs one command in a container under its lock and the exec deadline.
    ///
    /// The deadline covers waiting for the lock as well as the exec. The exec
    /// runs on its own task that owns the lock, so a call that times out keeps
    /// the container locked until the command really exits inside it; later
    /// calls to that container wait (or time out) instead of interleaving.
    pub async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput> {
        let lock = self.lock_for(container);
        let runtime = Arc::clone(&self.runtime);
        let target = container.to_string();
        let argv = cmd.to_vec();

        let run = async move {
            let guard = lock.lock_owned().await;
            let task = tokio::spawn(async move {
                let result = runtime.exec(&target, &argv).await;
                drop(guard);
                result
            });
            task.await
        };

        match tokio::time::timeout(self.exec_timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::Other(anyhow::anyhow!(
                "exec task in {} aborted: {}",
                container,
                join
            ))),
            Err(_) => {
                tracing::warn!(
                    container = %container,
                    timeout_ms = self.exec_timeout.as_millis() as u64,
                    "exec timed out, container stays locked until it exits"
                );
                Err(Error::ExecTimeout {
                    container: container.to_string(),
                    timeout_ms: self.exec_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Runs every job with bounded concurrency; results come back in node order.
    pub async fn run_all(&self, jobs: Vec<NodeJob>) -> Vec<(NodeJob, Result<ExecOutput>)> {
        let mut results: Vec<(NodeJob, Result<ExecOutput>)> = futures::stream::iter(jobs)
            .map(|job| async move {
                let result = self.exec(&job.container, &job.cmd).await;
                (job, result)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;
        results.sort_by_key(|(job, _)| job.node);
        results
    }

    /// Executes one script per node. A failing node is logged and reported
    /// but never stops the others.
    pub async fn apply_scripts(&self, scripts: Vec<(usize, String, TcScript)>) -> ApplyReport {
        let jobs = scripts
            .into_iter()
            .filter(|(_, _, script)| !script.is_empty())
            .map(|(node, container, script)| {
                tracing::debug!(node, container = %container, script = %script.render(), "shaping script");
                NodeJob {
                    node,
                    container,
                    cmd: script.command(),
                }
            })
            .collect();

        let outcomes: Vec<NodeOutcome> = self
            .run_all(jobs)
            .await
            .into_iter()
            .map(|(job, result)| {
                let result = result.and_then(|out| {
                    if out.is_success() {
                        Ok(())
                    } else {
                        Err(Error::ShapingApply {
                            node: job.node,
                            exit_code: out.exit_code,
                            stderr: out.stderr.trim().to_string(),
                        })
                    }
                });
                if let Err(e) = &result {
                    tracing::warn!(
                        node = job.node,
                        container = %job.container,
                        error = %e,
                        command = %job.cmd.last().map(String::as_str).unwrap_or_default(),
                        "shaping failed"
                    );
                }
                NodeOutcome {
                    node: job.node,
                    container: job.container,
                    result,
                }
            })
            .collect();

        let report = ApplyReport { outcomes };
        tracing::info!(
            ok = report.succeeded().len(),
            failed = report.failed().len(),
            "shaping applied"
        );
        report
    }

    /// Runs `ping -R` towards `dst` inside `container` and parses the
    /// recorded route and the loss. `addresses` maps node ids to IPv4.
    pub async fn measure_route(
        &self,
        container: &str,
        dst: Ipv4Addr,
        count: u32,
        addresses: &[Option<Ipv4Addr>],
    ) -> Result<MeasuredRoute> {
        let cmd: Vec<String> = vec![
            "ping".into(),
            "-c".into(),
            count.max(1).to_string(),
            "-W".into(),
            "1".into(),
            "-R".into(),
            dst.to_string(),
        ];
        let out = self.exec(container, &cmd).await?;
        // ping exits non-zero on loss; the output is still meaningful.
        let (hops, loss_percent) = parse_ping(&out.stdout);
        if hops.is_empty() && loss_percent.is_none() {
            return Err(Error::Other(anyhow::anyhow!(
                "ping in {} produced no usable output: {}",
                container,
                out.stderr.trim()
            )));
        }
        let node_hops = hops
            .iter()
            .map(|hop| addresses.iter().position(|a| *a == Some(*hop)))
            .collect();
        Ok(MeasuredRoute {
            hops,
            node_hops,
            loss_percent,
        })
    }
}

/// Extracts the first `RR:` block and the packet-loss percentage from
/// `ping -R` output.
pub fn parse_ping(output: &str) -> (Vec<Ipv4Addr>, Option<f32>) {
    let mut hops = Vec::new();
    let mut in_rr = false;
    let mut rr_done = false;
    let mut loss = None;

    for line in output.lines() {
        if !rr_done {
            if let Some(rest) = line.trim_start().strip_prefix("RR:") {
                in_rr = true;
                hops.extend(rest.split_whitespace().filter_map(|t| t.parse::<Ipv4Addr>().ok()));
                continue;
            }
            if in_rr {
                let indented = line.starts_with(char::is_whitespace);
                let hop = line.split_whitespace().next().and_then(|t| t.parse::<Ipv4Addr>().ok());
                match hop {
                    Some(ip) if indented => {
                        hops.push(ip);
                        continue;
                    }
                    _ => {
                        in_rr = false;
                        rr_done = true;
                    }
                }
            }
        }
        if let Some(idx) = line.find("% packet loss") {
            loss = line[..idx]
                .rsplit(|c: char| c.is_whitespace() || c == ',')
                .next()
                .and_then(|v| v.parse::<f32>().ok());
        }
    }
    (hops, loss)
}
