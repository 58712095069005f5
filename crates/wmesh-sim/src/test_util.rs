//! In-memory container runtime for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::discovery::ContainerRecord;
use crate::runtime::{ContainerRuntime, ExecOutput};
use crate::Result;

/// A [`ContainerRuntime`] answering from canned responses.
///
/// Replies are looked up by `(container, program)` where `program` is the
/// first argv element; anything unscripted succeeds with empty output. Every
/// exec is recorded.
#[derive(Default)]
pub struct ScriptedRuntime {
    containers: Vec<ContainerRecord>,
    responses: HashMap<(String, String), ExecOutput>,
    failing: HashMap<String, ExecOutput>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_containers(mut self, containers: Vec<ContainerRecord>) -> Self {
        self.containers = containers;
        self
    }

    pub fn respond(mut self, container: &str, program: &str, output: ExecOutput) -> Self {
        self.responses
            .insert((container.to_string(), program.to_string()), output);
        self
    }

    /// Every exec in `container` exits with `exit_code`.
    pub fn fail_container(mut self, container: &str, exit_code: i64, stderr: &str) -> Self {
        self.failing
            .insert(container.to_string(), ExecOutput::failure(exit_code, stderr));
        self
    }

    /// Every exec in `container` sleeps before answering.
    pub fn delay_container(mut self, container: &str, delay: Duration) -> Self {
        self.delays.insert(container.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Scripts (the `sh -c` payload) executed in one container, in order.
    pub fn scripts_for(&self, container: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(c, cmd)| c == container && cmd.first().map(String::as_str) == Some("sh"))
            .filter_map(|(_, cmd)| cmd.last().cloned())
            .collect()
    }
}

/// Builds a labelled wireless router record.
pub fn router_record(id: &str, name: &str, ip: Option<&str>) -> ContainerRecord {
    let mut labels = HashMap::new();
    labels.insert("emu.role".to_string(), "wireless-router".to_string());
    labels.insert("emu.name".to_string(), name.to_string());
    if let Some(ip) = ip {
        labels.insert("emu.net.0.name".to_string(), "wlan".to_string());
        labels.insert("emu.net.0.address".to_string(), format!("{}/24", ip));
    }
    ContainerRecord {
        id: id.to_string(),
        name: format!("/{}", name),
        labels,
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn list_containers(&self, label_filter: &str) -> Result<Vec<ContainerRecord>> {
        let (key, value) = label_filter.split_once('=').unwrap_or((label_filter, ""));
        Ok(self
            .containers
            .iter()
            .filter(|c| c.labels.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((container.to_string(), cmd.to_vec()));

        if let Some(delay) = self.delays.get(container) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(out) = self.failing.get(container) {
            return Ok(out.clone());
        }
        let program = cmd.first().cloned().unwrap_or_default();
        Ok(self
            .responses
            .get(&(container.to_string(), program))
            .cloned()
            .unwrap_or_else(|| ExecOutput::success("")))
    }
}
