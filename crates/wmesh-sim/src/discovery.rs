//! Point-in-time enumeration of wireless-router containers.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::config::DiscoveryConfig;
use crate::runtime::ContainerRuntime;
use crate::{Error, Result};

/// A running container as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// A discovered wireless router. `id` is its index in discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Router {
    pub id: usize,
    pub name: String,
    pub docker_id: String,
    pub ipv4: Option<Ipv4Addr>,
    /// Index `i` of the `net.<i>` label set carrying the wireless network.
    pub interface_index: Option<usize>,
}

impl Router {
    /// Device that carries the wireless network inside the container.
    pub fn device(&self, configured: Option<&str>) -> String {
        match configured {
            Some(dev) => dev.to_string(),
            None => format!("eth{}", self.interface_index.unwrap_or(0)),
        }
    }
}

/// Finds the address bound on the wireless network. The first interface
/// whose name label matches wins.
pub fn wireless_address(
    container: &ContainerRecord,
    cfg: &DiscoveryConfig,
) -> Result<(usize, Ipv4Addr)> {
    let missing = |reason: String| Error::Discovery {
        node: container.name.clone(),
        reason,
    };
    for idx in 0..cfg.max_interfaces {
        let Some(name) = container.labels.get(&cfg.net_name_label(idx)) else {
            continue;
        };
        if name != &cfg.wireless_network {
            continue;
        }
        let raw = container
            .labels
            .get(&cfg.net_address_label(idx))
            .ok_or_else(|| missing(format!("net.{} has no address label", idx)))?;
        let addr = raw.split('/').next().unwrap_or(raw).trim();
        let ip = addr
            .parse::<Ipv4Addr>()
            .map_err(|e| missing(format!("net.{} address {:?}: {}", idx, raw, e)))?;
        return Ok((idx, ip));
    }
    Err(missing(format!(
        "no interface on network {:?}",
        cfg.wireless_network
    )))
}

/// Filters wireless routers and assigns ids in logical-name order.
///
/// A router without the wireless interface keeps its id with `ipv4 = None`.
pub fn discover_routers(containers: Vec<ContainerRecord>, cfg: &DiscoveryConfig) -> Vec<Router> {
    let role_label = cfg.role_label();
    let name_label = cfg.name_label();

    let mut candidates: Vec<(String, ContainerRecord)> = containers
        .into_iter()
        .filter(|c| c.labels.get(&role_label) == Some(&cfg.role))
        .map(|c| {
            let name = c
                .labels
                .get(&name_label)
                .cloned()
                .unwrap_or_else(|| c.name.trim_start_matches('/').to_string());
            (name, c)
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

    candidates
        .into_iter()
        .enumerate()
        .map(|(id, (name, container))| {
            let (interface_index, ipv4) = match wireless_address(&container, cfg) {
                Ok((idx, ip)) => (Some(idx), Some(ip)),
                Err(e) => {
                    tracing::warn!(node = id, error = %e, "router has no wireless address");
                    (None, None)
                }
            };
            Router {
                id,
                name,
                docker_id: container.id,
                ipv4,
                interface_index,
            }
        })
        .collect()
}

/// Lists labelled containers through the runtime and discovers routers.
pub async fn discover(runtime: &dyn ContainerRuntime, cfg: &DiscoveryConfig) -> Result<Vec<Router>> {
    let filter = format!("{}={}", cfg.role_label(), cfg.role);
    let containers = runtime.list_containers(&filter).await?;
    let routers = discover_routers(containers, cfg);
    tracing::info!(
        routers = routers.len(),
        with_address = routers.iter().filter(|r| r.ipv4.is_some()).count(),
        "discovery complete"
    );
    Ok(routers)
}
