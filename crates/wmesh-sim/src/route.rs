//! End-to-end loss along live kernel routes.
//!
//! Each node's `ip -j route` output yields its next hop towards every peer.
//! Walking those hops from a source to a destination and multiplying the
//! per-hop survival probabilities gives the composed loss of the path.

use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::topology::Topology;
use crate::{Error, Result};

/// `nexthops[node][dst]`: the peer `node` forwards to when sending to `dst`.
pub type NextHopTable = Vec<Vec<Option<usize>>>;

/// One entry of `ip -j route`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteEntry {
    pub dst: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dev: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl RouteEntry {
    fn network(&self) -> Option<Ipv4Network> {
        if self.dst == "default" {
            return Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).ok();
        }
        if self.dst.contains('/') {
            Ipv4Network::from_str(&self.dst).ok()
        } else {
            let ip = self.dst.parse::<Ipv4Addr>().ok()?;
            Ipv4Network::new(ip, 32).ok()
        }
    }

    fn is_unreachable(&self) -> bool {
        matches!(
            self.kind.as_deref(),
            Some("unreachable" | "blackhole" | "prohibit" | "throw")
        )
    }
}

pub fn parse_routes(json: &str) -> std::result::Result<Vec<RouteEntry>, serde_json::Error> {
    serde_json::from_str(json)
}

/// Longest-prefix route towards `ip`.
pub fn lookup(routes: &[RouteEntry], ip: Ipv4Addr) -> Option<&RouteEntry> {
    routes
        .iter()
        .filter_map(|r| r.network().map(|net| (net, r)))
        .filter(|(net, _)| net.contains(ip))
        .max_by_key(|(net, _)| net.prefix())
        .map(|(_, r)| r)
}

/// Next hop from `node` towards each entry of `addresses` (indexed by node
/// id). A gatewayed route resolves to the gateway's node id; a directly
/// attached one to the destination itself.
pub fn next_hops(
    routes: &[RouteEntry],
    node: usize,
    addresses: &[Option<Ipv4Addr>],
) -> Vec<Option<usize>> {
    let id_of = |ip: Ipv4Addr| addresses.iter().position(|a| *a == Some(ip));
    addresses
        .iter()
        .enumerate()
        .map(|(dst, addr)| {
            if dst == node {
                return Some(node);
            }
            let ip = (*addr)?;
            let route = lookup(routes, ip)?;
            if route.is_unreachable() {
                return None;
            }
            match &route.gateway {
                Some(gw) => id_of(gw.parse().ok()?),
                None => Some(dst),
            }
        })
        .collect()
}

/// Result of walking the hops for one ordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RouteOutcome {
    SameNode,
    /// The walk stopped at a node with no next hop; `routes` is the partial path.
    NoRoute { routes: Vec<usize> },
    Reached { routes: Vec<usize>, loss: u8 },
}

/// Walks `src -> dst` through `nexthops`, composing per-hop loss.
///
/// A hop that returns to the node two steps back, or a path longer than the
/// node count, is a routing cycle and fails with [`Error::RoutingCycle`].
pub fn compose(
    src: usize,
    dst: usize,
    nexthops: &NextHopTable,
    topology: &Topology,
) -> Result<RouteOutcome> {
    if src == dst {
        return Ok(RouteOutcome::SameNode);
    }
    let n = nexthops.len();
    let mut path = vec![src];
    let mut survival = 1.0_f64;
    let mut cursor = src;

    loop {
        let next = nexthops
            .get(cursor)
            .and_then(|row| row.get(dst))
            .copied()
            .flatten();
        let Some(next) = next else {
            return Ok(RouteOutcome::NoRoute { routes: path });
        };
        path.push(next);
        survival *= 1.0 - f64::from(topology.get(cursor, next)) / 100.0;

        let len = path.len();
        if (len >= 3 && path[len - 1] == path[len - 3]) || len > n {
            return Err(Error::RoutingCycle { src, dst, path });
        }
        if next == dst {
            let loss = ((1.0 - survival) * 100.0).round().clamp(0.0, 100.0) as u8;
            return Ok(RouteOutcome::Reached { routes: path, loss });
        }
        cursor = next;
    }
}

/// Composed routes for every ordered pair.
#[derive(Debug, Default)]
pub struct RouteInfo {
    pub routes: Vec<Vec<RouteOutcome>>,
    /// Nodes whose routing table could not be read.
    pub query_failures: Vec<Error>,
}

impl RouteInfo {
    pub fn get(&self, src: usize, dst: usize) -> Option<&RouteOutcome> {
        self.routes.get(src).and_then(|row| row.get(dst))
    }
}

/// Composes every pair; the first routing cycle fails the whole pass.
pub fn compose_all(nexthops: &NextHopTable, topology: &Topology) -> Result<Vec<Vec<RouteOutcome>>> {
    let n = nexthops.len();
    (0..n)
        .map(|src| {
            (0..n)
                .map(|dst| compose(src, dst, nexthops, topology))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: usize = 0;
    const B: usize = 1;
    const C: usize = 2;

    fn line_topology() -> Topology {
        let mut topo = Topology::new(3);
        topo.set(A, B, 20);
        topo.set(B, C, 40);
        topo.set(A, C, 100);
        topo
    }

    fn line_nexthops() -> NextHopTable {
        vec![
            vec![Some(A), Some(B), Some(B)],
            vec![Some(A), Some(B), Some(C)],
            vec![Some(B), Some(B), Some(C)],
        ]
    }

    #[test]
    fn two_hop_loss_composes() {
        let out = compose(A, C, &line_nexthops(), &line_topology()).unwrap();
        assert_eq!(
            out,
            RouteOutcome::Reached {
                routes: vec![A, B, C],
                loss: 52
            }
        );
    }

    #[test]
    fn reverse_direction_uses_same_cells() {
        let topo = line_topology();
        let fwd = compose(A, C, &line_nexthops(), &topo).unwrap();
        let rev = compose(C, A, &line_nexthops(), &topo).unwrap();
        match (fwd, rev) {
            (
                RouteOutcome::Reached { loss: l1, .. },
                RouteOutcome::Reached {
                    routes, loss: l2, ..
                },
            ) => {
                assert_eq!(l1, l2);
                assert_eq!(routes, vec![C, B, A]);
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
    }

    #[test]
    fn ping_pong_is_a_cycle() {
        let nexthops = vec![
            vec![Some(A), Some(B), Some(B)],
            vec![Some(A), Some(B), Some(A)],
            vec![None, None, Some(C)],
        ];
        let err = compose(A, C, &nexthops, &line_topology()).unwrap_err();
        match err {
            Error::RoutingCycle { src, dst, path } => {
                assert_eq!((src, dst), (A, C));
                assert_eq!(path, vec![A, B, A]);
            }
            other => panic!("expected routing cycle, got {other}"),
        }
        assert!(compose_all(&nexthops, &line_topology()).is_err());
    }

    #[test]
    fn longer_cycle_is_bounded() {
        // 0 -> 1 -> 2 -> 0 ... towards 3
        let nexthops = vec![
            vec![Some(0), Some(1), Some(2), Some(1)],
            vec![Some(0), Some(1), Some(2), Some(2)],
            vec![Some(0), Some(1), Some(2), Some(0)],
            vec![None, None, None, Some(3)],
        ];
        let topo = Topology::new(4);
        assert!(matches!(
            compose(0, 3, &nexthops, &topo),
            Err(Error::RoutingCycle { .. })
        ));
    }

    #[test]
    fn missing_hop_is_no_route() {
        let mut nexthops = line_nexthops();
        nexthops[B][C] = None;
        let out = compose(A, C, &nexthops, &line_topology()).unwrap();
        assert_eq!(out, RouteOutcome::NoRoute { routes: vec![A, B] });
        assert_eq!(
            compose(B, B, &nexthops, &line_topology()).unwrap(),
            RouteOutcome::SameNode
        );

        let all = compose_all(&nexthops, &line_topology()).unwrap();
        assert_eq!(
            all[A][B],
            RouteOutcome::Reached {
                routes: vec![A, B],
                loss: 20
            }
        );
    }

    #[test]
    fn parses_ip_json_routes() {
        let json = r#"[
            {"dst":"default","gateway":"172.17.0.1","dev":"eth0","flags":[]},
            {"dst":"10.0.0.0/24","dev":"eth1","protocol":"kernel","scope":"link","prefsrc":"10.0.0.1","flags":[]},
            {"dst":"10.0.0.3","gateway":"10.0.0.2","dev":"eth1","protocol":"babel","metric":1024,"flags":["onlink"]},
            {"dst":"10.0.0.4","type":"unreachable","flags":[]},
            {"dst":"fe80::/64","dev":"eth1","flags":[]}
        ]"#;
        let routes = parse_routes(json).unwrap();
        assert_eq!(routes.len(), 5);

        let addresses = vec![
            Some(Ipv4Addr::new(10, 0, 0, 1)),
            Some(Ipv4Addr::new(10, 0, 0, 2)),
            Some(Ipv4Addr::new(10, 0, 0, 3)),
            Some(Ipv4Addr::new(10, 0, 0, 4)),
            None,
            Some(Ipv4Addr::new(192, 168, 9, 9)),
        ];
        let hops = next_hops(&routes, 0, &addresses);
        assert_eq!(hops, vec![Some(0), Some(1), Some(1), None, None, None]);
    }

    #[test]
    fn lookup_prefers_longest_prefix() {
        let routes = parse_routes(
            r#"[{"dst":"default","gateway":"10.0.0.9"},
                {"dst":"10.0.0.0/16","gateway":"10.0.0.8"},
                {"dst":"10.0.0.0/24","dev":"eth1"}]"#,
        )
        .unwrap();
        assert_eq!(lookup(&routes, Ipv4Addr::new(10, 0, 0, 5)).unwrap().dst, "10.0.0.0/24");
        assert_eq!(lookup(&routes, Ipv4Addr::new(10, 0, 7, 5)).unwrap().dst, "10.0.0.0/16");
        assert_eq!(lookup(&routes, Ipv4Addr::new(8, 8, 8, 8)).unwrap().dst, "default");
        assert!(parse_routes("not json").is_err());
    }
}
