//! The simulation aggregate: discovered routers, their mobile node state,
//! the direct loss matrix, and the fleet operations built on them.
//!
//! Mutations (`step`, `place`, `set_loss`) take `&mut self` and persist the
//! snapshot before returning, so one owner serialises every snapshot write.
//! Fleet operations take `&self` and fan out through the [`Applier`].

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::applier::{Applier, ApplyReport, MeasuredRoute, NodeJob, NodeOutcome};
use crate::config::SimConfig;
use crate::discovery::{self, Router};
use crate::impairment::{self, DeviceSet, FilterAddress, FilterDirection, Peer};
use crate::loss::LossModel;
use crate::node::Node;
use crate::route::{self, RouteInfo};
use crate::runtime::ContainerRuntime;
use crate::scenario::{self, Mobility, Placement};
use crate::snapshot::{self, NodeInfo};
use crate::topology::Topology;
use crate::{Error, Result};

pub struct Simulation {
    config: SimConfig,
    routers: Vec<Router>,
    nodes: Vec<Node>,
    topology: Topology,
    loss_model: Box<dyn LossModel>,
    mobility: Mobility,
    applier: Applier,
}

impl Simulation {
    /// Discovers routers and resumes from the snapshot (or seeds a fresh one)
    /// using the configured step loss table.
    pub async fn new(config: SimConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let loss_model = Box::new(config.loss.clone());
        Self::with_loss_model(config, runtime, loss_model).await
    }

    pub async fn with_loss_model(
        config: SimConfig,
        runtime: Arc<dyn ContainerRuntime>,
        loss_model: Box<dyn LossModel>,
    ) -> Result<Self> {
        let routers = discovery::discover(runtime.as_ref(), &config.discovery).await?;
        Self::from_routers(config, runtime, routers, loss_model)
    }

    /// Builds the simulation over an already discovered router list.
    pub fn from_routers(
        config: SimConfig,
        runtime: Arc<dyn ContainerRuntime>,
        routers: Vec<Router>,
        loss_model: Box<dyn LossModel>,
    ) -> Result<Self> {
        let seed = config.seed.unwrap_or_else(rand::random);
        let mut mobility = Mobility::new(config.mobility.clone(), seed);
        let applier = Applier::new(runtime, &config.applier);

        let persisted = if config.override_snapshot {
            None
        } else {
            snapshot::load(&config.snapshot_path)?
        };

        let fresh = persisted.is_none();
        let (nodes, topology) = match persisted {
            Some(info) => {
                if info.node_count != routers.len() {
                    return Err(Error::SnapshotMismatch {
                        persisted: info.node_count,
                        discovered: routers.len(),
                    });
                }
                let mut nodes = info.node_info;
                for (node, router) in nodes.iter_mut().zip(&routers) {
                    node.container_id = router.name.clone();
                    node.docker_id = Some(router.docker_id.clone());
                    node.ipaddress = router.ipv4;
                    for link in &mut node.connectivity {
                        if let Some(peer) = routers.get(link.id) {
                            link.container_id = peer.name.clone();
                        }
                    }
                }
                let topology = scenario::topology_from_nodes(&nodes);
                tracing::info!(
                    path = %config.snapshot_path.display(),
                    nodes = nodes.len(),
                    "resumed from snapshot"
                );
                (nodes, topology)
            }
            None => {
                let mut nodes: Vec<Node> = routers
                    .iter()
                    .map(|r| {
                        let mut node = Node::new(r.id, r.name.clone(), r.ipv4);
                        node.docker_id = Some(r.docker_id.clone());
                        node
                    })
                    .collect();
                mobility.seed_nodes(&mut nodes);
                let topology = scenario::recompute_links(&mut nodes, loss_model.as_ref());
                tracing::info!(nodes = nodes.len(), seed, "seeded fresh node layout");
                (nodes, topology)
            }
        };

        let sim = Self {
            config,
            routers,
            nodes,
            topology,
            loss_model,
            mobility,
            applier,
        };
        if fresh {
            sim.persist()?;
        }
        Ok(sim)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn routers(&self) -> &[Router] {
        &self.routers
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn applier(&self) -> &Applier {
        &self.applier
    }

    /// The persisted structure for the current state.
    pub fn node_info(&self) -> NodeInfo {
        NodeInfo::new(self.nodes.clone())
    }

    pub fn persist(&self) -> Result<()> {
        snapshot::save(&self.config.snapshot_path, &self.node_info())
    }

    fn addresses(&self) -> Vec<Option<Ipv4Addr>> {
        self.routers.iter().map(|r| r.ipv4).collect()
    }

    fn relink(&mut self) {
        self.topology = scenario::recompute_links(&mut self.nodes, self.loss_model.as_ref());
    }

    /// One mobility tick: move, recompute distances and loss, persist.
    pub fn step(&mut self) -> Result<()> {
        self.mobility.step(&mut self.nodes);
        self.relink();
        self.persist()
    }

    pub fn move_nodes(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.step()?;
        }
        Ok(())
    }

    /// Absolute placement; movement vectors are left untouched.
    pub fn place(&mut self, placements: &[Placement]) -> Result<()> {
        scenario::apply_placements(&mut self.nodes, placements)?;
        self.relink();
        self.persist()
    }

    /// Overrides the direct loss between two nodes until the next
    /// recomputation.
    pub fn set_loss(&mut self, a: usize, b: usize, loss: u8) -> Result<()> {
        let n = self.nodes.len();
        if let Some(&bad) = [a, b].iter().find(|&&id| id >= n) {
            return Err(Error::UnknownNode(bad));
        }
        if a == b {
            return Ok(());
        }
        let (lo, hi) = (a.min(b), a.max(b));
        let loss = loss.min(100);
        self.topology.set(lo, hi, loss);
        if let Some(link) = self.nodes[lo].connectivity.iter_mut().find(|l| l.id == hi) {
            link.loss = loss;
        }
        tracing::info!(a = lo, b = hi, loss, "loss override");
        self.persist()
    }

    fn devices(&self, router: &Router) -> DeviceSet {
        let shaping = &self.config.shaping;
        DeviceSet {
            device: router.device(shaping.device.as_deref()),
            ifb: shaping.ifb_device.clone(),
            rate: shaping.rate.clone(),
            delay_ms: shaping.delay_ms,
        }
    }

    fn peers_of(&self, id: usize) -> Vec<Peer> {
        self.routers
            .iter()
            .filter(|r| r.id != id)
            .map(|r| Peer {
                id: r.id,
                ipv4: r.ipv4,
            })
            .collect()
    }

    /// Resets both shaping directions on every node.
    pub async fn init_tc(&self) -> ApplyReport {
        let scripts = self
            .routers
            .iter()
            .map(|r| {
                let script = impairment::init_script(&self.devices(r), &self.peers_of(r.id));
                (r.id, r.docker_id.clone(), script)
            })
            .collect();
        self.applier.apply_scripts(scripts).await
    }

    /// Resets shaping fleet-wide, then pushes the current loss to every node
    /// whose reset succeeded. A node failing its reset is reported with that
    /// error and skipped by the update; the others still converge.
    pub async fn initialize(&self) -> ApplyReport {
        let init = self.init_tc().await;
        let ready = init.succeeded();
        let update = self.update_loss_for(&ready).await;

        let mut outcomes: Vec<NodeOutcome> = init
            .outcomes
            .into_iter()
            .filter(|o| o.result.is_err())
            .chain(update.outcomes)
            .collect();
        outcomes.sort_by_key(|o| o.node);
        ApplyReport { outcomes }
    }

    /// Pushes the current direct loss row of every node into its netem leaves.
    pub async fn update_loss_on_containers(&self) -> ApplyReport {
        let all: Vec<usize> = self.routers.iter().map(|r| r.id).collect();
        self.update_loss_for(&all).await
    }

    /// Loss update restricted to `nodes`.
    pub async fn update_loss_for(&self, nodes: &[usize]) -> ApplyReport {
        let scripts = self
            .routers
            .iter()
            .filter(|r| nodes.contains(&r.id))
            .map(|r| {
                let losses: Vec<(usize, u8)> = self
                    .peers_of(r.id)
                    .iter()
                    .map(|p| (p.id, self.topology.get(r.id, p.id)))
                    .collect();
                let script = impairment::loss_update_script(&self.devices(r), &losses);
                (r.id, r.docker_id.clone(), script)
            })
            .collect();
        self.applier.apply_scripts(scripts).await
    }

    /// Installs per-peer classification filters.
    pub async fn add_filter(
        &self,
        direction: FilterDirection,
        address: FilterAddress,
    ) -> ApplyReport {
        let scripts = self
            .routers
            .iter()
            .map(|r| {
                let script = impairment::filter_script(
                    &self.devices(r),
                    &self.peers_of(r.id),
                    direction,
                    address,
                );
                (r.id, r.docker_id.clone(), script)
            })
            .collect();
        self.applier.apply_scripts(scripts).await
    }

    /// Reads every node's routing table and composes end-to-end loss for
    /// every ordered pair. Unreadable tables count as "no next hop" for that
    /// node; a routing cycle fails the whole pass.
    pub async fn resolve_routes(&self) -> Result<RouteInfo> {
        let addresses = self.addresses();
        let jobs = self
            .routers
            .iter()
            .map(|r| NodeJob {
                node: r.id,
                container: r.docker_id.clone(),
                cmd: vec!["ip".into(), "-j".into(), "route".into()],
            })
            .collect();

        let n = self.routers.len();
        let mut nexthops = vec![vec![None; n]; n];
        let mut query_failures = Vec::new();

        for (job, result) in self.applier.run_all(jobs).await {
            let parsed = result.and_then(|out| {
                if !out.is_success() {
                    return Err(Error::RouteQuery {
                        node: job.node,
                        reason: format!("exit {:?}: {}", out.exit_code, out.stderr.trim()),
                    });
                }
                route::parse_routes(&out.stdout).map_err(|e| Error::RouteQuery {
                    node: job.node,
                    reason: e.to_string(),
                })
            });
            match parsed {
                Ok(routes) => {
                    nexthops[job.node] = route::next_hops(&routes, job.node, &addresses);
                }
                Err(e) => {
                    tracing::warn!(node = job.node, error = %e, "route query failed");
                    nexthops[job.node][job.node] = Some(job.node);
                    query_failures.push(e);
                }
            }
        }

        let routes = route::compose_all(&nexthops, &self.topology)?;
        Ok(RouteInfo {
            routes,
            query_failures,
        })
    }

    /// Measures the live route and loss from `src` to `dst` with `ping -R`.
    pub async fn measure_route(&self, src: usize, dst: usize, count: u32) -> Result<MeasuredRoute> {
        let src_router = self.routers.get(src).ok_or(Error::UnknownNode(src))?;
        let dst_router = self.routers.get(dst).ok_or(Error::UnknownNode(dst))?;
        let dst_ip = dst_router.ipv4.ok_or_else(|| Error::Discovery {
            node: dst_router.name.clone(),
            reason: "no wireless address to ping".into(),
        })?;
        self.applier
            .measure_route(&src_router.docker_id, dst_ip, count, &self.addresses())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::StepLossTable;
    use crate::test_util::ScriptedRuntime;

    fn routers(n: usize) -> Vec<Router> {
        (0..n)
            .map(|i| Router {
                id: i,
                name: format!("node-{i}"),
                docker_id: format!("r{i}"),
                ipv4: Some(Ipv4Addr::new(10, 0, 0, i as u8 + 1)),
                interface_index: Some(1),
            })
            .collect()
    }

    fn config(dir: &tempfile::TempDir) -> SimConfig {
        SimConfig {
            snapshot_path: dir.path().join("node_info.json"),
            seed: Some(3),
            ..Default::default()
        }
    }

    fn build(dir: &tempfile::TempDir, n: usize) -> (Simulation, Arc<ScriptedRuntime>) {
        let runtime = Arc::new(ScriptedRuntime::new());
        let sim = Simulation::from_routers(
            config(dir),
            runtime.clone(),
            routers(n),
            Box::new(StepLossTable::default()),
        )
        .unwrap();
        (sim, runtime)
    }

    #[test]
    fn fresh_simulation_persists_grid_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, _) = build(&dir, 6);
        assert_eq!(sim.nodes()[5].position(), (0.0, 100.0));
        assert_eq!(sim.topology().get(0, 1), 0);
        assert_eq!(sim.topology().get(0, 2), 20);

        let on_disk = snapshot::load(&dir.path().join("node_info.json"))
            .unwrap()
            .unwrap();
        assert_eq!(on_disk, sim.node_info());
    }

    #[test]
    fn restart_resumes_trajectory() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sim, _) = build(&dir, 4);
        sim.move_nodes(3).unwrap();
        let moved = sim.nodes().to_vec();

        let (resumed, _) = build(&dir, 4);
        assert_eq!(resumed.nodes(), moved.as_slice());
        assert_eq!(resumed.topology(), sim.topology());
    }

    #[test]
    fn override_reseeds_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sim, _) = build(&dir, 3);
        sim.place(&[Placement { id: 0, x: 999.0, y: 999.0 }]).unwrap();

        let mut cfg = config(&dir);
        cfg.override_snapshot = true;
        let fresh = Simulation::from_routers(
            cfg,
            Arc::new(ScriptedRuntime::new()),
            routers(3),
            Box::new(StepLossTable::default()),
        )
        .unwrap();
        assert_eq!(fresh.nodes()[0].position(), (0.0, 0.0));
    }

    #[test]
    fn snapshot_size_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        build(&dir, 3);
        let err = Simulation::from_routers(
            config(&dir),
            Arc::new(ScriptedRuntime::new()),
            routers(4),
            Box::new(StepLossTable::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            Error::SnapshotMismatch {
                persisted: 3,
                discovered: 4
            }
        ));
    }

    #[test]
    fn non_finite_placement_keeps_snapshot_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sim, _) = build(&dir, 2);
        let before = sim.node_info();
        let err = sim.place(&[Placement { id: 0, x: f64::NAN, y: 0.0 }]);
        assert!(matches!(err, Err(Error::InvalidPlacement { id: 0, .. })));
        assert_eq!(sim.node_info(), before);

        let (resumed, _) = build(&dir, 2);
        assert_eq!(resumed.node_info(), before);
    }

    #[test]
    fn manual_placement_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sim, _) = build(&dir, 3);
        let placements = [
            Placement { id: 0, x: 10.0, y: 10.0 },
            Placement { id: 1, x: 260.0, y: 10.0 },
            Placement { id: 2, x: 10.0, y: 390.0 },
        ];
        let directions: Vec<_> = sim.nodes().iter().map(|n| n.direction).collect();

        sim.place(&placements).unwrap();
        let first = (sim.topology().clone(), sim.node_info());
        sim.place(&placements).unwrap();
        let second = (sim.topology().clone(), sim.node_info());

        assert_eq!(first, second);
        assert_eq!(sim.topology().get(0, 1), 40);
        assert_eq!(sim.topology().get(0, 2), 60);
        let after: Vec<_> = sim.nodes().iter().map(|n| n.direction).collect();
        assert_eq!(directions, after);
    }

    #[test]
    fn placement_matches_tick_for_same_coordinates() {
        let dir_a = tempfile::tempdir().unwrap();
        let (mut ticked, _) = build(&dir_a, 5);
        ticked.step().unwrap();
        let positions: Vec<Placement> = ticked
            .nodes()
            .iter()
            .map(|n| Placement {
                id: n.id,
                x: n.x,
                y: n.y,
            })
            .collect();

        let dir_b = tempfile::tempdir().unwrap();
        let (mut placed, _) = build(&dir_b, 5);
        placed.place(&positions).unwrap();

        // Vectors differ where the tick bounced; link data must not.
        assert_eq!(placed.topology(), ticked.topology());
        for (p, t) in placed.nodes().iter().zip(ticked.nodes()) {
            assert_eq!(p.position(), t.position());
            assert_eq!(p.distance, t.distance);
            assert_eq!(p.connectivity, t.connectivity);
        }
    }

    #[test]
    fn loss_override_updates_matrix_and_connectivity() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sim, _) = build(&dir, 3);
        sim.set_loss(2, 0, 75).unwrap();
        assert_eq!(sim.topology().get(0, 2), 75);
        let link = sim.nodes()[0]
            .connectivity
            .iter()
            .find(|l| l.id == 2)
            .unwrap();
        assert_eq!(link.loss, 75);
        assert!(matches!(sim.set_loss(0, 9, 10), Err(Error::UnknownNode(9))));

        let (resumed, _) = build(&dir, 3);
        assert_eq!(resumed.topology().get(2, 0), 75);
    }

    #[tokio::test]
    async fn update_uses_direct_loss_row() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sim, runtime) = build(&dir, 3);
        sim.set_loss(0, 1, 30).unwrap();
        sim.set_loss(1, 2, 100).unwrap();

        let report = sim.update_loss_on_containers().await;
        assert!(report.is_success());

        let scripts = runtime.scripts_for("r1");
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("tc qdisc replace dev eth1 parent 1:10 handle 10: netem delay 0ms loss 30%"));
        assert!(scripts[0].contains("tc qdisc replace dev ifb0 parent 1:12 handle 12: netem delay 0ms loss 100%"));
        assert!(!scripts[0].contains("1:11 "));
    }
}
