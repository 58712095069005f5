use crate::config::MobilityConfig;
use crate::loss::LossModel;
use crate::node::{Connectivity, Node};
use crate::topology::Topology;
use crate::{Error, Result};
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// An externally supplied absolute position for one node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: usize,
    pub x: f64,
    pub y: f64,
}

/// Seeded random-walk mobility over a square plane `[0, plane_max]²`.
///
/// Each node keeps its movement vector across ticks; when a step would leave
/// the plane on an axis, that axis' component is inverted before moving.
#[derive(Debug)]
pub struct Mobility {
    cfg: MobilityConfig,
    rng: StdRng,
}

impl Mobility {
    pub fn new(cfg: MobilityConfig, seed: u64) -> Self {
        Self {
            cfg,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &MobilityConfig {
        &self.cfg
    }

    /// Default grid coordinate for a freshly discovered node.
    pub fn grid_position(&self, id: usize) -> (f64, f64) {
        let width = self.cfg.grid_width.max(1);
        (
            (id % width) as f64 * self.cfg.spacing,
            (id / width) as f64 * self.cfg.spacing,
        )
    }

    /// Places nodes on the grid and draws their initial movement vectors.
    pub fn seed_nodes(&mut self, nodes: &mut [Node]) {
        for node in nodes.iter_mut() {
            let (x, y) = self.grid_position(node.id);
            node.x = x;
            node.y = y;
            node.direction = [
                rand_signed(&mut self.rng, self.cfg.max_speed),
                rand_signed(&mut self.rng, self.cfg.max_speed),
            ];
        }
    }

    /// Advances every node by its movement vector.
    pub fn step(&self, nodes: &mut [Node]) {
        for node in nodes.iter_mut() {
            advance(node, self.cfg.plane_max);
        }
    }
}

/// Moves one node, bouncing off the plane edges. Returns whether any
/// component was inverted.
pub fn advance(node: &mut Node, plane_max: f64) -> bool {
    let (x, bx) = bounce_axis(node.x, &mut node.direction[0], plane_max);
    let (y, by) = bounce_axis(node.y, &mut node.direction[1], plane_max);
    node.x = x;
    node.y = y;
    bx || by
}

fn bounce_axis(pos: f64, dir: &mut f64, plane_max: f64) -> (f64, bool) {
    let mut bounced = false;
    let next = pos + *dir;
    if next < 0.0 || next > plane_max {
        *dir = -*dir;
        bounced = true;
    }
    // Clamp only matters for planes narrower than one step.
    ((pos + *dir).clamp(0.0, plane_max), bounced)
}

/// Sets absolute positions without touching movement vectors. The whole
/// batch is rejected before any node moves if one entry is invalid.
pub fn apply_placements(nodes: &mut [Node], placements: &[Placement]) -> Result<()> {
    if let Some(bad) = placements.iter().find(|p| p.id >= nodes.len()) {
        return Err(Error::UnknownNode(bad.id));
    }
    // Non-finite coordinates would be written as `null` and break the snapshot.
    if let Some(bad) = placements.iter().find(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(Error::InvalidPlacement {
            id: bad.id,
            x: bad.x,
            y: bad.y,
        });
    }
    for p in placements {
        let node = &mut nodes[p.id];
        node.x = p.x;
        node.y = p.y;
    }
    Ok(())
}

/// Recomputes the upper-triangular distance and connectivity data of every
/// node and returns the resulting loss matrix.
pub fn recompute_links(nodes: &mut [Node], model: &dyn LossModel) -> Topology {
    let n = nodes.len();
    let mut topology = Topology::new(n);
    for i in 0..n {
        let mut distance = std::collections::BTreeMap::new();
        let mut connectivity = Vec::with_capacity(n - i - 1);
        for j in (i + 1)..n {
            let d = nodes[i].distance_to(&nodes[j]);
            let loss = model.loss_at(d);
            topology.set(i, j, loss);
            distance.insert(j, d);
            connectivity.push(Connectivity {
                id: j,
                container_id: nodes[j].container_id.clone(),
                loss,
            });
        }
        nodes[i].distance = distance;
        nodes[i].connectivity = connectivity;
    }
    topology
}

/// Rebuilds the loss matrix from persisted connectivity entries.
pub fn topology_from_nodes(nodes: &[Node]) -> Topology {
    let mut topology = Topology::new(nodes.len());
    for node in nodes {
        for link in &node.connectivity {
            topology.set(node.id, link.id, link.loss);
        }
    }
    topology
}

fn rand_signed(rng: &mut StdRng, max_step: f64) -> f64 {
    if max_step <= 0.0 {
        return 0.0;
    }
    let mag = rng.random::<f64>() * max_step;
    if rng.random::<bool>() { mag } else { -mag }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::StepLossTable;

    fn nodes(n: usize) -> Vec<Node> {
        (0..n).map(|i| Node::new(i, format!("r{i}"), None)).collect()
    }

    #[test]
    fn grid_placement() {
        let m = Mobility::new(MobilityConfig::default(), 1);
        assert_eq!(m.grid_position(0), (0.0, 0.0));
        assert_eq!(m.grid_position(4), (400.0, 0.0));
        assert_eq!(m.grid_position(7), (200.0, 100.0));
    }

    #[test]
    fn seeding_is_deterministic_for_seed() {
        let mut a = nodes(6);
        let mut b = nodes(6);
        Mobility::new(MobilityConfig::default(), 42).seed_nodes(&mut a);
        Mobility::new(MobilityConfig::default(), 42).seed_nodes(&mut b);
        assert_eq!(a, b);
        for node in &a {
            assert!(node.direction.iter().all(|d| d.abs() <= 100.0));
        }
    }

    #[test]
    fn bounce_inverts_component_and_stays_in_plane() {
        let mut node = Node::new(0, "r0", None);
        node.x = 950.0;
        node.y = 500.0;
        node.direction = [80.0, -20.0];

        assert!(advance(&mut node, 1000.0));
        assert_eq!(node.direction, [-80.0, -20.0]);
        assert_eq!((node.x, node.y), (870.0, 480.0));

        node.x = 10.0;
        node.direction = [-30.0, 0.0];
        assert!(advance(&mut node, 1000.0));
        assert_eq!(node.direction[0], 30.0);
        assert_eq!(node.x, 40.0);
    }

    #[test]
    fn no_bounce_inside_plane() {
        let mut node = Node::new(0, "r0", None);
        node.x = 100.0;
        node.y = 100.0;
        node.direction = [50.0, 50.0];
        assert!(!advance(&mut node, 1000.0));
        assert_eq!(node.position(), (150.0, 150.0));
    }

    #[test]
    fn narrow_plane_clamps() {
        let mut node = Node::new(0, "r0", None);
        node.x = 5.0;
        node.direction = [100.0, 0.0];
        advance(&mut node, 10.0);
        assert!((0.0..=10.0).contains(&node.x));
    }

    #[test]
    fn random_walk_stays_in_plane() {
        let cfg = MobilityConfig {
            plane_max: 300.0,
            ..Default::default()
        };
        let mut m = Mobility::new(cfg, 7);
        let mut ns = nodes(9);
        m.seed_nodes(&mut ns);
        for _ in 0..200 {
            m.step(&mut ns);
            for node in &ns {
                assert!((0.0..=300.0).contains(&node.x), "x={}", node.x);
                assert!((0.0..=300.0).contains(&node.y), "y={}", node.y);
            }
        }
    }

    #[test]
    fn links_are_upper_triangular() {
        let mut ns = nodes(3);
        apply_placements(
            &mut ns,
            &[
                Placement { id: 0, x: 0.0, y: 0.0 },
                Placement { id: 1, x: 150.0, y: 0.0 },
                Placement { id: 2, x: 0.0, y: 500.0 },
            ],
        )
        .unwrap();
        let topo = recompute_links(&mut ns, &StepLossTable::default());

        assert_eq!(ns[0].distance.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ns[1].distance.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert!(ns[2].distance.is_empty());
        assert!(ns[2].connectivity.is_empty());
        assert_eq!(ns[0].connectivity[0].loss, 20);
        assert_eq!(ns[0].connectivity[1].loss, 100);
        assert_eq!(ns[0].connectivity[1].container_id, "r2");
        assert_eq!(topo.get(1, 0), 20);
        assert_eq!(topo.get(2, 0), 100);
        assert_eq!(topology_from_nodes(&ns), topo);
    }

    #[test]
    fn placement_rejects_non_finite_coordinates() {
        let mut ns = nodes(2);
        let err = apply_placements(
            &mut ns,
            &[
                Placement { id: 0, x: 5.0, y: 5.0 },
                Placement { id: 1, x: f64::NAN, y: 0.0 },
            ],
        );
        assert!(matches!(err, Err(Error::InvalidPlacement { id: 1, .. })));
        assert_eq!(ns[0].position(), (0.0, 0.0));

        let err = apply_placements(&mut ns, &[Placement { id: 0, x: 1.0, y: f64::INFINITY }]);
        assert!(matches!(err, Err(Error::InvalidPlacement { id: 0, .. })));
    }

    #[test]
    fn placement_rejects_unknown_id() {
        let mut ns = nodes(2);
        let err = apply_placements(&mut ns, &[Placement { id: 5, x: 1.0, y: 1.0 }]);
        assert!(matches!(err, Err(Error::UnknownNode(5))));
    }
}
