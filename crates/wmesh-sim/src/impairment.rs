//! Per-node `tc` script synthesis.
//!
//! Each node shapes two directions with the same class scheme: egress on the
//! wireless device, and ingress mirrored onto an IFB device. Under the HTB
//! root `1:` there is a default class `1:1` and, for every peer `p`, a class
//! `1:1{p}` carrying a netem leaf with handle `1{p}:`.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::node::{format_mac, link_local_ipv6, synthetic_mac};

/// Which direction(s) per-peer classification filters are installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum FilterDirection {
    Egress,
    Ingress,
    Both,
}

/// Header field used to classify a peer's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum FilterAddress {
    Ether,
    Ip,
    Ip6,
}

/// Devices and rates used when shaping one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSet {
    pub device: String,
    pub ifb: String,
    pub rate: String,
    pub delay_ms: u32,
}

/// A peer as seen from the node being shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub id: usize,
    pub ipv4: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdiscMode {
    Add,
    Replace,
}

/// Netem parameters for one peer leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetemParams {
    pub delay_ms: u32,
    pub loss_percent: u8,
}

/// One `tc`/`ip` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcOp {
    AddIfb { dev: String },
    LinkUp { dev: String },
    DeleteRoot { dev: String },
    DeleteIngress { dev: String },
    AddIngress { dev: String },
    MirrorIngress { dev: String, to: String },
    AddHtbRoot { dev: String },
    AddHtbClass { dev: String, classid: String, rate: String },
    Netem {
        dev: String,
        peer: usize,
        mode: QdiscMode,
        params: NetemParams,
    },
    U32Filter {
        dev: String,
        peer: usize,
        address: FilterAddress,
        field: MatchField,
        value: String,
    },
}

/// Whether a filter matches the peer as packet source or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchField {
    Src,
    Dst,
}

pub fn class_id(peer: usize) -> String {
    format!("1:1{}", peer)
}

pub fn netem_handle(peer: usize) -> String {
    format!("1{}:", peer)
}

fn append_netem_params(params: &NetemParams, args: &mut Vec<String>) {
    args.push("delay".into());
    args.push(format!("{}ms", params.delay_ms));
    args.push("loss".into());
    args.push(format!("{}%", params.loss_percent.min(100)));
}

impl TcOp {
    /// Ops whose failure is expected on a clean device (nothing to delete,
    /// IFB already present).
    pub fn tolerates_failure(&self) -> bool {
        matches!(
            self,
            TcOp::AddIfb { .. } | TcOp::DeleteRoot { .. } | TcOp::DeleteIngress { .. }
        )
    }

    pub fn args(&self) -> Vec<String> {
        let s = |v: &str| v.to_string();
        match self {
            TcOp::AddIfb { dev } => vec![s("ip"), s("link"), s("add"), dev.clone(), s("type"), s("ifb")],
            TcOp::LinkUp { dev } => vec![s("ip"), s("link"), s("set"), s("dev"), dev.clone(), s("up")],
            TcOp::DeleteRoot { dev } => vec![s("tc"), s("qdisc"), s("del"), s("dev"), dev.clone(), s("root")],
            TcOp::DeleteIngress { dev } => {
                vec![s("tc"), s("qdisc"), s("del"), s("dev"), dev.clone(), s("ingress")]
            }
            TcOp::AddIngress { dev } => vec![
                s("tc"),
                s("qdisc"),
                s("add"),
                s("dev"),
                dev.clone(),
                s("handle"),
                s("ffff:"),
                s("ingress"),
            ],
            TcOp::MirrorIngress { dev, to } => vec![
                s("tc"),
                s("filter"),
                s("add"),
                s("dev"),
                dev.clone(),
                s("parent"),
                s("ffff:"),
                s("protocol"),
                s("all"),
                s("u32"),
                s("match"),
                s("u32"),
                s("0"),
                s("0"),
                s("action"),
                s("mirred"),
                s("egress"),
                s("redirect"),
                s("dev"),
                to.clone(),
            ],
            TcOp::AddHtbRoot { dev } => vec![
                s("tc"),
                s("qdisc"),
                s("add"),
                s("dev"),
                dev.clone(),
                s("root"),
                s("handle"),
                s("1:"),
                s("htb"),
                s("default"),
                s("1"),
            ],
            TcOp::AddHtbClass { dev, classid, rate } => vec![
                s("tc"),
                s("class"),
                s("add"),
                s("dev"),
                dev.clone(),
                s("parent"),
                s("1:"),
                s("classid"),
                classid.clone(),
                s("htb"),
                s("rate"),
                rate.clone(),
            ],
            TcOp::Netem {
                dev,
                peer,
                mode,
                params,
            } => {
                let verb = match mode {
                    QdiscMode::Add => "add",
                    QdiscMode::Replace => "replace",
                };
                let mut args = vec![
                    s("tc"),
                    s("qdisc"),
                    s(verb),
                    s("dev"),
                    dev.clone(),
                    s("parent"),
                    class_id(*peer),
                    s("handle"),
                    netem_handle(*peer),
                    s("netem"),
                ];
                append_netem_params(params, &mut args);
                args
            }
            TcOp::U32Filter {
                dev,
                peer,
                address,
                field,
                value,
            } => {
                let (protocol, prio, kind) = match address {
                    FilterAddress::Ip => ("ip", "1", "ip"),
                    FilterAddress::Ip6 => ("ipv6", "2", "ip6"),
                    FilterAddress::Ether => ("all", "3", "ether"),
                };
                let field = match field {
                    MatchField::Src => "src",
                    MatchField::Dst => "dst",
                };
                vec![
                    s("tc"),
                    s("filter"),
                    s("add"),
                    s("dev"),
                    dev.clone(),
                    s("parent"),
                    s("1:"),
                    s("protocol"),
                    s(protocol),
                    s("prio"),
                    s(prio),
                    s("u32"),
                    s("match"),
                    s(kind),
                    s(field),
                    value.clone(),
                    s("flowid"),
                    class_id(*peer),
                ]
            }
        }
    }

    pub fn render(&self) -> String {
        let line = self.args().join(" ");
        if self.tolerates_failure() {
            format!("{} 2>/dev/null || true", line)
        } else {
            line
        }
    }
}

/// An ordered batch of ops executed as one shell invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcScript {
    pub ops: Vec<TcOp>,
}

impl TcScript {
    pub fn new(ops: Vec<TcOp>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Script text; aborts on the first unexpected failure.
    pub fn render(&self) -> String {
        let mut lines = vec!["set -e".to_string()];
        lines.extend(self.ops.iter().map(TcOp::render));
        lines.join("\n")
    }

    /// `sh -c <script>` argv for the container runtime.
    pub fn command(&self) -> Vec<String> {
        vec!["sh".into(), "-c".into(), self.render()]
    }
}

/// Full reset of both directions: old qdiscs are removed before the HTB
/// hierarchy and a 0% netem leaf per peer are installed, so running it twice
/// ends in the same state as running it once.
pub fn init_script(devices: &DeviceSet, peers: &[Peer]) -> TcScript {
    let dev = &devices.device;
    let ifb = &devices.ifb;
    let mut ops = vec![
        TcOp::AddIfb { dev: ifb.clone() },
        TcOp::LinkUp { dev: ifb.clone() },
        TcOp::DeleteRoot { dev: dev.clone() },
        TcOp::DeleteIngress { dev: dev.clone() },
        TcOp::DeleteRoot { dev: ifb.clone() },
        TcOp::AddIngress { dev: dev.clone() },
        TcOp::MirrorIngress {
            dev: dev.clone(),
            to: ifb.clone(),
        },
    ];
    for target in [dev, ifb] {
        ops.push(TcOp::AddHtbRoot {
            dev: target.clone(),
        });
        ops.push(TcOp::AddHtbClass {
            dev: target.clone(),
            classid: "1:1".into(),
            rate: devices.rate.clone(),
        });
        for peer in peers {
            ops.push(TcOp::AddHtbClass {
                dev: target.clone(),
                classid: class_id(peer.id),
                rate: devices.rate.clone(),
            });
            ops.push(TcOp::Netem {
                dev: target.clone(),
                peer: peer.id,
                mode: QdiscMode::Add,
                params: NetemParams {
                    delay_ms: 0,
                    loss_percent: 0,
                },
            });
        }
    }
    TcScript::new(ops)
}

/// In-place netem updates for the current loss towards each peer, on both
/// the egress and the IFB device.
pub fn loss_update_script(devices: &DeviceSet, losses: &[(usize, u8)]) -> TcScript {
    let mut ops = Vec::with_capacity(losses.len() * 2);
    for target in [&devices.device, &devices.ifb] {
        for &(peer, loss) in losses {
            ops.push(TcOp::Netem {
                dev: target.clone(),
                peer,
                mode: QdiscMode::Replace,
                params: NetemParams {
                    delay_ms: devices.delay_ms,
                    loss_percent: loss,
                },
            });
        }
    }
    TcScript::new(ops)
}

fn peer_value(peer: &Peer, address: FilterAddress) -> Option<String> {
    let ip = peer.ipv4?;
    Some(match address {
        FilterAddress::Ip => format!("{}/32", ip),
        FilterAddress::Ip6 => format!("{}/128", link_local_ipv6(synthetic_mac(ip))),
        FilterAddress::Ether => format_mac(synthetic_mac(ip)),
    })
}

/// u32 classifiers steering each peer's traffic into its class. Egress
/// matches the peer as destination, ingress (on the IFB) as source. Peers
/// without a known address are skipped.
pub fn filter_script(
    devices: &DeviceSet,
    peers: &[Peer],
    direction: FilterDirection,
    address: FilterAddress,
) -> TcScript {
    let mut targets = Vec::new();
    if matches!(direction, FilterDirection::Egress | FilterDirection::Both) {
        targets.push((&devices.device, MatchField::Dst));
    }
    if matches!(direction, FilterDirection::Ingress | FilterDirection::Both) {
        targets.push((&devices.ifb, MatchField::Src));
    }

    let mut ops = Vec::new();
    for (dev, field) in targets {
        for peer in peers {
            let Some(value) = peer_value(peer, address) else {
                continue;
            };
            ops.push(TcOp::U32Filter {
                dev: dev.clone(),
                peer: peer.id,
                address,
                field,
                value,
            });
        }
    }
    TcScript::new(ops)
}
