//! Per-node state persisted in the snapshot file.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Direct loss towards one higher-id peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connectivity {
    pub id: usize,
    pub container_id: String,
    pub loss: u8,
}

/// One emulated wireless endpoint, backed by one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: usize,
    pub x: f64,
    pub y: f64,
    /// Movement vector `[dx, dy]` applied on every mobility tick.
    pub direction: [f64; 2],
    /// Logical container name.
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_id: Option<String>,
    pub ipaddress: Option<Ipv4Addr>,
    /// Distance to every peer with a higher id.
    #[serde(default)]
    pub distance: BTreeMap<usize, f64>,
    /// Direct loss to every peer with a higher id, ordered by peer id.
    #[serde(default)]
    pub connectivity: Vec<Connectivity>,
}

impl Node {
    pub fn new(id: usize, container_id: impl Into<String>, ipaddress: Option<Ipv4Addr>) -> Self {
        Self {
            id,
            x: 0.0,
            y: 0.0,
            direction: [0.0, 0.0],
            container_id: container_id.into(),
            docker_id: None,
            ipaddress,
            distance: BTreeMap::new(),
            connectivity: Vec::new(),
        }
    }

    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    pub fn distance_to(&self, other: &Node) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Short form of the runtime id, as printed by `docker ps`.
    pub fn docker_short_id(&self) -> Option<&str> {
        self.docker_id
            .as_deref()
            .map(|id| if id.len() > 12 { &id[..12] } else { id })
    }

    /// Synthetic MAC derived from the IPv4 address, if one is known.
    pub fn mac(&self) -> Option<String> {
        self.ipaddress.map(|ip| format_mac(synthetic_mac(ip)))
    }

    /// Link-local IPv6 address derived from the synthetic MAC.
    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        self.ipaddress.map(|ip| link_local_ipv6(synthetic_mac(ip)))
    }
}

/// Container runtime MAC convention: `02:42` followed by the IPv4 octets.
pub fn synthetic_mac(ip: Ipv4Addr) -> [u8; 6] {
    let [a, b, c, d] = ip.octets();
    [0x02, 0x42, a, b, c, d]
}

pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// `fe80::/64` address with a modified EUI-64 interface id.
pub fn link_local_ipv6(mac: [u8; 6]) -> Ipv6Addr {
    let seg = |hi: u8, lo: u8| ((hi as u16) << 8) | lo as u16;
    Ipv6Addr::new(
        0xfe80,
        0,
        0,
        0,
        seg(mac[0] ^ 0x02, mac[1]),
        seg(mac[2], 0xff),
        seg(0xfe, mac[3]),
        seg(mac[4], mac[5]),
    )
}
