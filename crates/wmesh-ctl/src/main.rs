//! wmesh-ctl
//!
//! Drives a wireless mesh emulation over a running container fleet:
//!
//! - Discovers wireless-router containers and seeds or resumes node positions
//! - Moves nodes (random walk or absolute placement) and recomputes link loss
//! - Pushes per-peer `tc` netem loss into every container
//! - Inspects composed route loss and measures live routes with `ping -R`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wmesh_sim::impairment::{FilterAddress, FilterDirection};
use wmesh_sim::scenario::Placement;
use wmesh_sim::{ApplyReport, DockerRuntime, Node, RouteOutcome, SimConfig, Simulation};

/// Wireless mesh link emulation controller.
#[derive(Parser, Debug)]
#[command(name = "wmesh-ctl", about = "Wireless mesh link emulation controller")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ignore an existing snapshot and re-seed node positions.
    #[arg(long, default_value_t = false)]
    override_snapshot: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reset traffic shaping on every node and apply the current loss.
    Init,
    /// Advance the random walk and push the new loss to every node.
    Move {
        /// Number of mobility ticks.
        #[arg(default_value_t = 1)]
        count: usize,
        /// Pause between ticks.
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
        /// Only update the snapshot, leave containers untouched.
        #[arg(long, default_value_t = false)]
        no_apply: bool,
    },
    /// Place nodes at absolute coordinates (`id,x,y`).
    Place {
        #[arg(required = true, value_parser = parse_placement)]
        placements: Vec<Placement>,
        #[arg(long, default_value_t = false)]
        no_apply: bool,
    },
    /// Override the direct loss between two nodes.
    SetLoss { a: usize, b: usize, loss: u8 },
    /// Install per-peer u32 classification filters.
    Filter {
        /// Direction to classify on (default from config).
        #[arg(long, value_enum)]
        direction: Option<FilterDirection>,
        /// Address kind to match (default from config).
        #[arg(long, value_enum)]
        address: Option<FilterAddress>,
    },
    /// Compose end-to-end loss along the live kernel routes.
    Routes {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Measure the route and loss between two nodes with `ping -R`.
    Ping {
        src: usize,
        dst: usize,
        #[arg(long, default_value_t = 5)]
        count: u32,
    },
    /// Print node positions and the direct loss matrix.
    Show,
}

fn parse_placement(raw: &str) -> Result<Placement, String> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    let [id, x, y] = parts.as_slice() else {
        return Err(format!("expected id,x,y, got {:?}", raw));
    };
    let coord = |name: &str, raw: &str| -> Result<f64, String> {
        let v: f64 = raw
            .parse()
            .map_err(|e| format!("bad {} {:?}: {}", name, raw, e))?;
        if v.is_finite() {
            Ok(v)
        } else {
            Err(format!("{} must be finite, got {:?}", name, raw))
        }
    };
    Ok(Placement {
        id: id.parse().map_err(|e| format!("bad id {:?}: {}", id, e))?,
        x: coord("x", x)?,
        y: coord("y", y)?,
    })
}

fn node_line(node: &Node) -> String {
    let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".into());
    format!(
        "node {:>3} {:<20} {:<12} ({:>7.1}, {:>7.1}) dir ({:>6.1}, {:>6.1}) {} {} {}",
        node.id,
        node.container_id,
        node.docker_short_id().unwrap_or("-"),
        node.x,
        node.y,
        node.direction[0],
        node.direction[1],
        or_dash(node.ipaddress.map(|ip| ip.to_string())),
        or_dash(node.mac()),
        or_dash(node.ipv6().map(|ip| ip.to_string())),
    )
}

fn finish(report: &ApplyReport) -> anyhow::Result<()> {
    println!("{report}");
    if report.is_success() {
        Ok(())
    } else {
        anyhow::bail!("shaping failed on nodes {:?}", report.failed())
    }
}

fn print_matrix(rows: &[Vec<String>]) {
    print!("     ");
    for j in 0..rows.len() {
        print!("{:>5}", j);
    }
    println!();
    for (i, row) in rows.iter().enumerate() {
        print!("{:>5}", i);
        for cell in row {
            print!("{:>5}", cell);
        }
        println!();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SimConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SimConfig::default(),
    };
    config.override_snapshot |= cli.override_snapshot;

    tracing::info!(
        snapshot = %config.snapshot_path.display(),
        network = %config.discovery.wireless_network,
        "wmesh-ctl starting"
    );

    let runtime = Arc::new(DockerRuntime::connect().await?);
    let mut sim = Simulation::new(config, runtime).await?;

    match cli.command {
        Command::Init => finish(&sim.initialize().await),
        Command::Move {
            count,
            interval_ms,
            no_apply,
        } => {
            let mut failed = false;
            for tick in 0..count {
                if tick > 0 && interval_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
                sim.step()?;
                tracing::info!(tick = tick + 1, of = count, "moved");
                if !no_apply {
                    let report = sim.update_loss_on_containers().await;
                    failed |= !report.is_success();
                    println!("{report}");
                }
            }
            if failed {
                anyhow::bail!("shaping failed on at least one node");
            }
            Ok(())
        }
        Command::Place {
            placements,
            no_apply,
        } => {
            sim.place(&placements)?;
            if no_apply {
                return Ok(());
            }
            finish(&sim.update_loss_on_containers().await)
        }
        Command::SetLoss { a, b, loss } => {
            sim.set_loss(a, b, loss)?;
            finish(&sim.update_loss_on_containers().await)
        }
        Command::Filter { direction, address } => {
            let shaping = &sim.config().shaping;
            let direction = direction.unwrap_or(shaping.filter_direction);
            let address = address.unwrap_or(shaping.filter_address);
            finish(&sim.add_filter(direction, address).await)
        }
        Command::Routes { json } => {
            let info = sim.resolve_routes().await?;
            for failure in &info.query_failures {
                eprintln!("warning: {failure}");
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&info.routes)?);
                return Ok(());
            }
            let rows: Vec<Vec<String>> = info
                .routes
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|outcome| match outcome {
                            RouteOutcome::SameNode => "-".to_string(),
                            RouteOutcome::NoRoute { .. } => "x".to_string(),
                            RouteOutcome::Reached { loss, .. } => loss.to_string(),
                        })
                        .collect()
                })
                .collect();
            print_matrix(&rows);
            Ok(())
        }
        Command::Ping { src, dst, count } => {
            let measured = sim.measure_route(src, dst, count).await?;
            let hops: Vec<String> = measured
                .hops
                .iter()
                .zip(&measured.node_hops)
                .map(|(ip, node)| match node {
                    Some(id) => format!("{ip} (node {id})"),
                    None => ip.to_string(),
                })
                .collect();
            println!("route: {}", hops.join(" -> "));
            match measured.loss_percent {
                Some(loss) => println!("loss: {loss}%"),
                None => println!("loss: unknown"),
            }
            Ok(())
        }
        Command::Show => {
            for node in sim.nodes() {
                println!("{}", node_line(node));
            }
            let rows: Vec<Vec<String>> = sim
                .topology()
                .to_matrix()
                .into_iter()
                .map(|row| row.into_iter().map(|v| v.to_string()).collect())
                .collect();
            print_matrix(&rows);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_placements() {
        let p = parse_placement("3, 120.5,40").unwrap();
        assert_eq!(p, Placement { id: 3, x: 120.5, y: 40.0 });
        assert!(parse_placement("3,1").is_err());
        assert!(parse_placement("a,1,2").is_err());
    }

    #[test]
    fn rejects_non_finite_placements() {
        assert!(parse_placement("0,nan,1").is_err());
        assert!(parse_placement("0,1,inf").is_err());
        assert!(parse_placement("0,-inf,1").is_err());
    }

    #[test]
    fn parses_filter_options() {
        let cli = Cli::try_parse_from([
            "wmesh-ctl",
            "filter",
            "--direction",
            "ingress",
            "--address",
            "ip6",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Filter {
                direction: Some(FilterDirection::Ingress),
                address: Some(FilterAddress::Ip6),
            }
        ));
        let cli = Cli::try_parse_from(["wmesh-ctl", "filter"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Filter {
                direction: None,
                address: None
            }
        ));
        assert!(Cli::try_parse_from(["wmesh-ctl", "filter", "--direction", "sideways"]).is_err());
        assert!(Cli::try_parse_from(["wmesh-ctl", "filter", "--address", "ipx"]).is_err());
    }

    #[test]
    fn node_line_shows_derived_addresses() {
        let mut node = Node::new(2, "node-c", Some("10.0.0.5".parse().unwrap()));
        node.docker_id = Some("0123456789abcdef".into());
        let line = node_line(&node);
        assert!(line.contains("0123456789ab "));
        assert!(line.contains("10.0.0.5 02:42:0a:00:00:05 fe80::42:aff:fe00:5"));

        let bare = node_line(&Node::new(3, "node-d", None));
        assert!(bare.ends_with("- - -"));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["wmesh-ctl", "move", "3", "--interval-ms", "500"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Move {
                count: 3,
                interval_ms: 500,
                no_apply: false
            }
        ));
        let cli = Cli::try_parse_from(["wmesh-ctl", "place", "0,1,2", "1,3,4"]).unwrap();
        match cli.command {
            Command::Place { placements, .. } => assert_eq!(placements.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(Cli::try_parse_from(["wmesh-ctl", "place"]).is_err());
    }
}
