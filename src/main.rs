use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadroute::{
    socket_addr_to_multiaddr, DhtComponents, DhtConfig, KadDht, Keypair, MemoryDatastore, MemoryPeerStore, PeerId,
    PeerInfo, TcpTransport,
};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    id: PeerId,
    addr: SocketAddr,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id_part, addr_part) = s
            .split_once('@')
            .context("bootstrap peer must be PEER_ID@IP:PORT")?;
        let id = PeerId::from_str(id_part).context("invalid hex peer id")?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        Ok(BootstrapPeer { id, addr })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadroute")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    listen: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    #[arg(short, default_value_t = kadroute::DEFAULT_K)]
    k: usize,

    #[arg(short, long, default_value_t = kadroute::DEFAULT_ALPHA)]
    alpha: usize,

    #[arg(long, default_value_t = kadroute::DEFAULT_DISJOINT_PATHS)]
    disjoint_paths: usize,

    /// Query the network without answering inbound requests.
    #[arg(long)]
    client: bool,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = Keypair::generate();
    let local_id = keypair.peer_id();
    let transport = TcpTransport::bind(args.listen, local_id.clone()).await?;
    info!(peer = %local_id, addr = %transport.local_addr(), advertised = %transport.listen_multiaddr(), "node listening");

    let config = DhtConfig {
        k: args.k,
        alpha: args.alpha,
        disjoint_paths: args.disjoint_paths,
        client_mode: args.client,
        ..DhtConfig::default()
    };
    let dht = KadDht::new(
        config,
        DhtComponents {
            keypair,
            listen_addrs: transport.listen_multiaddrs(),
            dialer: transport.clone(),
            registrar: transport.clone(),
            peerstore: Arc::new(MemoryPeerStore::new()),
            datastore: Arc::new(MemoryDatastore::new()),
        },
    );
    dht.start().await?;

    let seeds: Vec<PeerInfo> = args
        .bootstrap
        .iter()
        .map(|p| PeerInfo::new(p.id.clone(), vec![socket_addr_to_multiaddr(p.addr)]))
        .collect();
    if !seeds.is_empty() {
        info!(count = seeds.len(), "bootstrapping");
        match dht.bootstrap(&seeds).await {
            Ok(found) => info!(found, "bootstrap complete"),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => match dht.telemetry().await {
                Ok(snapshot) => info!(
                    routing_table_size = snapshot.routing_table_size,
                    provider_records = snapshot.provider_records,
                    value_records = snapshot.value_records,
                    "telemetry snapshot"
                ),
                Err(e) => warn!(error = %e, "telemetry unavailable"),
            },
        }
    }

    dht.stop().await;
    transport.shutdown();
    Ok(())
}
