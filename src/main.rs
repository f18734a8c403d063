use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use sdmux_core::MuxConfig;
use sdmux_engine::{
    BrowseEvent, BrowseOp, EventReceiver, OpKind, Operation, QueryEvent, QueryOp, RegisterEvent,
    RegisterOp, ResolveEvent, ResolveOp, ServiceDiscovery,
};
use sdmux_mdns::MdnsProvider;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// sdmux - multiplexed DNS-SD browse, resolve and advertise
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/sdmux.yaml")]
    config: PathBuf,

    /// Emit JSON formatted logs
    #[arg(long, env = "SDMUX_JSON_LOGS")]
    json_logs: bool,

    /// Give every operation its own provider connection
    #[arg(long)]
    no_share: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "SDMUX_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Browse for instances of a service type
    Browse {
        /// Service type, e.g. `_http._tcp`
        service_type: String,

        #[arg(short, long)]
        domain: Option<String>,
    },

    /// Advertise a service instance until interrupted
    Register {
        /// Instance name; empty uses the local hostname
        name: String,
        service_type: String,
        port: u16,

        /// Advertise on behalf of another host
        #[arg(long)]
        host: Option<String>,

        /// TXT pair as `key=value`, repeatable
        #[arg(long = "txt")]
        txt: Vec<String>,

        /// Fail on a name conflict instead of renaming
        #[arg(long)]
        no_auto_rename: bool,
    },

    /// Resolve an instance to host, port and TXT pairs
    Resolve {
        name: String,
        service_type: String,

        #[arg(default_value = "local.")]
        domain: String,

        /// Interface index, 0 for any
        #[arg(short, long, default_value_t = 0)]
        interface: u32,
    },

    /// Query a raw resource record
    Query {
        fullname: String,

        /// Record type, 1 for A
        #[arg(default_value_t = 1)]
        rrtype: u16,

        /// Record class, 1 for IN
        #[arg(long = "class", default_value_t = 1)]
        rrclass: u16,

        #[arg(short, long, default_value_t = 0)]
        interface: u32,
    },
}

fn init_tracing(config: &MuxConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if json || config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn parse_txt(pair: &str) -> Result<(&str, &str)> {
    match pair.split_once('=') {
        Some((key, _)) if key.is_empty() => bail!("TXT pair has an empty key: {:?}", pair),
        Some((key, value)) => Ok((key, value)),
        None => Ok((pair, "")),
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Prints events until the operation fails, its channel closes, or Ctrl-C.
async fn follow<K: OpKind>(
    op: Operation<K>,
    events: EventReceiver<K::Event>,
    render: impl Fn(&K::Event) -> String,
) -> Result<()> {
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(Ok(event)) => println!("{} {}", timestamp(), render(&event)),
                Ok(Err(e)) => {
                    error!(op = %op.id(), error = %e, "Operation failed");
                    break Err(e.into());
                }
                Err(_) => break Ok(()),
            },
            signal = &mut interrupted => {
                info!("Interrupted");
                break signal.context("Failed to listen for Ctrl-C");
            }
        }
    };

    op.stop();
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration, environment overrides included
    let mut config = MuxConfig::load(&args.config)
        .with_context(|| format!("Failed to load config: {:?}", args.config))?;
    if args.no_share {
        config.share_connection = false;
    }
    init_tracing(&config, args.json_logs);
    info!("Configuration loaded from {:?}", args.config);

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(bind_address = %addr, "Prometheus metrics exporter initialized");
    }

    let provider = Arc::new(MdnsProvider::new().context("Failed to start mDNS provider")?);
    let sd = ServiceDiscovery::new(provider, config).context("Invalid configuration")?;

    let result = match args.command {
        Command::Browse {
            service_type,
            domain,
        } => {
            let op = BrowseOp::new(&sd, service_type);
            if let Some(domain) = domain {
                op.set_domain(domain)?;
            }
            let (op, events) = sd.start_channel(op)?;
            follow(op, events, |e: &BrowseEvent| {
                format!(
                    "{} {} {}{} (if {})",
                    if e.add { "ADD" } else { "RMV" },
                    e.name,
                    e.service_type,
                    e.domain,
                    e.interface
                )
            })
            .await
        }
        Command::Register {
            name,
            service_type,
            port,
            host,
            txt,
            no_auto_rename,
        } => {
            let op = match host {
                Some(host) => RegisterOp::new_proxy(&sd, name, service_type, host, port),
                None => RegisterOp::new(&sd, name, service_type, port),
            };
            for pair in &txt {
                let (key, value) = parse_txt(pair)?;
                op.set_txt_pair(key, value)
                    .with_context(|| format!("Invalid TXT pair {:?}", pair))?;
            }
            op.set_no_auto_rename(no_auto_rename)?;
            let (op, events) = sd.start_channel(op)?;
            follow(op, events, |e: &RegisterEvent| {
                format!(
                    "{} {}.{}{}",
                    if e.add { "REGISTERED" } else { "REMOVED" },
                    e.name,
                    e.service_type,
                    e.domain
                )
            })
            .await
        }
        Command::Resolve {
            name,
            service_type,
            domain,
            interface,
        } => {
            let op = ResolveOp::new(&sd, interface, name, service_type, domain);
            let (op, events) = sd.start_channel(op)?;
            follow(op, events, |e: &ResolveEvent| {
                let mut pairs: Vec<_> = e
                    .txt
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                pairs.sort();
                format!("{} -> {}:{} [{}]", e.fullname, e.host, e.port, pairs.join(" "))
            })
            .await
        }
        Command::Query {
            fullname,
            rrtype,
            rrclass,
            interface,
        } => {
            let op = QueryOp::new(&sd, interface, fullname, rrtype, rrclass);
            let (op, events) = sd.start_channel(op)?;
            follow(op, events, |e: &QueryEvent| {
                format!(
                    "{} {} type {} class {} ttl {} ({} bytes)",
                    if e.add { "ADD" } else { "RMV" },
                    e.fullname,
                    e.rrtype,
                    e.rrclass,
                    e.ttl,
                    e.rdata.len()
                )
            })
            .await
        }
    };

    sd.shutdown();
    result
}
