use clap::Parser;
use clap_derive::Parser;
use satlink::addr::{NodeAddr, Port};
use satlink::bootstrap::{bootstrap, log_diagnostics};
use satlink::client::run_client;
use satlink::config::{ClientConfig, ProbeConfig, StackConfig, StaticRoute};
use satlink::link::Link;
use satlink::sensor::CommandProbe;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tracing::{info, Level};

/// Client node: periodically reads the CPU temperature and reports it to the
/// server node.
#[derive(Parser)]
struct Args {
    /// This node's address on the link.
    #[clap(long, default_value_t = 3)]
    addr: u8,

    /// UDP endpoint the interface binds.
    #[clap(long, default_value = "127.0.0.1:9603")]
    bind: String,

    /// Static route `<node>=<host:port>`, may be given multiple times.
    #[clap(long)]
    route: Vec<String>,

    /// Address of the server node reports go to.
    #[clap(long, default_value_t = 2)]
    server: u8,

    /// Port the server expects application traffic on.
    #[clap(long, default_value_t = 10)]
    port: u8,

    /// Delay between reports in milliseconds.
    #[clap(long, default_value_t = 2000)]
    period_ms: u64,

    /// Command producing the temperature reading.
    #[clap(long, default_value = "vcgencmd measure_temp")]
    temp_command: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = StackConfig::new(NodeAddr::new(args.addr)?, args.bind.parse()?);
    let routes = if args.route.is_empty() {
        vec![
            "2=127.0.0.1:9602".to_string(),
            "4=127.0.0.1:9604".to_string(),
            "31=127.0.0.1:9631".to_string(),
        ]
    } else {
        args.route
    };
    for route in &routes {
        config.routes.push(route.parse::<StaticRoute>()?);
    }

    let mut client_config = ClientConfig::new(NodeAddr::new(args.server)?, Port::new(args.port)?);
    client_config.period = Duration::from_millis(args.period_ms);

    let mut probe_config = ProbeConfig::new();
    probe_config.command = args.temp_command;
    let probe = Arc::new(CommandProbe::new(probe_config)?);

    let link = bootstrap(&config).await?;
    if args.verbose || args.very_verbose {
        log_diagnostics(link.as_ref());
    }

    let result = select! {
        result = run_client(link.clone(), probe, client_config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    };

    link.shutdown().await;
    result
}
