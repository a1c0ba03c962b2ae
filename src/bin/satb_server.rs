use clap::Parser;
use clap_derive::Parser;
use satlink::addr::{NodeAddr, Port};
use satlink::bootstrap::{bootstrap, log_diagnostics};
use satlink::config::{ServerConfig, StackConfig, StaticRoute};
use satlink::link::Link;
use satlink::server::run_server;
use tokio::select;
use tracing::{info, Level};

/// Server node: accepts connections, logs the client's temperature reports and
/// answers service requests.
#[derive(Parser)]
struct Args {
    /// This node's address on the link.
    #[clap(long, default_value_t = 2)]
    addr: u8,

    /// UDP endpoint the interface binds.
    #[clap(long, default_value = "127.0.0.1:9602")]
    bind: String,

    /// Static route `<node>=<host:port>`, may be given multiple times.
    #[clap(long)]
    route: Vec<String>,

    /// Port application traffic is expected on.
    #[clap(long, default_value_t = 10)]
    port: u8,

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
            "3=127.0.0.1:9603".to_string(),
            "4=127.0.0.1:9604".to_string(),
            "31=127.0.0.1:9631".to_string(),
        ]
    } else {
        args.route
    };
    for route in &routes {
        config.routes.push(route.parse::<StaticRoute>()?);
    }

    let link = bootstrap(&config).await?;
    if args.verbose || args.very_verbose {
        log_diagnostics(link.as_ref());
    }

    let server_config = ServerConfig::new(Port::new(args.port)?);

    let result = select! {
        result = run_server(link.clone(), server_config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    };

    link.shutdown().await;
    result
}
