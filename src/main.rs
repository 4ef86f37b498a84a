//! Tunium - a two-node HTTP tunnel proxy

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tunium::app::Runtime;
use tunium::config::Config;
use tunium::error::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if let Some(config_type) = args.gen_config {
        let config = match config_type.as_str() {
            "client" => Config::default_client(),
            "server" => Config::default_server(),
            _ => {
                eprintln!("Unknown config type: {}. Use 'client' or 'server'", config_type);
                std::process::exit(1);
            }
        };
        println!("{}", serde_json::to_string_pretty(&config).unwrap());
        return Ok(());
    }

    let Some(config_path) = args.config else {
        print_help();
        std::process::exit(1);
    };
    let config = Config::load(&config_path)?;

    // Initialize logging: RUST_LOG wins over the config file
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| Some(config.log.level.clone()))
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Tunium v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(config)?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: Option<String>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = Args {
            config: None,
            gen_config: None,
            version: false,
        };

        let mut argv = std::env::args().skip(1);
        while let Some(arg) = argv.next() {
            match arg.as_str() {
                "-c" | "--config" => args.config = argv.next().map(PathBuf::from),
                "--gen-config" => args.gen_config = argv.next(),
                "-v" | "--version" => args.version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                // A bare path is shorthand for --config <path>
                path if !path.starts_with('-') && args.config.is_none() => {
                    args.config = Some(PathBuf::from(path));
                }
                unknown => {
                    eprintln!("Unknown option: {}", unknown);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        args
    }
}

fn print_help() {
    println!(
        r#"Tunium - a two-node HTTP tunnel proxy

USAGE:
    tunium [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config <TYPE>     Generate example config (client/server)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    tunium --gen-config server > cloud.json
    tunium --gen-config client > onprem.json
    tunium -c cloud.json
    RUST_LOG=debug tunium -c onprem.json

The server side accepts the tunnel link and usually opens the proxy port;
the client side dials out from behind the firewall and dials CONNECT
targets on its network. Point an HTTP client at the proxy port:

    curl -x http://127.0.0.1:3128 http://intranet.host:8080/
"#
    );
}

fn print_version() {
    println!("Tunium v{}", env!("CARGO_PKG_VERSION"));
    println!("A two-node HTTP tunnel proxy");
}
