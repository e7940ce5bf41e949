//! The `cinnabar` server binary.
//!
//! ```bash
//! # A leader on the default port
//! cinnabar
//!
//! # A leader with a startup snapshot
//! cinnabar --port 6380 --dir /var/lib/cinnabar --dbfilename dump.rdb
//!
//! # A follower
//! cinnabar --port 6380 --replicaof "127.0.0.1 6379" -vv
//! ```

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use tracing::info;

use cinnabar_server::{DEFAULT_PORT, Server, ServerConfig};

/// Cinnabar: an in-memory key/value and stream server speaking the RESP
/// wire protocol, with leader/follower replication.
#[derive(Parser)]
#[command(name = "cinnabar")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Port for the client-facing listener.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Run as a follower of the given leader, passed as one
    /// space-separated argument: "<host> <port>".
    #[arg(long, value_name = "\"HOST PORT\"")]
    replicaof: Option<String>,

    /// Directory holding the startup snapshot.
    #[arg(long)]
    dir: Option<std::path::PathBuf>,

    /// File name of the startup snapshot.
    #[arg(long)]
    dbfilename: Option<String>,

    /// Debug verbosity (-v for debug, -vv for trace).
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,
}

/// Splits the `--replicaof` argument into host and port.
fn parse_replica_of(raw: &str) -> Result<(String, u16)> {
    let Some((host, port)) = raw.trim().split_once(' ') else {
        bail!("--replicaof expects \"<host> <port>\", got {raw:?}");
    };
    let port = port
        .trim()
        .parse::<u16>()
        .with_context(|| format!("invalid leader port in --replicaof: {port:?}"))?;
    Ok((host.to_owned(), port))
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        // Usage errors exit 1, matching every other fatal startup path;
        // --help and --version still exit 0.
        let code = i32::from(e.use_stderr());
        let _ = e.print();
        std::process::exit(code);
    });
    init_logging(cli.verbose);

    let mut config = ServerConfig::new(cli.port);
    config.dir = cli.dir;
    config.dbfilename = cli.dbfilename;
    if let Some(raw) = &cli.replicaof {
        config.replica_of = Some(parse_replica_of(raw)?);
    }

    info!(
        port = config.port,
        replica = config.is_replica(),
        "starting cinnabar"
    );
    let server = Server::new(config)?;
    server.run()?;
    Ok(())
}
