#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use streamgate_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use streamgate_server::server::bus::NullBus;
use streamgate_server::server::directory::MemoryDirectory;
use streamgate_server::server::host::ServerHost;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: streamgate_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Listen endpoint (default: from config, 127.0.0.1:7040)\n\
\t--config   Config file path (default: ~/.streamgate/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,streamgate_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let mut cfg: ServerConfig = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = args.bind {
		cfg.bind_address = bind;
	}

	let directory = Arc::new(MemoryDirectory::from_settings(&cfg.directory)?);
	info!(users = cfg.directory.users.len(), "user directory ready");

	// The pub/sub transport is pluggable behind `ExternalBus`; this build
	// ships only the null transport.
	if cfg.bus.address.is_some() {
		warn!("bus.address is set but this build has no bus transport; using the null bus");
	}
	let bus = Arc::new(NullBus);

	let host = ServerHost::new(cfg, directory, bus);
	let listener = host.bind().await?;

	tokio::select! {
		res = host.run(listener) => res,
		_ = tokio::signal::ctrl_c() => {
			info!("ctrl-c received; shutting down");
			host.shutdown();
			Ok(())
		}
	}
}
