use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use modelgate::app::{self, AppError};
use modelgate::config::{self, Config};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "modelgate", about = "LLM gateway", long_about = None)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse and validate the config, then exit
	#[arg(long)]
	validate_only: bool,
}

fn load_config(args: &Args) -> Result<Config, String> {
	let contents = match (&args.config, &args.file) {
		(Some(bytes), _) => bytes.clone(),
		(None, Some(path)) => std::fs::read_to_string(path)
			.map_err(|e| format!("failed to read {}: {e}", path.display()))?,
		(None, None) => "{}".to_string(),
	};
	config::parse_config(&contents).map_err(|e| e.to_string())
}

fn setup_logging(cfg: &Config) {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&cfg.telemetry.log_level))
		.unwrap_or_else(|_| EnvFilter::new("info"));
	let builder = tracing_subscriber::fmt().with_env_filter(filter);
	if cfg.telemetry.log_format == "json" {
		builder.json().init();
	} else {
		builder.init();
	}
}

fn main() -> ExitCode {
	let args = Args::parse();
	let cfg = match load_config(&args) {
		Ok(cfg) => cfg,
		Err(e) => {
			eprintln!("config error: {e}");
			return ExitCode::from(EXIT_CONFIG);
		},
	};
	setup_logging(&cfg);
	if args.validate_only {
		println!("config ok");
		return ExitCode::SUCCESS;
	}

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(rt) => rt,
		Err(e) => {
			eprintln!("failed to start runtime: {e}");
			return ExitCode::from(EXIT_CONFIG);
		},
	};
	match runtime.block_on(app::run(cfg)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(AppError::Bind(addr, e)) => {
			eprintln!("bind error on {addr}: {e}");
			ExitCode::from(EXIT_BIND)
		},
		Err(AppError::Config(e)) => {
			eprintln!("config error: {e}");
			ExitCode::from(EXIT_CONFIG)
		},
		Err(e) => {
			eprintln!("fatal: {e}");
			ExitCode::from(EXIT_CONFIG)
		},
	}
}
