use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;

use proxycheck::config::{Mode, RunConfig, UpstreamConfig, UpstreamMode};
use proxycheck::parse::Credential;
use proxycheck_core::signal::Shutdown;
use proxycheck_core::{telemetry, version};

/// High-throughput proxy validation and IP-intelligence enrichment.
#[derive(Parser, Debug)]
#[command(name = "proxycheck", about, long_about = None, disable_version_flag = true)]
struct Args {
	/// Input file, one candidate proxy per line.
	#[arg(short = 'i', long = "input", value_name = "path")]
	input: PathBuf,

	/// Output file for confirmed working proxies.
	#[arg(short = 'o', long = "output", value_name = "path", default_value = "working.txt")]
	output: PathBuf,

	/// Port to assume for lines that don't specify one.
	#[arg(short = 'p', long = "default-port", value_name = "port")]
	default_port: Option<u16>,

	/// Probe mode: auto, all, http, https, or socks5.
	#[arg(short = 'm', long = "mode", value_name = "mode", default_value = "auto")]
	mode: String,

	/// Per-probe deadline, in seconds.
	#[arg(long = "timeout", value_name = "secs", default_value_t = 8)]
	timeout_secs: u64,

	/// Delay after each endpoint finishes, in milliseconds.
	#[arg(long = "delay", value_name = "ms", default_value_t = 0)]
	delay_ms: u64,

	/// Fixed worker-pool size. Auto-sized from CPU/FD/memory budget if unset.
	#[arg(short = 'c', long = "concurrency", value_name = "n")]
	concurrency: Option<usize>,

	/// Progress-line cadence, in seconds.
	#[arg(long = "progress-interval", value_name = "secs", default_value_t = 1)]
	progress_interval_secs: u64,

	/// File of `user:pass` lines tried against every endpoint lacking an
	/// inline credential.
	#[arg(long = "auth-file", value_name = "path")]
	auth_file: Option<PathBuf>,

	/// Fraction of the memory cap the auto-sizing formula may use.
	#[arg(long = "mem-budget-ratio", value_name = "ratio", default_value_t = 0.5)]
	mem_budget_ratio: f64,

	/// Estimated bytes of memory held per in-flight job.
	#[arg(long = "mem-per-job-bytes", value_name = "bytes", default_value_t = 2 * 1024 * 1024)]
	mem_per_job_bytes: u64,

	/// Fraction of FD/memory cap above which the admission controller issues
	/// opportunistic GC hints.
	#[arg(long = "gc-limit-ratio", value_name = "ratio", default_value_t = 0.60)]
	gc_limit_ratio: f64,

	/// Disables admission throttling; trusts --concurrency/--mem-budget-ratio
	/// outright instead of backing off under FD/RSS pressure.
	#[arg(long = "unsafe", default_value_t = false)]
	unsafe_mode: bool,

	/// Skips the CDN-range preload and lets every endpoint through.
	#[arg(long = "skip-cdn-check", default_value_t = false)]
	skip_cdn_check: bool,

	/// Upstream proxy address (host:port) every prober dials through instead
	/// of connecting directly.
	#[arg(long = "upstream", value_name = "host:port")]
	upstream: Option<String>,

	/// Upstream proxy protocol: http, https, or socks5.
	#[arg(long = "upstream-mode", value_name = "mode", default_value = "http")]
	upstream_mode: String,

	/// Upstream proxy credential, `user:pass`.
	#[arg(long = "upstream-auth", value_name = "user:pass")]
	upstream_auth: Option<String>,

	/// Logs one FAIL line per failed endpoint in addition to the summary.
	#[arg(short = 'v', long = "verbose", default_value_t = false)]
	verbose: bool,

	/// Print version and exit.
	#[arg(short = 'V', long = "version", default_value_t = false)]
	version: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	if args.version {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}

	let config = match build_config(&args) {
		Ok(config) => config,
		Err(err) => {
			eprintln!("proxycheck: {err}");
			std::process::exit(2);
		},
	};

	let _log_flush = telemetry::setup_logging(config.verbose);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(config))
}

async fn run(config: RunConfig) -> anyhow::Result<()> {
	let shutdown = Shutdown::new();
	let handle = proxycheck::engine::start(config.clone(), shutdown).await?;
	let counters = handle.counters.clone();
	handle.wait().await?;

	println!(
		"done. out={} okIP={} okLines={} fail={} skip={}",
		config.output_path.display(),
		counters.ok_endpoints.load(Ordering::Relaxed),
		counters.ok_lines.load(Ordering::Relaxed),
		counters.fail.load(Ordering::Relaxed),
		counters.skip.load(Ordering::Relaxed),
	);
	Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<RunConfig> {
	let mode = Mode::from_str(&args.mode).map_err(anyhow::Error::msg)?;

	let default_credentials = match &args.auth_file {
		Some(path) => load_auth_file(path)?,
		None => Vec::new(),
	};

	let upstream = match &args.upstream {
		Some(addr) => {
			let (host, port) = split_host_port(addr)?;
			let upstream_mode = match args.upstream_mode.as_str() {
				"http" => UpstreamMode::Http,
				"https" => UpstreamMode::Https,
				"socks5" => UpstreamMode::Socks5,
				other => anyhow::bail!("unknown upstream mode: {other}"),
			};
			let credential = match &args.upstream_auth {
				Some(raw) => Some(parse_user_pass(raw)?),
				None => None,
			};
			Some(UpstreamConfig { host, port, mode: upstream_mode, credential })
		},
		None => None,
	};

	Ok(RunConfig {
		input_path: args.input.clone(),
		output_path: args.output.clone(),
		default_port: args.default_port,
		mode,
		probe_timeout: Duration::from_secs(args.timeout_secs),
		endpoint_delay: Duration::from_millis(args.delay_ms),
		concurrency: args.concurrency,
		progress_interval: Duration::from_secs(args.progress_interval_secs),
		default_credentials,
		mem_budget_ratio: args.mem_budget_ratio,
		mem_per_job_bytes: args.mem_per_job_bytes,
		gc_limit_ratio: args.gc_limit_ratio,
		unsafe_mode: args.unsafe_mode,
		skip_cdn: !args.skip_cdn_check,
		upstream,
		verbose: args.verbose,
	})
}

fn load_auth_file(path: &PathBuf) -> anyhow::Result<Vec<Credential>> {
	let contents = std::fs::read_to_string(path)?;
	let mut credentials = Vec::new();
	for line in contents.lines() {
		let trimmed = line.trim();
		if trimmed.is_empty() || trimmed.starts_with('#') {
			continue;
		}
		credentials.push(parse_user_pass(trimmed)?);
	}
	Ok(credentials)
}

fn parse_user_pass(raw: &str) -> anyhow::Result<Credential> {
	match raw.split_once(':') {
		Some((user, pass)) => Ok(Credential { user: user.to_string(), pass: pass.to_string() }),
		None => anyhow::bail!("expected user:pass, got {raw:?}"),
	}
}

fn split_host_port(raw: &str) -> anyhow::Result<(String, u16)> {
	let (host, port) = raw.rsplit_once(':').ok_or_else(|| anyhow::anyhow!("expected host:port, got {raw:?}"))?;
	let port: u16 = port.parse().map_err(|_| anyhow::anyhow!("invalid port in {raw:?}"))?;
	Ok((host.to_string(), port))
}
