//! Resolved run configuration, built by the CLI crate and consumed by the
//! engine entry point. This is the only place CLI flags and engine
//! internals meet.

use std::path::PathBuf;
use std::time::Duration;

use crate::parse::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	Auto,
	All,
	Http,
	Https,
	Socks5,
}

impl std::str::FromStr for Mode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"auto" => Ok(Mode::Auto),
			"all" => Ok(Mode::All),
			"http" => Ok(Mode::Http),
			"https" => Ok(Mode::Https),
			"socks5" => Ok(Mode::Socks5),
			other => Err(format!("unknown mode: {other}")),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
	Http,
	Https,
	Socks5,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
	pub host: String,
	pub port: u16,
	pub mode: UpstreamMode,
	pub credential: Option<Credential>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
	pub input_path: PathBuf,
	pub output_path: PathBuf,
	pub default_port: Option<u16>,
	pub mode: Mode,
	pub probe_timeout: Duration,
	pub endpoint_delay: Duration,
	pub concurrency: Option<usize>,
	pub progress_interval: Duration,
	pub default_credentials: Vec<Credential>,
	pub mem_budget_ratio: f64,
	pub mem_per_job_bytes: u64,
	pub gc_limit_ratio: f64,
	/// Disables the admission controller's pausing/throttling entirely,
	/// trusting the caller's `concurrency`/`mem_budget_ratio` choice instead
	/// of backing off under FD/RSS pressure (spec.md §6 "unsafe toggle").
	pub unsafe_mode: bool,
	pub skip_cdn: bool,
	pub upstream: Option<UpstreamConfig>,
	pub verbose: bool,
}

impl Default for RunConfig {
	fn default() -> Self {
		RunConfig {
			input_path: PathBuf::from("input.txt"),
			output_path: PathBuf::from("working.txt"),
			default_port: None,
			mode: Mode::Auto,
			probe_timeout: Duration::from_secs(8),
			endpoint_delay: Duration::ZERO,
			concurrency: None,
			progress_interval: Duration::from_secs(1),
			default_credentials: Vec::new(),
			mem_budget_ratio: 0.5,
			mem_per_job_bytes: 2 * 1024 * 1024,
			gc_limit_ratio: 0.60,
			unsafe_mode: false,
			skip_cdn: true,
			upstream: None,
			verbose: false,
		}
	}
}
