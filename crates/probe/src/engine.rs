//! C9 — worker pool & dispatcher (spec.md §4.7): streams the input file
//! into a bounded job channel, runs a fixed pool of workers each driving
//! the C7 state machine, and routes every `Outcome` through a single
//! outcome channel drained by the C10 writer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use proxycheck_core::signal::Shutdown;

use crate::admission::{self, AdmissionLimits, AdmissionState};
use crate::cdn::{self, CdnTable};
use crate::classify::FailureKind;
use crate::config::RunConfig;
use crate::dial::{DirectDialer, TargetDialer, UpstreamDialer};
use crate::outcome::{Counters, Outcome};
use crate::parse::{self, Job};
use crate::platform::{self, ResourceProbe};
use crate::probers::http::HttpProber;
use crate::probers::https::HttpsProber;
use crate::probers::socks5::Socks5Prober;
use crate::state_machine::{self, ProberRegistry};
use crate::transport::ConnTracker;
use crate::writer;

pub struct EngineHandle {
	pub counters: Arc<Counters>,
	join: JoinHandle<anyhow::Result<()>>,
}

impl EngineHandle {
	pub async fn wait(self) -> anyhow::Result<()> {
		self.join.await?
	}
}

/// Starts the whole engine on a spawned task and returns immediately with a
/// handle, so the caller (the CLI) can await it alongside signal handling.
/// `shutdown` is consumed: its one-shot `wait()` is bridged onto an
/// internal `watch` channel so every long-lived engine task (dispatcher,
/// admission controller, progress reporter) can observe it repeatedly.
pub async fn start(config: RunConfig, shutdown: Shutdown) -> anyhow::Result<EngineHandle> {
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		shutdown.wait().await;
		let _ = shutdown_tx.send(true);
	});

	let counters = Arc::new(Counters::default());
	let join = tokio::spawn(run(config, counters.clone(), shutdown_rx));
	Ok(EngineHandle { counters, join })
}

async fn run(config: RunConfig, counters: Arc<Counters>, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
	let probe: Arc<dyn ResourceProbe> = Arc::from(platform::platform_probe());

	let concurrency = match config.concurrency {
		Some(n) => n,
		None => auto_concurrency(
			std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
			probe.fd_cap().unwrap_or(100_000),
			probe.mem_cap_bytes(),
			config.mem_budget_ratio,
			config.mem_per_job_bytes,
		),
	};
	tracing::info!(concurrency, "starting engine");

	let limits = AdmissionLimits::new(concurrency as i64, probe.fd_cap(), probe.mem_cap_bytes())
		.with_gc_limit_ratio(config.gc_limit_ratio);
	let admission_state = AdmissionState::new(limits);
	if config.unsafe_mode {
		tracing::warn!("unsafe mode: admission controller will not throttle or pause");
	} else {
		tokio::spawn(admission::run(admission_state.clone(), probe.clone(), shutdown_rx.clone()));
	}

	let cdn_table = if config.skip_cdn {
		let client = reqwest::Client::new();
		Arc::new(cdn::load(&client, Duration::from_secs(10)).await)
	} else {
		Arc::new(CdnTable::default())
	};

	let dialer: Arc<dyn TargetDialer> = match &config.upstream {
		Some(upstream) => UpstreamDialer::new(upstream.clone()),
		None => Arc::new(DirectDialer),
	};
	let registry = Arc::new(ProberRegistry {
		http: Arc::new(HttpProber),
		https: Arc::new(HttpsProber),
		socks5: Arc::new(Socks5Prober),
	});

	let channel_capacity = (concurrency / 4).clamp(128, 4096);
	let (job_tx, job_rx) = mpsc::channel::<Job>(channel_capacity);
	let (outcome_tx, outcome_rx) = mpsc::channel::<Outcome>(channel_capacity);

	let total = count_dispatchable_lines(&config.input_path).await.unwrap_or(0);

	let writer_handle = tokio::spawn(writer::run(config.output_path.clone(), outcome_rx, counters.clone(), config.verbose));
	let progress_handle = tokio::spawn(crate::progress::run(
		counters.clone(),
		admission_state.clone(),
		total,
		config.progress_interval,
		shutdown_rx.clone(),
	));

	let worker_count = concurrency.max(1);
	let job_rx = Arc::new(Mutex::new(job_rx));
	let mut worker_handles = Vec::with_capacity(worker_count);
	for _ in 0..worker_count {
		let job_rx = job_rx.clone();
		let outcome_tx = outcome_tx.clone();
		let admission_state = admission_state.clone();
		let registry = registry.clone();
		let dialer = dialer.clone();
		let tracker = ConnTracker::new();
		let counters = counters.clone();
		let probe_timeout = config.probe_timeout;
		let endpoint_delay = config.endpoint_delay;
		let mode = config.mode;
		worker_handles.push(tokio::spawn(async move {
			loop {
				let job = {
					let mut rx = job_rx.lock().await;
					rx.recv().await
				};
				let Some(job) = job else { break };
				let _guard = admission_state.acquire().await;
				let outcome = state_machine::run(
					&job,
					mode,
					&registry,
					probe_timeout,
					&dialer,
					&tracker,
					&counters.request_count,
				)
				.await;
				if outcome_tx.send(outcome).await.is_err() {
					break;
				}
				if !endpoint_delay.is_zero() {
					tokio::time::sleep(endpoint_delay).await;
				}
			}
		}));
	}

	dispatch(&config, job_tx, outcome_tx, cdn_table, shutdown_rx.clone()).await?;

	for handle in worker_handles {
		handle.await?;
	}
	writer_handle.await??;
	progress_handle.await?;

	tracing::info!(
		ok_ip = counters.ok_endpoints.load(std::sync::atomic::Ordering::Relaxed),
		ok_lines = counters.ok_lines.load(std::sync::atomic::Ordering::Relaxed),
		fail = counters.fail.load(std::sync::atomic::Ordering::Relaxed),
		skip = counters.skip.load(std::sync::atomic::Ordering::Relaxed),
		out = %config.output_path.display(),
		"done"
	);
	Ok(())
}

/// Streams the input file line by line, dispatching CDN-filtered and
/// malformed lines straight to the outcome channel and everything else to
/// the job channel. Closes `job_tx`/`outcome_tx` on EOF or shutdown.
async fn dispatch(
	config: &RunConfig,
	job_tx: mpsc::Sender<Job>,
	outcome_tx: mpsc::Sender<Outcome>,
	cdn_table: Arc<CdnTable>,
	mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let file = File::open(&config.input_path).await?;
	let mut lines = BufReader::with_capacity(64 * 1024, file).lines();

	loop {
		if *shutdown_rx.borrow() {
			break;
		}
		let line = tokio::select! {
			line = lines.next_line() => line?,
			_ = shutdown_rx.changed() => {
				if *shutdown_rx.borrow() { break; } else { continue; }
			}
		};
		let Some(line) = line else { break };

		match parse::parse(&line, config.default_port, &config.default_credentials, config.mode) {
			Ok(None) => continue,
			Ok(Some(job)) => {
				if config.skip_cdn {
					if let Some(provider) = cdn_table.matches(&job.endpoint) {
						let outcome = Outcome::Skip { endpoint: job.endpoint, kind: FailureKind::Cdn(provider.to_string()) };
						if outcome_tx.send(outcome).await.is_err() {
							break;
						}
						continue;
					}
				}
				if job_tx.send(job).await.is_err() {
					break;
				}
			},
			Err(bad_line) => {
				let outcome = Outcome::BadLine { reason: bad_line.reason };
				if outcome_tx.send(outcome).await.is_err() {
					break;
				}
			},
		}
	}
	Ok(())
}

async fn count_dispatchable_lines(path: &Path) -> anyhow::Result<u64> {
	let file = File::open(path).await?;
	let mut lines = BufReader::with_capacity(64 * 1024, file).lines();
	let mut total = 0u64;
	while let Some(line) = lines.next_line().await? {
		let trimmed = line.trim();
		if !trimmed.is_empty() && !trimmed.starts_with('#') {
			total += 1;
		}
	}
	Ok(total)
}

/// Auto-sizing formula from spec.md §4.7: `base = cpu_count * 2000` (or
/// `*3000` at cpu_count >= 8), floor 1000, capped by both the FD budget and
/// the memory budget.
pub fn auto_concurrency(cpu_count: usize, fd_cap: u64, mem_cap: Option<u64>, mem_budget_ratio: f64, mem_per_job_bytes: u64) -> usize {
	let multiplier = if cpu_count >= 8 { 3000 } else { 2000 };
	let base = (cpu_count * multiplier).max(1000);

	let fd_budget = ((fd_cap as f64 * 0.70) / 4.0) as usize;
	let mem_budget = mem_cap
		.map(|cap| ((mem_budget_ratio * cap as f64) / mem_per_job_bytes as f64) as usize)
		.unwrap_or(usize::MAX);

	base.min(fd_budget).min(mem_budget).max(1)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn auto_concurrency_uses_higher_multiplier_above_eight_cpus() {
		let low = auto_concurrency(4, 100_000, None, 0.5, 2 * 1024 * 1024);
		let high = auto_concurrency(8, 100_000, None, 0.5, 2 * 1024 * 1024);
		assert_eq!(low, 8000);
		assert_eq!(high, 24_000.min((100_000f64 * 0.70 / 4.0) as usize));
	}

	#[test]
	fn memory_budget_caps_concurrency_when_tight() {
		let n = auto_concurrency(8, 1_000_000, Some(256 * 1024 * 1024), 0.5, 2 * 1024 * 1024);
		assert_eq!(n, 64);
	}
}
