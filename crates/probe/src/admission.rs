//! C8 — dynamic admission controller: samples RSS/FD pressure every 200ms
//! and adjusts a shared concurrency ceiling, per the threshold table in
//! spec.md §4.6. No locks: a single writer task mutates the atomics,
//! workers only read-and-increment/decrement (spec.md §5).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::platform::ResourceProbe;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
	pub hard_cap: i64,
	pub min_limit: i64,
	pub step_up: i64,
	pub fd_cap: u64,
	pub mem_cap: Option<u64>,
	pub resume_threshold_fd: u64,
	/// Fraction of `fd_cap`/`mem_cap` above which the controller starts
	/// issuing opportunistic GC hints even though it isn't yet shrinking the
	/// limit (spec.md §6 `gc-limit-ratio`; default matches spec.md §4.6's
	/// 0.60 threshold).
	pub gc_limit_ratio: f64,
}

impl AdmissionLimits {
	pub fn new(hard_cap: i64, fd_cap: Option<u64>, mem_cap: Option<u64>) -> Self {
		let hard_cap = hard_cap.max(1);
		let min_limit = 64.max(hard_cap / 10).min(hard_cap);
		let step_up = 8.max(hard_cap / 80);
		let fd_cap = fd_cap.unwrap_or(100_000);
		let warn_threshold = (fd_cap as f64 * 0.35) as u64;
		let resume_threshold_fd = 4_000.max((warn_threshold as f64 * 0.8) as u64);
		AdmissionLimits {
			hard_cap,
			min_limit,
			step_up,
			fd_cap,
			mem_cap,
			resume_threshold_fd,
			gc_limit_ratio: 0.60,
		}
	}

	pub fn with_gc_limit_ratio(mut self, ratio: f64) -> Self {
		self.gc_limit_ratio = ratio;
		self
	}
}

/// Shared, atomically-updated admission state. Workers read `dynamic_limit`,
/// `paused`, and `active`; only the controller task writes `dynamic_limit`
/// and `paused`.
pub struct AdmissionState {
	dynamic_limit: AtomicI64,
	paused: AtomicBool,
	active: AtomicU64,
	limits: AdmissionLimits,
}

impl AdmissionState {
	pub fn new(limits: AdmissionLimits) -> Arc<Self> {
		Arc::new(AdmissionState {
			dynamic_limit: AtomicI64::new(limits.hard_cap),
			paused: AtomicBool::new(false),
			active: AtomicU64::new(0),
			limits,
		})
	}

	pub fn dynamic_limit(&self) -> i64 {
		self.dynamic_limit.load(Ordering::Acquire)
	}

	pub fn is_paused(&self) -> bool {
		self.paused.load(Ordering::Acquire)
	}

	pub fn active(&self) -> u64 {
		self.active.load(Ordering::Acquire)
	}

	pub fn limits(&self) -> AdmissionLimits {
		self.limits
	}

	/// Waits for admission, then increments `active`. Returns a guard that
	/// decrements `active` on drop. This is the only suspension point
	/// spec.md §5 calls the "admission check loop".
	pub async fn acquire(self: &Arc<Self>) -> AdmissionGuard {
		loop {
			if self.is_paused() {
				tokio::time::sleep(Duration::from_millis(10)).await;
				continue;
			}
			if self.active() as i64 >= self.dynamic_limit() {
				tokio::time::sleep(Duration::from_millis(2)).await;
				continue;
			}
			self.active.fetch_add(1, Ordering::AcqRel);
			return AdmissionGuard { state: self.clone() };
		}
	}
}

pub struct AdmissionGuard {
	state: Arc<AdmissionState>,
}

impl Drop for AdmissionGuard {
	fn drop(&mut self) {
		self.state.active.fetch_sub(1, Ordering::AcqRel);
	}
}

/// Runs the 200ms sampling loop until `shutdown` fires. Intended to be
/// spawned as its own task.
pub async fn run(
	state: Arc<AdmissionState>,
	probe: Arc<dyn ResourceProbe>,
	mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
	let mut last_opportunistic_gc = tokio::time::Instant::now();
	loop {
		tokio::select! {
			_ = tokio::time::sleep(SAMPLE_INTERVAL) => {}
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					return;
				}
			}
		}
		let snapshot = probe.snapshot();
		tick(&state, &probe, snapshot, &mut last_opportunistic_gc);
	}
}

/// One admission-controller tick: pure given a snapshot, so it's unit
/// testable without a real clock/process (spec.md §8 property 11).
pub fn tick(
	state: &Arc<AdmissionState>,
	probe: &Arc<dyn ResourceProbe>,
	snapshot: crate::platform::ResourceSnapshot,
	last_opportunistic_gc: &mut tokio::time::Instant,
) {
	let limits = state.limits();
	let fd_cap = limits.fd_cap as f64;
	let fd_count = snapshot.fd_count as f64;
	let fd_ratio = fd_count / fd_cap;
	let mem_ratio = limits
		.mem_cap
		.map(|cap| snapshot.rss_bytes as f64 / cap as f64)
		.unwrap_or(0.0);

	let current = state.dynamic_limit.load(Ordering::Acquire);

	if fd_ratio > 0.45 {
		state.dynamic_limit.store(limits.min_limit, Ordering::Release);
		state.paused.store(true, Ordering::Release);
		probe.gc_hint(true);
	} else if fd_ratio > 0.35 {
		let next = ((current as f64) * 0.8) as i64;
		state.dynamic_limit.store(next.max(limits.min_limit), Ordering::Release);
		probe.gc_hint(false);
	} else if mem_ratio > 0.88 || fd_ratio > 0.85 {
		let next = ((current as f64) * 0.7) as i64;
		state.dynamic_limit.store(next.max(limits.min_limit), Ordering::Release);
		state.paused.store(true, Ordering::Release);
		probe.gc_hint(true);
	} else if mem_ratio > 0.80 || fd_ratio > 0.80 {
		let next = ((current as f64) * 0.8) as i64;
		state.dynamic_limit.store(next.max(limits.min_limit), Ordering::Release);
		probe.gc_hint(true);
	} else if mem_ratio > 0.70 || fd_ratio > 0.70 {
		let next = ((current as f64) * 0.9) as i64;
		state.dynamic_limit.store(next.max(limits.min_limit), Ordering::Release);
	} else if mem_ratio > limits.gc_limit_ratio || fd_ratio > limits.gc_limit_ratio {
		if last_opportunistic_gc.elapsed() >= Duration::from_secs(1) {
			probe.gc_hint(false);
			*last_opportunistic_gc = tokio::time::Instant::now();
		}
	} else {
		let next = (current + limits.step_up).min(limits.hard_cap);
		state.dynamic_limit.store(next, Ordering::Release);
	}

	// Resume from a pause once FD pressure and RSS have both recovered.
	if state.paused.load(Ordering::Acquire) {
		let mem_ok = limits
			.mem_cap
			.map(|cap| (snapshot.rss_bytes as f64 / cap as f64) < 0.65)
			.unwrap_or(true);
		if (snapshot.fd_count) < limits.resume_threshold_fd && mem_ok {
			state.paused.store(false, Ordering::Release);
		}
	}
}
