//! Progress reporter: periodically samples the monotonic counters and the
//! admission state, and logs one diagnostic line in the format from
//! spec.md §6.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::admission::AdmissionState;
use crate::outcome::Counters;

const EMA_ALPHA: f64 = 0.20;

/// Runs until `shutdown` fires, sampling every `interval` and logging one
/// progress line to the diagnostic stream (`tracing`).
pub async fn run(counters: Arc<Counters>, admission_state: Arc<AdmissionState>, total: u64, interval: Duration, mut shutdown: watch::Receiver<bool>) {
	let start = Instant::now();
	let mut last_tick = start;
	let mut last_done = counters.done.load(Ordering::Relaxed);
	let mut last_requests = counters.request_count.load(Ordering::Relaxed);
	let mut ema_ips = 0.0f64;
	let mut ema_qps = 0.0f64;

	loop {
		tokio::select! {
			_ = tokio::time::sleep(interval) => {}
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					return;
				}
			}
		}

		let now = Instant::now();
		let elapsed = now.duration_since(last_tick).as_secs_f64().max(0.001);
		last_tick = now;

		let done = counters.done.load(Ordering::Relaxed);
		let requests = counters.request_count.load(Ordering::Relaxed);
		let instant_ips = (done.saturating_sub(last_done)) as f64 / elapsed;
		let instant_qps = (requests.saturating_sub(last_requests)) as f64 / elapsed;
		last_done = done;
		last_requests = requests;

		ema_ips = EMA_ALPHA * instant_ips + (1.0 - EMA_ALPHA) * ema_ips;
		ema_qps = EMA_ALPHA * instant_qps + (1.0 - EMA_ALPHA) * ema_qps;

		let left = total.saturating_sub(done);
		let eta = if ema_ips > 0.01 { Duration::from_secs_f64(left as f64 / ema_ips) } else { Duration::ZERO };

		tracing::info!(
			"ips:{}/{} left:{} ip/s:{:.1} qps:{:.1} eta:{} ok:{} fail:{} skip:{} dyn:{} act:{} up:{}",
			done,
			total,
			left,
			ema_ips,
			ema_qps,
			format_hms(eta),
			counters.ok_endpoints.load(Ordering::Relaxed),
			counters.fail.load(Ordering::Relaxed),
			counters.skip.load(Ordering::Relaxed),
			admission_state.dynamic_limit(),
			admission_state.active(),
			format_hms(now.duration_since(start)),
		);
	}
}

fn format_hms(d: Duration) -> String {
	let total_secs = d.as_secs();
	let h = total_secs / 3600;
	let m = (total_secs % 3600) / 60;
	let s = total_secs % 60;
	format!("{h}:{m:02}:{s:02}")
}
