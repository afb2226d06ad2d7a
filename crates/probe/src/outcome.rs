//! Outcome and counter types shared across the engine (spec.md §3).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::classify::FailureKind;
use crate::parse::{Credential, Endpoint, Protocol};

#[derive(Debug, Clone)]
pub struct IpInfo {
	pub isp: String,
	pub ip_type: String,
	pub country: String,
}

impl IpInfo {
	pub fn field(s: &str) -> String {
		if s.is_empty() { "-".to_string() } else { s.to_string() }
	}
}

#[derive(Debug, Clone)]
pub struct Success {
	pub protocol: Protocol,
	pub credential: Credential,
	pub info: IpInfo,
}

#[derive(Debug, Clone)]
pub enum Outcome {
	Success { endpoint: Endpoint, successes: Vec<Success> },
	Failure { endpoint: Endpoint, kind: FailureKind, last_error: String },
	Skip { endpoint: Endpoint, kind: FailureKind },
	BadLine { reason: String },
}

/// Monotonic run counters, all lock-free atomics (spec.md §3/§5). Failure
/// reason counts are the one map-shaped field; each key gets its own
/// atomic counter behind a mutex-guarded map (writes are rare relative to
/// the hot path, which only ever touches the per-key atomic).
#[derive(Default)]
pub struct Counters {
	pub done: AtomicU64,
	pub ok_endpoints: AtomicU64,
	pub ok_lines: AtomicU64,
	pub fail: AtomicU64,
	pub skip: AtomicU64,
	pub request_count: AtomicU64,
	reasons: Mutex<HashMap<String, AtomicU64>>,
}

impl Counters {
	pub fn record_reason(&self, reason: &str) {
		let reasons = self.reasons.lock().unwrap();
		if let Some(counter) = reasons.get(reason) {
			counter.fetch_add(1, Ordering::Relaxed);
			return;
		}
		drop(reasons);
		let mut reasons = self.reasons.lock().unwrap();
		reasons
			.entry(reason.to_string())
			.or_insert_with(|| AtomicU64::new(0))
			.fetch_add(1, Ordering::Relaxed);
	}

	pub fn reason_snapshot(&self) -> HashMap<String, u64> {
		self
			.reasons
			.lock()
			.unwrap()
			.iter()
			.map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
			.collect()
	}

	pub fn apply(&self, outcome: &Outcome) {
		self.done.fetch_add(1, Ordering::Relaxed);
		match outcome {
			Outcome::Success { successes, .. } => {
				self.ok_endpoints.fetch_add(1, Ordering::Relaxed);
				self.ok_lines.fetch_add(successes.len() as u64, Ordering::Relaxed);
			},
			Outcome::Failure { kind, .. } => {
				self.fail.fetch_add(1, Ordering::Relaxed);
				self.record_reason(&kind.as_str());
			},
			Outcome::Skip { kind, .. } => {
				self.skip.fetch_add(1, Ordering::Relaxed);
				self.record_reason(&kind.as_str());
			},
			Outcome::BadLine { .. } => {
				self.skip.fetch_add(1, Ordering::Relaxed);
				self.record_reason("bad_line");
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::parse::SchemeHint;

	fn ep() -> Endpoint {
		Endpoint {
			host: "1.2.3.4".to_string(),
			port: 80,
			scheme_hint: SchemeHint::Unknown,
			inline_credential: None,
			raw: "1.2.3.4:80".to_string(),
		}
	}

	#[test]
	fn done_equals_sum_of_buckets() {
		let counters = Counters::default();
		counters.apply(&Outcome::Success {
			endpoint: ep(),
			successes: vec![Success {
				protocol: Protocol::Http,
				credential: Credential::empty(),
				info: IpInfo { isp: String::new(), ip_type: String::new(), country: "US".to_string() },
			}],
		});
		counters.apply(&Outcome::Failure {
			endpoint: ep(),
			kind: FailureKind::Refused,
			last_error: "refused".to_string(),
		});
		counters.apply(&Outcome::Skip { endpoint: ep(), kind: FailureKind::Cdn("cloudflare".to_string()) });
		counters.apply(&Outcome::BadLine { reason: "bad".to_string() });

		let done = counters.done.load(Ordering::Relaxed);
		let ok = counters.ok_endpoints.load(Ordering::Relaxed);
		let fail = counters.fail.load(Ordering::Relaxed);
		let skip = counters.skip.load(Ordering::Relaxed);
		assert_eq!(done, ok + fail + skip);
	}
}
