//! C7 — per-endpoint state machine (spec.md §4.5): orders protocols,
//! iterates credentials, detects the "endpoint unreachable" signals that
//! short-circuit remaining protocols, and picks the primary failure kind.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use crate::classify::{FailureKind, primary_failure_kind};
use crate::config::Mode;
use crate::dial::TargetDialer;
use crate::outcome::{IpInfo, Outcome, Success};
use crate::parse::{Credential, Job, Protocol};
use crate::probers::Prober;
use crate::transport::ConnTracker;

/// Maps each `Protocol` to its prober implementation. Built once at startup
/// and shared read-only across all workers.
pub struct ProberRegistry {
	pub http: Arc<dyn Prober>,
	pub https: Arc<dyn Prober>,
	pub socks5: Arc<dyn Prober>,
}

impl ProberRegistry {
	pub fn get(&self, protocol: Protocol) -> &Arc<dyn Prober> {
		match protocol {
			Protocol::Http => &self.http,
			Protocol::Https => &self.https,
			Protocol::Socks5 => &self.socks5,
		}
	}
}

/// Runs the full protocol/credential loop from spec.md §4.5 for one `Job`
/// and returns its `Outcome`. Probes within this call run strictly
/// sequentially on the caller's task (spec.md §4.7 — "per-endpoint, probes
/// run strictly sequentially on the same worker").
pub async fn run(
	job: &Job,
	mode: Mode,
	registry: &ProberRegistry,
	deadline: Duration,
	dialer: &Arc<dyn TargetDialer>,
	tracker: &Arc<ConnTracker>,
	request_counter: &AtomicU64,
) -> Outcome {
	let mut successes = Vec::new();
	let mut observed_kinds = Vec::new();
	let mut last_error: Option<String> = None;
	let mut last_error_kind: Option<FailureKind> = None;
	let mut endpoint_unreachable = false;

	for &protocol in &job.protocol_order {
		if endpoint_unreachable {
			break;
		}
		let prober = registry.get(protocol);
		let mut succeeded_this_protocol = false;

		for credential in &job.default_credentials {
			let result = prober
				.probe(&job.endpoint, credential, deadline, dialer, tracker, request_counter)
				.await;
			match result {
				Ok(probe_result) => {
					successes.push(Success {
						protocol: probe_result.actual_protocol.unwrap_or(protocol),
						credential: credential.clone(),
						info: IpInfo {
							isp: probe_result.isp,
							ip_type: probe_result.ip_type,
							country: probe_result.country,
						},
					});
					succeeded_this_protocol = true;
					break;
				},
				Err((kind, message)) => {
					let short_circuit = kind.is_unreachable_signal();
					observed_kinds.push(kind.clone());
					last_error = Some(message);
					last_error_kind = Some(kind);
					if short_circuit {
						endpoint_unreachable = true;
						break;
					}
				},
			}
		}

		if mode == Mode::Auto && succeeded_this_protocol {
			break;
		}
	}

	if successes.is_empty() {
		let kind = primary_failure_kind(&observed_kinds, last_error_kind);
		Outcome::Failure {
			endpoint: job.endpoint.clone(),
			kind,
			last_error: last_error.unwrap_or_default(),
		}
	} else {
		Outcome::Success { endpoint: job.endpoint.clone(), successes }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::parse::{Endpoint, SchemeHint};
	use crate::probers::ProbeResult;
	use async_trait::async_trait;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct ScriptedProber {
		attempts: AtomicUsize,
		results: Vec<Result<ProbeResult, (FailureKind, String)>>,
	}

	impl ScriptedProber {
		fn new(results: Vec<Result<ProbeResult, (FailureKind, String)>>) -> Arc<Self> {
			Arc::new(ScriptedProber { attempts: AtomicUsize::new(0), results })
		}
	}

	#[async_trait]
	impl Prober for ScriptedProber {
		async fn probe(
			&self,
			_endpoint: &Endpoint,
			_credential: &Credential,
			_deadline: Duration,
			_dialer: &Arc<dyn TargetDialer>,
			_tracker: &Arc<ConnTracker>,
			_request_counter: &AtomicU64,
		) -> Result<ProbeResult, (FailureKind, String)> {
			let i = self.attempts.fetch_add(1, Ordering::SeqCst);
			self.results.get(i).cloned().unwrap_or_else(|| Err((FailureKind::Other, "exhausted script".to_string())))
		}
	}

	fn endpoint() -> Endpoint {
		Endpoint {
			host: "198.51.100.5".to_string(),
			port: 9999,
			scheme_hint: SchemeHint::Unknown,
			inline_credential: None,
			raw: "198.51.100.5:9999".to_string(),
		}
	}

	fn dummy_dialer() -> Arc<dyn TargetDialer> {
		Arc::new(crate::dial::DirectDialer)
	}

	#[tokio::test]
	async fn refused_on_first_protocol_short_circuits_remaining() {
		let refused = ScriptedProber::new(vec![Err((FailureKind::Refused, "refused".to_string()))]);
		let never_called = ScriptedProber::new(vec![]);
		let registry = ProberRegistry {
			http: refused.clone(),
			https: never_called.clone(),
			socks5: never_called,
		};
		let job = Job {
			endpoint: endpoint(),
			default_credentials: vec![Credential::empty()],
			protocol_order: vec![Protocol::Http, Protocol::Https, Protocol::Socks5],
		};
		let tracker = ConnTracker::new();
		let dialer = dummy_dialer();
		let counter = AtomicU64::new(0);
		let outcome = run(&job, Mode::All, &registry, Duration::from_secs(1), &dialer, &tracker, &counter).await;
		match outcome {
			Outcome::Failure { kind, .. } => assert_eq!(kind, FailureKind::Refused),
			other => panic!("expected failure, got {other:?}"),
		}
		assert_eq!(refused.attempts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn auto_mode_stops_at_first_success() {
		let first_fails_then_succeeds = ScriptedProber::new(vec![
			Err((FailureKind::Auth, "bad creds".to_string())),
			Ok(ProbeResult {
				isp: "ExampleCorp".to_string(),
				ip_type: "isp".to_string(),
				country: "US".to_string(),
				http_status: 200,
				actual_protocol: None,
			}),
		]);
		let never_called = ScriptedProber::new(vec![]);
		let registry = ProberRegistry {
			http: first_fails_then_succeeds,
			https: never_called.clone(),
			socks5: never_called,
		};
		let job = Job {
			endpoint: endpoint(),
			default_credentials: vec![Credential::empty(), Credential { user: "u".to_string(), pass: "p".to_string() }],
			protocol_order: vec![Protocol::Http, Protocol::Https, Protocol::Socks5],
		};
		let tracker = ConnTracker::new();
		let dialer = dummy_dialer();
		let counter = AtomicU64::new(0);
		let outcome = run(&job, Mode::Auto, &registry, Duration::from_secs(1), &dialer, &tracker, &counter).await;
		match outcome {
			Outcome::Success { successes, .. } => assert_eq!(successes.len(), 1),
			other => panic!("expected success, got {other:?}"),
		}
	}
}
