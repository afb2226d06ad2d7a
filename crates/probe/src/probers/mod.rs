//! C5 — shared prober contract (spec.md §4.3). Three implementations
//! (http, https, socks5) each hand back either a validated `ProbeResult` or
//! the `FailureKind` that ended the attempt.

pub mod http;
pub mod https;
pub mod socks5;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use async_trait::async_trait;

use crate::classify::FailureKind;
use crate::dial::TargetDialer;
use crate::parse::{Credential, Endpoint, Protocol};
use crate::transport::ConnTracker;

/// What C6 produced, plus the HTTP status observed on the probed proxy
/// itself (spec.md §4.3: `ProbeResult` carries `(isp, ip_type, country,
/// http_status)`).
#[derive(Debug, Clone)]
pub struct ProbeResult {
	pub isp: String,
	pub ip_type: String,
	pub country: String,
	pub http_status: u16,
	/// Set when the protocol that actually succeeded differs from the one
	/// the caller invoked, e.g. the HTTPS-tunnel prober falling back to
	/// plain HTTP (spec.md §4.3.2 / §8 scenario S3). `None` means the
	/// invoked protocol is the protocol that succeeded.
	pub actual_protocol: Option<Protocol>,
}

/// One protocol's probe implementation. `dialer` resolves to either a
/// direct TCP connect or a dial through the configured upstream proxy
/// (spec.md §4.3.4); `request_counter` is incremented exactly once per HTTP
/// request issued (spec.md §4.3).
#[async_trait]
pub trait Prober: Send + Sync {
	async fn probe(
		&self,
		endpoint: &Endpoint,
		credential: &Credential,
		deadline: Duration,
		dialer: &Arc<dyn TargetDialer>,
		tracker: &Arc<ConnTracker>,
		request_counter: &AtomicU64,
	) -> Result<ProbeResult, (FailureKind, String)>;
}
