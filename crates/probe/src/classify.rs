//! C4 — error classifier: maps low-level transport errors to the closed
//! `FailureKind` set, once, at the site that observed the error.

use std::fmt;
use std::io;

/// Closed set of coarse failure classifications, ordered by diagnostic
/// priority (index 0 is highest priority — see `FailureKind::priority`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
	Auth,
	IpInfo,
	Non204,
	ConnectFail,
	Tls,
	Timeout,
	Refused,
	Unreachable,
	Reset,
	Dial,
	Dns,
	Eof,
	HttpsToHttp,
	Other,
	BadLine,
	Cdn(String),
}

impl FailureKind {
	/// Position in the priority order from spec.md §3 (lower = higher
	/// priority). Used to pick the primary failure kind for an endpoint when
	/// multiple attempts failed with different kinds.
	pub fn priority(&self) -> u8 {
		match self {
			FailureKind::Auth => 0,
			FailureKind::IpInfo => 1,
			FailureKind::Non204 => 2,
			FailureKind::ConnectFail => 3,
			FailureKind::Tls => 4,
			FailureKind::Timeout => 5,
			FailureKind::Refused => 6,
			FailureKind::Unreachable => 7,
			FailureKind::Reset => 8,
			FailureKind::Dial => 9,
			FailureKind::Dns => 10,
			FailureKind::Eof => 11,
			FailureKind::HttpsToHttp => 12,
			FailureKind::Other => 13,
			FailureKind::BadLine => 14,
			FailureKind::Cdn(_) => 15,
		}
	}

	/// True for the kinds that abort the rest of an endpoint's protocol
	/// attempts (spec.md §4.5, §9 — cross-protocol short-circuit).
	pub fn is_unreachable_signal(&self) -> bool {
		matches!(
			self,
			FailureKind::Reset | FailureKind::Unreachable | FailureKind::Refused
		)
	}

	pub fn as_str(&self) -> String {
		match self {
			FailureKind::Auth => "auth".to_string(),
			FailureKind::IpInfo => "ipinfo".to_string(),
			FailureKind::Non204 => "non204".to_string(),
			FailureKind::ConnectFail => "connect_fail".to_string(),
			FailureKind::Tls => "tls".to_string(),
			FailureKind::Timeout => "timeout".to_string(),
			FailureKind::Refused => "refused".to_string(),
			FailureKind::Unreachable => "unreachable".to_string(),
			FailureKind::Reset => "reset".to_string(),
			FailureKind::Dial => "dial".to_string(),
			FailureKind::Dns => "dns".to_string(),
			FailureKind::Eof => "eof".to_string(),
			FailureKind::HttpsToHttp => "https_to_http".to_string(),
			FailureKind::Other => "other".to_string(),
			FailureKind::BadLine => "bad_line".to_string(),
			FailureKind::Cdn(provider) => format!("cdn_{provider}"),
		}
	}
}

impl fmt::Display for FailureKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.as_str())
	}
}

/// Picks the primary failure kind for an endpoint from the multiset of
/// kinds observed across its attempts, per spec.md §4.5/§9: priority order
/// first, then insertion order as the tie-break (so behavior is
/// deterministic given the same sequence of attempts).
pub fn primary_failure_kind(observed: &[FailureKind], last_error_kind: Option<FailureKind>) -> FailureKind {
	observed
		.iter()
		.min_by_key(|k| k.priority())
		.cloned()
		.or(last_error_kind)
		.unwrap_or(FailureKind::Other)
}

/// Classifies a raw I/O error observed while dialing or reading/writing a
/// probe's socket.
pub fn classify_io_error(err: &io::Error) -> FailureKind {
	use io::ErrorKind::*;
	match err.kind() {
		TimedOut => FailureKind::Timeout,
		ConnectionRefused => FailureKind::Refused,
		ConnectionReset => FailureKind::Reset,
		ConnectionAborted => FailureKind::Reset,
		UnexpectedEof => FailureKind::Eof,
		HostUnreachable | NetworkUnreachable | AddrNotAvailable => FailureKind::Unreachable,
		_ => {
			let msg = err.to_string();
			classify_message(&msg).unwrap_or(FailureKind::Other)
		},
	}
}

/// Classifies a TLS handshake failure. Separate from `classify_io_error`
/// because rustls/tokio-rustls surface handshake failures as a wrapped
/// `io::Error` whose message, not `.kind()`, carries the useful signal — in
/// particular the "peer spoke plaintext HTTP" signature the HTTPS-tunnel
/// prober (C5.2) uses to decide whether to retry as HTTP.
pub fn classify_tls_error(err: &io::Error) -> FailureKind {
	if is_plaintext_peer_signature(&err.to_string()) {
		return FailureKind::Tls;
	}
	classify_message(&err.to_string()).unwrap_or(FailureKind::Tls)
}

/// True when a TLS handshake failure's message matches one of the known
/// "the peer actually spoke plaintext HTTP" signatures (spec.md §4.3.2).
pub fn is_plaintext_peer_signature(msg: &str) -> bool {
	const SIGNATURES: &[&str] = &[
		"server gave http response to https client",
		"first record does not look like a tls handshake",
		"handshake failure",
		"internal error",
	];
	let lower = msg.to_ascii_lowercase();
	SIGNATURES.iter().any(|s| lower.contains(s))
}

fn classify_message(msg: &str) -> Option<FailureKind> {
	let lower = msg.to_ascii_lowercase();
	if lower.contains("timed out") || lower.contains("timeout") {
		Some(FailureKind::Timeout)
	} else if lower.contains("refused") {
		Some(FailureKind::Refused)
	} else if lower.contains("reset") {
		Some(FailureKind::Reset)
	} else if lower.contains("unreachable") {
		Some(FailureKind::Unreachable)
	} else if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
		Some(FailureKind::Dns)
	} else if lower.contains("eof") {
		Some(FailureKind::Eof)
	} else {
		None
	}
}

/// Classifies an HTTP status code returned directly by a probed proxy
/// (spec.md §4.3.1: 407/401 map to `auth`).
pub fn classify_http_status(status: u16) -> Option<FailureKind> {
	match status {
		401 | 407 => Some(FailureKind::Auth),
		200 => None,
		_ => Some(FailureKind::ConnectFail),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifying_same_error_twice_is_deterministic() {
		let e1 = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
		let e2 = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
		assert_eq!(classify_io_error(&e1), classify_io_error(&e2));
	}

	#[test]
	fn priority_order_is_deterministic_regardless_of_insertion() {
		let observed = vec![FailureKind::Timeout, FailureKind::Auth, FailureKind::Reset];
		assert_eq!(primary_failure_kind(&observed, None), FailureKind::Auth);
	}

	#[test]
	fn falls_back_to_last_error_then_other() {
		assert_eq!(
			primary_failure_kind(&[], Some(FailureKind::Dns)),
			FailureKind::Dns
		);
		assert_eq!(primary_failure_kind(&[], None), FailureKind::Other);
	}

	#[test]
	fn plaintext_signature_detection_is_case_insensitive() {
		assert!(is_plaintext_peer_signature(
			"Server Gave HTTP Response To HTTPS Client"
		));
		assert!(!is_plaintext_peer_signature("certificate expired"));
	}
}
