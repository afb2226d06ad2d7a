//! C6 — IP-intel client: given an already-established connection through a
//! working proxy, issues one GET against the fixed intel URL and parses
//! the documented JSON shape (spec.md §4.4, §6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::time::timeout;

use crate::classify::FailureKind;
use crate::outcome::IpInfo;
use crate::transport::{self, BoxedStream};

pub const INTEL_HOST: &str = "ip-api.example.com";
pub const INTEL_PATH: &str = "/json";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const MAX_BODY_BYTES: usize = 32 * 1024;

#[derive(Deserialize)]
struct IntelEnvelope {
	ipapi: IntelBody,
	code: i64,
}

#[derive(Deserialize, Default)]
struct IntelBody {
	#[serde(default)]
	country: String,
	#[serde(default)]
	asn: IntelSubfields,
	#[serde(default)]
	company: IntelSubfields,
}

#[derive(Deserialize, Default)]
struct IntelSubfields {
	#[serde(default)]
	name: String,
	#[serde(rename = "type", default)]
	kind: String,
}

/// Sends one GET to the intel endpoint over `stream` and validates/parses
/// the response per spec.md §4.4/§6. Increments `request_counter` exactly
/// once, regardless of outcome (spec.md §4.3).
pub async fn fetch(
	stream: BoxedStream,
	deadline: Duration,
	request_counter: &AtomicU64,
) -> Result<(IpInfo, u16), (FailureKind, String)> {
	let io = TokioIo::new(stream);
	let handshake = hyper::client::conn::http1::handshake(io);
	let (mut sender, conn) = match timeout(deadline, handshake).await {
		Ok(Ok(pair)) => pair,
		Ok(Err(e)) => return Err((FailureKind::ConnectFail, e.to_string())),
		Err(_) => return Err((FailureKind::Timeout, "http handshake timed out".to_string())),
	};

	let req = http::Request::builder()
		.method(http::Method::GET)
		.uri(INTEL_PATH)
		.header(http::header::HOST, INTEL_HOST)
		.header(http::header::USER_AGENT, USER_AGENT)
		.body(Empty::<Bytes>::new())
		.expect("request builder with known-good parts should not fail");

	request_counter.fetch_add(1, Ordering::Relaxed);
	transport::drive_http1(conn, async move {
		let send = sender.send_request(req);
		let resp = match timeout(deadline, send).await {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => return Err((FailureKind::ConnectFail, e.to_string())),
			Err(_) => return Err((FailureKind::Timeout, "intel request timed out".to_string())),
		};

		let status = resp.status();
		if status != http::StatusCode::OK {
			return Err((FailureKind::IpInfo, format!("intel endpoint returned {status}")));
		}

		let collected = match timeout(deadline, resp.into_body().collect()).await {
			Ok(Ok(c)) => c,
			Ok(Err(e)) => return Err((FailureKind::IpInfo, e.to_string())),
			Err(_) => return Err((FailureKind::Timeout, "intel body read timed out".to_string())),
		};
		let body = collected.to_bytes();
		validate_and_parse(&body).map(|info| (info, status.as_u16()))
	})
	.await
}

/// Validates and extracts `(isp, ip_type, country)` from a raw intel-JSON
/// body (spec.md §4.4/§6), independent of how the bytes were fetched. Used
/// directly by `fetch` above and by the HTTP prober, which issues its GET
/// with proxy semantics (absolute-form URI, `Proxy-Authorization`) rather
/// than the plain request this module's `fetch` sends.
pub fn validate_and_parse(body: &[u8]) -> Result<IpInfo, (FailureKind, String)> {
	if body.len() > MAX_BODY_BYTES {
		return Err((FailureKind::IpInfo, "intel body too large".to_string()));
	}
	if !body.starts_with(b"{") {
		return Err((FailureKind::IpInfo, "intel body does not start with '{'".to_string()));
	}

	let parsed: IntelEnvelope =
		serde_json::from_slice(body).map_err(|e| (FailureKind::IpInfo, format!("invalid intel json: {e}")))?;
	if parsed.code != 200 || parsed.ipapi.country.is_empty() {
		return Err((FailureKind::IpInfo, "intel response missing code=200/country".to_string()));
	}

	let isp = if !parsed.ipapi.company.name.is_empty() {
		parsed.ipapi.company.name
	} else {
		parsed.ipapi.asn.name
	};
	let ip_type = if !parsed.ipapi.asn.kind.is_empty() {
		parsed.ipapi.asn.kind
	} else {
		parsed.ipapi.company.kind
	};

	Ok(IpInfo {
		isp: IpInfo::field(&isp),
		ip_type: IpInfo::field(&ip_type),
		country: parsed.ipapi.country,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_parses_documented_shape() {
		let json = r#"{"ipapi":{"country":"US","asn":{"name":"ExampleNet","type":"isp"},"company":{"name":"ExampleCorp","type":"business"}},"code":200}"#;
		let parsed: IntelEnvelope = serde_json::from_str(json).unwrap();
		assert_eq!(parsed.code, 200);
		assert_eq!(parsed.ipapi.country, "US");
		assert_eq!(parsed.ipapi.company.name, "ExampleCorp");
	}

	#[test]
	fn empty_isp_falls_back_to_asn_name() {
		let json = r#"{"ipapi":{"country":"US","asn":{"name":"ExampleNet","type":""},"company":{"name":"","type":""}},"code":200}"#;
		let parsed: IntelEnvelope = serde_json::from_str(json).unwrap();
		let isp = if !parsed.ipapi.company.name.is_empty() {
			parsed.ipapi.company.name.clone()
		} else {
			parsed.ipapi.asn.name.clone()
		};
		assert_eq!(isp, "ExampleNet");
	}
}
