//! C5.2 — HTTPS-tunnel prober (spec.md §4.3.2): TLS-handshakes to the
//! endpoint itself (SNI = endpoint host, verification disabled), issues a
//! `CONNECT` for the intel host, then layers a second TLS session for the
//! intel host over the tunnel before handing off to C6.
//!
//! Falls back to the HTTP prober once if the first TLS handshake's failure
//! looks like the peer actually spoke plaintext HTTP (spec.md §4.3.2).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_rustls::TlsConnector;

use crate::classify::{FailureKind, classify_tls_error, is_plaintext_peer_signature};
use crate::dial::TargetDialer;
use crate::intel::{self, INTEL_HOST};
use crate::parse::{Credential, Endpoint};
use crate::transport::{ConnTracker, insecure_tls_config};
use crate::wire::connect;

use super::http::HttpProber;
use super::{ProbeResult, Prober};

const INTEL_PORT: u16 = 443;

pub struct HttpsProber;

#[async_trait]
impl Prober for HttpsProber {
	async fn probe(
		&self,
		endpoint: &Endpoint,
		credential: &Credential,
		deadline: Duration,
		dialer: &Arc<dyn TargetDialer>,
		tracker: &Arc<ConnTracker>,
		request_counter: &AtomicU64,
	) -> Result<ProbeResult, (FailureKind, String)> {
		let connect_deadline = deadline / 2;
		let tcp = dialer.dial(tracker, &endpoint.host, endpoint.port, connect_deadline).await?;

		let tls_config = insecure_tls_config();
		let connector = TlsConnector::from(tls_config);
		let server_name = rustls_pki_types::ServerName::try_from(endpoint.host.clone())
			.map_err(|e| (FailureKind::Tls, e.to_string()))?;

		let mut proxy_tls = match tokio::time::timeout(connect_deadline, connector.connect(server_name, tcp)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => {
				let kind = classify_tls_error(&e);
				if is_plaintext_peer_signature(&e.to_string()) {
					return self.fallback_to_http(endpoint, credential, deadline, dialer, tracker, request_counter).await.map_err(
						|_| (FailureKind::HttpsToHttp, e.to_string()),
					);
				}
				return Err((kind, e.to_string()));
			},
			Err(_) => return Err((FailureKind::Timeout, "tls handshake to endpoint timed out".to_string())),
		};

		request_counter.fetch_add(1, Ordering::Relaxed);
		if let Err((kind, msg)) = connect::connect(&mut proxy_tls, INTEL_HOST, INTEL_PORT, credential, deadline).await {
			if is_plaintext_peer_signature(&msg) {
				return self
					.fallback_to_http(endpoint, credential, deadline, dialer, tracker, request_counter)
					.await
					.map_err(|_| (FailureKind::HttpsToHttp, msg));
			}
			return Err((kind, msg));
		}

		let intel_tls_config = insecure_tls_config();
		let intel_connector = TlsConnector::from(intel_tls_config);
		let intel_name = rustls_pki_types::ServerName::try_from(INTEL_HOST)
			.map_err(|e| (FailureKind::Tls, e.to_string()))?;
		let intel_tls = match tokio::time::timeout(deadline, intel_connector.connect(intel_name, proxy_tls)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => return Err((classify_tls_error(&e), e.to_string())),
			Err(_) => return Err((FailureKind::Timeout, "tls handshake to intel host timed out".to_string())),
		};

		let (info, status) = intel::fetch(Box::new(intel_tls), deadline, request_counter).await?;
		Ok(ProbeResult {
			isp: info.isp,
			ip_type: info.ip_type,
			country: info.country,
			http_status: status,
			actual_protocol: None,
		})
	}
}

impl HttpsProber {
	/// Delegates to the HTTP prober and marks the result as having actually
	/// succeeded over plain HTTP, so callers print `http://`, not `https://`
	/// (spec.md §8 scenario S3), even though this method was invoked as the
	/// https prober.
	async fn fallback_to_http(
		&self,
		endpoint: &Endpoint,
		credential: &Credential,
		deadline: Duration,
		dialer: &Arc<dyn TargetDialer>,
		tracker: &Arc<ConnTracker>,
		request_counter: &AtomicU64,
	) -> Result<ProbeResult, (FailureKind, String)> {
		let mut result = HttpProber.probe(endpoint, credential, deadline, dialer, tracker, request_counter).await?;
		result.actual_protocol = Some(crate::parse::Protocol::Http);
		Ok(result)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Mode;
	use crate::dial::DirectDialer;
	use crate::parse::{Protocol, SchemeHint, parse};
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;

	#[test]
	fn plaintext_signature_drives_fallback_decision() {
		assert!(is_plaintext_peer_signature(
			"server gave HTTP response to HTTPS client"
		));
	}

	/// S3: falling back to plain HTTP must label the result as having
	/// succeeded over http, not https, regardless of which prober was
	/// originally invoked.
	#[tokio::test]
	async fn fallback_to_http_labels_result_as_http() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 1024];
			let _ = stream.read(&mut buf).await;
			let body = br#"{"ipapi":{"country":"US","asn":{"name":"ExampleNet","type":"isp"},"company":{"name":"","type":""}},"code":200}"#;
			let response = format!(
				"HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n",
				body.len()
			);
			stream.write_all(response.as_bytes()).await.unwrap();
			stream.write_all(body).await.unwrap();
		});

		let job = parse(&format!("{addr}"), None, &[], Mode::Https).unwrap().unwrap();
		let endpoint = Endpoint { scheme_hint: SchemeHint::Https, ..job.endpoint };
		let tracker = ConnTracker::new();
		let dialer: Arc<dyn TargetDialer> = Arc::new(DirectDialer);
		let counter = AtomicU64::new(0);

		let result = HttpsProber
			.fallback_to_http(&endpoint, &Credential::empty(), Duration::from_secs(2), &dialer, &tracker, &counter)
			.await
			.unwrap();
		assert_eq!(result.actual_protocol, Some(Protocol::Http));
	}
}
