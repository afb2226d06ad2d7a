//! C5.3 — SOCKS5 prober (spec.md §4.3.3): RFC 1928/1929 handshake to the
//! endpoint, CONNECT to the intel host, then an outer TLS layer for the
//! intel host before C6 runs. The handshake itself runs entirely inline
//! (`wire::socks5`) — the critical no-background-task rule this design
//! exists to enforce.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use async_trait::async_trait;
use tokio_rustls::TlsConnector;

use crate::classify::{FailureKind, classify_tls_error};
use crate::dial::TargetDialer;
use crate::intel::{self, INTEL_HOST};
use crate::parse::{Credential, Endpoint};
use crate::transport::{ConnTracker, insecure_tls_config};
use crate::wire::socks5 as socks5_wire;

use super::{ProbeResult, Prober};

const INTEL_PORT: u16 = 443;

pub struct Socks5Prober;

#[async_trait]
impl Prober for Socks5Prober {
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
		let mut tcp = dialer.dial(tracker, &endpoint.host, endpoint.port, connect_deadline).await?;

		socks5_wire::connect(&mut tcp, credential, INTEL_HOST, INTEL_PORT, deadline).await?;

		let tls_config = insecure_tls_config();
		let connector = TlsConnector::from(tls_config);
		let server_name = rustls_pki_types::ServerName::try_from(INTEL_HOST)
			.map_err(|e| (FailureKind::Tls, e.to_string()))?;
		let tls = match tokio::time::timeout(deadline, connector.connect(server_name, tcp)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => return Err((classify_tls_error(&e), e.to_string())),
			Err(_) => return Err((FailureKind::Timeout, "tls handshake to intel host timed out".to_string())),
		};

		let (info, status) = intel::fetch(Box::new(tls), deadline, request_counter).await?;
		Ok(ProbeResult {
			isp: info.isp,
			ip_type: info.ip_type,
			country: info.country,
			http_status: status,
			actual_protocol: None,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dial::DirectDialer;
	use crate::parse::SchemeHint;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;

	#[tokio::test]
	async fn refused_connect_reply_short_circuits_before_tls() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut greeting = [0u8; 2];
			stream.read_exact(&mut greeting).await.unwrap();
			let mut methods = vec![0u8; greeting[1] as usize];
			stream.read_exact(&mut methods).await.unwrap();
			stream.write_all(&[0x05, 0x00]).await.unwrap();
			let mut head = [0u8; 4];
			stream.read_exact(&mut head).await.unwrap();
			let mut len_byte = [0u8; 1];
			stream.read_exact(&mut len_byte).await.unwrap();
			let mut domain = vec![0u8; len_byte[0] as usize];
			stream.read_exact(&mut domain).await.unwrap();
			let mut port = [0u8; 2];
			stream.read_exact(&mut port).await.unwrap();
			stream
				.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
				.await
				.unwrap();
		});

		let prober = Socks5Prober;
		let endpoint = Endpoint {
			host: addr.ip().to_string(),
			port: addr.port(),
			scheme_hint: SchemeHint::Socks5,
			inline_credential: None,
			raw: addr.to_string(),
		};
		let tracker = ConnTracker::new();
		let dialer: Arc<dyn TargetDialer> = Arc::new(DirectDialer);
		let counter = AtomicU64::new(0);
		let result = prober
			.probe(&endpoint, &Credential::empty(), Duration::from_secs(2), &dialer, &tracker, &counter)
			.await;
		assert_eq!(result.unwrap_err().0, FailureKind::Refused);
	}
}
