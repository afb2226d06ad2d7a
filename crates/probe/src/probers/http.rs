//! C5.1 — HTTP prober (spec.md §4.3.1): treats the endpoint as a plain HTTP
//! proxy and issues an absolute-form request for the intel URL directly to
//! it, with `Proxy-Authorization` carrying the credential under test.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use tokio::time::timeout;

use crate::classify::{FailureKind, classify_http_status};
use crate::dial::TargetDialer;
use crate::intel::{INTEL_HOST, INTEL_PATH, validate_and_parse};
use crate::parse::{Credential, Endpoint};
use crate::transport::ConnTracker;

use super::{ProbeResult, Prober};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const MAX_BODY_BYTES: usize = 32 * 1024;

pub struct HttpProber;

#[async_trait]
impl Prober for HttpProber {
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
		let stream = dialer.dial(tracker, &endpoint.host, endpoint.port, connect_deadline).await?;

		let io = TokioIo::new(stream);
		let handshake = hyper::client::conn::http1::handshake(io);
		let (mut sender, conn) = match timeout(deadline, handshake).await {
			Ok(Ok(pair)) => pair,
			Ok(Err(e)) => return Err((FailureKind::ConnectFail, e.to_string())),
			Err(_) => return Err((FailureKind::Timeout, "http handshake timed out".to_string())),
		};

		let mut builder = http::Request::builder()
			.method(http::Method::GET)
			.uri(format!("http://{INTEL_HOST}{INTEL_PATH}"))
			.header(http::header::HOST, INTEL_HOST)
			.header(http::header::USER_AGENT, USER_AGENT);
		if !credential.is_empty() {
			let token = base64::Engine::encode(
				&base64::engine::general_purpose::STANDARD,
				format!("{}:{}", credential.user, credential.pass),
			);
			builder = builder.header(http::header::PROXY_AUTHORIZATION, format!("Basic {token}"));
		}
		let req = builder
			.body(Empty::<Bytes>::new())
			.expect("request builder with known-good parts should not fail");

		request_counter.fetch_add(1, Ordering::Relaxed);
		crate::transport::drive_http1(conn, async move {
			let send = sender.send_request(req);
			let resp = match timeout(deadline, send).await {
				Ok(Ok(resp)) => resp,
				Ok(Err(e)) => return Err((FailureKind::ConnectFail, e.to_string())),
				Err(_) => return Err((FailureKind::Timeout, "http proxy request timed out".to_string())),
			};

			let status = resp.status().as_u16();
			if let Some(kind) = classify_http_status(status) {
				return Err((kind, format!("proxy returned {status}")));
			}

			let collected = match timeout(deadline, resp.into_body().collect()).await {
				Ok(Ok(c)) => c,
				Ok(Err(e)) => return Err((FailureKind::IpInfo, e.to_string())),
				Err(_) => return Err((FailureKind::Timeout, "intel body read timed out".to_string())),
			};
			let body = collected.to_bytes();
			if body.len() > MAX_BODY_BYTES {
				return Err((FailureKind::IpInfo, "intel body too large".to_string()));
			}
			let info = validate_and_parse(&body)?;

			Ok(ProbeResult {
				isp: info.isp,
				ip_type: info.ip_type,
				country: info.country,
				http_status: status,
				actual_protocol: None,
			})
		})
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Mode;
	use crate::dial::DirectDialer;
	use crate::parse::{SchemeHint, parse};
	use tokio::net::TcpListener;

	fn endpoint_for(addr: std::net::SocketAddr) -> Endpoint {
		let job = parse(&format!("{addr}"), None, &[], Mode::Http).unwrap().unwrap();
		Endpoint { scheme_hint: SchemeHint::Http, ..job.endpoint }
	}

	#[tokio::test]
	async fn proxy_auth_required_maps_to_auth_failure() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 1024];
			let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
			let _ = tokio::io::AsyncWriteExt::write_all(
				&mut stream,
				b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n",
			)
			.await;
		});

		let prober = HttpProber;
		let endpoint = endpoint_for(addr);
		let tracker = ConnTracker::new();
		let dialer: Arc<dyn TargetDialer> = Arc::new(DirectDialer);
		let counter = AtomicU64::new(0);
		let result = prober
			.probe(&endpoint, &Credential::empty(), Duration::from_secs(2), &dialer, &tracker, &counter)
			.await;
		assert_eq!(result.unwrap_err().0, FailureKind::Auth);
		assert_eq!(counter.load(Ordering::Relaxed), 1);
	}
}
