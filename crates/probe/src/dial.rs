//! Target dialing, direct or through a configured upstream proxy
//! (spec.md §4.3.4). Every prober asks a `TargetDialer` for a stream to the
//! endpoint instead of calling `TcpStream::connect` itself, so upstream
//! chaining is transparent to C5.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;

use crate::classify::FailureKind;
use crate::config::{UpstreamConfig, UpstreamMode};
use crate::parse::Credential;
use crate::transport::{BoxedStream, ConnTracker, dial_and_track, insecure_tls_config};
use crate::wire::{connect, socks5};

#[async_trait]
pub trait TargetDialer: Send + Sync {
	async fn dial(
		&self,
		tracker: &Arc<ConnTracker>,
		target_host: &str,
		target_port: u16,
		deadline: Duration,
	) -> Result<BoxedStream, (FailureKind, String)>;
}

/// Dials straight to the target. The default when no upstream is configured.
pub struct DirectDialer;

#[async_trait]
impl TargetDialer for DirectDialer {
	async fn dial(
		&self,
		tracker: &Arc<ConnTracker>,
		target_host: &str,
		target_port: u16,
		deadline: Duration,
	) -> Result<BoxedStream, (FailureKind, String)> {
		let addr = resolve(target_host, target_port).await?;
		let stream = dial_and_track(tracker, addr, deadline).await?;
		Ok(Box::new(stream))
	}
}

/// Dials through a fixed upstream proxy, built once at startup and shared
/// read-only across all probes (spec.md §4.3.4). `mode` selects which of
/// the three tunnel-establishment protocols is used to reach the target
/// through the upstream; none of them run the IP-intel step, they only
/// establish a raw byte tunnel.
pub struct UpstreamDialer {
	config: UpstreamConfig,
}

impl UpstreamDialer {
	pub fn new(config: UpstreamConfig) -> Arc<Self> {
		Arc::new(UpstreamDialer { config })
	}
}

#[async_trait]
impl TargetDialer for UpstreamDialer {
	async fn dial(
		&self,
		tracker: &Arc<ConnTracker>,
		target_host: &str,
		target_port: u16,
		deadline: Duration,
	) -> Result<BoxedStream, (FailureKind, String)> {
		let addr = resolve(&self.config.host, self.config.port).await?;
		let credential = self.config.credential.clone().unwrap_or_default();

		match self.config.mode {
			UpstreamMode::Http => {
				let mut stream = dial_and_track(tracker, addr, deadline).await?;
				connect::connect(&mut stream, target_host, target_port, &credential, deadline).await?;
				Ok(Box::new(stream))
			},
			UpstreamMode::Https => {
				let tcp = dial_and_track(tracker, addr, deadline).await?;
				let tls_config = insecure_tls_config();
				let connector = tokio_rustls::TlsConnector::from(tls_config);
				let server_name = rustls_pki_types::ServerName::try_from(self.config.host.clone())
					.map_err(|e| (FailureKind::Tls, e.to_string()))?;
				let mut tls = tokio::time::timeout(deadline, connector.connect(server_name, tcp))
					.await
					.map_err(|_| (FailureKind::Timeout, "upstream tls handshake timed out".to_string()))?
					.map_err(|e| (crate::classify::classify_tls_error(&e), e.to_string()))?;
				connect::connect(&mut tls, target_host, target_port, &credential, deadline).await?;
				Ok(Box::new(tls))
			},
			UpstreamMode::Socks5 => {
				let mut stream = dial_and_track(tracker, addr, deadline).await?;
				socks5::connect(&mut stream, &credential, target_host, target_port, deadline).await?;
				Ok(Box::new(stream))
			},
		}
	}
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, (FailureKind, String)> {
	if let Ok(ip) = host.parse::<std::net::IpAddr>() {
		return Ok(SocketAddr::new(ip, port));
	}
	lookup_host((host, port))
		.await
		.map_err(|e| (FailureKind::Dns, e.to_string()))?
		.next()
		.ok_or_else(|| (FailureKind::Dns, format!("no addresses resolved for {host}")))
}
