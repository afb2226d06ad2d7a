//! Shared transport plumbing for the three protocol probers (C5): a fresh,
//! tracked TCP dial with keep-alive disabled and abortive close, an
//! insecure-by-design TLS client config, and the conn-tracker that proves
//! (spec.md §8 property 4) that no socket opened inside a probe outlives
//! that probe's `Outcome`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::classify::{FailureKind, classify_io_error};

/// Counts sockets opened vs. closed by probes run against it. One instance
/// is shared for the whole process; each probe's sockets are tracked
/// through it, and tests assert `opened() == closed()` after a batch of
/// probes completes (spec.md §8 property 4).
#[derive(Default)]
pub struct ConnTracker {
	opened: AtomicU64,
	closed: AtomicU64,
}

impl ConnTracker {
	pub fn new() -> Arc<Self> {
		Arc::new(ConnTracker::default())
	}

	pub fn opened(&self) -> u64 {
		self.opened.load(Ordering::SeqCst)
	}

	pub fn closed(&self) -> u64 {
		self.closed.load(Ordering::SeqCst)
	}

	pub fn all_closed(&self) -> bool {
		self.opened() == self.closed()
	}

	fn track(self: &Arc<Self>, inner: TcpStream) -> TrackedStream {
		self.opened.fetch_add(1, Ordering::SeqCst);
		TrackedStream {
			inner,
			tracker: self.clone(),
		}
	}
}

pin_project! {
	/// A `TcpStream` registered with a `ConnTracker`; reports itself closed
	/// on drop regardless of which exit path (success, error, or the
	/// deadline future being dropped on timeout) triggered it.
	pub struct TrackedStream {
		#[pin]
		inner: TcpStream,
		tracker: Arc<ConnTracker>,
	}
}

impl Drop for TrackedStream {
	fn drop(&mut self) {
		self.tracker.closed.fetch_add(1, Ordering::SeqCst);
	}
}

impl AsyncRead for TrackedStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_read(cx, buf)
	}
}

impl AsyncWrite for TrackedStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		self.project().inner.poll_write(cx, buf)
	}
	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_flush(cx)
	}
	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_shutdown(cx)
	}
}

/// Object-safe marker trait so a tracked plain stream and a tracked TLS
/// stream can share one boxed type through the rest of a prober.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Dials a fresh TCP connection to `addr`, disables keep-alive, and arms
/// `SO_LINGER(on, 0)` so the socket RSTs on close instead of lingering in
/// TIME_WAIT (spec.md §4.3 shared prober rules), via `socket2::SockRef`
/// borrowing the still-owned tokio socket's fd. Registers the socket with
/// `tracker` before returning it.
pub async fn dial_and_track(
	tracker: &Arc<ConnTracker>,
	addr: SocketAddr,
	deadline: Duration,
) -> Result<TrackedStream, (FailureKind, String)> {
	let connect = TcpStream::connect(addr);
	let stream = match timeout(deadline, connect).await {
		Ok(Ok(stream)) => stream,
		Ok(Err(e)) => return Err((classify_io_error(&e), e.to_string())),
		Err(_) => return Err((FailureKind::Timeout, "connect timed out".to_string())),
	};
	apply_socket_options(&stream).map_err(|e| (classify_io_error(&e), e.to_string()))?;
	Ok(tracker.track(stream))
}

fn apply_socket_options(stream: &TcpStream) -> io::Result<()> {
	let sock = socket2::SockRef::from(stream);
	sock.set_linger(Some(Duration::ZERO))?;
	sock.set_keepalive(false)?;
	stream.set_nodelay(true)?;
	Ok(())
}

/// Drives a hyper HTTP/1 `Connection` future alongside `work` instead of
/// handing it to a background task, so a probe that returns never leaves
/// anything still polling its socket (spec.md §193/§246 — no probe may leave
/// a background task alive, and no socket it opened may be observable once
/// its `Outcome` is enqueued). If the connection finishes before `work`
/// does, the peer closed (or the connection errored) before the request
/// completed, which is itself a failure.
pub async fn drive_http1<C, F, T>(conn: C, work: F) -> Result<T, (FailureKind, String)>
where
	C: Future<Output = hyper::Result<()>>,
	F: Future<Output = Result<T, (FailureKind, String)>>,
{
	tokio::pin!(conn);
	tokio::pin!(work);
	tokio::select! {
		res = &mut conn => match res {
			Ok(()) => Err((FailureKind::Eof, "proxy connection closed before response completed".to_string())),
			Err(e) => Err((FailureKind::ConnectFail, e.to_string())),
		},
		out = &mut work => out,
	}
}

/// An insecure-by-design `rustls::ClientConfig`: probing, not trusting
/// (spec.md §4.3.2). Certificate verification is fully disabled.
pub fn insecure_tls_config() -> Arc<rustls::ClientConfig> {
	let mut config = rustls::ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(NoVerify))
		.with_no_client_auth();
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	Arc::new(config)
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls_pki_types::CertificateDer<'_>,
		_intermediates: &[rustls_pki_types::CertificateDer<'_>],
		_server_name: &rustls_pki_types::ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls_pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &rustls_pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &rustls_pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		vec![
			rustls::SignatureScheme::RSA_PKCS1_SHA256,
			rustls::SignatureScheme::RSA_PKCS1_SHA384,
			rustls::SignatureScheme::RSA_PKCS1_SHA512,
			rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
			rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA256,
			rustls::SignatureScheme::RSA_PSS_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA512,
			rustls::SignatureScheme::ED25519,
		]
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::net::TcpListener;

	#[tokio::test]
	async fn dial_tracks_open_and_close() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let _ = listener.accept().await;
		});

		let tracker = ConnTracker::new();
		{
			let _stream = dial_and_track(&tracker, addr, Duration::from_secs(1)).await.unwrap();
			assert_eq!(tracker.opened(), 1);
			assert_eq!(tracker.closed(), 0);
		}
		assert_eq!(tracker.closed(), 1);
		assert!(tracker.all_closed());
	}

	#[tokio::test]
	async fn dial_to_closed_port_is_refused_or_times_out() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let tracker = ConnTracker::new();
		let result = dial_and_track(&tracker, addr, Duration::from_millis(500)).await;
		assert!(result.is_err());
	}
}
