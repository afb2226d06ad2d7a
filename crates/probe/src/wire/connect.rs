//! HTTP `CONNECT` tunnel establishment on an already-open stream. Shared by
//! the HTTPS-tunnel prober (spec.md §4.3.2) and by an `UpstreamDialer`
//! configured in http/https mode (spec.md §4.3.4) — both need exactly the
//! same "ask the peer to open a raw tunnel to some other host:port" step.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Duration, timeout};

use crate::classify::{FailureKind, classify_http_status};
use crate::parse::Credential;

const MAX_HEADER_BYTES: usize = 4 * 1024;
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Sends `CONNECT target_host:target_port HTTP/1.1` and reads the status
/// line + header block. Leaves the stream positioned right after the
/// terminating blank line on success, ready to carry tunneled bytes.
pub async fn connect<S>(
	stream: &mut S,
	target_host: &str,
	target_port: u16,
	credential: &Credential,
	deadline: Duration,
) -> Result<(), (FailureKind, String)>
where
	S: AsyncReadExt + AsyncWriteExt + Unpin,
{
	timeout(deadline, do_connect(stream, target_host, target_port, credential))
		.await
		.map_err(|_| (FailureKind::Timeout, "http connect tunnel timed out".to_string()))?
}

async fn do_connect<S>(
	stream: &mut S,
	target_host: &str,
	target_port: u16,
	credential: &Credential,
) -> Result<(), (FailureKind, String)>
where
	S: AsyncReadExt + AsyncWriteExt + Unpin,
{
	let mut request = format!(
		"CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\nUser-Agent: {USER_AGENT}\r\n"
	);
	if !credential.is_empty() {
		let token = base64::Engine::encode(
			&base64::engine::general_purpose::STANDARD,
			format!("{}:{}", credential.user, credential.pass),
		);
		request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
	}
	request.push_str("\r\n");

	stream
		.write_all(request.as_bytes())
		.await
		.map_err(|e| (crate::classify::classify_io_error(&e), e.to_string()))?;

	let (status, _headers) = read_status_and_headers(stream).await?;
	match status {
		200 => Ok(()),
		other => match classify_http_status(other) {
			Some(kind) => Err((kind, format!("proxy CONNECT returned {other}"))),
			None => Ok(()),
		},
	}
}

/// Reads a status line + header block byte-at-a-time up to
/// `MAX_HEADER_BYTES`, stopping at the blank-line terminator.
async fn read_status_and_headers<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<(u16, String), (FailureKind, String)> {
	let mut buf = Vec::with_capacity(512);
	let mut byte = [0u8; 1];
	loop {
		if buf.len() >= MAX_HEADER_BYTES {
			return Err((FailureKind::ConnectFail, "proxy response headers exceeded 4 KiB".to_string()));
		}
		let n = stream
			.read(&mut byte)
			.await
			.map_err(|e| (crate::classify::classify_io_error(&e), e.to_string()))?;
		if n == 0 {
			return Err((FailureKind::Eof, "connection closed while reading proxy response".to_string()));
		}
		buf.push(byte[0]);
		if buf.ends_with(b"\r\n\r\n") {
			break;
		}
	}
	let text = String::from_utf8_lossy(&buf).into_owned();
	let status_line = text.lines().next().unwrap_or_default();
	let status = parse_status_line(status_line)?;
	Ok((status, text))
}

/// Accepts `HTTP/1.0 200 ...` or `HTTP/1.1 200 ...`, case-insensitively, per
/// spec.md §4.3.2.
fn parse_status_line(line: &str) -> Result<u16, (FailureKind, String)> {
	let mut parts = line.split_whitespace();
	let version = parts.next().unwrap_or_default();
	if !version.eq_ignore_ascii_case("HTTP/1.0") && !version.eq_ignore_ascii_case("HTTP/1.1") {
		return Err((FailureKind::ConnectFail, format!("unexpected proxy response: {line}")));
	}
	let code = parts
		.next()
		.ok_or_else(|| (FailureKind::ConnectFail, format!("malformed status line: {line}")))?;
	code
		.parse::<u16>()
		.map_err(|_| (FailureKind::ConnectFail, format!("non-numeric status code: {code}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn successful_connect_reply_is_accepted() {
		let (mut client, mut server) = duplex(4096);
		tokio::spawn(async move {
			let mut buf = [0u8; 512];
			let _ = server.read(&mut buf).await.unwrap();
			server.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();
		});
		let result = connect(&mut client, "intel.example", 443, &Credential::empty(), Duration::from_secs(1)).await;
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn auth_required_reply_maps_to_auth() {
		let (mut client, mut server) = duplex(4096);
		tokio::spawn(async move {
			let mut buf = [0u8; 512];
			let _ = server.read(&mut buf).await.unwrap();
			server.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await.unwrap();
		});
		let result = connect(&mut client, "intel.example", 443, &Credential::empty(), Duration::from_secs(1)).await;
		assert_eq!(result.unwrap_err().0, FailureKind::Auth);
	}

	#[test]
	fn status_line_accepts_http_1_0_case_insensitively() {
		assert_eq!(parse_status_line("http/1.0 200 ok").unwrap(), 200);
	}
}
