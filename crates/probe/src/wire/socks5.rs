//! RFC 1928/1929 SOCKS5 client handshake, written to run entirely inline on
//! the caller's own task: no spawned background task ever holds a socket
//! past the handshake (spec.md §4.3.3/§9 — the goroutine-leak origin this
//! whole design protects against). Used both by the SOCKS5 prober and by an
//! `UpstreamDialer` configured in socks5 mode.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Duration, timeout};

use crate::classify::FailureKind;
use crate::parse::Credential;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Runs the full method-negotiation + optional auth + CONNECT sequence on
/// an already-open `stream`. On success the stream is left positioned right
/// after the CONNECT reply, ready to carry the tunneled bytes.
pub async fn connect<S>(
	stream: &mut S,
	credential: &Credential,
	target_host: &str,
	target_port: u16,
	deadline: Duration,
) -> Result<(), (FailureKind, String)>
where
	S: AsyncReadExt + AsyncWriteExt + Unpin,
{
	timeout(deadline, handshake(stream, credential, target_host, target_port))
		.await
		.map_err(|_| (FailureKind::Timeout, "socks5 handshake timed out".to_string()))?
}

async fn handshake<S>(
	stream: &mut S,
	credential: &Credential,
	target_host: &str,
	target_port: u16,
) -> Result<(), (FailureKind, String)>
where
	S: AsyncReadExt + AsyncWriteExt + Unpin,
{
	let want_auth = !credential.is_empty();
	let methods: &[u8] = if want_auth { &[METHOD_NO_AUTH, METHOD_USER_PASS] } else { &[METHOD_NO_AUTH] };
	let mut greeting = Vec::with_capacity(2 + methods.len());
	greeting.push(VERSION);
	greeting.push(methods.len() as u8);
	greeting.extend_from_slice(methods);
	write_all(stream, &greeting).await?;

	let mut reply = [0u8; 2];
	read_exact(stream, &mut reply).await?;
	if reply[0] != VERSION {
		return Err((FailureKind::ConnectFail, "socks5: bad version in method reply".to_string()));
	}
	match reply[1] {
		METHOD_NO_AUTH => {},
		METHOD_USER_PASS if want_auth => {
			subnegotiate(stream, credential).await?;
		},
		METHOD_NO_ACCEPTABLE => {
			return Err((FailureKind::Auth, "socks5: no acceptable auth method".to_string()));
		},
		other => {
			return Err((FailureKind::ConnectFail, format!("socks5: unexpected method {other}")));
		},
	}

	request_connect(stream, target_host, target_port).await
}

async fn subnegotiate<S>(stream: &mut S, credential: &Credential) -> Result<(), (FailureKind, String)>
where
	S: AsyncReadExt + AsyncWriteExt + Unpin,
{
	let user = credential.user.as_bytes();
	let pass = credential.pass.as_bytes();
	if user.len() > 255 || pass.len() > 255 {
		return Err((FailureKind::Auth, "socks5: credential too long for RFC 1929".to_string()));
	}
	let mut req = Vec::with_capacity(3 + user.len() + pass.len());
	req.push(0x01);
	req.push(user.len() as u8);
	req.extend_from_slice(user);
	req.push(pass.len() as u8);
	req.extend_from_slice(pass);
	write_all(stream, &req).await?;

	let mut reply = [0u8; 2];
	read_exact(stream, &mut reply).await?;
	if reply[1] != 0x00 {
		return Err((FailureKind::Auth, "socks5: username/password rejected".to_string()));
	}
	Ok(())
}

async fn request_connect<S>(stream: &mut S, target_host: &str, target_port: u16) -> Result<(), (FailureKind, String)>
where
	S: AsyncReadExt + AsyncWriteExt + Unpin,
{
	let mut req = vec![VERSION, CMD_CONNECT, 0x00];
	match target_host.parse::<std::net::Ipv4Addr>() {
		Ok(ip) => {
			req.push(ATYP_IPV4);
			req.extend_from_slice(&ip.octets());
		},
		Err(_) => match target_host.parse::<std::net::Ipv6Addr>() {
			Ok(ip) => {
				req.push(ATYP_IPV6);
				req.extend_from_slice(&ip.octets());
			},
			Err(_) => {
				let host = target_host.as_bytes();
				if host.len() > 255 {
					return Err((FailureKind::ConnectFail, "socks5: domain name too long".to_string()));
				}
				req.push(ATYP_DOMAIN);
				req.push(host.len() as u8);
				req.extend_from_slice(host);
			},
		},
	}
	req.extend_from_slice(&target_port.to_be_bytes());
	write_all(stream, &req).await?;

	let mut head = [0u8; 4];
	read_exact(stream, &mut head).await?;
	if head[0] != VERSION {
		return Err((FailureKind::ConnectFail, "socks5: bad version in connect reply".to_string()));
	}
	let rep = head[1];
	let atyp = head[3];

	// Drain BND.ADDR/BND.PORT so the stream is left clean for the caller,
	// regardless of whether the CONNECT itself succeeded.
	let addr_len = match atyp {
		ATYP_IPV4 => 4,
		ATYP_IPV6 => 16,
		ATYP_DOMAIN => {
			let mut len_byte = [0u8; 1];
			read_exact(stream, &mut len_byte).await?;
			len_byte[0] as usize
		},
		other => return Err((FailureKind::ConnectFail, format!("socks5: unknown address type {other}"))),
	};
	let mut addr_buf = vec![0u8; addr_len + 2];
	read_exact(stream, &mut addr_buf).await?;

	match rep {
		0x00 => Ok(()),
		0x02 => Err((FailureKind::ConnectFail, "socks5: connection not allowed by ruleset".to_string())),
		0x03 => Err((FailureKind::Unreachable, "socks5: network unreachable".to_string())),
		0x04 => Err((FailureKind::Unreachable, "socks5: host unreachable".to_string())),
		0x05 => Err((FailureKind::Refused, "socks5: connection refused by destination".to_string())),
		0x06 => Err((FailureKind::Unreachable, "socks5: TTL expired".to_string())),
		0x07 => Err((FailureKind::ConnectFail, "socks5: command not supported".to_string())),
		0x08 => Err((FailureKind::ConnectFail, "socks5: address type not supported".to_string())),
		other => Err((FailureKind::ConnectFail, format!("socks5: connect failed, rep={other}"))),
	}
}

async fn write_all<S: AsyncWriteExt + Unpin>(stream: &mut S, buf: &[u8]) -> Result<(), (FailureKind, String)> {
	stream
		.write_all(buf)
		.await
		.map_err(|e| (crate::classify::classify_io_error(&e), e.to_string()))
}

async fn read_exact<S: AsyncReadExt + Unpin>(stream: &mut S, buf: &mut [u8]) -> Result<(), (FailureKind, String)> {
	stream
		.read_exact(buf)
		.await
		.map_err(|e| (crate::classify::classify_io_error(&e), e.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;
	use tokio::net::{TcpListener, TcpStream};

	async fn serve_no_auth_connect(mut server: impl AsyncReadExt + AsyncWriteExt + Unpin) {
		let mut greeting = [0u8; 2];
		server.read_exact(&mut greeting).await.unwrap();
		let mut methods = vec![0u8; greeting[1] as usize];
		server.read_exact(&mut methods).await.unwrap();
		server.write_all(&[VERSION, METHOD_NO_AUTH]).await.unwrap();

		let mut head = [0u8; 4];
		server.read_exact(&mut head).await.unwrap();
		assert_eq!(head[3], ATYP_DOMAIN);
		let mut len_byte = [0u8; 1];
		server.read_exact(&mut len_byte).await.unwrap();
		let mut domain = vec![0u8; len_byte[0] as usize];
		server.read_exact(&mut domain).await.unwrap();
		let mut port = [0u8; 2];
		server.read_exact(&mut port).await.unwrap();

		server
			.write_all(&[VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn no_auth_connect_succeeds_against_fixture() {
		let (mut client, server) = duplex(4096);
		tokio::spawn(serve_no_auth_connect(server));
		let result = connect(&mut client, &Credential::empty(), "example.test", 443, Duration::from_secs(1)).await;
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn refused_destination_maps_to_refused() {
		let (mut client, mut server) = duplex(4096);
		tokio::spawn(async move {
			let mut greeting = [0u8; 2];
			server.read_exact(&mut greeting).await.unwrap();
			let mut methods = vec![0u8; greeting[1] as usize];
			server.read_exact(&mut methods).await.unwrap();
			server.write_all(&[VERSION, METHOD_NO_AUTH]).await.unwrap();
			let mut head = [0u8; 4];
			server.read_exact(&mut head).await.unwrap();
			let mut len_byte = [0u8; 1];
			server.read_exact(&mut len_byte).await.unwrap();
			let mut domain = vec![0u8; len_byte[0] as usize];
			server.read_exact(&mut domain).await.unwrap();
			let mut port = [0u8; 2];
			server.read_exact(&mut port).await.unwrap();
			server
				.write_all(&[VERSION, 0x05, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
				.await
				.unwrap();
		});
		let result = connect(&mut client, &Credential::empty(), "example.test", 443, Duration::from_secs(1)).await;
		assert_eq!(result.unwrap_err().0, FailureKind::Refused);
	}

	#[tokio::test]
	async fn handshake_against_closed_peer_times_out_or_errors() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);
		let attempt = TcpStream::connect(addr).await;
		assert!(attempt.is_err());
	}
}
