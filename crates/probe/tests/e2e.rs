//! End-to-end engine runs against local fixtures, covering the scenarios
//! from spec.md §8: a full HTTP-proxy success path and bad-line handling.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use proxycheck::config::{Mode, RunConfig};
use proxycheck_core::signal::Shutdown;

const INTEL_JSON: &str = r#"{"ipapi":{"country":"US","asn":{"name":"ExampleNet","type":"isp"},"company":{"name":"ExampleCorp","type":"business"}},"code":200}"#;

fn write_lines(lines: &[&str]) -> NamedTempFile {
	let mut file = NamedTempFile::new().unwrap();
	for line in lines {
		writeln!(file, "{line}").unwrap();
	}
	file.flush().unwrap();
	file
}

/// S2-ish: a bare HTTP proxy that demands the password on the second
/// attempt and returns the documented intel JSON body once satisfied.
async fn spawn_auth_gated_proxy() -> std::net::SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let (mut stream, _) = match listener.accept().await {
				Ok(pair) => pair,
				Err(_) => return,
			};
			tokio::spawn(async move {
				let mut buf = vec![0u8; 4096];
				let n = stream.read(&mut buf).await.unwrap_or(0);
				let request = String::from_utf8_lossy(&buf[..n]);
				if request.contains("Proxy-Authorization") {
					let body = INTEL_JSON.as_bytes();
					let response = format!(
						"HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n{}",
						body.len(),
						INTEL_JSON
					);
					let _ = stream.write_all(response.as_bytes()).await;
				} else {
					let _ = stream
						.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
						.await;
				}
			});
		}
	});
	addr
}

#[tokio::test]
async fn auth_gated_proxy_yields_one_success_line() {
	let addr = spawn_auth_gated_proxy().await;
	let input = write_lines(&[&format!("http://u:p@{addr}")]);
	let output = NamedTempFile::new().unwrap();

	let mut config = RunConfig {
		input_path: input.path().to_path_buf(),
		output_path: output.path().to_path_buf(),
		mode: Mode::Auto,
		probe_timeout: Duration::from_secs(2),
		concurrency: Some(4),
		progress_interval: Duration::from_secs(60),
		skip_cdn: false,
		..RunConfig::default()
	};
	config.mem_budget_ratio = 0.5;

	let handle = proxycheck::engine::start(config, Shutdown::new()).await.unwrap();
	let counters = handle.counters.clone();
	handle.wait().await.unwrap();

	assert_eq!(counters.done.load(Ordering::Relaxed), 1);
	assert_eq!(counters.ok_endpoints.load(Ordering::Relaxed), 1);
	assert_eq!(counters.ok_lines.load(Ordering::Relaxed), 1);
	assert_eq!(counters.fail.load(Ordering::Relaxed), 0);

	let written = std::fs::read_to_string(output.path()).unwrap();
	assert_eq!(written, format!("http://u:p@{addr}#[ExampleCorp][isp][US]\n"));
}

/// S5: comments and blank lines are silently skipped (neither done nor
/// skip), while a line that fails to parse counts as a bad line.
#[tokio::test]
async fn comments_and_blank_lines_are_ignored_bad_lines_are_counted() {
	let input = write_lines(&["# comment", "", "not_a_valid_line:::"]);
	let output = NamedTempFile::new().unwrap();

	let config = RunConfig {
		input_path: input.path().to_path_buf(),
		output_path: output.path().to_path_buf(),
		mode: Mode::Auto,
		probe_timeout: Duration::from_millis(200),
		concurrency: Some(2),
		progress_interval: Duration::from_secs(60),
		skip_cdn: false,
		..RunConfig::default()
	};

	let handle = proxycheck::engine::start(config, Shutdown::new()).await.unwrap();
	let counters = handle.counters.clone();
	handle.wait().await.unwrap();

	assert_eq!(counters.done.load(Ordering::Relaxed), 1);
	assert_eq!(counters.skip.load(Ordering::Relaxed), 1);
	assert_eq!(counters.ok_endpoints.load(Ordering::Relaxed), 0);
	assert_eq!(counters.fail.load(Ordering::Relaxed), 0);

	let written = std::fs::read_to_string(output.path()).unwrap();
	assert!(written.is_empty());
}
