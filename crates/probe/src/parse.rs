//! C2 — endpoint parser: streams input lines into normalized `Job` records.

use std::fmt;
use std::net::IpAddr;

use crate::config::Mode;

/// Address of a proxy candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
	pub host: String,
	pub port: u16,
	pub scheme_hint: SchemeHint,
	pub inline_credential: Option<Credential>,
	pub raw: String,
}

impl Endpoint {
	/// `true` if `host` parses as an IPv6 literal (stored without brackets
	/// per spec.md §3; re-bracketed on output by `Display`).
	pub fn is_ipv6(&self) -> bool {
		self.host.parse::<std::net::Ipv6Addr>().is_ok()
	}

	pub fn ip(&self) -> Option<IpAddr> {
		self.host.parse().ok()
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_ipv6() {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeHint {
	Http,
	Https,
	Socks5,
	Unknown,
}

/// A (user, pass) pair; both may be empty. The empty credential is always
/// tried first (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credential {
	pub user: String,
	pub pass: String,
}

impl Credential {
	pub fn empty() -> Self {
		Credential::default()
	}

	pub fn is_empty(&self) -> bool {
		self.user.is_empty() && self.pass.is_empty()
	}
}

/// One parsed input line, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
	pub endpoint: Endpoint,
	pub default_credentials: Vec<Credential>,
	pub protocol_order: Vec<Protocol>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
	Http,
	Https,
	Socks5,
}

impl Protocol {
	pub fn scheme(&self) -> &'static str {
		match self {
			Protocol::Http => "http",
			Protocol::Https => "https",
			Protocol::Socks5 => "socks5",
		}
	}

	pub fn default_port(&self) -> u16 {
		match self {
			Protocol::Http => 80,
			Protocol::Https => 443,
			Protocol::Socks5 => 1080,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadLine {
	pub raw: String,
	pub reason: String,
}

/// Parses one input line into a `Job`, given the default credentials and
/// mode the run was configured with. Returns `Ok(None)` for blank/comment
/// lines, which count toward neither `done` nor `skip` (spec.md §8
/// property 10).
pub fn parse(
	line: &str,
	default_port: Option<u16>,
	default_credentials: &[Credential],
	mode: Mode,
) -> Result<Option<Job>, BadLine> {
	let trimmed = line.trim();
	if trimmed.is_empty() || trimmed.starts_with('#') {
		return Ok(None);
	}

	let parsed = parse_shape(trimmed, default_port).map_err(|reason| BadLine {
		raw: line.to_string(),
		reason,
	})?;

	let protocol_order = derive_protocol_order(mode, parsed.scheme_hint, parsed.port);

	let effective_credentials = match &parsed.inline_credential {
		Some(cred) if !cred.is_empty() => vec![Credential::empty(), cred.clone()],
		_ => {
			let mut list = vec![Credential::empty()];
			list.extend(default_credentials.iter().filter(|c| !c.is_empty()).cloned());
			list
		},
	};

	Ok(Some(Job {
		endpoint: Endpoint {
			host: parsed.host,
			port: parsed.port,
			scheme_hint: parsed.scheme_hint,
			inline_credential: parsed.inline_credential,
			raw: line.to_string(),
		},
		default_credentials: effective_credentials,
		protocol_order,
	}))
}

struct Parsed {
	host: String,
	port: u16,
	scheme_hint: SchemeHint,
	inline_credential: Option<Credential>,
}

/// Recognizes the five line shapes from spec.md §4.1.
fn parse_shape(line: &str, default_port: Option<u16>) -> Result<Parsed, String> {
	if let Some(rest) = scheme_prefix(line) {
		return parse_url_shape(line, rest, default_port);
	}

	if let Some(at_idx) = line.rfind('@') {
		// user:pass@host[:port], no scheme.
		let (userinfo, hostport) = line.split_at(at_idx);
		let hostport = &hostport[1..];
		let cred = parse_userinfo(userinfo)?;
		let (host, port) = parse_host_port(hostport, default_port)?;
		return Ok(Parsed {
			host,
			port,
			scheme_hint: SchemeHint::Unknown,
			inline_credential: Some(cred),
		});
	}

	// Bare IP or host:port or bare host.
	let (host, port) = parse_host_port(line, default_port)?;
	Ok(Parsed {
		host,
		port,
		scheme_hint: SchemeHint::Unknown,
		inline_credential: None,
	})
}

fn scheme_prefix(line: &str) -> Option<&str> {
	for scheme in ["http://", "https://", "socks5://", "s5://"] {
		if let Some(rest) = line.strip_prefix(scheme) {
			return Some(rest);
		}
	}
	None
}

fn parse_url_shape(full: &str, rest: &str, default_port: Option<u16>) -> Result<Parsed, String> {
	let scheme_hint = if full.starts_with("http://") {
		SchemeHint::Http
	} else if full.starts_with("https://") {
		SchemeHint::Https
	} else {
		// socks5:// or s5://
		SchemeHint::Socks5
	};

	let (userinfo, hostport) = match rest.rfind('@') {
		Some(idx) => (Some(&rest[..idx]), &rest[idx + 1..]),
		None => (None, rest),
	};
	if hostport.is_empty() {
		return Err("missing host".to_string());
	}
	let scheme_default_port = match scheme_hint {
		SchemeHint::Http => 80,
		SchemeHint::Https => 443,
		SchemeHint::Socks5 => 1080,
		SchemeHint::Unknown => unreachable!(),
	};
	let (host, port) = parse_host_port(hostport, Some(default_port.unwrap_or(scheme_default_port)))?;
	let inline_credential = match userinfo {
		Some(ui) if !ui.is_empty() => Some(parse_userinfo(ui)?),
		_ => None,
	};
	Ok(Parsed {
		host,
		port,
		scheme_hint,
		inline_credential,
	})
}

fn parse_userinfo(userinfo: &str) -> Result<Credential, String> {
	match userinfo.split_once(':') {
		Some((user, pass)) => Ok(Credential {
			user: decode_component(user),
			pass: decode_component(pass),
		}),
		None => Ok(Credential {
			user: decode_component(userinfo),
			pass: String::new(),
		}),
	}
}

fn decode_component(s: &str) -> String {
	percent_encoding::percent_decode_str(s)
		.decode_utf8_lossy()
		.into_owned()
}

/// Parses `host`, `host:port`, `[ipv6]`, or `[ipv6]:port`. A missing port is
/// filled from `default_port`; if neither is present, this is a parse
/// failure (spec.md §4.1 shapes 3 and 5 require a default port).
fn parse_host_port(s: &str, default_port: Option<u16>) -> Result<(String, u16), String> {
	if let Some(rest) = s.strip_prefix('[') {
		let Some(end) = rest.find(']') else {
			return Err("unterminated ipv6 bracket".to_string());
		};
		let host = &rest[..end];
		if host.parse::<std::net::Ipv6Addr>().is_err() {
			return Err(format!("invalid ipv6 literal: {host}"));
		}
		let after = &rest[end + 1..];
		let port = if let Some(p) = after.strip_prefix(':') {
			p.parse::<u16>().map_err(|_| format!("invalid port: {p}"))?
		} else if after.is_empty() {
			default_port.ok_or_else(|| "missing port".to_string())?
		} else {
			return Err(format!("unexpected trailer after ipv6 literal: {after}"));
		};
		return Ok((host.to_string(), port));
	}

	if s.parse::<std::net::Ipv6Addr>().is_ok() {
		let port = default_port.ok_or_else(|| "missing port".to_string())?;
		return Ok((s.to_string(), port));
	}

	// host[:port] — split on the last colon so bare IPv4/hostnames without
	// a port (and without brackets) still work.
	match s.rsplit_once(':') {
		Some((host, port_str)) if !host.is_empty() && port_str.chars().all(|c| c.is_ascii_digit()) && !port_str.is_empty() => {
			let port: u16 = port_str.parse().map_err(|_| format!("invalid port: {port_str}"))?;
			if host.is_empty() {
				return Err("missing host".to_string());
			}
			Ok((host.to_string(), port))
		},
		_ => {
			if s.is_empty() {
				return Err("missing host".to_string());
			}
			let port = default_port.ok_or_else(|| "missing port".to_string())?;
			Ok((s.to_string(), port))
		},
	}
}

/// Pure function `(scheme_hint, port) -> permutation of {http, https,
/// socks5}` (spec.md §4.1, tested as property 6 in spec.md §8).
pub fn derive_protocol_order(mode: Mode, scheme_hint: SchemeHint, port: u16) -> Vec<Protocol> {
	match mode {
		Mode::Http => vec![Protocol::Http],
		Mode::Https => vec![Protocol::Https],
		Mode::Socks5 => vec![Protocol::Socks5],
		Mode::Auto | Mode::All => match scheme_hint {
			SchemeHint::Http => vec![Protocol::Http, Protocol::Https, Protocol::Socks5],
			SchemeHint::Https => vec![Protocol::Https, Protocol::Http, Protocol::Socks5],
			SchemeHint::Socks5 => vec![Protocol::Socks5, Protocol::Http, Protocol::Https],
			SchemeHint::Unknown => match port {
				443 | 8443 | 9443 => vec![Protocol::Https, Protocol::Http, Protocol::Socks5],
				80 | 8080 | 3128 | 8000 | 8888 => vec![Protocol::Http, Protocol::Https, Protocol::Socks5],
				1080 => vec![Protocol::Socks5, Protocol::Http, Protocol::Https],
				_ => vec![Protocol::Https, Protocol::Http, Protocol::Socks5],
			},
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn job(line: &str, mode: Mode) -> Job {
		parse(line, None, &[], mode).unwrap().unwrap()
	}

	#[test]
	fn bare_host_port() {
		let j = job("10.0.0.1:8080", Mode::Auto);
		assert_eq!(j.endpoint.host, "10.0.0.1");
		assert_eq!(j.endpoint.port, 8080);
	}

	#[test]
	fn bare_ip_needs_default_port() {
		assert!(parse("10.0.0.1", None, &[], Mode::Auto).is_err());
		let j = parse("10.0.0.1", Some(8080), &[], Mode::Auto)
			.unwrap()
			.unwrap();
		assert_eq!(j.endpoint.port, 8080);
	}

	#[test]
	fn ipv6_bracketed_and_unbracketed_parse_identically() {
		let a = job("[::1]:1080", Mode::Socks5);
		let b = parse("::1", Some(1080), &[], Mode::Socks5).unwrap().unwrap();
		assert_eq!(a.endpoint.host, b.endpoint.host);
		assert_eq!(a.endpoint.port, b.endpoint.port);
		assert_eq!(a.endpoint.to_string(), "[::1]:1080");
	}

	#[test]
	fn userinfo_host_port() {
		let j = job("user:pass@10.0.0.1:8080", Mode::Auto);
		assert_eq!(
			j.endpoint.inline_credential,
			Some(Credential {
				user: "user".to_string(),
				pass: "pass".to_string()
			})
		);
		assert_eq!(j.endpoint.scheme_hint, SchemeHint::Unknown);
	}

	#[test]
	fn full_url_with_scheme_and_credential() {
		let j = job("http://u:p@10.0.0.1:8080", Mode::Auto);
		assert_eq!(j.endpoint.scheme_hint, SchemeHint::Http);
		assert_eq!(j.endpoint.port, 8080);
		assert_eq!(
			j.protocol_order,
			vec![Protocol::Http, Protocol::Https, Protocol::Socks5]
		);
	}

	#[test]
	fn scheme_default_port_applied() {
		let j = job("socks5://1.2.3.4", Mode::Auto);
		assert_eq!(j.endpoint.port, 1080);
	}

	#[test]
	fn comments_and_blank_lines_are_ignored() {
		assert!(parse("# comment", None, &[], Mode::Auto).unwrap().is_none());
		assert!(parse("   ", None, &[], Mode::Auto).unwrap().is_none());
	}

	#[test]
	fn invalid_line_is_bad_line() {
		let err = parse("not_a_valid_line", None, &[], Mode::Auto).unwrap_err();
		assert_eq!(err.raw, "not_a_valid_line");
	}

	#[test]
	fn protocol_order_fixed_modes_single_element() {
		assert_eq!(
			derive_protocol_order(Mode::Http, SchemeHint::Unknown, 1080),
			vec![Protocol::Http]
		);
	}

	#[test]
	fn protocol_order_is_pure_function_of_hint_and_port() {
		let a = derive_protocol_order(Mode::Auto, SchemeHint::Unknown, 443);
		let b = derive_protocol_order(Mode::Auto, SchemeHint::Unknown, 443);
		assert_eq!(a, b);
		assert_eq!(a, vec![Protocol::Https, Protocol::Http, Protocol::Socks5]);
	}

	#[test]
	fn round_trip_canonical_url() {
		let j = job("http://u:p@198.51.100.1:8080", Mode::Auto);
		let canonical = format!(
			"http://u:p@{}",
			j.endpoint
		);
		let reparsed = parse(&canonical, None, &[], Mode::Auto).unwrap().unwrap();
		assert_eq!(reparsed.endpoint.host, j.endpoint.host);
		assert_eq!(reparsed.endpoint.port, j.endpoint.port);
		assert_eq!(reparsed.endpoint.inline_credential, j.endpoint.inline_credential);
	}
}
