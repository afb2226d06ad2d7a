//! C3 — CDN filter: an in-memory CIDR table used to skip endpoints that sit
//! behind a known CDN range (they are not real standalone proxies).

use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;

use crate::parse::Endpoint;

#[derive(Debug, Clone)]
struct Entry<N> {
	net: N,
	provider: &'static str,
}

/// Two sorted CIDR lists (v4, v6) tagged by provider, immutable after load.
#[derive(Debug, Clone, Default)]
pub struct CdnTable {
	v4: Vec<Entry<Ipv4Net>>,
	v6: Vec<Entry<Ipv6Net>>,
}

impl CdnTable {
	pub fn is_empty(&self) -> bool {
		self.v4.is_empty() && self.v6.is_empty()
	}

	pub fn len(&self) -> usize {
		self.v4.len() + self.v6.len()
	}

	/// Returns the provider name if `endpoint`'s host falls inside a known
	/// CDN range. Non-IP hosts (hostnames) never match — the CDN table only
	/// covers address ranges.
	pub fn matches(&self, endpoint: &Endpoint) -> Option<&'static str> {
		match endpoint.ip()? {
			std::net::IpAddr::V4(ip) => self.v4.iter().find(|e| e.net.contains(&ip)).map(|e| e.provider),
			std::net::IpAddr::V6(ip) => self.v6.iter().find(|e| e.net.contains(&ip)).map(|e| e.provider),
		}
	}

	fn sort(&mut self) {
		self.v4.sort_by_key(|e| (e.net.network(), e.net.prefix_len()));
		self.v6.sort_by_key(|e| (e.net.network(), e.net.prefix_len()));
	}
}

/// Loads the three remote CDN sources described in spec.md §4.2/§6. Any
/// individual source may fail without aborting the load; an empty result
/// disables skipping (the caller logs a one-line warning per spec.md §7).
pub async fn load(client: &reqwest::Client, timeout: Duration) -> CdnTable {
	let mut table = CdnTable::default();

	match load_cloudflare(client, timeout).await {
		Ok((v4, v6)) => {
			table.v4.extend(v4);
			table.v6.extend(v6);
		},
		Err(e) => tracing::warn!(error = %e, "failed to load cloudflare ranges"),
	}
	match load_fastly(client, timeout).await {
		Ok((v4, v6)) => {
			table.v4.extend(v4);
			table.v6.extend(v6);
		},
		Err(e) => tracing::warn!(error = %e, "failed to load fastly ranges"),
	}
	match load_aws(client, timeout).await {
		Ok((v4, v6)) => {
			table.v4.extend(v4);
			table.v6.extend(v6);
		},
		Err(e) => tracing::warn!(error = %e, "failed to load aws cloudfront ranges"),
	}

	table.sort();
	if table.is_empty() {
		tracing::warn!("CDN table is empty; CDN skipping disabled");
	}
	table
}

const CLOUDFLARE_V4_URL: &str = "https://www.cloudflare.com/ips-v4";
const CLOUDFLARE_V6_URL: &str = "https://www.cloudflare.com/ips-v6";
const FASTLY_URL: &str = "https://api.fastly.com/public-ip-list";
const AWS_URL: &str = "https://ip-ranges.amazonaws.com/ip-ranges.json";

async fn load_cloudflare(
	client: &reqwest::Client,
	timeout: Duration,
) -> anyhow::Result<(Vec<Entry<Ipv4Net>>, Vec<Entry<Ipv6Net>>)> {
	let v4_text = client.get(CLOUDFLARE_V4_URL).timeout(timeout).send().await?.text().await?;
	let v6_text = client.get(CLOUDFLARE_V6_URL).timeout(timeout).send().await?.text().await?;
	let v4 = v4_text
		.split_whitespace()
		.filter_map(|cidr| cidr.parse().ok())
		.map(|net| Entry { net, provider: "cloudflare" })
		.collect();
	let v6 = v6_text
		.split_whitespace()
		.filter_map(|cidr| cidr.parse().ok())
		.map(|net| Entry { net, provider: "cloudflare" })
		.collect();
	Ok((v4, v6))
}

#[derive(Deserialize)]
struct FastlyResponse {
	addresses: Vec<String>,
	ipv6_addresses: Vec<String>,
}

async fn load_fastly(
	client: &reqwest::Client,
	timeout: Duration,
) -> anyhow::Result<(Vec<Entry<Ipv4Net>>, Vec<Entry<Ipv6Net>>)> {
	let resp: FastlyResponse = client.get(FASTLY_URL).timeout(timeout).send().await?.json().await?;
	let v4 = resp
		.addresses
		.iter()
		.filter_map(|cidr| cidr.parse().ok())
		.map(|net| Entry { net, provider: "fastly" })
		.collect();
	let v6 = resp
		.ipv6_addresses
		.iter()
		.filter_map(|cidr| cidr.parse().ok())
		.map(|net| Entry { net, provider: "fastly" })
		.collect();
	Ok((v4, v6))
}

#[derive(Deserialize)]
struct AwsResponse {
	prefixes: Vec<AwsV4Prefix>,
	ipv6_prefixes: Vec<AwsV6Prefix>,
}

#[derive(Deserialize)]
struct AwsV4Prefix {
	ip_prefix: String,
	service: String,
	region: String,
}

#[derive(Deserialize)]
struct AwsV6Prefix {
	ipv6_prefix: String,
	service: String,
	region: String,
}

async fn load_aws(
	client: &reqwest::Client,
	timeout: Duration,
) -> anyhow::Result<(Vec<Entry<Ipv4Net>>, Vec<Entry<Ipv6Net>>)> {
	let resp: AwsResponse = client.get(AWS_URL).timeout(timeout).send().await?.json().await?;
	let v4 = resp
		.prefixes
		.iter()
		.filter(|p| p.service == "CLOUDFRONT" && p.region == "GLOBAL")
		.filter_map(|p| p.ip_prefix.parse().ok())
		.map(|net| Entry { net, provider: "aws_cloudfront" })
		.collect();
	let v6 = resp
		.ipv6_prefixes
		.iter()
		.filter(|p| p.service == "CLOUDFRONT" && p.region == "GLOBAL")
		.filter_map(|p| p.ipv6_prefix.parse().ok())
		.map(|net| Entry { net, provider: "aws_cloudfront" })
		.collect();
	Ok((v4, v6))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::parse::SchemeHint;

	fn ep(host: &str) -> Endpoint {
		Endpoint {
			host: host.to_string(),
			port: 80,
			scheme_hint: SchemeHint::Unknown,
			inline_credential: None,
			raw: host.to_string(),
		}
	}

	#[test]
	fn matches_contained_v4() {
		let mut table = CdnTable::default();
		table.v4.push(Entry {
			net: "104.16.0.0/13".parse().unwrap(),
			provider: "cloudflare",
		});
		table.sort();
		assert_eq!(table.matches(&ep("104.16.1.1")), Some("cloudflare"));
		assert_eq!(table.matches(&ep("8.8.8.8")), None);
	}

	#[test]
	fn hostnames_never_match() {
		let mut table = CdnTable::default();
		table.v4.push(Entry {
			net: "104.16.0.0/13".parse().unwrap(),
			provider: "cloudflare",
		});
		assert_eq!(table.matches(&ep("example.com")), None);
	}
}
