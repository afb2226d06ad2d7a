use std::env;
use std::process::Command;

fn main() {
	let git_revision = Command::new("git")
		.args(["rev-parse", "--short", "HEAD"])
		.output()
		.ok()
		.filter(|o| o.status.success())
		.and_then(|o| String::from_utf8(o.stdout).ok())
		.map(|s| s.trim().to_string())
		.unwrap_or_else(|| "unknown".to_string());
	println!("cargo:rustc-env=PROXYCHECK_BUILD_GIT_REVISION={git_revision}");

	let rustc = rustc_version::version()
		.map(|v| v.to_string())
		.unwrap_or_else(|_| "unknown".to_string());
	println!("cargo:rustc-env=PROXYCHECK_BUILD_RUSTC_VERSION={rustc}");

	let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
	println!("cargo:rustc-env=PROXYCHECK_BUILD_PROFILE={profile}");

	println!("cargo:rerun-if-changed=build.rs");
}
