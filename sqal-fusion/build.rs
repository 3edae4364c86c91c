//! Build script for sqal-fusion
//!
//! Stamps the binaries with the git commit, build time and profile; `/health`
//! and the startup banner report them.

use std::process::Command;

fn main() {
    let git_hash = Command::new("git")
        .args(["rev-parse", "--short=8", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    // RFC 3339 with local offset, e.g. 2026-03-02T06:15:00+01:00
    let build_timestamp = chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false);
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=SQAL_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=SQAL_BUILD_TIMESTAMP={}", build_timestamp);
    println!("cargo:rustc-env=SQAL_BUILD_PROFILE={}", profile);
}
