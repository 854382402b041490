//! Stamps the binary with its build time and source revision.
//!
//! `qm --help` and `qm -V` stay short; `qm --version` (long form) shows
//! `QM_GIT_COMMIT` and `QM_BUILD_TIMESTAMP`.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let built = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    println!("cargo:rustc-env=QM_BUILD_TIMESTAMP={}", built);

    let commit = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=QM_GIT_COMMIT={}", commit);
}
