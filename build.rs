use std::process::Command;

/// Stamp the short commit hash into ZAP_COMMIT for `zap --version`
fn main() {
    let commit = Command::new("git")
        .args(["rev-parse", "--short=10", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=ZAP_COMMIT={}", commit);
    println!("cargo:rerun-if-changed=.git/HEAD");
}
