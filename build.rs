//! Stamps the binary with the checkout it was built from; `main` prints it
//! in the startup diagnostics.

use std::process::Command;

fn describe_checkout() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let described = String::from_utf8(output.stdout).ok()?;
    Some(described.trim().to_string()).filter(|d| !d.is_empty())
}

fn main() {
    let build = describe_checkout().unwrap_or_else(|| "unreleased".to_string());
    println!("cargo:rustc-env=GATEWAY_BUILD={}", build);
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
