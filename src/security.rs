#![forbid(unsafe_code)]

//! Security helpers shared by the grabtube backend.

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;
use url::Url;

/// Hosts the backend is willing to hand to the extractor.
const ALLOWED_HOSTS: &[&str] = &["youtube.com", "www.youtube.com", "youtu.be"];

/// Fails fast when a binary is started as root. Running as a regular
/// unprivileged user keeps local installs predictable and avoids accidental
/// writes into system directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Accepts only http(s) URLs pointing at a known video host, so arbitrary
/// caller input never reaches the extractor's command line. Returns the
/// parsed URL on success.
pub fn validate_source_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("parsing source URL {raw:?}"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("unsupported URL scheme: {}", url.scheme());
    }
    let Some(host) = url.host_str() else {
        bail!("source URL has no host");
    };
    if !ALLOWED_HOSTS.contains(&host) {
        bail!("unsupported host: {host}");
    }
    Ok(url)
}
