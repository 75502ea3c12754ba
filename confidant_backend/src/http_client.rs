use std::time::Duration;

use anyhow::{Context, Result};

const SYSTEM_PROXY_ENV: &str = "CONFIDANT_ENABLE_SYSTEM_PROXY";
const USER_AGENT: &str = concat!("confidant/", env!("CARGO_PKG_VERSION"));

fn system_proxy_enabled() -> bool {
    std::env::var(SYSTEM_PROXY_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// HTTP client for the chat and speech endpoints. Every request is bounded by
/// `timeout`; proxies from the environment are only honoured when
/// `CONFIDANT_ENABLE_SYSTEM_PROXY` is set.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT);
    if !system_proxy_enabled() {
        builder = builder.no_proxy();
    }
    builder.build().context("Failed to build HTTP client")
}
