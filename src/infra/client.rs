//! Shared HTTP client construction.

use std::time::Duration;

use reqwest::Client;

/// Sent on every outbound request so origin operators can identify us.
pub(crate) const USER_AGENT: &str = concat!("brezza/", env!("CARGO_PKG_VERSION"));

/// Build a client with the crate user agent and a per-request deadline
/// covering connect, redirects, and body transfer.
pub(crate) fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
}
