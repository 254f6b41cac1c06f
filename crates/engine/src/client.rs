//! HTTP client construction shared by the provider, liveness checks, the
//! WebDriver renderer and the Bot API notifier.

use std::time::Duration;

use reqwest::{Client, Proxy};

use crate::proxy_pool::ProxyEndpoint;

const USER_AGENT: &str = concat!("handle-watch/", env!("CARGO_PKG_VERSION"));

pub fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
}

/// Client whose every request is tunnelled through `endpoint`.
pub fn proxied_client(endpoint: &ProxyEndpoint, timeout: Duration) -> Result<Client, reqwest::Error> {
    let mut proxy = Proxy::all(endpoint.url())?;
    if let (Some(user), Some(pass)) = (&endpoint.username, &endpoint.password) {
        proxy = proxy.basic_auth(user, pass);
    }
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .proxy(proxy)
        .build()
}
