//! Outbound HTTP clients for the panel: timeouts, redirect policy, identifying headers.

use crate::config::Config;
use anyhow::Context;
use reqwest::header::{ACCEPT, COOKIE, HeaderValue, USER_AGENT};
use reqwest::{Client, redirect};
use std::time::Duration;

/// Identifying User-Agent sent on every panel request.
pub const PANEL_USER_AGENT: &str = "LoginProxy/1.0";

/// Clients bound to one panel. `login` never follows redirects so Set-Cookie on a 3xx stays
/// observable; `data` follows them like a normal browser fetch and also loads the login page.
#[derive(Clone)]
pub struct PanelClient {
    pub login: Client,
    pub data: Client,
    base: String,
    login_url: String,
}

impl PanelClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        Ok(Self {
            login: build_client(timeout, redirect::Policy::none())?,
            data: build_client(timeout, redirect::Policy::default())?,
            base: config.panel_base().to_string(),
            login_url: config.login_url(),
        })
    }

    /// Panel host without trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    /// GET against a data endpoint carrying the stored session cookie.
    pub fn data_request(&self, url: &str, cookie: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        let cookie = HeaderValue::try_from(cookie).context("session cookie is not a valid header value")?;
        Ok(self
            .data
            .get(url)
            .header(COOKIE, cookie)
            .header(USER_AGENT, PANEL_USER_AGENT)
            .header(ACCEPT, "application/json"))
    }
}

/// Build a reqwest client with the request timeout and the given redirect policy.
fn build_client(timeout: Duration, policy: redirect::Policy) -> anyhow::Result<Client> {
    Client::builder()
        .connect_timeout(std::cmp::min(Duration::from_secs(10), timeout))
        .timeout(timeout)
        .redirect(policy)
        .build()
        .context("build reqwest client")
}
