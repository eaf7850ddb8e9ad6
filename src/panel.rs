//! Downstream data endpoints of the panel: numbers list and same-day SMS log.
//! Bodies are passed through verbatim; no schema checks.

use crate::client::PanelClient;
use crate::metrics;
use crate::session::SessionHolder;
use anyhow::Context;
use chrono::NaiveDate;
use std::time::Instant;
use tracing::debug;

const NUMBERS_PATH: &str = "/NumberPanel/ints/agent/res/data_smsnumbers.php";
const SMS_PATH: &str = "/NumberPanel/ints/agent/res/data_smscdr.php";

/// Which data endpoint; also the metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Numbers,
    Sms,
}

impl Endpoint {
    pub fn label(self) -> &'static str {
        match self {
            Endpoint::Numbers => "numbers",
            Endpoint::Sms => "sms",
        }
    }
}

/// Result of a proxied read that did not fail on the network.
#[derive(Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// No stored session; nothing was sent.
    LoginRequired,
    /// Raw downstream body, whatever its status code.
    Body(String),
}

pub fn numbers_url(base: &str) -> String {
    format!(
        "{}{}?frange=&fclient=&sEcho=2&iColumns=8&sColumns=%2C%2C%2C%2C%2C%2C%2C&iDisplayStart=0&iDisplayLength=-1",
        base, NUMBERS_PATH
    )
}

/// SMS report URL bounded to one calendar day (00:00:00 through 23:59:59).
pub fn sms_url(base: &str, day: NaiveDate) -> String {
    let d = day.format("%Y-%m-%d");
    format!(
        "{base}{SMS_PATH}?fdate1={d}%2000:00:00&fdate2={d}%2023:59:59&frange=&fclient=&fnum=&fcli=&fgdate=&fgmonth=&fgrange=&fgnumber=&fgcli=&fg=0&sEcho=2&iColumns=9&iDisplayStart=0&iDisplayLength=-1"
    )
}

/// Current UTC calendar day.
pub fn today_utc() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

pub async fn fetch_numbers(
    client: &PanelClient,
    session: &SessionHolder,
) -> anyhow::Result<FetchOutcome> {
    let url = numbers_url(client.base());
    fetch(client, session, Endpoint::Numbers, &url).await
}

pub async fn fetch_sms(
    client: &PanelClient,
    session: &SessionHolder,
) -> anyhow::Result<FetchOutcome> {
    let url = sms_url(client.base(), today_utc());
    fetch(client, session, Endpoint::Sms, &url).await
}

async fn fetch(
    client: &PanelClient,
    session: &SessionHolder,
    endpoint: Endpoint,
    url: &str,
) -> anyhow::Result<FetchOutcome> {
    let Some(cookie) = session.get().await else {
        return Ok(FetchOutcome::LoginRequired);
    };
    let start = Instant::now();
    let result = send(client, &cookie, endpoint, url).await;
    let elapsed = start.elapsed().as_secs_f64();
    match &result {
        Ok((status, _)) => metrics::record_panel_request(endpoint.label(), status_class(*status), elapsed),
        Err(_) => metrics::record_panel_request(endpoint.label(), "error", elapsed),
    }
    let (status, body) = result?;
    debug!(endpoint = endpoint.label(), status, bytes = body.len(), "panel data fetched");
    Ok(FetchOutcome::Body(body))
}

async fn send(
    client: &PanelClient,
    cookie: &str,
    endpoint: Endpoint,
    url: &str,
) -> anyhow::Result<(u16, String)> {
    let response = client
        .data_request(url, cookie)?
        .send()
        .await
        .with_context(|| format!("fetch {} from panel", endpoint.label()))?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .with_context(|| format!("read {} response body", endpoint.label()))?;
    Ok((status, body))
}

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}
