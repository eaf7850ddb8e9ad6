//! Panel login by form scraping: GET the login page, fill the first form's credential fields,
//! POST it back, and take the session cookie from Set-Cookie (following at most one redirect).
//!
//! Field detection patterns (part of the contract; a panel markup change can break them):
//! username = first input name matching `(?i)user|login|email`,
//! password = first input name matching `(?i)pass|pwd`.

use crate::client::{PANEL_USER_AGENT, PanelClient};
use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Response;
use reqwest::header::{HeaderMap, LOCATION, REFERER, SET_COOKIE, USER_AGENT};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

/// Longest response excerpt returned when no cookie could be obtained.
pub const SAMPLE_MAX_CHARS: usize = 800;

static USER_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)user|login|email").expect("valid username pattern"));
static PASS_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)pass|pwd").expect("valid password pattern"));
static FORM: Lazy<Selector> = Lazy::new(|| Selector::parse("form").expect("valid form selector"));
static INPUT: Lazy<Selector> =
    Lazy::new(|| Selector::parse("input").expect("valid input selector"));

/// Why a login attempt produced no session.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("Cannot detect username/password fields.")]
    FieldsNotFound { found_fields: Vec<String> },
    #[error("Login failed (no cookie)")]
    NoCookie { sample: String },
    #[error("{0:#}")]
    Request(#[from] anyhow::Error),
}

impl LoginError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LoginError::FieldsNotFound { .. } => "fields_not_found",
            LoginError::NoCookie { .. } => "no_cookie",
            LoginError::Request(_) => "error",
        }
    }
}

/// Credentials to submit. Empty strings count as "not supplied".
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    /// Prefer the override when non-empty, else the configured default.
    pub fn resolve(
        user: Option<&str>,
        pass: Option<&str>,
        default_user: &str,
        default_pass: &str,
    ) -> Self {
        let pick = |v: Option<&str>, d: &str| {
            v.filter(|s| !s.is_empty()).unwrap_or(d).to_string()
        };
        Self {
            user: pick(user, default_user),
            pass: pick(pass, default_pass),
        }
    }
}

/// Name → value pairs of one HTML form, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormFields {
    fields: Vec<(String, String)>,
}

impl FormFields {
    /// Insert or update. A repeated name keeps its first position and takes the newer value.
    pub fn insert(&mut self, name: &str, value: &str) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.fields.push((name.to_string(), value.to_string())),
        }
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|(n, _)| n.clone()).collect()
    }

    /// First field name matching `pattern`.
    fn find_name(&self, pattern: &Regex) -> Option<String> {
        self.fields
            .iter()
            .map(|(n, _)| n)
            .find(|n| pattern.is_match(n))
            .cloned()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.fields
    }
}

/// Parse the first `<form>` of the page into its named `<input>` fields.
/// No form → empty map.
pub fn parse_login_form(html: &str) -> FormFields {
    let document = Html::parse_document(html);
    let mut fields = FormFields::default();
    let Some(form) = document.select(&FORM).next() else {
        return fields;
    };
    for input in form.select(&INPUT) {
        let Some(name) = input.value().attr("name") else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        fields.insert(name, input.value().attr("value").unwrap_or(""));
    }
    fields
}

/// Locate the username and password fields. Returns (user_field, pass_field).
pub fn detect_credential_fields(fields: &FormFields) -> Result<(String, String), LoginError> {
    match (fields.find_name(&USER_FIELD), fields.find_name(&PASS_FIELD)) {
        (Some(user), Some(pass)) => Ok((user, pass)),
        _ => Err(LoginError::FieldsNotFound {
            found_fields: fields.names(),
        }),
    }
}

/// Scraped fields with the credentials filled in; every other field is left as scraped.
pub fn build_login_form(html: &str, creds: &Credentials) -> Result<FormFields, LoginError> {
    let mut fields = parse_login_form(html);
    let (user_field, pass_field) = detect_credential_fields(&fields)?;
    debug!(user_field = %user_field, pass_field = %pass_field, "detected login fields");
    fields.insert(&user_field, &creds.user);
    fields.insert(&pass_field, &creds.pass);
    Ok(fields)
}

/// Raw Set-Cookie values in header order.
pub fn set_cookie_values(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| match v.to_str() {
            Ok(s) => Some(s.to_string()),
            Err(_) => {
                debug!(bytes = v.len(), "skipping non-ASCII Set-Cookie header");
                None
            }
        })
        .collect()
}

/// `name=value` part of each Set-Cookie (attributes dropped), joined with "; ".
pub fn join_cookie_pairs(set_cookies: &[String]) -> String {
    set_cookies
        .iter()
        .map(|s| s.split(';').next().unwrap_or(s).trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

/// At most `max` characters of `body`.
pub fn truncate_chars(body: &str, max: usize) -> String {
    body.chars().take(max).collect()
}

/// Location target of a 3xx response, resolved against `base`.
fn redirect_target(response: &Response, base: &str) -> Option<reqwest::Url> {
    if !response.status().is_redirection() {
        return None;
    }
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    let base = reqwest::Url::parse(base).ok()?;
    base.join(location).ok()
}

/// Run the whole login flow and return the raw session cookie.
pub async fn login(client: &PanelClient, creds: &Credentials) -> Result<String, LoginError> {
    let login_url = client.login_url();

    let page = client
        .data
        .get(login_url)
        .header(USER_AGENT, PANEL_USER_AGENT)
        .send()
        .await
        .context("fetch login page")?;
    let html = page.text().await.context("read login page")?;

    let form = build_login_form(&html, creds)?;

    let response = client
        .login
        .post(login_url)
        .header(USER_AGENT, PANEL_USER_AGENT)
        .form(form.pairs())
        .send()
        .await
        .context("submit login form")?;
    let status = response.status();
    let mut set_cookies = set_cookie_values(response.headers());
    debug!(status = status.as_u16(), cookies = set_cookies.len(), "login form submitted");

    let follow = if set_cookies.is_empty() {
        redirect_target(&response, login_url)
    } else {
        None
    };
    if let Some(target) = follow {
        debug!(location = %target, "no cookie on login response, following redirect once");
        let followed = client
            .login
            .get(target)
            .header(USER_AGENT, PANEL_USER_AGENT)
            .header(REFERER, login_url)
            .send()
            .await
            .context("follow login redirect")?;
        set_cookies = set_cookie_values(followed.headers());
    }

    if set_cookies.is_empty() {
        let body = response.text().await.context("read login response")?;
        warn!(status = status.as_u16(), "login response carried no session cookie");
        return Err(LoginError::NoCookie {
            sample: truncate_chars(&body, SAMPLE_MAX_CHARS),
        });
    }

    let cookie = join_cookie_pairs(&set_cookies);
    info!(cookies = set_cookies.len(), "panel login succeeded");
    Ok(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LOGIN_PAGE: &str = r#"
<html><body>
  <form id="login" method="post" action="/NumberPanel/signin">
    <input type="hidden" name="csrf_token" value="tok123">
    <input type="text" name="username" value="">
    <input type="password" name="password">
    <input type="submit" value="Sign in">
    <input type="text" name="capt" value="7">
  </form>
  <form id="other"><input name="search_user" value="x"></form>
</body></html>
"#;

    fn creds() -> Credentials {
        Credentials {
            user: "alice".into(),
            pass: "s3cret".into(),
        }
    }

    fn client_for(server: &MockServer) -> PanelClient {
        let config = Config {
            panel_host: server.uri(),
            login_path: "/NumberPanel/login".into(),
            timeout_ms: 2_000,
            ..Config::default()
        };
        PanelClient::new(&config).unwrap()
    }

    async fn mount_login_page(server: &MockServer, html: &str) {
        Mock::given(method("GET"))
            .and(path("/NumberPanel/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string(html.to_string()))
            .mount(server)
            .await;
    }

    #[test]
    fn parse_first_form_only() {
        let fields = parse_login_form(LOGIN_PAGE);
        assert_eq!(fields.names(), vec!["csrf_token", "username", "password", "capt"]);
        assert_eq!(fields.get("csrf_token"), Some("tok123"));
        assert_eq!(fields.get("password"), Some(""));
        assert_eq!(fields.get("search_user"), None);
    }

    #[test]
    fn parse_page_without_form_is_empty() {
        let fields = parse_login_form("<html><body><input name='user'></body></html>");
        assert!(fields.names().is_empty());
    }

    #[test]
    fn repeated_name_keeps_position_takes_last_value() {
        let fields = parse_login_form(
            r#"<form><input name="a" value="1"><input name="b"><input name="a" value="2"></form>"#,
        );
        assert_eq!(fields.names(), vec!["a", "b"]);
        assert_eq!(fields.get("a"), Some("2"));
    }

    #[test]
    fn detect_matches_case_insensitive_patterns() {
        let fields = parse_login_form(
            r#"<form><input name="tok"><input name="EMAIL_addr"><input name="UserPwd2"></form>"#,
        );
        let (user, pass) = detect_credential_fields(&fields).unwrap();
        assert_eq!(user, "EMAIL_addr");
        assert_eq!(pass, "UserPwd2");
    }

    #[test]
    fn detect_failure_lists_found_fields() {
        let fields = parse_login_form(
            r#"<form><input name="foo"><input name="bar" value="1"><input type="submit"></form>"#,
        );
        match detect_credential_fields(&fields) {
            Err(LoginError::FieldsNotFound { found_fields }) => {
                assert_eq!(found_fields, vec!["foo", "bar"]);
            }
            other => panic!("expected FieldsNotFound, got {:?}", other),
        }
    }

    #[test]
    fn detect_requires_both_fields() {
        let fields = parse_login_form(r#"<form><input name="login"><input name="code"></form>"#);
        assert!(matches!(
            detect_credential_fields(&fields),
            Err(LoginError::FieldsNotFound { .. })
        ));
    }

    #[test]
    fn build_form_fills_credentials_keeps_hidden_fields() {
        let form = build_login_form(LOGIN_PAGE, &creds()).unwrap();
        assert_eq!(form.get("username"), Some("alice"));
        assert_eq!(form.get("password"), Some("s3cret"));
        assert_eq!(form.get("csrf_token"), Some("tok123"));
        assert_eq!(form.get("capt"), Some("7"));
    }

    #[test]
    fn join_cookie_pairs_drops_attributes_keeps_order() {
        let raw = vec![
            "PHPSESSID=abc123; path=/; HttpOnly".to_string(),
            "lang=en; Expires=Wed, 21 Oct 2026 07:28:00 GMT".to_string(),
            "plain=1".to_string(),
        ];
        assert_eq!(join_cookie_pairs(&raw), "PHPSESSID=abc123; lang=en; plain=1");
    }

    #[test]
    fn truncate_counts_chars() {
        let long = "é".repeat(900);
        let t = truncate_chars(&long, SAMPLE_MAX_CHARS);
        assert_eq!(t.chars().count(), 800);
        assert_eq!(truncate_chars("short", SAMPLE_MAX_CHARS), "short");
    }

    #[test]
    fn credentials_resolve_prefers_non_empty_override() {
        let c = Credentials::resolve(Some("bob"), Some(""), "def_user", "def_pass");
        assert_eq!(c.user, "bob");
        assert_eq!(c.pass, "def_pass");
        let c = Credentials::resolve(None, None, "def_user", "def_pass");
        assert_eq!(c.user, "def_user");
        assert_eq!(c.pass, "def_pass");
    }

    #[tokio::test]
    async fn login_with_direct_set_cookie() {
        let server = MockServer::start().await;
        mount_login_page(&server, LOGIN_PAGE).await;
        Mock::given(method("POST"))
            .and(path("/NumberPanel/login"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(header("user-agent", PANEL_USER_AGENT))
            .and(body_string_contains("username=alice"))
            .and(body_string_contains("password=s3cret"))
            .and(body_string_contains("csrf_token=tok123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("set-cookie", "PHPSESSID=abc123; path=/")
                    .append_header("set-cookie", "lang=en; HttpOnly"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cookie = login(&client_for(&server), &creds()).await.unwrap();
        assert_eq!(cookie, "PHPSESSID=abc123; lang=en");
    }

    #[tokio::test]
    async fn login_cookie_on_redirect_response_is_used_without_following() {
        let server = MockServer::start().await;
        mount_login_page(&server, LOGIN_PAGE).await;
        Mock::given(method("POST"))
            .and(path("/NumberPanel/login"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "/NumberPanel/agent/")
                    .append_header("set-cookie", "PHPSESSID=on302; path=/"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/NumberPanel/agent/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cookie = login(&client_for(&server), &creds()).await.unwrap();
        assert_eq!(cookie, "PHPSESSID=on302");
    }

    #[tokio::test]
    async fn login_follows_one_redirect_for_cookie() {
        let server = MockServer::start().await;
        mount_login_page(&server, LOGIN_PAGE).await;
        Mock::given(method("POST"))
            .and(path("/NumberPanel/login"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "/NumberPanel/agent/"),
            )
            .mount(&server)
            .await;
        let referer = format!("{}/NumberPanel/login", server.uri());
        Mock::given(method("GET"))
            .and(path("/NumberPanel/agent/"))
            .and(header("referer", referer.as_str()))
            .respond_with(
                ResponseTemplate::new(200).append_header("set-cookie", "PHPSESSID=fromhop; path=/"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cookie = login(&client_for(&server), &creds()).await.unwrap();
        assert_eq!(cookie, "PHPSESSID=fromhop");
    }

    #[tokio::test]
    async fn login_follows_exactly_one_hop() {
        let server = MockServer::start().await;
        mount_login_page(&server, LOGIN_PAGE).await;
        Mock::given(method("POST"))
            .and(path("/NumberPanel/login"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/hop1"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hop1"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/hop2"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hop2"))
            .respond_with(ResponseTemplate::new(200).append_header("set-cookie", "late=1"))
            .expect(0)
            .mount(&server)
            .await;

        let err = login(&client_for(&server), &creds()).await.unwrap_err();
        assert!(matches!(err, LoginError::NoCookie { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn login_without_cookie_returns_truncated_sample() {
        let server = MockServer::start().await;
        mount_login_page(&server, LOGIN_PAGE).await;
        let body = format!("<html>Invalid credentials{}</html>", "x".repeat(2_000));
        Mock::given(method("POST"))
            .and(path("/NumberPanel/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.clone()))
            .mount(&server)
            .await;

        match login(&client_for(&server), &creds()).await {
            Err(LoginError::NoCookie { sample }) => {
                assert_eq!(sample.chars().count(), SAMPLE_MAX_CHARS);
                assert!(sample.starts_with("<html>Invalid credentials"));
                assert!(body.starts_with(&sample));
            }
            other => panic!("expected NoCookie, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn login_redirect_without_location_is_no_cookie() {
        let server = MockServer::start().await;
        mount_login_page(&server, LOGIN_PAGE).await;
        Mock::given(method("POST"))
            .and(path("/NumberPanel/login"))
            .respond_with(ResponseTemplate::new(303).set_body_string("moved"))
            .mount(&server)
            .await;

        match login(&client_for(&server), &creds()).await {
            Err(LoginError::NoCookie { sample }) => assert_eq!(sample, "moved"),
            other => panic!("expected NoCookie, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn login_field_detection_failure_skips_post() {
        let server = MockServer::start().await;
        mount_login_page(&server, r#"<form><input name="q"><input name="go"></form>"#).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        match login(&client_for(&server), &creds()).await {
            Err(LoginError::FieldsNotFound { found_fields }) => {
                assert_eq!(found_fields, vec!["q", "go"]);
            }
            other => panic!("expected FieldsNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn login_page_redirect_is_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/NumberPanel/login"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/NumberPanel/login/"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/NumberPanel/login/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/NumberPanel/login"))
            .and(body_string_contains("username=alice"))
            .respond_with(
                ResponseTemplate::new(200).append_header("set-cookie", "PHPSESSID=abc123; path=/"),
            )
            .mount(&server)
            .await;

        let cookie = login(&client_for(&server), &creds()).await.unwrap();
        assert_eq!(cookie, "PHPSESSID=abc123");
    }

    /// Serves the login page, then answers the form POST with a body cut short.
    async fn spawn_truncating_panel() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&buf).to_string();
                        let Some(end) = text.find("\r\n\r\n") else {
                            continue;
                        };
                        let content_length = text[..end]
                            .lines()
                            .filter_map(|l| l.split_once(':'))
                            .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if buf.len() >= end + 4 + content_length {
                            break;
                        }
                    }
                    let response = if buf.starts_with(b"POST") {
                        "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\npartial"
                            .to_string()
                    } else {
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            LOGIN_PAGE.len(),
                            LOGIN_PAGE
                        )
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn login_body_read_failure_is_request_error() {
        let config = Config {
            panel_host: spawn_truncating_panel().await,
            timeout_ms: 2_000,
            ..Config::default()
        };
        let client = PanelClient::new(&config).unwrap();
        let err = login(&client, &creds()).await.unwrap_err();
        assert_eq!(err.kind(), "error");
        assert!(err.to_string().contains("read login response"), "{}", err);
    }

    #[test]
    fn set_cookie_values_skips_non_ascii_values() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, reqwest::header::HeaderValue::from_static("a=1; path=/"));
        headers.append(
            SET_COOKIE,
            reqwest::header::HeaderValue::from_bytes(b"b=\xe9t\xe9").unwrap(),
        );
        headers.append(SET_COOKIE, reqwest::header::HeaderValue::from_static("c=3"));
        assert_eq!(set_cookie_values(&headers), vec!["a=1; path=/", "c=3"]);
    }

    #[tokio::test]
    async fn login_unreachable_panel_is_request_error() {
        let config = Config {
            panel_host: "http://127.0.0.1:1".into(),
            timeout_ms: 1_000,
            ..Config::default()
        };
        let client = PanelClient::new(&config).unwrap();
        let err = login(&client, &creds()).await.unwrap_err();
        assert_eq!(err.kind(), "error");
        assert!(err.to_string().contains("fetch login page"), "{}", err);
    }
}
