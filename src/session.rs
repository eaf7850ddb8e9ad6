//! Session cookie storage: one plain-text file plus an in-memory holder that mirrors it.
//!
//! **Single-writer assumption:** only one proxy process should use a given cookie file.
//! Concurrent logins inside the process are last-write-wins.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Flat file holding the raw (unmasked) session cookie.
#[derive(Debug, Clone)]
pub struct CookieFile {
    path: PathBuf,
}

impl CookieFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read and trim the stored cookie. Missing, unreadable, or empty file → None.
    pub fn load(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => {
                let s = s.trim();
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no stored session cookie");
                None
            }
        }
    }

    /// Overwrite the file with `cookie`. Errors are logged, not returned.
    pub fn save(&self, cookie: &str) {
        if let Err(e) = std::fs::write(&self.path, cookie) {
            error!(path = %self.path.display(), error = %e, "save session cookie failed");
        }
    }
}

/// Redact a cookie string for display: each `name=value` becomes `name=****<last 4 of value>`.
/// Segments without `=` or with an empty value pass through unchanged.
pub fn mask_cookie(cookie: Option<&str>) -> Option<String> {
    let cookie = cookie?;
    let masked: Vec<String> = cookie
        .split(';')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(mask_segment)
        .collect();
    Some(masked.join("; "))
}

fn mask_segment(segment: &str) -> String {
    match segment.split_once('=') {
        Some((name, value)) if !value.is_empty() => {
            let tail_start = value
                .char_indices()
                .rev()
                .nth(3)
                .map(|(i, _)| i)
                .unwrap_or(0);
            format!("{}=****{}", name, &value[tail_start..])
        }
        _ => segment.to_string(),
    }
}

/// In-memory session cookie owned by the server state, persisted through a [`CookieFile`].
#[derive(Clone)]
pub struct SessionHolder {
    cookie: Arc<RwLock<Option<String>>>,
    file: CookieFile,
}

impl SessionHolder {
    /// Start with whatever a previous run persisted.
    pub fn load(file: CookieFile) -> Self {
        let initial = file.load();
        Self {
            cookie: Arc::new(RwLock::new(initial)),
            file,
        }
    }

    pub async fn get(&self) -> Option<String> {
        self.cookie.read().await.clone()
    }

    /// Replace the in-memory cookie only.
    pub async fn set(&self, cookie: String) {
        *self.cookie.write().await = Some(cookie);
    }

    /// Replace the in-memory cookie and overwrite the file.
    pub async fn persist(&self, cookie: String) {
        self.file.save(&cookie);
        self.set(cookie).await;
    }

    pub async fn masked(&self) -> Option<String> {
        mask_cookie(self.cookie.read().await.as_deref())
    }
}
