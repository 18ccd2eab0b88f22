//! Music catalog playlist source
//!
//! Authenticates with the OAuth client-credentials flow and pages through a
//! playlist's tracks. The cursor is the absolute `next` URL returned by the
//! API, so a run can resume from any archived cursor.

use std::time::{Duration, Instant};

use serde::Deserialize;
use wareline_core::{Cursor, Page, RawRecord, Source, SourceError};

use crate::http::{http_client, parse_json, send_text};

/// Tokens are refreshed this long before the server-side expiry.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub api_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub playlist_id: String,
    /// Tracks per page (the API caps this at 100)
    pub page_size: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.spotify.com/v1".into(),
            auth_url: "https://accounts.spotify.com/api/token".into(),
            client_id: String::new(),
            client_secret: String::new(),
            playlist_id: String::new(),
            page_size: 100,
        }
    }
}

struct Token {
    value: String,
    refresh_at: Instant,
}

pub struct CatalogSource {
    config: CatalogConfig,
    token: Option<Token>,
}

impl CatalogSource {
    pub fn new(config: CatalogConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.client_id.is_empty() && !config.client_secret.is_empty(),
            "catalog.client_id and catalog.client_secret are required"
        );
        anyhow::ensure!(!config.playlist_id.is_empty(), "catalog.playlist_id is required");
        anyhow::ensure!(
            (1..=100).contains(&config.page_size),
            "catalog.page_size must be between 1 and 100, got {}",
            config.page_size
        );
        Ok(Self {
            config,
            token: None,
        })
    }

    /// URL of the first page.
    pub fn first_page_url(&self) -> String {
        format!(
            "{}/playlists/{}/tracks?limit={}",
            self.config.api_url.trim_end_matches('/'),
            self.config.playlist_id,
            self.config.page_size
        )
    }

    fn access_token(&mut self) -> Result<String, SourceError> {
        if let Some(token) = &self.token {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }
        log::debug!("Requesting catalog access token");
        let request = http_client()
            .post(&self.config.auth_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body("grant_type=client_credentials");
        let body = send_text(request)?;
        let (value, expires_in) = parse_token(&body)?;
        let lifetime = Duration::from_secs(expires_in).saturating_sub(TOKEN_MARGIN);
        self.token = Some(Token {
            value: value.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(value)
    }
}

impl Source for CatalogSource {
    fn name(&self) -> &str {
        "catalog"
    }

    fn fetch_page(&mut self, cursor: Option<&Cursor>) -> Result<Page, SourceError> {
        let mut url = match cursor {
            Some(c) => c.as_str().to_string(),
            None => self.first_page_url(),
        };
        // An empty page ends the stream, so pages holding only removed
        // tracks are skipped here
        loop {
            let token = self.access_token()?;
            let body = send_text(http_client().get(&url).bearer_auth(&token))?;
            let page = parse_tracks_page(&body)?;
            log::debug!(
                "catalog: {} tracks, next: {}",
                page.records.len(),
                page.next.as_ref().map_or("none", |c| c.as_str())
            );
            match &page.next {
                Some(next) if page.records.is_empty() => url = next.as_str().to_string(),
                _ => return Ok(page),
            }
        }
    }
}

/// Extract `(access_token, expires_in)` from a token response.
pub fn parse_token(body: &str) -> Result<(String, u64), SourceError> {
    let json = parse_json(body, "token")?;
    let token = json["access_token"]
        .as_str()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| SourceError::Decode {
            message: "token response without access_token".into(),
        })?;
    let expires_in = json["expires_in"].as_u64().unwrap_or(3600);
    Ok((token.to_string(), expires_in))
}

/// Parse one playlist-tracks page. Items whose `track` is null (removed or
/// local-only tracks) are dropped here; everything else is passed through
/// untouched for the normalizer.
pub fn parse_tracks_page(body: &str) -> Result<Page, SourceError> {
    let json = parse_json(body, "playlist page")?;
    let items = json["items"]
        .as_array()
        .ok_or_else(|| SourceError::Decode {
            message: "playlist page without items array".into(),
        })?;

    let mut records: Vec<RawRecord> = Vec::with_capacity(items.len());
    for item in items {
        let serde_json::Value::Object(map) = item else {
            continue;
        };
        if !map.get("track").is_some_and(|t| !t.is_null()) {
            continue;
        }
        records.push(map.clone());
    }

    let next = json["next"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(Cursor::new);
    Ok(Page { records, next })
}
