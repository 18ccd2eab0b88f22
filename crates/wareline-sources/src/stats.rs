//! Development-statistics API source
//!
//! Walks every configured indicator for a fixed set of countries. Responses
//! are two-element arrays `[meta, records]`; the cursor encodes the
//! indicator position and page number as `"<indicator>:<page>"`.

use std::time::Duration;

use serde::Deserialize;
use wareline_core::{Cursor, Page, RawRecord, Source, SourceError};

use crate::http::{http_client, parse_json, send_text};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub base_url: String,
    pub indicators: Vec<String>,
    pub countries: Vec<String>,
    /// `from:to` year range
    pub date_range: String,
    pub per_page: usize,
    /// Pause between consecutive requests
    pub page_delay_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.worldbank.org/v2".into(),
            indicators: [
                "SP.POP.TOTL",
                "NY.GDP.MKTP.CD",
                "NY.GDP.PCAP.CD",
                "SP.DYN.LE00.IN",
                "SE.ADT.LITR.ZS",
                "SH.DYN.MORT",
                "EN.ATM.CO2E.PC",
            ]
            .map(String::from)
            .to_vec(),
            countries: ["EG", "SA", "AE", "JO", "NG", "ZA", "KE"]
                .map(String::from)
                .to_vec(),
            date_range: "2010:2023".into(),
            per_page: 1000,
            page_delay_ms: 500,
        }
    }
}

/// Position in the indicator × page walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsPosition {
    pub indicator: usize,
    /// 1-based page number
    pub page: u32,
}

impl StatsPosition {
    pub const START: Self = Self {
        indicator: 0,
        page: 1,
    };

    pub fn parse(cursor: &Cursor) -> Result<Self, SourceError> {
        let bad = || SourceError::Decode {
            message: format!("malformed stats cursor {cursor:?}"),
        };
        let (indicator, page) = cursor.as_str().split_once(':').ok_or_else(bad)?;
        Ok(Self {
            indicator: indicator.parse().map_err(|_| bad())?,
            page: page.parse().ok().filter(|&p| p >= 1).ok_or_else(bad)?,
        })
    }

    pub fn to_cursor(self) -> Cursor {
        Cursor::new(format!("{}:{}", self.indicator, self.page))
    }

    /// Position after a page reporting `pages` total pages, or `None` once
    /// the last indicator is exhausted.
    pub fn advance(self, pages: u32, indicators: usize) -> Option<Self> {
        if self.page < pages {
            Some(Self {
                page: self.page + 1,
                ..self
            })
        } else if self.indicator + 1 < indicators {
            Some(Self {
                indicator: self.indicator + 1,
                page: 1,
            })
        } else {
            None
        }
    }
}

/// One decoded response page.
#[derive(Debug, Default)]
pub struct StatsPage {
    pub pages: u32,
    pub records: Vec<RawRecord>,
}

/// Decode a `[meta, records]` response. Observations without a value are
/// dropped. A missing or null record array is an empty page.
pub fn parse_stats_page(body: &str) -> Result<StatsPage, SourceError> {
    let json = parse_json(body, "stats page")?;
    let parts = json.as_array().ok_or_else(|| SourceError::Decode {
        message: "stats page is not an array".into(),
    })?;
    let Some(meta) = parts.first() else {
        return Ok(StatsPage::default());
    };
    if let Some(message) = meta.get("message") {
        return Err(SourceError::Decode {
            message: format!("stats API error: {message}"),
        });
    }

    // `pages` arrives as a number or a numeric string depending on the endpoint
    let pages = match &meta["pages"] {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .unwrap_or(1) as u32;

    let records = parts
        .get(1)
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    serde_json::Value::Object(map)
                        if map.get("value").is_some_and(|v| !v.is_null()) =>
                    {
                        Some(map.clone())
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(StatsPage { pages, records })
}

pub struct StatsSource {
    config: StatsConfig,
    requests: usize,
}

impl StatsSource {
    pub fn new(config: StatsConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.indicators.is_empty(), "stats.indicators is empty");
        anyhow::ensure!(!config.countries.is_empty(), "stats.countries is empty");
        anyhow::ensure!(config.per_page > 0, "stats.per_page must be positive");
        Ok(Self {
            config,
            requests: 0,
        })
    }

    pub fn page_url(&self, pos: StatsPosition) -> String {
        format!(
            "{}/country/{}/indicator/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.countries.join(";"),
            self.config.indicators[pos.indicator]
        )
    }

    fn request(&mut self, pos: StatsPosition) -> Result<StatsPage, SourceError> {
        if self.requests > 0 && self.config.page_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.page_delay_ms));
        }
        self.requests += 1;

        let per_page = self.config.per_page.to_string();
        let page = pos.page.to_string();
        let request = http_client().get(self.page_url(pos)).query(&[
            ("format", "json"),
            ("date", self.config.date_range.as_str()),
            ("per_page", per_page.as_str()),
            ("page", page.as_str()),
        ]);
        parse_stats_page(&send_text(request)?)
    }
}

impl Source for StatsSource {
    fn name(&self) -> &str {
        "stats"
    }

    /// An empty page ends the stream, so indicators (or pages) with no
    /// usable observations are skipped here rather than returned.
    fn fetch_page(&mut self, cursor: Option<&Cursor>) -> Result<Page, SourceError> {
        let mut pos = match cursor {
            Some(c) => StatsPosition::parse(c)?,
            None => StatsPosition::START,
        };
        let indicators = self.config.indicators.len();
        if pos.indicator >= indicators {
            return Ok(Page::default());
        }

        loop {
            let page = self.request(pos)?;
            let next = pos.advance(page.pages, indicators);
            log::debug!(
                "stats: {} page {}/{}: {} observations",
                self.config.indicators[pos.indicator],
                pos.page,
                page.pages,
                page.records.len()
            );
            if !page.records.is_empty() {
                return Ok(Page {
                    records: page.records,
                    next: next.map(StatsPosition::to_cursor),
                });
            }
            match next {
                Some(p) => pos = p,
                None => return Ok(Page::default()),
            }
        }
    }
}
