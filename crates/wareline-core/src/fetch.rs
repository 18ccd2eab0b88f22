//! Paginated fetch with cursor continuation and per-page retry
//!
//! [`PageFetcher`] drives a [`Source`] one page at a time:
//!
//! ```text
//! FETCHING → (RETRYING → FETCHING)* → DONE | FAILED
//! ```
//!
//! The sequence ends (DONE) when a page comes back empty or without a
//! continuation cursor. It fails when a page exhausts its retry budget,
//! hits a permanent error, when the cursor stops advancing, or on
//! cancellation. After DONE or FAILED the iterator only yields `None`.

use std::fmt;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::archive::PageArchive;
use crate::cancel::CancelToken;
use crate::error::{PipelineError, SourceError, Stage};
use crate::normalize::RawRecord;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Opaque continuation token (URL, page number, offset...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page as returned by a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// `None` when this is the last page
    pub next: Option<Cursor>,
}

/// Paginated source of raw records.
///
/// `cursor` is `None` for the first page. Implementations only fetch; retry,
/// loop detection and archiving are the fetcher's job.
pub trait Source {
    fn name(&self) -> &str;

    fn fetch_page(&mut self, cursor: Option<&Cursor>) -> Result<Page, SourceError>;
}

/// A page yielded by [`PageFetcher`], with its position in the run.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub index: usize,
    pub cursor: Option<Cursor>,
    pub next: Option<Cursor>,
    pub records: Vec<RawRecord>,
    /// Attempts it took (1 = no retry)
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Fetching,
    Done,
    Failed,
}

pub struct PageFetcher<'a> {
    source: &'a mut dyn Source,
    policy: RetryPolicy,
    cursor: Option<Cursor>,
    visited: FxHashSet<Option<Cursor>>,
    index: usize,
    state: FetchState,
    archive: Option<&'a mut PageArchive>,
    cancel: Option<&'a CancelToken>,
}

impl<'a> PageFetcher<'a> {
    pub fn new(source: &'a mut dyn Source, policy: RetryPolicy, start: Option<Cursor>) -> Self {
        Self {
            source,
            policy,
            cursor: start,
            visited: FxHashSet::default(),
            index: 0,
            state: FetchState::Fetching,
            archive: None,
            cancel: None,
        }
    }

    /// Persist every page to `archive` before yielding it.
    pub fn with_archive(mut self, archive: &'a mut PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Number of pages yielded so far.
    pub fn pages(&self) -> usize {
        self.index
    }

    fn fail(&mut self, err: impl Into<PipelineError>) -> Option<Result<FetchedPage, PipelineError>> {
        self.state = FetchState::Failed;
        Some(Err(err.into()))
    }

    fn label(&self) -> String {
        match &self.cursor {
            Some(c) => format!("{} page {} ({c})", self.source.name(), self.index),
            None => format!("{} page {}", self.source.name(), self.index),
        }
    }
}

impl Iterator for PageFetcher<'_> {
    type Item = Result<FetchedPage, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != FetchState::Fetching {
            return None;
        }
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            return self.fail(PipelineError::Cancelled {
                stage: Stage::Extract,
            });
        }

        self.visited.insert(self.cursor.clone());
        let label = self.label();
        let cursor = self.cursor.clone();
        let source = &mut *self.source;
        let result = retry_with_backoff(&label, &self.policy, self.cancel, |_| {
            source.fetch_page(cursor.as_ref())
        });
        let (page, attempts) = match result {
            Ok(ok) => ok,
            Err(_) if self.cancel.is_some_and(CancelToken::is_cancelled) => {
                return self.fail(PipelineError::Cancelled {
                    stage: Stage::Extract,
                });
            }
            Err(e) => return self.fail(e),
        };

        if page.records.is_empty() {
            log::debug!("{label}: empty page, done");
            self.state = FetchState::Done;
            return None;
        }

        match &page.next {
            Some(next) if self.visited.contains(&Some(next.clone())) => {
                return self.fail(SourceError::CursorStalled {
                    cursor: next.clone(),
                });
            }
            Some(next) => self.cursor = Some(next.clone()),
            None => self.state = FetchState::Done,
        }

        let fetched = FetchedPage {
            index: self.index,
            cursor,
            next: page.next,
            records: page.records,
            attempts,
        };

        if let Some(archive) = self.archive.as_deref_mut() {
            if let Err(e) = archive.write_page(&fetched) {
                return self.fail(PipelineError::Io(e));
            }
        }

        log::debug!("{label}: {} records", fetched.records.len());
        self.index += 1;
        Some(Ok(fetched))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Source replaying a fixed script of responses, recording requested cursors.
    pub(crate) struct ScriptedSource {
        pub responses: VecDeque<Result<Page, SourceError>>,
        pub requested: Vec<Option<Cursor>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(responses: Vec<Result<Page, SourceError>>) -> Self {
            Self {
                responses: responses.into(),
                requested: Vec::new(),
            }
        }
    }

    impl Source for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn fetch_page(&mut self, cursor: Option<&Cursor>) -> Result<Page, SourceError> {
            self.requested.push(cursor.cloned());
            self.responses.pop_front().unwrap_or(Ok(Page::default()))
        }
    }

    pub(crate) fn page(ids: &[&str], next: Option<&str>) -> Page {
        Page {
            records: ids
                .iter()
                .map(|id| {
                    let mut m = RawRecord::new();
                    m.insert("id".into(), serde_json::Value::String(id.to_string()));
                    m
                })
                .collect(),
            next: next.map(Cursor::new),
        }
    }

    fn unavailable() -> SourceError {
        SourceError::Http {
            status: Some(503),
            message: "unavailable".into(),
        }
    }

    #[test]
    fn follows_cursors_until_no_next() {
        let mut src = ScriptedSource::new(vec![
            Ok(page(&["a", "b"], Some("p2"))),
            Ok(page(&["c"], None)),
        ]);
        let pages: Vec<_> = PageFetcher::new(&mut src, RetryPolicy::no_delay(3), None)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].cursor, Some(Cursor::new("p2")));
        assert_eq!(pages[1].index, 1);
        assert_eq!(src.requested, vec![None, Some(Cursor::new("p2"))]);
    }

    #[test]
    fn empty_page_ends_sequence() {
        let mut src = ScriptedSource::new(vec![
            Ok(page(&["a"], Some("p2"))),
            Ok(page(&[], Some("p3"))),
        ]);
        let pages: Vec<_> = PageFetcher::new(&mut src, RetryPolicy::no_delay(3), None)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(src.requested.len(), 2);
    }

    #[test]
    fn empty_first_page_yields_nothing() {
        let mut src = ScriptedSource::new(vec![Ok(Page::default())]);
        let mut fetcher = PageFetcher::new(&mut src, RetryPolicy::no_delay(3), None);
        assert!(fetcher.next().is_none());
        assert!(fetcher.next().is_none());
    }

    #[test]
    fn repeated_cursor_fails() {
        let mut src = ScriptedSource::new(vec![
            Ok(page(&["a"], Some("p2"))),
            Ok(page(&["b"], Some("p2"))),
        ]);
        let mut fetcher = PageFetcher::new(&mut src, RetryPolicy::no_delay(3), None);
        assert!(fetcher.next().unwrap().is_ok());
        match fetcher.next() {
            Some(Err(PipelineError::Source(SourceError::CursorStalled { cursor }))) => {
                assert_eq!(cursor.as_str(), "p2");
            }
            other => panic!("expected stalled cursor, got {other:?}"),
        }
        assert!(fetcher.next().is_none());
    }

    #[test]
    fn cursor_loop_fails() {
        let mut src = ScriptedSource::new(vec![
            Ok(page(&["a"], Some("p2"))),
            Ok(page(&["b"], Some("p3"))),
            Ok(page(&["c"], Some("p2"))),
        ]);
        let results: Vec<_> = PageFetcher::new(&mut src, RetryPolicy::no_delay(3), None).collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(
            results[2],
            Err(PipelineError::Source(SourceError::CursorStalled { .. }))
        ));
    }

    #[test]
    fn transient_failures_retried() {
        let mut src = ScriptedSource::new(vec![
            Err(unavailable()),
            Err(unavailable()),
            Ok(page(&["a"], None)),
        ]);
        let pages: Vec<_> = PageFetcher::new(&mut src, RetryPolicy::no_delay(3), None)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(pages[0].attempts, 3);
        assert_eq!(src.requested, vec![None, None, None]);
    }

    #[test]
    fn retries_exhausted_fails() {
        let mut src = ScriptedSource::new(vec![
            Ok(page(&["a"], Some("p2"))),
            Err(unavailable()),
            Err(unavailable()),
        ]);
        let results: Vec<_> = PageFetcher::new(&mut src, RetryPolicy::no_delay(2), None).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[1],
            Err(PipelineError::Source(SourceError::RetriesExhausted { attempts: 2, .. }))
        ));
    }

    #[test]
    fn cancellation_stops_before_next_request() {
        let mut src = ScriptedSource::new(vec![
            Ok(page(&["a"], Some("p2"))),
            Ok(page(&["b"], None)),
        ]);
        let cancel = CancelToken::new();
        let mut fetcher =
            PageFetcher::new(&mut src, RetryPolicy::no_delay(3), None).with_cancel(&cancel);
        assert!(fetcher.next().unwrap().is_ok());
        cancel.cancel();
        assert!(matches!(
            fetcher.next(),
            Some(Err(PipelineError::Cancelled {
                stage: Stage::Extract
            }))
        ));
        drop(fetcher);
        assert_eq!(src.requested.len(), 1);
    }

    /// Fails transiently and cancels the run on its first request.
    struct CancellingSource {
        cancel: CancelToken,
        calls: usize,
    }

    impl Source for CancellingSource {
        fn name(&self) -> &str {
            "cancelling"
        }

        fn fetch_page(&mut self, _cursor: Option<&Cursor>) -> Result<Page, SourceError> {
            self.calls += 1;
            self.cancel.cancel();
            Err(unavailable())
        }
    }

    #[test]
    fn cancellation_cuts_backoff_short() {
        let cancel = CancelToken::new();
        let mut src = CancellingSource {
            cancel: cancel.clone(),
            calls: 0,
        };
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        };
        let started = std::time::Instant::now();
        let mut fetcher = PageFetcher::new(&mut src, policy, None).with_cancel(&cancel);
        assert!(matches!(
            fetcher.next(),
            Some(Err(PipelineError::Cancelled {
                stage: Stage::Extract
            }))
        ));
        assert!(fetcher.next().is_none());
        drop(fetcher);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(src.calls, 1);
    }

    #[test]
    fn starts_from_given_cursor() {
        let mut src = ScriptedSource::new(vec![Ok(page(&["x"], None))]);
        let pages: Vec<_> =
            PageFetcher::new(&mut src, RetryPolicy::no_delay(1), Some(Cursor::new("p7")))
                .collect::<Result<_, _>>()
                .unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(src.requested, vec![Some(Cursor::new("p7"))]);
    }
}
