//! Lazy traversal of cursor-paginated listings.
//!
//! A `PageWalker` is single-pass: it fetches a page only when the previous one
//! has been fully consumed, and once it has returned `None` or an error it stays
//! terminated. Walking the listing again requires a new walker.

use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tracing::debug;

/// One page of a listing and the opaque cursor of the page after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

#[async_trait]
pub trait PageFetcher: Send {
    type Item: Send;
    type Error: std::error::Error + Send + 'static;

    /// Fetch the page at `cursor`, or the first page when `cursor` is `None`.
    async fn fetch(&mut self, cursor: Option<&str>) -> Result<Page<Self::Item>, Self::Error>;
}

#[derive(Debug, Error)]
pub enum WalkError<E: std::error::Error + 'static> {
    #[error("Failed to fetch page {page}: {source}")]
    Fetch {
        page: usize,
        #[source]
        source: E,
    },

    #[error("Listing returned a cursor it had already returned: {0}")]
    CursorLoop(String),
}

/// Position of a walk within the listing.
#[derive(Debug, Default)]
pub struct ImportCursor {
    next: Option<String>,
    exhausted: bool,
    seen: HashSet<String>,
    looped_on: Option<String>,
}

impl ImportCursor {
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

pub struct PageWalker<F: PageFetcher> {
    fetcher: F,
    cursor: ImportCursor,
    buffer: VecDeque<F::Item>,
    pages_fetched: usize,
}

impl<F: PageFetcher> PageWalker<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            cursor: ImportCursor::default(),
            buffer: VecDeque::new(),
            pages_fetched: 0,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn cursor(&self) -> &ImportCursor {
        &self.cursor
    }

    /// Next item in listing order. `None` means the listing is exhausted; an
    /// error ends the walk, though items yielded before it remain valid.
    pub async fn next(&mut self) -> Option<Result<F::Item, WalkError<F::Error>>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            if let Some(cursor) = self.cursor.looped_on.take() {
                return Some(Err(WalkError::CursorLoop(cursor)));
            }
            if self.cursor.exhausted {
                return None;
            }

            let cursor = self.cursor.next.take();
            let page = match self.fetcher.fetch(cursor.as_deref()).await {
                Ok(page) => page,
                Err(source) => {
                    self.cursor.exhausted = true;
                    return Some(Err(WalkError::Fetch {
                        page: self.pages_fetched + 1,
                        source,
                    }));
                }
            };
            self.pages_fetched += 1;
            debug!(
                "Fetched page {} with {} items",
                self.pages_fetched,
                page.items.len()
            );

            match page.next {
                Some(next) if !self.cursor.seen.insert(next.clone()) => {
                    self.cursor.exhausted = true;
                    self.cursor.looped_on = Some(next);
                }
                Some(next) => self.cursor.next = Some(next),
                None => self.cursor.exhausted = true,
            }
            self.buffer.extend(page.items);
        }
    }

    /// The walk as a `Stream` of items. It ends after the first error, like
    /// `next`.
    pub fn into_stream(self) -> impl Stream<Item = Result<F::Item, WalkError<F::Error>>> {
        stream::unfold(self, |mut walker| async move {
            let item = walker.next().await?;
            Some((item, walker))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{StreamExt, TryStreamExt};
    use std::collections::HashMap;
    use std::fmt;

    #[derive(Debug)]
    struct FetchFailed;

    impl fmt::Display for FetchFailed {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("fetch failed")
        }
    }

    impl std::error::Error for FetchFailed {}

    /// Serves pages keyed by cursor ("" for the first page).
    struct ScriptedPages {
        pages: HashMap<String, Result<Page<u32>, ()>>,
        requested: Vec<Option<String>>,
    }

    impl ScriptedPages {
        fn new(pages: Vec<(&str, Result<Page<u32>, ()>)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                requested: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedPages {
        type Item = u32;
        type Error = FetchFailed;

        async fn fetch(&mut self, cursor: Option<&str>) -> Result<Page<u32>, FetchFailed> {
            self.requested.push(cursor.map(str::to_string));
            match self.pages.get(cursor.unwrap_or("")) {
                Some(Ok(page)) => Ok(page.clone()),
                _ => Err(FetchFailed),
            }
        }
    }

    fn page(items: &[u32], next: Option<&str>) -> Result<Page<u32>, ()> {
        Ok(Page {
            items: items.to_vec(),
            next: next.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn test_items_follow_listing_order_across_pages() {
        let fetcher = ScriptedPages::new(vec![
            ("", page(&[1, 2], Some("c2"))),
            ("c2", page(&[3], Some("c3"))),
            ("c3", page(&[4, 5], None)),
        ]);
        let walker = PageWalker::new(fetcher);
        let items: Vec<u32> = walker.into_stream().try_collect().await.unwrap();
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_pages_are_fetched_lazily() {
        let fetcher = ScriptedPages::new(vec![
            ("", page(&[1, 2], Some("c2"))),
            ("c2", page(&[3], None)),
        ]);
        let mut walker = PageWalker::new(fetcher);

        assert_eq!(walker.next().await.unwrap().unwrap(), 1);
        assert_eq!(walker.next().await.unwrap().unwrap(), 2);
        assert_eq!(walker.pages_fetched(), 1);
        assert_eq!(walker.fetcher.requested, vec![None]);

        assert_eq!(walker.next().await.unwrap().unwrap(), 3);
        assert_eq!(walker.pages_fetched(), 2);
        assert!(walker.next().await.is_none());
        assert!(walker.cursor().is_exhausted());
    }

    #[tokio::test]
    async fn test_empty_pages_are_skipped() {
        let fetcher = ScriptedPages::new(vec![
            ("", page(&[], Some("c2"))),
            ("c2", page(&[7], None)),
        ]);
        let walker = PageWalker::new(fetcher);
        let items: Vec<u32> = walker.into_stream().try_collect().await.unwrap();
        assert_eq!(items, vec![7]);
    }

    #[tokio::test]
    async fn test_fetch_failure_ends_walk_after_earlier_items() {
        let fetcher = ScriptedPages::new(vec![
            ("", page(&[1, 2], Some("c2"))),
            ("c2", Err(())),
        ]);
        let mut walker = PageWalker::new(fetcher);

        assert_eq!(walker.next().await.unwrap().unwrap(), 1);
        assert_eq!(walker.next().await.unwrap().unwrap(), 2);
        match walker.next().await {
            Some(Err(WalkError::Fetch { page, .. })) => assert_eq!(page, 2),
            other => panic!("expected fetch error, got {:?}", other.map(|r| r.is_ok())),
        }
        // Terminated: no further fetches.
        assert!(walker.next().await.is_none());
        assert_eq!(walker.fetcher.requested.len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_reported() {
        let fetcher = ScriptedPages::new(vec![
            ("", page(&[1], Some("c2"))),
            ("c2", page(&[2], Some("c2"))),
        ]);
        let mut walker = PageWalker::new(fetcher);

        assert_eq!(walker.next().await.unwrap().unwrap(), 1);
        assert_eq!(walker.next().await.unwrap().unwrap(), 2);
        assert!(matches!(
            walker.next().await,
            Some(Err(WalkError::CursorLoop(c))) if c == "c2"
        ));
        assert!(walker.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_stops_after_cursor_loop() {
        let fetcher = ScriptedPages::new(vec![
            ("", page(&[1], Some("c2"))),
            ("c2", page(&[2], Some("c2"))),
        ]);
        let results: Vec<_> = PageWalker::new(fetcher).into_stream().collect().await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().ok(), Some(&1));
        assert_eq!(results[1].as_ref().ok(), Some(&2));
        assert!(matches!(&results[2], Err(WalkError::CursorLoop(c)) if c == "c2"));
    }

    #[tokio::test]
    async fn test_try_collect_surfaces_fetch_failure() {
        let fetcher = ScriptedPages::new(vec![
            ("", page(&[1, 2], Some("c2"))),
            ("c2", Err(())),
        ]);
        let result: Result<Vec<u32>, _> = PageWalker::new(fetcher).into_stream().try_collect().await;
        assert!(matches!(result, Err(WalkError::Fetch { page: 2, .. })));
    }
}
