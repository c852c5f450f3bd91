//! Cursor / newer-than pagination.
//!
//! Epistemic foundation:
//! - K_i: The origin returns pages newest first, so once a page's newest
//!   record predates the stop date every later page does too
//! - B_i: The continuation cursor advances (might not) → fatal error instead
//!   of an endless loop

use crate::models::{ExportError, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::marker::PhantomData;
use tracing::debug;

/// Input of one cursor fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorRequest {
    /// Opaque continuation from the previous page, `None` for the first page
    pub after: Option<String>,
    /// Records updated before this instant are not wanted
    pub stop_on: Option<DateTime<Utc>>,
}

/// One page of a cursor-paginated collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPage<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
    /// Largest `updated_at` on the page, if the origin orders by it
    pub newest_updated_at: Option<DateTime<Utc>>,
}

impl<T> CursorPage<T> {
    /// A terminal page.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            has_more: false,
            next_cursor: None,
            newest_updated_at: None,
        }
    }
}

/// Pull-style driver: call [`next_page`](Self::next_page) until it yields `None`.
pub struct CursorPaginator<T, F> {
    fetch: F,
    stop_on: Option<DateTime<Utc>>,
    cursor: Option<String>,
    finished: bool,
    pages: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F, Fut> CursorPaginator<T, F>
where
    F: FnMut(CursorRequest) -> Fut,
    Fut: Future<Output = Result<CursorPage<T>>>,
{
    pub fn new(stop_on: Option<DateTime<Utc>>, fetch: F) -> Self {
        Self {
            fetch,
            stop_on,
            cursor: None,
            finished: false,
            pages: 0,
            _marker: PhantomData,
        }
    }

    /// Fetch the next page, `Ok(None)` once the collection is exhausted or
    /// the stop date has been crossed.
    pub async fn next_page(&mut self) -> Result<Option<CursorPage<T>>> {
        if self.finished {
            return Ok(None);
        }

        let request = CursorRequest {
            after: self.cursor.clone(),
            stop_on: self.stop_on,
        };
        let page = (self.fetch)(request).await?;
        self.pages += 1;

        let crossed_stop = match (self.stop_on, page.newest_updated_at) {
            (Some(stop_on), Some(newest)) => newest < stop_on,
            _ => false,
        };

        if !page.has_more || crossed_stop {
            debug!(pages = self.pages, crossed_stop, "Cursor pagination finished");
            self.finished = true;
        } else {
            match &page.next_cursor {
                Some(next) if self.cursor.as_ref() != Some(next) => {
                    self.cursor = Some(next.clone());
                }
                Some(next) => {
                    return Err(ExportError::Pagination(format!(
                        "cursor did not advance past {next}"
                    )));
                }
                None => {
                    return Err(ExportError::Pagination(
                        "page has more results but no continuation cursor".into(),
                    ));
                }
            }
        }

        Ok(Some(page))
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Feed every page to `handler` in request order. A handler error aborts
    /// the pagination with that error. Returns the number of pages.
    pub async fn drain<H, HFut>(mut self, mut handler: H) -> Result<usize>
    where
        H: FnMut(CursorPage<T>) -> HFut,
        HFut: Future<Output = Result<()>>,
    {
        while let Some(page) = self.next_page().await? {
            handler(page).await?;
        }
        Ok(self.pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    /// Three pages, newest first: days 9-8, 6-5, 3-2.
    fn fetch_fixture(
        seen: Arc<Mutex<Vec<Option<String>>>>,
    ) -> impl FnMut(CursorRequest) -> std::future::Ready<Result<CursorPage<u32>>> {
        move |req: CursorRequest| {
            seen.lock().push(req.after.clone());
            let page = match req.after.as_deref() {
                None => CursorPage {
                    items: vec![9, 8],
                    has_more: true,
                    next_cursor: Some("c1".into()),
                    newest_updated_at: Some(at(9)),
                },
                Some("c1") => CursorPage {
                    items: vec![6, 5],
                    has_more: true,
                    next_cursor: Some("c2".into()),
                    newest_updated_at: Some(at(6)),
                },
                _ => CursorPage {
                    items: vec![3, 2],
                    has_more: false,
                    next_cursor: None,
                    newest_updated_at: Some(at(3)),
                },
            };
            std::future::ready(Ok(page))
        }
    }

    #[tokio::test]
    async fn test_drains_all_pages_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut items = Vec::new();
        let pages = CursorPaginator::new(None, fetch_fixture(seen.clone()))
            .drain(|page| {
                items.extend(page.items);
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(pages, 3);
        assert_eq!(items, vec![9, 8, 6, 5, 3, 2]);
        assert_eq!(
            *seen.lock(),
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_stops_after_page_older_than_stop_date() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut paginator = CursorPaginator::new(Some(at(7)), fetch_fixture(seen.clone()));

        assert_eq!(paginator.next_page().await.unwrap().unwrap().items, vec![9, 8]);
        // Newest on this page is day 6 < day 7: yielded, then finished.
        assert_eq!(paginator.next_page().await.unwrap().unwrap().items, vec![6, 5]);
        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_handler_error_aborts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let err = CursorPaginator::new(None, fetch_fixture(seen.clone()))
            .drain(|_page| async { Err(ExportError::ChannelClosed) })
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::ChannelClosed));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_cursor_is_fatal() {
        let mut paginator = CursorPaginator::new(None, |_req: CursorRequest| async {
            Ok(CursorPage {
                items: vec![1u32],
                has_more: true,
                next_cursor: Some("same".to_string()),
                newest_updated_at: None,
            })
        });
        assert!(paginator.next_page().await.unwrap().is_some());
        assert!(matches!(
            paginator.next_page().await,
            Err(ExportError::Pagination(_))
        ));
    }
}
