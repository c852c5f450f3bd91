//! Offset-based pagination.
//!
//! K_i: The next offset advances by the page size the origin reports,
//! falling back to the number of items returned.
//! B_i: The origin advances (might not) → a zero advance with `has_more` is fatal.

use crate::models::{ExportError, Result};
use std::future::Future;
use std::marker::PhantomData;
use tracing::debug;

/// Input of one offset fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRequest {
    pub offset: u64,
    pub page_size: u64,
}

/// One page of an offset-paginated collection.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetPage<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    /// Page size the origin actually applied, if it reports one
    pub page_size: Option<u64>,
    /// Collection size, if the origin reports one
    pub total: Option<u64>,
}

/// Pull-style driver: call [`next_page`](Self::next_page) until it yields `None`.
pub struct OffsetPaginator<T, F> {
    fetch: F,
    offset: u64,
    page_size: u64,
    finished: bool,
    pages: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F, Fut> OffsetPaginator<T, F>
where
    F: FnMut(OffsetRequest) -> Fut,
    Fut: Future<Output = Result<OffsetPage<T>>>,
{
    /// Start at `start_offset`, usually the last persisted offset or zero.
    pub fn new(start_offset: u64, page_size: u64, fetch: F) -> Self {
        Self {
            fetch,
            offset: start_offset,
            page_size,
            finished: false,
            pages: 0,
            _marker: PhantomData,
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<OffsetPage<T>>> {
        if self.finished {
            return Ok(None);
        }

        let request = OffsetRequest {
            offset: self.offset,
            page_size: self.page_size,
        };
        let page = (self.fetch)(request).await?;
        self.pages += 1;

        let advance = page.page_size.unwrap_or(page.items.len() as u64);
        if page.has_more && advance == 0 {
            return Err(ExportError::Pagination(format!(
                "page at offset {} claims more results but advances by zero",
                self.offset
            )));
        }

        // Offset is "next unread": a short final page only moves it by what was read.
        self.offset += if page.has_more {
            advance
        } else {
            page.items.len() as u64
        };
        if !page.has_more {
            debug!(pages = self.pages, offset = self.offset, "Offset pagination finished");
            self.finished = true;
        }

        Ok(Some(page))
    }

    /// Offset the next fetch would start at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Feed every page to `handler` in request order. Returns the final
    /// offset, suitable as a watermark.
    pub async fn drain<H, HFut>(mut self, mut handler: H) -> Result<u64>
    where
        H: FnMut(OffsetPage<T>) -> HFut,
        HFut: Future<Output = Result<()>>,
    {
        while let Some(page) = self.next_page().await? {
            handler(page).await?;
        }
        Ok(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(total: u64) -> impl FnMut(OffsetRequest) -> std::future::Ready<Result<OffsetPage<u64>>> {
        move |req: OffsetRequest| {
            let end = (req.offset + req.page_size).min(total);
            std::future::ready(Ok(OffsetPage {
                items: (req.offset..end).collect(),
                has_more: end < total,
                page_size: Some(req.page_size),
                total: Some(total),
            }))
        }
    }

    #[tokio::test]
    async fn test_no_page_dropped() {
        let mut all = Vec::new();
        let offset = OffsetPaginator::new(0, 3, fixture(10))
            .drain(|page| {
                all.extend(page.items);
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert_eq!(offset, 10);
    }

    #[tokio::test]
    async fn test_resume_from_offset() {
        let mut paginator = OffsetPaginator::new(8, 3, fixture(10));
        let page = paginator.next_page().await.unwrap().unwrap();
        assert_eq!(page.items, vec![8, 9]);
        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(paginator.pages(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_item_count() {
        let mut calls = 0u64;
        let mut paginator = OffsetPaginator::new(0, 50, move |req: OffsetRequest| {
            calls += 1;
            let page = OffsetPage {
                items: vec![req.offset; 2],
                has_more: calls < 2,
                page_size: None,
                total: None,
            };
            std::future::ready(Ok(page))
        });
        paginator.next_page().await.unwrap();
        assert_eq!(paginator.offset(), 2);
        paginator.next_page().await.unwrap();
        assert_eq!(paginator.offset(), 4);
        assert!(paginator.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_advance_is_fatal() {
        let mut paginator = OffsetPaginator::new(0, 10, |_req: OffsetRequest| {
            std::future::ready(Ok(OffsetPage::<u64> {
                items: Vec::new(),
                has_more: true,
                page_size: None,
                total: None,
            }))
        });
        assert!(matches!(
            paginator.next_page().await,
            Err(ExportError::Pagination(_))
        ));
    }
}
