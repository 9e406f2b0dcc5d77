//! Pagination descriptors shared by list operations.

use serde::{Deserialize, Serialize};

/// Default number of items per page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Maximum allowed items per page.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Requested page. Out-of-range values are clamped, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// `page` is clamped to at least 1 and `limit` to [1, MAX_PAGE_SIZE].
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Build from optional query parameters; a zero or absent limit means `default_limit`.
    pub fn from_query(page: Option<u32>, limit: Option<u32>, default_limit: u32) -> Self {
        let limit = match limit {
            Some(l) if l > 0 => l,
            _ => default_limit,
        };
        Self::new(page.unwrap_or(1), limit)
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }

    pub fn total_pages(&self, total: u64) -> u32 {
        if total == 0 {
            return 0;
        }
        total.div_ceil(u64::from(self.limit)) as u32
    }

    /// Slice an already filtered and sorted collection into this page.
    pub fn apply<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len() as u64;
        let page_items = items
            .into_iter()
            .skip(self.offset())
            .take(self.limit as usize)
            .collect();
        Page::new(page_items, total, self)
    }
}

/// Pagination metadata returned with every list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
}

/// One page of results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: PageInfo,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, request: &PageRequest) -> Self {
        Self {
            items,
            pagination: PageInfo {
                page: request.page,
                limit: request.limit,
                total,
                total_pages: request.total_pages(total),
            },
        }
    }

    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            items: self.items.into_iter().map(f).collect(),
            pagination: self.pagination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_page_and_limit() {
        let p = PageRequest::new(0, 1000);
        assert_eq!(p.page, 1);
        assert_eq!(p.limit, MAX_PAGE_SIZE);
        assert_eq!(PageRequest::new(3, 0).limit, 1);
    }

    #[test]
    fn from_query_uses_default_limit() {
        assert_eq!(PageRequest::from_query(None, None, 50).limit, 50);
        assert_eq!(PageRequest::from_query(Some(2), Some(0), 50).limit, 50);
        assert_eq!(PageRequest::from_query(Some(2), Some(10), 50).page, 2);
    }

    #[test]
    fn total_pages_rounds_up() {
        let p = PageRequest::new(1, 20);
        assert_eq!(p.total_pages(0), 0);
        assert_eq!(p.total_pages(1), 1);
        assert_eq!(p.total_pages(20), 1);
        assert_eq!(p.total_pages(21), 2);
    }

    #[test]
    fn apply_slices_requested_page() {
        let page = PageRequest::new(2, 3).apply((1..=8).collect::<Vec<_>>());
        assert_eq!(page.items, vec![4, 5, 6]);
        assert_eq!(page.pagination.total, 8);
        assert_eq!(page.pagination.total_pages, 3);

        let past_end = PageRequest::new(5, 3).apply((1..=8).collect::<Vec<_>>());
        assert!(past_end.items.is_empty());
    }
}
