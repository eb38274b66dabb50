//! Sequence-number pagination for folder listings.
//!
//! A page is the window `[max(1, end - size + 1), end]` where `end` is the
//! page token or, on the first page, the mailbox's `EXISTS` count. The next
//! token is the sequence number just below the window, so listing walks from
//! the newest message towards message 1.

use crate::providers::email::{ProviderError, Result};

/// An inclusive range of sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub start: u32,
    pub end: u32,
}

impl PageWindow {
    /// Token for the page after this one, `None` once message 1 is covered.
    pub fn next_token(&self) -> Option<String> {
        (self.start > 1).then(|| (self.start - 1).to_string())
    }
}

/// Parses a numeric page token.
pub fn parse_token(token: Option<&str>) -> Result<Option<u32>> {
    token
        .filter(|t| !t.trim().is_empty())
        .map(|t| {
            t.trim()
                .parse::<u32>()
                .map_err(|_| ProviderError::InvalidRequest(format!("invalid page token: {t}")))
        })
        .transpose()
}

/// Computes the window for one page. `None` when there is nothing to list.
pub fn page_window(exists: u32, page_size: u32, token: Option<u32>) -> Option<PageWindow> {
    let end = token.map_or(exists, |t| t.min(exists));
    if end == 0 {
        return None;
    }
    let size = page_size.max(1);
    let start = end.saturating_sub(size - 1).max(1);
    Some(PageWindow { start, end })
}

/// Offset-based paging over a search result, newest first.
///
/// Returns the slice for this page and the next offset token.
pub fn page_slice(uids_desc: &[u32], page_size: u32, offset: Option<u32>) -> (&[u32], Option<String>) {
    let offset = offset.unwrap_or(0) as usize;
    if offset >= uids_desc.len() {
        return (&[], None);
    }
    let end = (offset + page_size.max(1) as usize).min(uids_desc.len());
    let next = (end < uids_desc.len()).then(|| end.to_string());
    (&uids_desc[offset..end], next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_page_ends_at_exists() {
        assert_eq!(
            page_window(120, 50, None),
            Some(PageWindow { start: 71, end: 120 })
        );
    }

    #[test]
    fn walks_down_to_message_one() {
        let mut token = None;
        let mut windows = Vec::new();
        loop {
            let window = page_window(120, 50, token).unwrap();
            windows.push(window);
            match window.next_token() {
                Some(next) => token = parse_token(Some(&next)).unwrap(),
                None => break,
            }
        }

        assert_eq!(
            windows,
            vec![
                PageWindow { start: 71, end: 120 },
                PageWindow { start: 21, end: 70 },
                PageWindow { start: 1, end: 20 },
            ]
        );
    }

    #[test]
    fn terminates_within_ceiling_of_pages() {
        for (exists, size) in [(1u32, 1u32), (10, 3), (100, 10), (101, 10), (7, 50)] {
            let mut token = None;
            let mut calls = 0;
            let mut covered = 0;
            while let Some(window) = page_window(exists, size, token) {
                calls += 1;
                covered += window.end - window.start + 1;
                match window.next_token() {
                    Some(next) => token = Some(next.parse().unwrap()),
                    None => break,
                }
            }
            assert_eq!(calls, exists.div_ceil(size));
            assert_eq!(covered, exists);
        }
    }

    #[test]
    fn empty_mailbox_has_no_window() {
        assert_eq!(page_window(0, 50, None), None);
    }

    #[test]
    fn stale_token_is_clamped() {
        assert_eq!(
            page_window(30, 50, Some(80)),
            Some(PageWindow { start: 1, end: 30 })
        );
    }

    #[test]
    fn tokens_must_be_numeric() {
        assert_eq!(parse_token(Some("42")).unwrap(), Some(42));
        assert_eq!(parse_token(None).unwrap(), None);
        assert!(parse_token(Some("CAEQ")).is_err());
    }

    #[test]
    fn slices_search_results_by_offset() {
        let uids = [9, 7, 5, 3, 1];
        assert_eq!(page_slice(&uids, 2, None), (&uids[0..2], Some("2".to_string())));
        assert_eq!(page_slice(&uids, 2, Some(4)), (&uids[4..5], None));
        assert_eq!(page_slice(&uids, 2, Some(9)).0.len(), 0);
    }
}
