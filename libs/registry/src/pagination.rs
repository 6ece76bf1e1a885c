//! Page tokens for listings.
//!
//! A token is two little-endian `u16` fields, `{limit, page}`, base64-url
//! encoded (with padding). Pages are 1-based.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{RegistryError, RegistryResult};

/// Page size of wire-compatible listings.
pub const DEFAULT_PAGE_LIMIT: u16 = 100;

/// Position within a paginated listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageToken {
    pub limit: u16,
    pub page: u16,
}

impl PageToken {
    /// First page with the given size.
    pub fn first(limit: u16) -> Self {
        Self { limit, page: 1 }
    }

    /// The token for the following page.
    pub fn next(&self) -> Self {
        Self {
            limit: self.limit,
            page: self.page.saturating_add(1),
        }
    }

    pub fn encode(&self) -> String {
        let mut buf = [0u8; 4];
        buf[..2].copy_from_slice(&self.limit.to_le_bytes());
        buf[2..].copy_from_slice(&self.page.to_le_bytes());
        URL_SAFE.encode(buf)
    }

    pub fn decode(token: &str) -> RegistryResult<Self> {
        let bytes = URL_SAFE
            .decode(token)
            .map_err(|e| RegistryError::InvalidInput(format!("malformed page token: {e}")))?;
        match bytes.len() {
            4 => Ok(Self {
                limit: u16::from_le_bytes([bytes[0], bytes[1]]),
                page: u16::from_le_bytes([bytes[2], bytes[3]]),
            }),
            n if n > 4 => Err(RegistryError::InvalidInput(
                "too many values for page token".to_string(),
            )),
            _ => Err(RegistryError::InvalidInput(
                "too few values for page token".to_string(),
            )),
        }
    }

    /// Reject tokens not produced for a listing of `expected_limit`.
    pub fn validate(&self, expected_limit: u16) -> RegistryResult<()> {
        if self.limit != expected_limit {
            return Err(RegistryError::InvalidInput(format!(
                "token limit must be {expected_limit}"
            )));
        }
        if self.page == 0 {
            return Err(RegistryError::InvalidInput(
                "token page must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Extract the page this token designates from `items`.
    pub fn extract<T>(&self, items: Vec<T>) -> Page<T> {
        let limit = usize::from(self.limit);
        let start = usize::from(self.page.saturating_sub(1)).saturating_mul(limit);
        let end = start.saturating_add(limit).min(items.len());
        if start >= items.len() {
            return Page {
                items: Vec::new(),
                next_page_token: None,
            };
        }

        let next_page_token = (end < items.len()).then(|| self.next().encode());
        let items = items.into_iter().skip(start).take(end - start).collect();
        Page {
            items,
            next_page_token,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_listing_103_with_page_size_60() {
        let items: Vec<u32> = (0..103).collect();
        let first = PageToken::first(60).extract(items.clone());
        assert_eq!(first.items.len(), 60);
        let token = first.next_page_token.expect("first page carries a token");

        let second_token = PageToken::decode(&token).unwrap();
        assert_eq!(second_token, PageToken { limit: 60, page: 2 });
        let second = second_token.extract(items);
        assert_eq!(second.items.len(), 43);
        assert_eq!(second.items[0], 60);
        assert!(second.next_page_token.is_none());
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_token() {
        let items: Vec<u32> = (0..100).collect();
        let page = PageToken::first(100).extract(items);
        assert_eq!(page.items.len(), 100);
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_page_past_end_is_empty() {
        let page = PageToken { limit: 10, page: 5 }.extract(vec![1, 2, 3]);
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_wire_format() {
        let token = PageToken { limit: 100, page: 2 };
        // [0x64, 0x00, 0x02, 0x00]
        assert_eq!(token.encode(), "ZAACAA==");
        assert_eq!(PageToken::decode("ZAACAA==").unwrap(), token);
    }

    #[rstest]
    #[case(PageToken { limit: 100, page: 1 }, true)]
    #[case(PageToken { limit: 60, page: 1 }, false)]
    #[case(PageToken { limit: 100, page: 0 }, false)]
    fn test_validate(#[case] token: PageToken, #[case] ok: bool) {
        assert_eq!(token.validate(DEFAULT_PAGE_LIMIT).is_ok(), ok);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let long = URL_SAFE.encode([1u8, 0, 1, 0, 9]);
        assert_eq!(
            PageToken::decode(&long),
            Err(RegistryError::InvalidInput("too many values for page token".to_string()))
        );
        assert!(PageToken::decode(&URL_SAFE.encode([1u8])).is_err());
        assert!(PageToken::decode("!!!").is_err());
    }

    proptest! {
        #[test]
        fn prop_token_codec(limit in any::<u16>(), page in any::<u16>()) {
            let token = PageToken { limit, page };
            prop_assert_eq!(PageToken::decode(&token.encode()).unwrap(), token);
        }

        #[test]
        fn prop_pages_partition_listing(len in 0usize..500, limit in 1u16..120) {
            let items: Vec<usize> = (0..len).collect();
            let mut token = PageToken::first(limit);
            let mut seen = Vec::new();
            loop {
                let page = token.extract(items.clone());
                seen.extend(page.items);
                match page.next_page_token {
                    Some(next) => token = PageToken::decode(&next).unwrap(),
                    None => break,
                }
            }
            prop_assert_eq!(seen, items);
        }
    }
}
