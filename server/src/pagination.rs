//! Page-window arithmetic and navigation links for listing endpoints.
//!
//! Listing handlers read the `page` and `perPage` query parameters with
//! [`PageQuery::from_pairs`], normalize them with [`PageQuery::params`], fetch one window of documents, and then
//! describe the window with a [`Page`]: its `Pagination-*` headers and an
//! RFC 8288 `Link` header pointing at the first, previous, next, and last
//! pages that actually exist.
//!
//! # Normalization Rules
//!
//! - Only the first occurrence of a repeated parameter counts.
//! - Values are read up to the first non-digit, so `2abc` is page 2.
//! - `page` defaults to 1 when absent, unparseable, or below 1.
//! - `perPage` defaults to the configured default when absent, unparseable,
//!   below 1, or above the cap.
//! - `first`/`prev` appear only when `page > 1`; `next`/`last` only when
//!   `page < ceil(total / perPage)`.
//!
//! # Example
//!
//! ```rust
//! use beerapi_server::pagination::{PageLimits, PageQuery};
//!
//! let pairs = vec![("page".to_string(), "1".to_string())];
//! let params = PageQuery::from_pairs(&pairs).params(PageLimits::default());
//! assert_eq!(params.skip(), 0);
//!
//! let page = params.with_total(25);
//!
//! let links = page.links();
//! assert_eq!(links.next, Some(2));
//! assert_eq!(links.last, Some(3));
//! assert!(links.first.is_none() && links.prev.is_none());
//!
//! assert_eq!(
//!     page.link_header("http://localhost:3000/api/v1/beer").as_deref(),
//!     Some(
//!         "<http://localhost:3000/api/v1/beer?page=2&perPage=10>; rel=\"next\", \
//!          <http://localhost:3000/api/v1/beer?page=3&perPage=10>; rel=\"last\""
//!     )
//! );
//! ```

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Default number of items per page.
pub const DEFAULT_PER_PAGE: u64 = 10;

/// Largest page size a client may request.
pub const MAX_PER_PAGE: u64 = 10;

/// Response header carrying the normalized page number.
pub const HEADER_PAGE: HeaderName = HeaderName::from_static("pagination-page");

/// Response header carrying the normalized page size.
pub const HEADER_PAGE_SIZE: HeaderName = HeaderName::from_static("pagination-pagesize");

/// Response header carrying the total number of matching documents.
pub const HEADER_TOTAL: HeaderName = HeaderName::from_static("pagination-total");

/// Page-size bounds for a listing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    /// Page size used when the client does not ask for a valid one.
    pub default_per_page: u64,

    /// Largest accepted page size.
    pub max_per_page: u64,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_per_page: DEFAULT_PER_PAGE,
            max_per_page: MAX_PER_PAGE,
        }
    }
}

/// Returns the first value given for `key` in a decoded query string.
#[must_use]
pub fn first_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

/// Raw pagination query parameters.
///
/// Values are kept as strings so that garbage input falls back to defaults
/// instead of rejecting the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageQuery {
    pub page: Option<String>,
    pub per_page: Option<String>,
}

impl PageQuery {
    /// Picks `page` and `perPage` out of decoded query pairs.
    #[must_use]
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        Self {
            page: first_value(pairs, "page").map(str::to_string),
            per_page: first_value(pairs, "perPage").map(str::to_string),
        }
    }

    /// Normalizes the raw parameters into a page cursor.
    #[must_use]
    pub fn params(&self, limits: PageLimits) -> PageParams {
        PageParams::new(
            parse_number(self.page.as_deref()),
            parse_number(self.per_page.as_deref()),
            limits,
        )
    }
}

/// Reads the leading integer of `raw`, ignoring anything after its digits.
/// Leading whitespace and a sign are accepted.
fn parse_number(raw: Option<&str>) -> Option<i64> {
    let value = raw?.trim_start();
    let (negative, rest) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let number: i64 = rest[..end].parse().ok()?;
    Some(if negative { -number } else { number })
}

/// Normalized `(page, perPage)` cursor, before the total is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParams {
    pub page: u64,
    pub per_page: u64,
}

impl PageParams {
    /// Applies the normalization rules to possibly-missing raw values.
    #[must_use]
    pub fn new(page: Option<i64>, per_page: Option<i64>, limits: PageLimits) -> Self {
        let page = match page {
            Some(page) if page >= 1 => page as u64,
            _ => 1,
        };
        let per_page = match per_page {
            Some(size) if size >= 1 && size as u64 <= limits.max_per_page => size as u64,
            _ => limits.default_per_page,
        };
        Self { page, per_page }
    }

    /// Number of documents to skip before this page.
    #[must_use]
    pub fn skip(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.per_page)
    }

    /// Completes the cursor with the collection size.
    #[must_use]
    pub fn with_total(self, total: u64) -> Page {
        Page {
            page: self.page,
            per_page: self.per_page,
            total,
        }
    }
}

/// Page numbers of the navigation targets that exist for a page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageLinks {
    pub first: Option<u64>,
    pub prev: Option<u64>,
    pub next: Option<u64>,
    pub last: Option<u64>,
}

impl PageLinks {
    /// Returns `true` if no navigation target exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first.is_none() && self.prev.is_none() && self.next.is_none() && self.last.is_none()
    }
}

/// One window over a collection of `total` documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
}

impl Page {
    /// Builds a normalized page from raw numbers.
    #[must_use]
    pub fn new(page: i64, per_page: i64, total: u64, limits: PageLimits) -> Self {
        PageParams::new(Some(page), Some(per_page), limits).with_total(total)
    }

    /// Highest page number holding at least one document (0 when empty).
    #[must_use]
    pub fn last_page(&self) -> u64 {
        self.total.div_ceil(self.per_page.max(1))
    }

    /// Navigation targets relative to this page.
    #[must_use]
    pub fn links(&self) -> PageLinks {
        let mut links = PageLinks::default();

        if self.page > 1 {
            links.first = Some(1);
            links.prev = Some(self.page - 1);
        }

        let last = self.last_page();
        if self.page < last {
            links.next = Some(self.page + 1);
            links.last = Some(last);
        }

        links
    }

    /// Formats the `Link` header value for this page of `url`.
    ///
    /// Returns `None` when no navigation target exists.
    #[must_use]
    pub fn link_header(&self, url: &str) -> Option<String> {
        let links = self.links();
        if links.is_empty() {
            return None;
        }

        let separator = if url.contains('?') { '&' } else { '?' };
        let entries: Vec<String> = [
            ("first", links.first),
            ("prev", links.prev),
            ("next", links.next),
            ("last", links.last),
        ]
        .into_iter()
        .filter_map(|(rel, target)| {
            target.map(|page| {
                format!(
                    "<{url}{separator}page={page}&perPage={}>; rel=\"{rel}\"",
                    self.per_page
                )
            })
        })
        .collect();

        Some(entries.join(", "))
    }

    /// Writes the pagination headers (and `Link`, when applicable) for `url`.
    pub fn apply_headers(&self, headers: &mut HeaderMap, url: &str) {
        headers.insert(HEADER_PAGE, HeaderValue::from(self.page));
        headers.insert(HEADER_PAGE_SIZE, HeaderValue::from(self.per_page));
        headers.insert(HEADER_TOTAL, HeaderValue::from(self.total));

        if let Some(link) = self.link_header(url) {
            match HeaderValue::from_str(&link) {
                Ok(value) => {
                    headers.insert(axum::http::header::LINK, value);
                }
                Err(err) => {
                    tracing::warn!(error = %err, url, "Link header is not a valid header value");
                }
            }
        }
    }
}
