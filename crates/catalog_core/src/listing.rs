use url::Url;

/// Placeholder replaced by the page number in a listing URL template.
pub const PAGE_PLACEHOLDER: &str = "{page}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListingSourceError {
    #[error("listing template `{0}` has no {{page}} placeholder")]
    MissingPlaceholder(String),
    #[error("listing page url `{url}` is invalid: {message}")]
    InvalidUrl { url: String, message: String },
}

/// A paginated listing: `url_template` with `{page}`, visited for
/// `first_page..first_page + page_count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingSource {
    pub url_template: String,
    pub first_page: u32,
    pub page_count: u32,
}

impl ListingSource {
    pub fn new(url_template: impl Into<String>, page_count: u32) -> Self {
        Self {
            url_template: url_template.into(),
            first_page: 1,
            page_count,
        }
    }

    pub fn page_url(&self, page: u32) -> String {
        self.url_template
            .replace(PAGE_PLACEHOLDER, &page.to_string())
    }

    /// Every page URL in visiting order. Each one is validated as an absolute URL.
    pub fn page_urls(&self) -> Result<Vec<String>, ListingSourceError> {
        if !self.url_template.contains(PAGE_PLACEHOLDER) {
            return Err(ListingSourceError::MissingPlaceholder(
                self.url_template.clone(),
            ));
        }
        let last = self.first_page.saturating_add(self.page_count);
        (self.first_page..last)
            .map(|page| {
                let url = self.page_url(page);
                match Url::parse(&url) {
                    Ok(_) => Ok(url),
                    Err(err) => Err(ListingSourceError::InvalidUrl {
                        url,
                        message: err.to_string(),
                    }),
                }
            })
            .collect()
    }
}
