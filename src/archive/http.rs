use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, Response};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Archive, ArchiveError};
use crate::model::HistoryItem;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the simulation server's `/history` endpoints.
#[derive(Debug, Clone)]
pub struct HttpArchive {
    base: Url,
    client: Client,
}

impl HttpArchive {
    /// # Errors
    ///
    /// Returns an error when `base_url` is not an absolute http(s) URL or the
    /// HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, ArchiveError> {
        let base = Url::parse(base_url).map_err(|err| ArchiveError::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(ArchiveError::InvalidUrl {
                url: base_url.to_string(),
                reason: "not a base url".to_string(),
            });
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { base, client })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    fn endpoint(&self, id: Option<&str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("history");
            if let Some(id) = id {
                segments.push(id);
            }
        }
        url
    }
}

fn check(response: Response) -> Result<Response, ArchiveError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(ArchiveError::Status {
        status: status.as_u16(),
        body,
    })
}

impl Archive for HttpArchive {
    fn list(&self) -> Result<Vec<HistoryItem>, ArchiveError> {
        let url = self.endpoint(None);
        debug!(%url, "listing history");
        let body = check(self.client.get(url).send()?)?.text()?;
        let entries: Vec<Value> = serde_json::from_str(&body)?;

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<HistoryItem>(entry) {
                Ok(item) => items.push(item),
                Err(err) => warn!(error = %err, "skipping undecodable history entry"),
            }
        }
        Ok(items)
    }

    fn fetch(&self, id: &str) -> Result<Option<HistoryItem>, ArchiveError> {
        // The server only exposes the full listing.
        Ok(self.list()?.into_iter().find(|item| item.id == id))
    }

    fn delete(&self, id: &str) -> Result<(), ArchiveError> {
        let url = self.endpoint(Some(id));
        debug!(%url, "deleting history item");
        check(self.client.delete(url).send()?)?;
        Ok(())
    }
}
