//! Typed Rust client for the Google Cloud DNS API.
//!
//! Covers the subset needed to publish VM address records:
//! record sets (list) and changes (create).

mod types;

pub use types::*;

const BASE_URL: &str = "https://dns.googleapis.com/dns/v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cloud dns request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cloud dns {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for one managed zone of the Cloud DNS REST API.
#[derive(Clone)]
pub struct CloudDnsClient {
    token: String,
    project: String,
    zone: String,
    http: reqwest::Client,
}

impl CloudDnsClient {
    pub fn new(
        token: impl Into<String>,
        project: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            project: project.into(),
            zone: zone.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{BASE_URL}/projects/{}/managedZones/{}{path}",
            self.project, self.zone
        )
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    // ── Record sets ──────────────────────────────────────────────────

    /// List every record set in the zone, following pagination.
    pub async fn list_record_sets(&self) -> Result<Vec<ResourceRecordSet>> {
        let mut rrsets = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .http
                .get(self.url("/rrsets"))
                .header("Authorization", self.auth());
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token)]);
            }

            let page: ListRecordSetsResponse = Self::check(req.send().await?, "list rrsets")
                .await?
                .json()
                .await?;

            rrsets.extend(page.rrsets);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(rrsets)
    }

    // ── Changes ──────────────────────────────────────────────────────

    /// Atomically apply additions and deletions to the zone.
    pub async fn create_change(&self, req: &CreateChangeRequest) -> Result<Change> {
        let resp = self
            .http
            .post(self.url("/changes"))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::check(resp, "create change")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }
}
