use serde::{Deserialize, Serialize};

// ── Record set types ─────────────────────────────────────────────────

/// One resource record set of a managed zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecordSet {
    /// Fully qualified name, including the trailing dot.
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub ttl: u32,
    #[serde(default)]
    pub rrdatas: Vec<String>,
}

impl ResourceRecordSet {
    /// An `A` record pointing `name` at a single address.
    pub fn a_record(name: impl Into<String>, address: impl Into<String>, ttl: u32) -> Self {
        Self {
            name: name.into(),
            record_type: "A".into(),
            ttl,
            rrdatas: vec![address.into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRecordSetsResponse {
    #[serde(default)]
    pub rrsets: Vec<ResourceRecordSet>,
    pub next_page_token: Option<String>,
}

// ── Change types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateChangeRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additions: Vec<ResourceRecordSet>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deletions: Vec<ResourceRecordSet>,
}

impl CreateChangeRequest {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Change {
    pub id: String,
    pub status: String,
}
