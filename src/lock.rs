use serde::{Deserialize, Serialize};

/// Lock metadata as sent by Terraform on LOCK and UNLOCK.
///
/// The stored record is always the exact bytes the client sent; this type is
/// only used to read fields out of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Operation", default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(rename = "Info", default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(rename = "Who", default, skip_serializing_if = "Option::is_none")]
    pub who: Option<String>,
    #[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "Created", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(rename = "Path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Only the owner id matters for release, so the other fields may be anything.
#[derive(Deserialize)]
struct LockOwner {
    #[serde(rename = "ID")]
    id: String,
}

impl LockInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Extracts the `ID` field from a serialized lock record.
    pub fn owner_id(raw: &[u8]) -> Result<String, serde_json::Error> {
        let owner: LockOwner = serde_json::from_slice(raw)?;
        Ok(owner.id)
    }
}
