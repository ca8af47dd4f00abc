//! Wire types of the admin API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pagination block attached to every listing response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub per_page: u32,
    #[serde(default = "first_page")]
    pub current_page: u32,
    #[serde(default = "first_page")]
    pub total_pages: u32,
}

fn first_page() -> u32 {
    1
}

/// Success envelope. `data` is an array for listings and an object for
/// single-resource endpoints such as the store profile.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingEnvelope {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Value,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fields: Option<Value>,
}

/// Error envelope: `{"status": 4xx, "success": false, "error": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

impl ApiErrorResponse {
    pub fn describe(&self) -> String {
        let code = match &self.error.code {
            Value::String(code) => code.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let mut message = if code.is_empty() {
            self.error.message.clone()
        } else {
            format!("{}: {}", code, self.error.message)
        };
        if let Some(fields) = &self.error.fields {
            message.push_str(&format!(" {}", fields));
        }
        message
    }
}
