//! Admin API client for the platform's paginated listing endpoints.

use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use serde_json::Value;
use std::time::Duration;

use salla_mirror_core::entities::EntityKind;
use salla_mirror_core::sync::ListingPage;

use crate::error::{Result, SallaApiError};
use crate::types::{ApiErrorResponse, ListingEnvelope, Pagination};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;
const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Listing path of each kind, relative to the API base URL.
/// Order items have no endpoint of their own.
pub(crate) fn endpoint_for(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Store => Some("store/info"),
        EntityKind::Brand => Some("brands"),
        EntityKind::Category => Some("categories"),
        EntityKind::Product => Some("products"),
        EntityKind::Customer => Some("customers"),
        EntityKind::Order => Some("orders"),
        EntityKind::Shipment => Some("shipments"),
        EntityKind::Coupon => Some("coupons"),
        EntityKind::OrderItem => None,
    }
}

/// Seconds to wait before calling again after a 429. `Retry-After` wins over
/// the reset timestamp; without either a minute is assumed.
fn retry_after_secs(headers: &HeaderMap, now: DateTime<Utc>) -> u64 {
    let header = |name: &str| -> Option<String> {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
    };
    if let Some(secs) = header(RETRY_AFTER.as_str()).and_then(|v| v.parse::<u64>().ok()) {
        return secs.max(1);
    }
    if let Some(reset) = header(RATE_LIMIT_RESET_HEADER).and_then(|v| v.parse::<i64>().ok()) {
        return (reset - now.timestamp()).max(1) as u64;
    }
    DEFAULT_RETRY_AFTER_SECS
}

#[derive(Debug, Clone)]
pub struct SallaApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl SallaApiClient {
    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[SallaApi] Response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[SallaApi] Response error ({}): {}", status, preview);
    }

    /// Create a client for the admin API rooted at `base_url`
    /// (e.g. "https://api.salla.dev/admin/v2").
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self, token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if token.trim().is_empty() {
            return Err(SallaApiError::auth("Missing access token"));
        }
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SallaApiError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    fn listing_url(
        &self,
        kind: EntityKind,
        page: u32,
        per_page: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let path = endpoint_for(kind).ok_or_else(|| {
            SallaApiError::invalid_request(format!("{} has no listing endpoint", kind))
        })?;
        let mut url = format!(
            "{}/{}?page={}&per_page={}",
            self.base_url,
            path,
            page.max(1),
            per_page.max(1)
        );
        if let Some(since) = since {
            url.push_str("&since=");
            url.push_str(&urlencoding::encode(
                &since.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        Ok(url)
    }

    /// Fetch one page of `kind`. Single-resource endpoints come back as a
    /// one-record, one-page listing.
    pub async fn list_page(
        &self,
        token: &str,
        kind: EntityKind,
        page: u32,
        per_page: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<ListingPage> {
        let url = self.listing_url(kind, page, per_page, since)?;
        debug!("[SallaApi] GET {}", url);
        let response = self
            .client
            .get(&url)
            .headers(self.headers(token)?)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = retry_after_secs(response.headers(), Utc::now());
            debug!("[SallaApi] Rate limited on {}, retry after {}s", kind, retry_after_secs);
            return Err(SallaApiError::RateLimited { retry_after_secs });
        }

        let body = response.text().await?;
        Self::log_response(status, &body);
        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                return Err(SallaApiError::api(status.as_u16(), error.describe()));
            }
            return Err(SallaApiError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        let envelope: ListingEnvelope = serde_json::from_str(&body)?;
        into_listing_page(envelope, page, per_page)
    }
}

fn into_listing_page(envelope: ListingEnvelope, page: u32, per_page: u32) -> Result<ListingPage> {
    let records = match envelope.data {
        Value::Array(records) => records,
        Value::Null => Vec::new(),
        record @ Value::Object(_) => vec![record],
        other => {
            return Err(SallaApiError::api(
                200,
                format!("Unexpected listing data: {}", other),
            ))
        }
    };
    let pagination = envelope.pagination.unwrap_or(Pagination {
        count: records.len() as u64,
        total: records.len() as u64,
        per_page,
        current_page: page.max(1),
        total_pages: 1,
    });
    Ok(ListingPage {
        total_pages: pagination.total_pages.max(1),
        current_page: pagination.current_page.max(1),
        per_page: if pagination.per_page == 0 {
            per_page
        } else {
            pagination.per_page
        },
        total: pagination.total,
        records,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Debug, Clone)]
    pub(crate) struct CapturedRequest {
        pub target: String,
        pub authorization: Option<String>,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct MockResponse {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl MockResponse {
        pub fn json(status: u16, body: impl Into<String>) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: body.into(),
            }
        }

        pub fn with_header(mut self, name: &str, value: &str) -> Self {
            self.headers.push((name.to_string(), value.to_string()));
            self
        }
    }

    pub(crate) fn listing_body(records: &[Value], current_page: u32, total_pages: u32) -> String {
        serde_json::json!({
            "status": 200,
            "success": true,
            "data": records,
            "pagination": {
                "count": records.len(),
                "total": 5,
                "perPage": 2,
                "currentPage": current_page,
                "totalPages": total_pages,
            }
        })
        .to_string()
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(
        stream: &mut tokio::net::TcpStream,
    ) -> Option<(String, HashMap<String, String>)> {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if header_end_offset(&buffer).is_some() {
                break;
            }
        }

        let header_end = header_end_offset(&buffer)?;
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let target = lines.next()?.split_whitespace().nth(1)?.to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        Some((target, headers))
    }

    async fn write_http_response(
        stream: &mut tokio::net::TcpStream,
        response: &MockResponse,
    ) -> std::io::Result<()> {
        let extra: String = response
            .headers
            .iter()
            .map(|(name, value)| format!("{}: {}\r\n", name, value))
            .collect();
        let raw = format!(
            "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n{}",
            response.status,
            response.body.len(),
            extra,
            response.body
        );
        stream.write_all(raw.as_bytes()).await?;
        stream.flush().await
    }

    /// Serves `responses` in order; requests beyond the script get a 500.
    pub(crate) async fn start_mock_server(
        responses: Vec<MockResponse>,
    ) -> (String, Arc<TokioMutex<Vec<CapturedRequest>>>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let captured = Arc::new(TokioMutex::new(Vec::<CapturedRequest>::new()));
        let scripted = Arc::new(TokioMutex::new(VecDeque::from(responses)));
        let captured_clone = Arc::clone(&captured);

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(value) => value,
                    Err(_) => break,
                };
                let captured_inner = Arc::clone(&captured_clone);
                let scripted_inner = Arc::clone(&scripted);
                tokio::spawn(async move {
                    let Some((target, headers)) = read_http_request(&mut stream).await else {
                        return;
                    };
                    captured_inner.lock().await.push(CapturedRequest {
                        target,
                        authorization: headers.get("authorization").cloned(),
                    });
                    let response = scripted_inner
                        .lock()
                        .await
                        .pop_front()
                        .unwrap_or_else(|| MockResponse::json(500, r#"{"error":{"message":"unexpected request"}}"#));
                    let _ = write_http_response(&mut stream, &response).await;
                });
            }
        });

        (format!("http://{}", addr), captured)
    }

    fn client(base_url: &str) -> SallaApiClient {
        SallaApiClient::new(base_url, Duration::from_secs(5)).expect("client")
    }

    #[tokio::test]
    async fn listing_page_is_parsed_with_bearer_auth() {
        let records = vec![
            serde_json::json!({ "id": 1, "name": "Mug" }),
            serde_json::json!({ "id": 2, "name": "Cup" }),
        ];
        let (base_url, captured) =
            start_mock_server(vec![MockResponse::json(200, listing_body(&records, 1, 3))]).await;

        let page = client(&base_url)
            .list_page("tok-1", EntityKind::Product, 1, 2, None)
            .await
            .unwrap();

        assert_eq!(page.records, records);
        assert_eq!((page.current_page, page.total_pages, page.per_page), (1, 3, 2));
        assert!(page.has_more());
        let requests = captured.lock().await;
        assert_eq!(requests[0].target, "/products?page=1&per_page=2");
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer tok-1"));
    }

    #[tokio::test]
    async fn incremental_listing_sends_since() {
        let (base_url, captured) =
            start_mock_server(vec![MockResponse::json(200, listing_body(&[], 1, 1))]).await;
        let since = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();

        let page = client(&base_url)
            .list_page("tok-1", EntityKind::Order, 1, 50, Some(since))
            .await
            .unwrap();

        assert!(page.records.is_empty());
        assert_eq!(
            captured.lock().await[0].target,
            "/orders?page=1&per_page=50&since=2026-04-01T08%3A00%3A00Z"
        );
    }

    #[tokio::test]
    async fn store_profile_is_a_single_record_page() {
        let body = r#"{"status":200,"success":true,"data":{"id":7,"name":"Demo"}}"#;
        let (base_url, _) = start_mock_server(vec![MockResponse::json(200, body)]).await;

        let page = client(&base_url)
            .list_page("tok-1", EntityKind::Store, 1, 50, None)
            .await
            .unwrap();

        assert_eq!(page.records.len(), 1);
        assert!(!page.has_more());
    }

    #[tokio::test]
    async fn too_many_requests_carries_retry_after() {
        let (base_url, _) = start_mock_server(vec![
            MockResponse::json(429, r#"{"error":{"message":"slow down"}}"#).with_header("Retry-After", "17"),
        ])
        .await;

        let err = client(&base_url)
            .list_page("tok-1", EntityKind::Customer, 1, 50, None)
            .await
            .unwrap_err();

        assert!(matches!(err, SallaApiError::RateLimited { retry_after_secs: 17 }));
    }

    #[tokio::test]
    async fn error_envelope_is_described() {
        let body = r#"{"status":422,"success":false,"error":{"code":"validation","message":"per_page is too large"}}"#;
        let (base_url, _) = start_mock_server(vec![MockResponse::json(422, body)]).await;

        let err = client(&base_url)
            .list_page("tok-1", EntityKind::Product, 1, 5000, None)
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), Some(422));
        assert!(err.to_string().contains("per_page is too large"));
    }

    #[tokio::test]
    async fn order_items_have_no_endpoint() {
        let err = client("http://127.0.0.1:9")
            .list_page("tok-1", EntityKind::OrderItem, 1, 50, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SallaApiError::InvalidRequest(_)));
    }

    #[test]
    fn retry_after_falls_back_to_reset_header() {
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            RATE_LIMIT_RESET_HEADER,
            HeaderValue::from_str(&(now.timestamp() + 30).to_string()).unwrap(),
        );
        assert_eq!(retry_after_secs(&headers, now), 30);
        assert_eq!(retry_after_secs(&HeaderMap::new(), now), DEFAULT_RETRY_AFTER_SECS);
    }
}
