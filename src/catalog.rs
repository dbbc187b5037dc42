// Catalog resources
// Resource families, list envelopes and typed catalog operations

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ApiError, Result};
use crate::http_client::{ApiClient, ApiRequest, CachePolicy, FileUpload};

/// Default page size for list views
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// API version prefix
const API_PREFIX: &str = "/v1";

/// Group of endpoints sharing one cache-invalidation scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceFamily {
    Products,
    Memorabilia,
    Merchandise,
    Uploads,
}

impl ResourceFamily {
    pub const ALL: [ResourceFamily; 4] = [
        ResourceFamily::Products,
        ResourceFamily::Memorabilia,
        ResourceFamily::Merchandise,
        ResourceFamily::Uploads,
    ];

    /// URL path segment
    pub fn segment(self) -> &'static str {
        match self {
            ResourceFamily::Products => "products",
            ResourceFamily::Memorabilia => "memorabilia",
            ResourceFamily::Merchandise => "merchandises",
            ResourceFamily::Uploads => "uploads",
        }
    }

    /// Whether the family has a list view
    pub fn is_listable(self) -> bool {
        !matches!(self, ResourceFamily::Uploads)
    }

    /// Collection endpoint, e.g. `/v1/products/`
    pub fn collection_endpoint(self) -> String {
        format!("{}/{}/", API_PREFIX, self.segment())
    }

    /// Item endpoint, e.g. `/v1/products/42`
    pub fn item_endpoint(self, id: &str) -> String {
        format!("{}/{}/{}", API_PREFIX, self.segment(), id)
    }

    /// Family an endpoint belongs to
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        let path = strip_query(endpoint);
        let rest = path.strip_prefix(API_PREFIX)?.strip_prefix('/')?;
        let segment = rest.split('/').next()?;

        Self::ALL.into_iter().find(|f| f.segment() == segment)
    }

    /// Cache key for a detail view
    pub fn item_cache_key(self, id: &str) -> String {
        format!("{}:id:{}", self.segment(), id)
    }
}

impl fmt::Display for ResourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

impl FromStr for ResourceFamily {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "product" | "products" => Ok(ResourceFamily::Products),
            "memorabilia" => Ok(ResourceFamily::Memorabilia),
            "merch" | "merchandise" | "merchandises" => Ok(ResourceFamily::Merchandise),
            "upload" | "uploads" => Ok(ResourceFamily::Uploads),
            other => Err(format!(
                "unknown resource family '{}' (expected products, memorabilia, merchandise or uploads)",
                other
            )),
        }
    }
}

fn strip_query(endpoint: &str) -> &str {
    endpoint.split(|c: char| c == '?' || c == '#').next().unwrap_or(endpoint)
}

/// Whether an endpoint is a collection listing (`/v1/products`, `/v1/products/`)
pub fn is_listing_endpoint(endpoint: &str) -> bool {
    let path = strip_query(endpoint).trim_end_matches('/');

    ResourceFamily::ALL
        .into_iter()
        .filter(|f| f.is_listable())
        .any(|f| f.collection_endpoint().trim_end_matches('/') == path)
}

/// Paged list response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEnvelope<T = Value> {
    #[serde(default = "Vec::new")]
    pub rows: Vec<T>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub offset: u64,
    /// Set when the list could not be loaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ListEnvelope<T> {
    /// Empty list carrying a diagnostic message
    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            rows: Vec::new(),
            total: 0,
            offset: 0,
            error: Some(message.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

impl<T: DeserializeOwned> ListEnvelope<T> {
    /// Decode a list response; a bare JSON array is accepted too
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => {
                let rows: Vec<T> = items
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| ApiError::Decode(format!("Invalid list row: {}", e)))?;
                Ok(Self {
                    total: rows.len() as u64,
                    rows,
                    offset: 0,
                    error: None,
                })
            }
            other => serde_json::from_value(other)
                .map_err(|e| ApiError::Decode(format!("Invalid list response: {}", e))),
        }
    }
}

/// Paging and search parameters for list views
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub offset: u64,
    pub limit: u64,
    pub search: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
            search: None,
        }
    }
}

impl ListQuery {
    pub fn page(page: u64) -> Self {
        Self {
            offset: page.saturating_mul(DEFAULT_PAGE_SIZE),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        let search = search.into();
        self.search = if search.trim().is_empty() {
            None
        } else {
            Some(search)
        };
        self
    }

    fn page_index(&self) -> u64 {
        self.offset / self.limit.max(1)
    }

    /// Cache key, e.g. `products:p0`
    pub fn cache_key(&self, family: ResourceFamily) -> String {
        let mut key = format!("{}:p{}", family.segment(), self.page_index());
        if self.limit != DEFAULT_PAGE_SIZE {
            key.push_str(&format!(":l{}", self.limit));
        }
        if self.offset % self.limit.max(1) != 0 {
            key.push_str(&format!(":o{}", self.offset));
        }
        if let Some(search) = &self.search {
            key.push_str(&format!(":q{}", search));
        }
        key
    }

    fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("offset".to_string(), self.offset.to_string()),
            ("limit".to_string(), self.limit.to_string()),
        ];
        if let Some(search) = &self.search {
            params.push(("search".to_string(), search.clone()));
        }
        params
    }
}

/// Typed catalog operations used by list/edit screens and the storefront
#[derive(Clone)]
pub struct Catalog {
    api: ApiClient,
    list_ttl: Option<Duration>,
}

impl Catalog {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            list_ttl: None,
        }
    }

    /// Override the cache TTL for list and detail reads
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.list_ttl = Some(ttl);
        self
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    fn policy(&self, key: String) -> CachePolicy {
        let policy = CachePolicy::new(key).stale_while_revalidate();
        match self.list_ttl {
            Some(ttl) => policy.ttl(ttl),
            None => policy,
        }
    }

    /// List a collection; never fails, errors come back as a degraded envelope
    pub async fn list<T: DeserializeOwned>(
        &self,
        family: ResourceFamily,
        query: &ListQuery,
    ) -> ListEnvelope<T> {
        if !family.is_listable() {
            return ListEnvelope::degraded(format!("{} cannot be listed", family));
        }

        let mut request = ApiRequest::get(family.collection_endpoint())
            .cached(self.policy(query.cache_key(family)));
        for (name, value) in query.params() {
            request = request.query(name, value);
        }

        self.api.list(request).await
    }

    /// Fetch a single record
    pub async fn get<T: DeserializeOwned>(&self, family: ResourceFamily, id: &str) -> Result<T> {
        let request = ApiRequest::get(family.item_endpoint(id))
            .cached(self.policy(family.item_cache_key(id)));
        self.api.request_json(request).await
    }

    /// Create a record from a raw form payload
    pub async fn create(&self, family: ResourceFamily, payload: Value) -> Result<Value> {
        self.api
            .request(ApiRequest::post(family.collection_endpoint(), payload))
            .await
    }

    /// Partially update a record
    pub async fn update(&self, family: ResourceFamily, id: &str, payload: Value) -> Result<Value> {
        self.api
            .request(ApiRequest::patch(family.item_endpoint(id), payload))
            .await
    }

    /// Delete a record
    pub async fn delete(&self, family: ResourceFamily, id: &str) -> Result<()> {
        self.api
            .request(ApiRequest::delete(family.item_endpoint(id)))
            .await
            .map(|_| ())
    }

    /// Upload a file (multipart field `file`)
    pub async fn upload(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        bytes: Bytes,
    ) -> Result<Value> {
        let upload = FileUpload {
            field: "file".to_string(),
            file_name: file_name.to_string(),
            content_type: content_type.map(str::to_string),
            bytes,
        };
        self.api
            .request(ApiRequest::upload(
                ResourceFamily::Uploads.collection_endpoint(),
                upload,
            ))
            .await
    }

    /// Delete an uploaded file
    pub async fn delete_upload(&self, name: &str) -> Result<()> {
        self.api
            .request(ApiRequest::delete(ResourceFamily::Uploads.item_endpoint(name)))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_family_from_endpoint() {
        assert_eq!(
            ResourceFamily::from_endpoint("/v1/products/"),
            Some(ResourceFamily::Products)
        );
        assert_eq!(
            ResourceFamily::from_endpoint("/v1/products/42?expand=images"),
            Some(ResourceFamily::Products)
        );
        assert_eq!(
            ResourceFamily::from_endpoint("/v1/merchandises"),
            Some(ResourceFamily::Merchandise)
        );
        assert_eq!(
            ResourceFamily::from_endpoint("/v1/uploads/"),
            Some(ResourceFamily::Uploads)
        );
        assert_eq!(ResourceFamily::from_endpoint("/v1/auth/login"), None);
        assert_eq!(ResourceFamily::from_endpoint("/products/"), None);
    }

    #[test]
    fn test_family_parse() {
        assert_eq!("Products".parse::<ResourceFamily>(), Ok(ResourceFamily::Products));
        assert_eq!("merch".parse::<ResourceFamily>(), Ok(ResourceFamily::Merchandise));
        assert_eq!(
            "memorabilia".parse::<ResourceFamily>(),
            Ok(ResourceFamily::Memorabilia)
        );
        assert!("props".parse::<ResourceFamily>().is_err());
    }

    #[test]
    fn test_listing_endpoints() {
        assert!(is_listing_endpoint("/v1/products/"));
        assert!(is_listing_endpoint("/v1/products"));
        assert!(is_listing_endpoint("/v1/memorabilia/?offset=20&limit=20"));
        assert!(is_listing_endpoint("/v1/merchandises/"));
        assert!(!is_listing_endpoint("/v1/products/42"));
        assert!(!is_listing_endpoint("/v1/uploads/"));
        assert!(!is_listing_endpoint("/v1/auth/login"));
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(ResourceFamily::Products.collection_endpoint(), "/v1/products/");
        assert_eq!(ResourceFamily::Merchandise.item_endpoint("7"), "/v1/merchandises/7");
        assert_eq!(ResourceFamily::Memorabilia.item_cache_key("7"), "memorabilia:id:7");
    }

    #[test]
    fn test_list_query_cache_keys() {
        assert_eq!(ListQuery::default().cache_key(ResourceFamily::Products), "products:p0");
        assert_eq!(ListQuery::page(2).cache_key(ResourceFamily::Products), "products:p2");
        assert_eq!(
            ListQuery::default().limit(50).cache_key(ResourceFamily::Memorabilia),
            "memorabilia:p0:l50"
        );
        assert_eq!(
            ListQuery::default()
                .search("lightsaber")
                .cache_key(ResourceFamily::Merchandise),
            "merchandises:p0:qlightsaber"
        );
        let unaligned = ListQuery {
            offset: 5,
            ..ListQuery::default()
        };
        assert_eq!(unaligned.cache_key(ResourceFamily::Products), "products:p0:o5");
    }

    #[test]
    fn test_list_query_huge_page_saturates() {
        let query = ListQuery::page(u64::MAX);
        assert_eq!(query.offset, u64::MAX);
        assert_eq!(
            query.cache_key(ResourceFamily::Products),
            format!("products:p{}:o{}", u64::MAX / DEFAULT_PAGE_SIZE, u64::MAX)
        );
    }

    #[test]
    fn test_list_query_blank_search_ignored() {
        let query = ListQuery::default().search("   ");
        assert_eq!(query.search, None);
        assert_eq!(query.params().len(), 2);
    }

    #[test]
    fn test_envelope_from_value() {
        let envelope: ListEnvelope = ListEnvelope::from_value(json!({
            "rows": [{"id": 1}, {"id": 2}],
            "total": 12,
            "offset": 10
        }))
        .unwrap();
        assert_eq!(envelope.rows.len(), 2);
        assert_eq!(envelope.total, 12);
        assert_eq!(envelope.offset, 10);
        assert!(!envelope.is_degraded());

        let envelope: ListEnvelope = ListEnvelope::from_value(json!([{"id": 1}])).unwrap();
        assert_eq!(envelope.total, 1);

        let err = ListEnvelope::<Value>::from_value(json!("nope")).unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[test]
    fn test_degraded_envelope_shape() {
        let envelope: ListEnvelope = ListEnvelope::degraded("Network error: connection refused");
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "rows": [],
                "total": 0,
                "offset": 0,
                "error": "Network error: connection refused"
            })
        );
    }
}
