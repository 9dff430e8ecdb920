//! Offline fallback for requests that got neither a network nor a cache response.

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use pwakit_net::{Request, Response};
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::cache::{CacheKey, CacheStorage};
use crate::config::WorkerConfig;
use crate::strategy::{ResponseSource, ServedResponse};

const OFFLINE_ERROR: &str = "offline";
const OFFLINE_MESSAGE: &str = "This content is not available offline";

/// Exact cache match, then the offline page for documents, then a JSON 503.
///
/// The synthesized 503 is never written to a cache.
pub(crate) async fn respond(
    caches: &CacheStorage,
    config: &WorkerConfig,
    scope: &Url,
    request: &Request,
) -> ServedResponse {
    if let Some(entry) = caches.match_request(&CacheKey::for_request(request)).await {
        return ServedResponse::cached(&entry);
    }

    if request.accepts("text/html") {
        if let Ok(page_url) = scope.join(&config.offline_page) {
            if let Some(entry) = caches.match_request(&CacheKey::get(&page_url)).await {
                debug!(url = %request.url, "Serving offline page");
                return ServedResponse {
                    response: entry.to_response(),
                    source: ResponseSource::OfflinePage,
                };
            }
        }
    }

    ServedResponse {
        response: service_unavailable(&request.url),
        source: ResponseSource::Synthesized,
    }
}

fn service_unavailable(url: &Url) -> Response {
    let body = json!({
        "error": OFFLINE_ERROR,
        "message": OFFLINE_MESSAGE,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    Response::new(
        url.clone(),
        StatusCode::SERVICE_UNAVAILABLE,
        headers,
        body.to_string(),
    )
}
