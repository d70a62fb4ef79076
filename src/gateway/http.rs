//! HTTP transport to the e-commerce backend.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};

use super::{Backend, GatewayCall, GatewayFailure, Operation};

/// Backend reached over HTTP with JSON bodies
pub struct HttpBackend {
    /// Base URL, e.g. `http://frontend:80/api`
    base_url: Url,
    /// HTTP client
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid backend URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("Backend URL cannot carry a path: {}", base_url);
        }
        Ok(Self {
            base_url,
            client: reqwest::Client::new(),
        })
    }

    /// Build endpoint URL; each segment is percent-encoded on its own
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Method, URL and optional JSON body for a call
    fn route(
        &self,
        call: &GatewayCall,
    ) -> Result<(Method, Url, Option<serde_json::Value>), GatewayFailure> {
        let route = match call.operation {
            Operation::GetProduct => {
                let id = path_id(call, "product_id")?;
                (Method::GET, self.url(&["products", id]), None)
            }
            Operation::GetCart => {
                let user = path_id(call, "user_id")?;
                (Method::GET, self.url(&["cart", user]), None)
            }
            Operation::ListOrders => {
                let resource = call.required_str("resource_id")?;
                let mut url = self.url(&["orders"]);
                url.query_pairs_mut().append_pair("resource_id", resource);
                (Method::GET, url, None)
            }
            Operation::UpdateOrderState => {
                let order = path_id(call, "order_id")?;
                let body = serde_json::json!({
                    "state": call.params.get("state").cloned().unwrap_or_default(),
                    "details": call.params.get("details").cloned().unwrap_or_default(),
                });
                (
                    Method::POST,
                    self.url(&["orders", order, "state"]),
                    Some(body),
                )
            }
            Operation::SendNotification => {
                call.required_str("recipient")?;
                (
                    Method::POST,
                    self.url(&["notifications"]),
                    Some(call.params.clone()),
                )
            }
        };
        Ok(route)
    }
}

/// An id used as a path segment; dot segments would be dropped from the path
fn path_id<'a>(call: &'a GatewayCall, key: &str) -> Result<&'a str, GatewayFailure> {
    let id = call.required_str(key)?;
    if id == "." || id == ".." {
        return Err(GatewayFailure::Rejected {
            operation: call.operation,
            status: None,
            reason: format!("invalid {} '{}'", key, id),
        });
    }
    Ok(id)
}

/// Map a non-success HTTP status to a typed failure
fn classify_status(
    operation: Operation,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> GatewayFailure {
    match status.as_u16() {
        408 | 504 => GatewayFailure::Timeout {
            operation,
            elapsed_ms: 0,
        },
        429 => GatewayFailure::RateLimited {
            operation,
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        },
        code @ 400..=499 => GatewayFailure::Rejected {
            operation,
            status: Some(code),
            reason: if body.is_empty() {
                status.to_string()
            } else {
                body
            },
        },
        _ => GatewayFailure::Unavailable {
            operation,
            reason: format!("backend returned {}", status),
            circuit_open: false,
        },
    }
}

/// Parse a `Retry-After` header given in seconds
fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .map(str::trim)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, call: &GatewayCall) -> Result<serde_json::Value, GatewayFailure> {
        let operation = call.operation;
        let (method, url, body) = self.route(call)?;

        let mut request = self.client.request(method, url);
        if let Some(timeout) = call.timeout {
            request = request.timeout(timeout);
        }
        if operation.is_mutation() {
            if let Some(key) = &call.idempotency_key {
                request = request.header("Idempotency-Key", key);
            }
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayFailure::Timeout {
                    operation,
                    elapsed_ms: call.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                }
            } else {
                GatewayFailure::Unavailable {
                    operation,
                    reason: e.to_string(),
                    circuit_open: false,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(operation, status, retry_after, text));
        }

        let text = response
            .text()
            .await
            .map_err(|e| GatewayFailure::Unavailable {
                operation,
                reason: format!("failed to read response body: {}", e),
                circuit_open: false,
            })?;

        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| GatewayFailure::Rejected {
            operation,
            status: Some(status.as_u16()),
            reason: format!("unparseable response body: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let op = Operation::UpdateOrderState;

        assert!(matches!(
            classify_status(op, StatusCode::GATEWAY_TIMEOUT, None, String::new()),
            GatewayFailure::Timeout { .. }
        ));
        assert!(matches!(
            classify_status(op, StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(2)), String::new()),
            GatewayFailure::RateLimited { retry_after_ms: Some(2000), .. }
        ));
        assert!(matches!(
            classify_status(op, StatusCode::CONFLICT, None, "already shipped".into()),
            GatewayFailure::Rejected { status: Some(409), .. }
        ));
        assert!(matches!(
            classify_status(op, StatusCode::BAD_GATEWAY, None, String::new()),
            GatewayFailure::Unavailable { circuit_open: false, .. }
        ));
    }

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(parse_retry_after(Some(" 3 ")), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn test_routes() {
        let backend = HttpBackend::new("http://frontend:80/api/").unwrap();

        let (method, url, body) = backend
            .route(&GatewayCall::update_order_state("o-1", "rerouted", serde_json::json!({})))
            .unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(url.as_str(), "http://frontend:80/api/orders/o-1/state");
        assert_eq!(body.unwrap()["state"], "rerouted");

        let (method, url, body) = backend.route(&GatewayCall::get_product("p-9")).unwrap();
        assert_eq!(method, Method::GET);
        assert_eq!(url.as_str(), "http://frontend:80/api/products/p-9");
        assert!(body.is_none());

        let bad = GatewayCall::new(Operation::GetCart, serde_json::json!({}));
        assert!(backend.route(&bad).is_err());
    }

    #[test]
    fn test_ids_with_reserved_characters_stay_in_place() {
        let backend = HttpBackend::new("http://frontend:80/api").unwrap();

        let (_, url, _) = backend.route(&GatewayCall::list_orders("a&b=c")).unwrap();
        assert_eq!(url.as_str(), "http://frontend:80/api/orders?resource_id=a%26b%3Dc");
        assert_eq!(url.query_pairs().count(), 1);

        let (_, url, _) = backend.route(&GatewayCall::get_product("x/../admin")).unwrap();
        assert_eq!(url.as_str(), "http://frontend:80/api/products/x%2F..%2Fadmin");

        let (_, url, _) = backend.route(&GatewayCall::get_cart("order 42")).unwrap();
        assert_eq!(url.as_str(), "http://frontend:80/api/cart/order%2042");

        let dots = GatewayCall::update_order_state("..", "rerouted", serde_json::json!({}));
        assert!(matches!(
            backend.route(&dots),
            Err(GatewayFailure::Rejected { status: None, .. })
        ));
    }

    #[test]
    fn test_rejects_unusable_base_url() {
        assert!(HttpBackend::new("not a url").is_err());
        assert!(HttpBackend::new("mailto:ops@example.com").is_err());
    }
}
