//! Request and response views the engine works against.
//!
//! Host adapters convert their own request types into a [`RequestProxy`] and
//! receive throttled responses as [`IngressResponse`] or [`EgressResponse`].

use std::collections::HashMap;
use std::sync::Arc;

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Method, StatusCode, Uri};

use super::check::LimitCheckResult;
use crate::error::{Result, ThrottleError};

/// Read-only view of an incoming or outgoing request.
#[derive(Debug, Clone)]
pub struct RequestProxy {
    uri: Uri,
    method: Method,
    headers: HeaderMap,
    context: HashMap<String, String>,
}

impl RequestProxy {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            uri,
            method,
            headers: HeaderMap::new(),
            context: HashMap::new(),
        }
    }

    /// Build a request from textual method and URI.
    pub fn parse(method: &str, uri: &str) -> Result<Self> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| ThrottleError::InvalidRequest(format!("method {:?}: {}", method, e)))?;
        let uri = uri
            .parse::<Uri>()
            .map_err(|e| ThrottleError::InvalidRequest(format!("uri {:?}: {}", uri, e)))?;
        Ok(Self::new(method, uri))
    }

    /// Append a header value; repeated names keep every value.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ThrottleError::InvalidRequest(format!("header {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ThrottleError::InvalidRequest(format!("header value: {}", e)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Attach adapter specific data, e.g. an authenticated caller id.
    pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The full URI as written, including the query string.
    pub fn uri_string(&self) -> String {
        self.uri.to_string()
    }

    pub fn uri_without_query_string(&self) -> String {
        let mut out = String::new();
        if let (Some(scheme), Some(authority)) = (self.uri.scheme_str(), self.uri.authority()) {
            out.push_str(scheme);
            out.push_str("://");
            out.push_str(authority.as_str());
        }
        out.push_str(self.uri.path());
        out
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Every value of `name` that is valid UTF-8. Names are case-insensitive.
    pub fn header_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .get_all(name)
            .into_iter()
            .filter_map(|v| v.to_str().ok())
    }

    pub fn context(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }
}

impl<B> From<&http::Request<B>> for RequestProxy {
    fn from(request: &http::Request<B>) -> Self {
        Self {
            uri: request.uri().clone(),
            method: request.method().clone(),
            headers: request.headers().clone(),
            context: HashMap::new(),
        }
    }
}

/// Mutable response handed to response fabrics.
pub trait ResponseProxy: Send {
    fn status(&self) -> StatusCode;

    fn set_status(&mut self, status: StatusCode);

    fn set_header(&mut self, name: HeaderName, value: HeaderValue);

    fn write_body(&mut self, text: &str);

    fn as_ingress_mut(&mut self) -> Option<&mut IngressResponse> {
        None
    }

    fn as_egress_mut(&mut self) -> Option<&mut EgressResponse> {
        None
    }
}

/// Status, headers and body of a synthetic throttled response.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottledResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl Default for ThrottledResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }
}

impl ThrottledResponse {
    /// Convert into an `http::Response` for the host framework.
    pub fn into_http(self) -> http::Response<String> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Response rendered on the ingress side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressResponse {
    pub response: ThrottledResponse,
    /// Set by a response fabric to ignore the verdict and serve the request
    pub continue_as_normal: bool,
}

/// Response synthesized for a throttled outgoing call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EgressResponse {
    pub response: ThrottledResponse,
    /// Set by a response fabric to wait and retry the call
    pub should_retry: bool,
    /// Retries performed so far for this call
    pub retry_count: u32,
}

macro_rules! impl_response_proxy {
    ($ty:ty, $accessor:ident, $ret:ty) => {
        impl ResponseProxy for $ty {
            fn status(&self) -> StatusCode {
                self.response.status
            }

            fn set_status(&mut self, status: StatusCode) {
                self.response.status = status;
            }

            fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
                self.response.headers.insert(name, value);
            }

            fn write_body(&mut self, text: &str) {
                self.response.body.push_str(text);
            }

            fn $accessor(&mut self) -> Option<&mut $ret> {
                Some(self)
            }
        }
    };
}

impl_response_proxy!(IngressResponse, as_ingress_mut, IngressResponse);
impl_response_proxy!(EgressResponse, as_egress_mut, EgressResponse);

/// Caller supplied renderer for throttled responses.
pub type ResponseFabric =
    Arc<dyn Fn(&[LimitCheckResult], &RequestProxy, &mut dyn ResponseProxy) + Send + Sync>;

/// Render the standard throttled response for the given verdict.
pub fn render_default(result: &LimitCheckResult, response: &mut dyn ResponseProxy) {
    let status =
        StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
    response.set_status(status);
    response.set_header(RETRY_AFTER, HeaderValue::from(result.retry_after_seconds));
    response.write_body(&format!("Retry after {} seconds", result.retry_after_seconds));
}

/// Status of a completed call, used to classify circuit breaker outcomes.
pub trait ResponseStatus {
    /// `None` when the call has no notion of status and counts as success.
    fn status_code(&self) -> Option<u16>;
}

impl ResponseStatus for () {
    fn status_code(&self) -> Option<u16> {
        None
    }
}

impl ResponseStatus for u16 {
    fn status_code(&self) -> Option<u16> {
        Some(*self)
    }
}

impl ResponseStatus for StatusCode {
    fn status_code(&self) -> Option<u16> {
        Some(self.as_u16())
    }
}

impl<B> ResponseStatus for http::Response<B> {
    fn status_code(&self) -> Option<u16> {
        Some(self.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let request = RequestProxy::parse("get", "https://api.example.com/items/7?page=2")
            .unwrap()
            .with_header("X-Api-Key", "abc")
            .unwrap()
            .with_context("caller", "svc-a");

        assert_eq!(*request.method(), Method::GET);
        assert_eq!(request.uri_string(), "https://api.example.com/items/7?page=2");
        assert_eq!(request.uri_without_query_string(), "https://api.example.com/items/7");
        assert_eq!(request.header_values("x-api-key").collect::<Vec<_>>(), vec!["abc"]);
        assert_eq!(request.context("caller"), Some("svc-a"));
    }

    #[test]
    fn test_path_only_uri() {
        let request = RequestProxy::parse("POST", "/orders?id=1").unwrap();
        assert_eq!(request.uri_without_query_string(), "/orders");
    }

    #[test]
    fn test_invalid_parts_are_rejected() {
        assert!(RequestProxy::parse("GET", "http://[bad").is_err());
        let request = RequestProxy::parse("GET", "/").unwrap();
        assert!(request.with_header("bad header", "x").is_err());
    }

    #[test]
    fn test_from_http_request() {
        let http_request = http::Request::builder()
            .method("PUT")
            .uri("/a")
            .header("x-tenant", "t1")
            .body(())
            .unwrap();
        let request = RequestProxy::from(&http_request);
        assert_eq!(*request.method(), Method::PUT);
        assert_eq!(request.header_values("X-Tenant").next(), Some("t1"));
    }

    #[test]
    fn test_response_proxy_downcasts() {
        let mut ingress = IngressResponse::default();
        let proxy: &mut dyn ResponseProxy = &mut ingress;
        assert!(proxy.as_egress_mut().is_none());
        proxy.as_ingress_mut().unwrap().continue_as_normal = true;
        assert!(ingress.continue_as_normal);
    }

    #[test]
    fn test_render_default() {
        let result = LimitCheckResult::propagated(-1, 12, "abc".to_string(), 503);
        let mut response = EgressResponse::default();
        render_default(&result, &mut response);

        let http_response = response.response.into_http();
        assert_eq!(http_response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_response.headers()[RETRY_AFTER], "12");
        assert_eq!(http_response.body(), "Retry after 12 seconds");
    }
}
