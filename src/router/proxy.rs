//! The migration proxy (§4.9): forwards a request verbatim to a successor
//! registry when the target repository does not (yet) exist locally,
//! during cutover. Grounded in the teacher's `service/auth.rs`, which
//! already reaches for a bare `reqwest::Client` to call out to GitHub;
//! here the same client is reused to forward arbitrary v2 requests
//! instead of calling a fixed OAuth endpoint.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use regex::Regex;

use crate::error::OciError;

pub struct MigrationProxy {
    client: reqwest::Client,
    upstream_url: String,
    include: Vec<Regex>,
}

impl MigrationProxy {
    pub fn new(upstream_url: String, include: Vec<Regex>) -> Self {
        MigrationProxy {
            client: reqwest::Client::new(),
            upstream_url,
            include,
        }
    }

    /// Whether `repository_path` is eligible for proxying: empty `include`
    /// means "all repositories", otherwise at least one pattern must match.
    pub fn matches(&self, repository_path: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(repository_path))
    }

    /// Forwards the request verbatim to the successor registry, setting
    /// `X-Forwarded-For`/`X-Forwarded-Host` (§4.9). An unreachable upstream
    /// or any 5xx response is surfaced uniformly as 503
    /// `ErrorCodeUnavailable` — §9's Open Question (b) resolves both cases
    /// the same way, undifferentiated to the client.
    pub async fn forward(
        &self,
        method: Method,
        uri: &Uri,
        mut headers: HeaderMap,
        body: Bytes,
        client_addr: Option<String>,
        local_host: Option<String>,
    ) -> Response {
        let target = format!("{}{}", self.upstream_url, uri);

        if let Some(addr) = client_addr {
            if let Ok(value) = addr.parse() {
                headers.insert("x-forwarded-for", value);
            }
        }
        if let Some(host) = local_host {
            if let Ok(value) = host.parse() {
                headers.insert("x-forwarded-host", value);
            }
        }

        let request = match self
            .client
            .request(method, &target)
            .headers(headers)
            .body(body)
            .build()
        {
            Ok(req) => req,
            Err(_) => return unavailable(),
        };

        let upstream_response = match self.client.execute(request).await {
            Ok(resp) => resp,
            Err(_) => return unavailable(),
        };

        if upstream_response.status().is_server_error() {
            return unavailable();
        }

        let status = upstream_response.status();
        let response_headers = upstream_response.headers().clone();
        let bytes = match upstream_response.bytes().await {
            Ok(b) => b,
            Err(_) => return unavailable(),
        };

        let mut response = Response::builder().status(status);
        if let Some(h) = response.headers_mut() {
            *h = response_headers;
        }
        response
            .body(Body::from(bytes))
            .unwrap_or_else(|_| unavailable())
    }
}

fn unavailable() -> Response {
    OciError::Unavailable("migration proxy upstream is unreachable".to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_everything_when_include_is_empty() {
        let proxy = MigrationProxy::new("http://successor".into(), vec![]);
        assert!(proxy.matches("anything/here"));
    }

    #[test]
    fn matches_only_configured_patterns() {
        let proxy = MigrationProxy::new(
            "http://successor".into(),
            vec![Regex::new("^legacy/").unwrap()],
        );
        assert!(proxy.matches("legacy/foo"));
        assert!(!proxy.matches("other/foo"));
    }
}
