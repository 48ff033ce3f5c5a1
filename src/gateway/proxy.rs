//! Backend request forwarding
//!
//! The proxy strips everything gateway-internal before forwarding:
//! `Authorization`, `Cookie`, and `Host` never reach a backend, nor do
//! hop-by-hop headers. When a service opts in, the caller's validated
//! identity is injected as `x-auth-subject` / `x-auth-issuer` /
//! `x-auth-claims` headers, so backends can authorize without speaking OIDC
//! themselves.
//!
//! A backend that cannot be reached is a 502, distinct from the 403 an
//! access-control denial produces.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Response, header};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::gateway::routes::ServiceRoute;
use crate::provider::Claims;
use crate::{Error, Result};

/// Identity header carrying the OIDC subject.
pub const HEADER_SUBJECT: &str = "x-auth-subject";
/// Identity header carrying the issuer URL.
pub const HEADER_ISSUER: &str = "x-auth-issuer";
/// Identity header carrying the full claim set as JSON.
pub const HEADER_CLAIMS: &str = "x-auth-claims";

/// Hop-by-hop headers (RFC 9110 §7.6.1) plus gateway-internal ones.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forward a request to the service's backend and stream the response back.
///
/// # Errors
///
/// Returns [`Error::BackendUnavailable`] when the backend refuses the
/// connection or times out.
pub async fn forward(
    http: &reqwest::Client,
    route: &ServiceRoute,
    method: Method,
    rest: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
    claims: Option<&Claims>,
) -> Result<Response<Body>> {
    let mut url = format!("{}{rest}", route.origin);
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }

    debug!(service = %route.name, method = %method, url = %url, "Forwarding request");

    let mut outbound = filter_request_headers(headers);
    if route.pass_identity_headers {
        if let Some(claims) = claims {
            inject_identity_headers(&mut outbound, claims);
        }
    }

    let response = http
        .request(method, &url)
        .headers(outbound)
        .timeout(route.timeout)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            warn!(service = %route.name, error = %e, "Backend request failed");
            Error::BackendUnavailable(format!("{}: {e}", route.name))
        })?;

    let status = response.status();
    let mut builder = Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        for (name, value) in response.headers() {
            if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            // append, not insert: Set-Cookie and friends may repeat
            response_headers.append(name.clone(), value.clone());
        }
    }

    builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|e| Error::Internal(format!("Response assembly failed: {e}")))
}

/// Copy the inbound headers minus hop-by-hop and credential headers.
fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        // Identity headers only ever come from the gateway itself
        if name.as_str().starts_with("x-auth-") {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Add the identity headers derived from validated claims.
fn inject_identity_headers(headers: &mut HeaderMap, claims: &Claims) {
    if let Ok(v) = HeaderValue::from_str(&claims.subject) {
        headers.insert(HeaderName::from_static(HEADER_SUBJECT), v);
    }
    if let Ok(v) = HeaderValue::from_str(&claims.issuer) {
        headers.insert(HeaderName::from_static(HEADER_ISSUER), v);
    }
    if let Ok(json) = serde_json::to_string(&claims.extra) {
        if let Ok(v) = HeaderValue::from_str(&json) {
            headers.insert(HeaderName::from_static(HEADER_CLAIMS), v);
        }
    }
}

/// Parse a cookie header and return the named cookie's value.
#[must_use]
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}

/// Extract a bearer token from the Authorization header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
