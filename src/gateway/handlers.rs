//! HTTP dispatch and built-in endpoints
//!
//! All paths funnel through one fallback handler that consults the
//! [`RouteTable`]: login and callback endpoints, the built-in PAP and
//! userinfo endpoints, and the proxied services. Authentication comes from
//! the session cookie or a bearer token; authorization is the policy tree,
//! fail-closed.
//!
//! Error philosophy at this boundary: a missing or invalid credential is a
//! 401, a policy denial is a 403, an unreachable backend is a 502, and an
//! unexpected failure is a 500. None of them ever tear down the listener.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Redirect, Response},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::ac::{Decision, PolicyStore};
use crate::config::Config;
use crate::gateway::proxy::{self, bearer_token, cookie_value};
use crate::gateway::routes::{ResolvedRoute, RouteTable, RouteTarget, ServiceRoute};
use crate::gateway::session::{SESSION_COOKIE, SessionStore};
use crate::provider::{Claims, ProviderManager};

/// Largest request body the gateway buffers before forwarding.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state
pub struct AppState {
    /// Gateway configuration
    pub config: Arc<Config>,
    /// Provider clients and token validation
    pub providers: Arc<ProviderManager>,
    /// Access-control policy tree
    pub policies: Arc<PolicyStore>,
    /// Login sessions
    pub sessions: Arc<SessionStore>,
    /// Request routing table
    pub routes: Arc<RouteTable>,
}

/// Create the main router: every path goes through [`dispatch`].
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the plain-HTTP router that only redirects to the external base
/// URI, preserving path and query.
pub fn create_redirect_router(base_uri: String) -> Router {
    let base = base_uri.trim_end_matches('/').to_string();
    Router::new().fallback(move |uri: Uri| {
        let target = match uri.query() {
            Some(q) => format!("{base}{}?{q}", uri.path()),
            None => format!("{base}{}", uri.path()),
        };
        async move { Redirect::permanent(&target) }
    })
}

/// Route and handle one request.
async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    let Some(route) = state.routes.resolve(&path) else {
        return error_response(StatusCode::NOT_FOUND, "No such route");
    };

    let claims = authenticate(&state, &parts.headers).await;

    match route {
        ResolvedRoute {
            target: RouteTarget::Auth,
            rest,
        } => handle_auth(&state, claims, &rest, query.as_deref()).await,
        ResolvedRoute {
            target: RouteTarget::Callback,
            ..
        } => handle_callback(&state, query.as_deref()).await,
        ResolvedRoute {
            target: RouteTarget::Userinfo { authenticate },
            ..
        } => handle_userinfo(&state, authenticate, claims, &path, &parts.method),
        ResolvedRoute {
            target: RouteTarget::Pap { authenticate },
            rest,
        } => handle_pap(&state, authenticate, claims, &path, &rest, &parts.method),
        ResolvedRoute {
            target: RouteTarget::Service(service),
            rest,
        } => {
            let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
                Ok(b) => b,
                Err(_) => {
                    return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
                }
            };
            handle_service(
                &state,
                &service,
                claims,
                &path,
                &rest,
                query.as_deref(),
                parts.method,
                &parts.headers,
                body,
            )
            .await
        }
    }
}

/// Resolve the caller's identity from the session cookie or a bearer token.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<Claims> {
    if let Some(id) = cookie_value(headers, SESSION_COOKIE) {
        if let Some(session) = state.sessions.get(id) {
            return Some(session.claims);
        }
    }
    if let Some(token) = bearer_token(headers) {
        return state.providers.validate(token).await;
    }
    None
}

/// GET /auth[/{provider}]: session introspection, provider listing, and
/// login kickoff. The provider comes from the path remainder or, failing
/// that, a `provider` query parameter.
async fn handle_auth(
    state: &AppState,
    claims: Option<Claims>,
    rest: &str,
    query: Option<&str>,
) -> Response {
    let params = parse_query(query);

    let path_provider = rest.trim_start_matches('/');
    let provider = if path_provider.is_empty() {
        params
            .iter()
            .find(|(k, _)| k == "provider")
            .map(|(_, v)| v.as_str())
    } else {
        Some(path_provider)
    };

    if let Some(provider) = provider {
        let Some(client) = state.providers.client(provider) else {
            // Configured but not bootstrapped yet, or plain unknown
            let status = if state.config.providers.contains_key(provider) {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::NOT_FOUND
            };
            return error_response(status, &format!("Provider '{provider}' not available"));
        };

        let Some(redirect_uri) = state.providers.redirect_uri_for(provider) else {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "No redirect URI");
        };

        let return_to = params
            .iter()
            .find(|(k, _)| k == "return_to")
            .map_or("/", |(_, v)| v.as_str())
            .to_string();
        // Only same-site return targets; anything else is an open redirect
        let return_to = if return_to.starts_with('/') && !return_to.starts_with("//") {
            return_to
        } else {
            "/".to_string()
        };

        let login = state.sessions.begin_login(provider, &return_to);
        return match client.authorization_url(&redirect_uri, &login.state, &login.nonce) {
            Ok(url) => {
                debug!(provider = %provider, "Redirecting to provider login");
                Redirect::to(&url).into_response()
            }
            Err(e) => {
                error!(provider = %provider, error = %e, "Login redirect failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Login redirect failed")
            }
        };
    }

    if let Some(claims) = claims {
        return Json(json!({
            "authenticated": true,
            "subject": claims.subject,
            "issuer": claims.issuer,
        }))
        .into_response();
    }

    let ready = state.providers.clients();
    let providers: Vec<_> = state
        .config
        .providers
        .keys()
        .map(|name| {
            json!({
                "name": name,
                "ready": ready.contains_key(name),
                "login": format!("{}?provider={name}", state.config.server.auth_path),
            })
        })
        .collect();
    Json(json!({ "authenticated": false, "providers": providers })).into_response()
}

/// OIDC redirect endpoint: finish the authorization-code flow.
async fn handle_callback(state: &AppState, query: Option<&str>) -> Response {
    let params = parse_query(query);
    let get = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    if let Some(err) = get("error") {
        warn!(error = %err, "Provider returned an authorization error");
        return error_response(StatusCode::UNAUTHORIZED, "Login was not completed");
    }

    let (Some(code), Some(login_state)) = (get("code"), get("state")) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing code or state");
    };

    let Some(login) = state.sessions.take_pending(login_state) else {
        return error_response(StatusCode::BAD_REQUEST, "Unknown or expired login state");
    };

    let Some(client) = state.providers.client(&login.provider) else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Provider not available");
    };
    let Some(redirect_uri) = state.providers.redirect_uri_for(&login.provider) else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "No redirect URI");
    };

    let tokens = match client
        .exchange_code(state.providers.http(), code, &redirect_uri)
        .await
    {
        Ok(t) => t,
        Err(e) => {
            warn!(provider = %login.provider, error = %e, "Code exchange failed");
            return error_response(StatusCode::BAD_GATEWAY, "Token exchange failed");
        }
    };

    let Some(id_token) = tokens.id_token.as_deref() else {
        return error_response(StatusCode::BAD_GATEWAY, "Provider returned no ID token");
    };

    let Some(claims) = state.providers.validate(id_token).await else {
        return error_response(StatusCode::UNAUTHORIZED, "ID token validation failed");
    };

    // Nonce binding: the token must carry the nonce from this login
    if claims.get("nonce").and_then(serde_json::Value::as_str) != Some(login.nonce.as_str()) {
        warn!(provider = %login.provider, "Nonce mismatch in ID token");
        return error_response(StatusCode::UNAUTHORIZED, "ID token validation failed");
    }

    info!(provider = %login.provider, subject = %claims.subject, "Login completed");
    let session_id = state
        .sessions
        .create(claims, tokens.access_token, login.provider);

    let cookie = format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; Secure; SameSite=Lax");
    (
        StatusCode::SEE_OTHER,
        [
            (header::SET_COOKIE, cookie),
            (header::LOCATION, login.return_to),
        ],
    )
        .into_response()
}

/// Built-in userinfo endpoint: the caller's own claims.
fn handle_userinfo(
    state: &AppState,
    must_authenticate: bool,
    claims: Option<Claims>,
    path: &str,
    method: &Method,
) -> Response {
    if must_authenticate && claims.is_none() {
        return unauthenticated_response(state);
    }
    if state.policies.authorize(claims.as_ref(), path, method.as_str()) == Decision::Deny {
        return error_response(StatusCode::FORBIDDEN, "Access denied");
    }

    match claims {
        Some(claims) => Json(serde_json::Value::Object(claims.extra)).into_response(),
        None => Json(json!({})).into_response(),
    }
}

/// Built-in PAP endpoint: inspect the active policy tree, reload on demand.
fn handle_pap(
    state: &AppState,
    must_authenticate: bool,
    claims: Option<Claims>,
    path: &str,
    rest: &str,
    method: &Method,
) -> Response {
    if must_authenticate && claims.is_none() {
        return unauthenticated_response(state);
    }
    if state.policies.authorize(claims.as_ref(), path, method.as_str()) == Decision::Deny {
        return error_response(StatusCode::FORBIDDEN, "Access denied");
    }

    match (method, rest) {
        (&Method::GET, "" | "/") => Json(state.policies.snapshot().describe()).into_response(),
        (&Method::POST, "/reload") => {
            match state.policies.load_dirs(&state.config.access_control.json_dirs) {
                Ok(rules) => Json(json!({ "reloaded": true, "rules": rules })).into_response(),
                Err(e) => {
                    error!(error = %e, "Policy reload failed, previous tree kept");
                    (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        Json(json!({ "reloaded": false, "error": e.to_string() })),
                    )
                        .into_response()
                }
            }
        }
        _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "Unsupported PAP operation"),
    }
}

/// Authenticate, authorize, and forward a service request.
#[allow(clippy::too_many_arguments)]
async fn handle_service(
    state: &AppState,
    service: &ServiceRoute,
    claims: Option<Claims>,
    path: &str,
    rest: &str,
    query: Option<&str>,
    method: Method,
    headers: &HeaderMap,
    body: bytes::Bytes,
) -> Response {
    if service.authenticate && claims.is_none() {
        return unauthenticated_response(state);
    }

    if state.policies.authorize(claims.as_ref(), path, method.as_str()) == Decision::Deny {
        debug!(service = %service.name, path = %path, "Policy denied request");
        return error_response(StatusCode::FORBIDDEN, "Access denied");
    }

    match proxy::forward(
        state.providers.http(),
        service,
        method,
        rest,
        query,
        headers,
        body,
        claims.as_ref(),
    )
    .await
    {
        Ok(response) => response,
        Err(e) => {
            let status = e.status_code();
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!(service = %service.name, error = %e, "Proxy failure");
            }
            error_response(status, &e.to_string())
        }
    }
}

/// 401 with a pointer at the login endpoint.
fn unauthenticated_response(state: &AppState) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({
            "error": "Authentication required",
            "login": state.config.server.auth_path,
        })),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_decodes_values() {
        let params = parse_query(Some("provider=idp1&return_to=%2Fsvc1%2Fpage"));
        assert_eq!(
            params,
            vec![
                ("provider".to_string(), "idp1".to_string()),
                ("return_to".to_string(), "/svc1/page".to_string()),
            ]
        );
        assert!(parse_query(None).is_empty());
    }
}
