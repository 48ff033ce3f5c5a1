//! Request routing
//!
//! The route table is built once from the configuration at startup and is
//! immutable afterwards. Every request path resolves to exactly one closed
//! [`RouteTarget`]; the string origins `pap` and `userinfo` are mapped to
//! their built-in targets here, never re-interpreted per request.
//!
//! Service prefixes are ordered longest-first, so `/svc1/api` wins over
//! `/svc1` regardless of configuration map ordering. Ties cannot happen:
//! duplicate prefixes are rejected when the table is built.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::{Error, Result};

/// A proxied backend service, resolved from the configuration.
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    /// Service name from the configuration
    pub name: String,
    /// Backend origin, e.g. `http://10.0.0.5:8080`
    pub origin: String,
    /// Path prefix the service is mounted under
    pub proxy_path: String,
    /// Whether requests must be authenticated
    pub authenticate: bool,
    /// Whether identity headers are injected into forwarded requests
    pub pass_identity_headers: bool,
    /// Forward timeout
    pub timeout: Duration,
}

/// Where a request goes, as a closed set.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// Forward to a backend service
    Service(Arc<ServiceRoute>),
    /// Built-in policy administration endpoint
    Pap {
        /// Whether requests must be authenticated
        authenticate: bool,
    },
    /// Built-in userinfo endpoint
    Userinfo {
        /// Whether requests must be authenticated
        authenticate: bool,
    },
    /// Login entry point
    Auth,
    /// OIDC redirect (authorization-code callback)
    Callback,
}

/// One entry of the ordered route table.
#[derive(Debug, Clone)]
struct RouteEntry {
    /// Path prefix (exact match for `Callback`)
    prefix: String,
    /// Exact-only entries never match sub-paths
    exact: bool,
    target: RouteTarget,
}

/// A resolved route: the target plus the path remainder to forward.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    /// The target this request goes to
    pub target: RouteTarget,
    /// Path remainder after the matched prefix, beginning with `/` (or
    /// empty for an exact hit)
    pub rest: String,
}

/// Immutable request-routing table.
#[derive(Debug)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    /// Build the table from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when two services share a prefix or a
    /// service prefix collides with a built-in path.
    pub fn build(config: &Config) -> Result<Self> {
        let mut entries = Vec::new();

        // Prefix match: the login flow accepts `/auth/<provider>` too.
        entries.push(RouteEntry {
            prefix: config.server.auth_path.clone(),
            exact: false,
            target: RouteTarget::Auth,
        });
        for path in &config.server.redirect_paths {
            entries.push(RouteEntry {
                prefix: path.clone(),
                exact: true,
                target: RouteTarget::Callback,
            });
        }

        // Deterministic order: longest prefix first, then by name.
        let mut services: Vec<_> = config.services.iter().collect();
        services.sort_by(|(a_name, a), (b_name, b)| {
            b.proxy_path
                .len()
                .cmp(&a.proxy_path.len())
                .then_with(|| a_name.cmp(b_name))
        });

        for (name, service) in services {
            let prefix = service.proxy_path.trim_end_matches('/').to_string();
            let prefix = if prefix.is_empty() {
                "/".to_string()
            } else {
                prefix
            };

            if entries.iter().any(|e| e.prefix == prefix) {
                return Err(Error::Config(format!(
                    "Service '{name}': duplicate proxy_path '{prefix}'"
                )));
            }

            let target = match service.origin.as_str() {
                "pap" => RouteTarget::Pap {
                    authenticate: service.authenticate,
                },
                "userinfo" => RouteTarget::Userinfo {
                    authenticate: service.authenticate,
                },
                origin => RouteTarget::Service(Arc::new(ServiceRoute {
                    name: name.clone(),
                    origin: origin.trim_end_matches('/').to_string(),
                    proxy_path: prefix.clone(),
                    authenticate: service.authenticate,
                    pass_identity_headers: service.pass_identity_headers,
                    timeout: service.timeout,
                })),
            };

            entries.push(RouteEntry {
                prefix,
                exact: false,
                target,
            });
        }

        Ok(Self { entries })
    }

    /// Resolve a request path to its target, first match wins.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute> {
        for entry in &self.entries {
            if entry.exact {
                if path == entry.prefix {
                    return Some(ResolvedRoute {
                        target: entry.target.clone(),
                        rest: String::new(),
                    });
                }
                continue;
            }

            if path == entry.prefix {
                return Some(ResolvedRoute {
                    target: entry.target.clone(),
                    rest: String::new(),
                });
            }
            let with_slash = if entry.prefix == "/" {
                "/".to_string()
            } else {
                format!("{}/", entry.prefix)
            };
            if path.starts_with(&with_slash) {
                let rest = if entry.prefix == "/" {
                    path.to_string()
                } else {
                    path[entry.prefix.len()..].to_string()
                };
                return Some(ResolvedRoute {
                    target: entry.target.clone(),
                    rest,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn service(origin: &str, proxy_path: &str) -> ServiceConfig {
        ServiceConfig {
            origin: origin.to_string(),
            proxy_path: proxy_path.to_string(),
            authenticate: true,
            pass_identity_headers: false,
            timeout: Duration::from_secs(30),
        }
    }

    fn table_with(services: &[(&str, &str, &str)]) -> RouteTable {
        let mut config = Config::default();
        for (name, origin, path) in services {
            config
                .services
                .insert((*name).to_string(), service(origin, path));
        }
        RouteTable::build(&config).unwrap()
    }

    #[test]
    fn auth_matches_provider_subpaths() {
        let table = table_with(&[]);

        assert!(matches!(
            table.resolve("/auth").unwrap().target,
            RouteTarget::Auth
        ));
        // Named-provider login lives under the auth path
        let hit = table.resolve("/auth/idp1").unwrap();
        assert!(matches!(hit.target, RouteTarget::Auth));
        assert_eq!(hit.rest, "/idp1");
        // Segment boundaries still apply
        assert!(table.resolve("/authx").is_none());
    }

    #[test]
    fn callback_is_exact() {
        let table = table_with(&[]);

        assert!(matches!(
            table.resolve("/oidc-redirect").unwrap().target,
            RouteTarget::Callback
        ));
        assert!(table.resolve("/oidc-redirect/sub").is_none());
    }

    #[test]
    fn service_prefix_matches_subpaths() {
        let table = table_with(&[("svc1", "http://127.0.0.1:9000", "/svc1")]);

        let hit = table.resolve("/svc1/api/items").unwrap();
        let RouteTarget::Service(route) = hit.target else {
            panic!("expected service target");
        };
        assert_eq!(route.name, "svc1");
        assert_eq!(hit.rest, "/api/items");

        // The bare prefix matches with an empty remainder
        let bare = table.resolve("/svc1").unwrap();
        assert_eq!(bare.rest, "");
    }

    #[test]
    fn prefix_match_respects_segment_boundaries() {
        let table = table_with(&[("svc1", "http://127.0.0.1:9000", "/svc1")]);
        assert!(table.resolve("/svc1extra").is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let table = table_with(&[
            ("outer", "http://127.0.0.1:9000", "/svc"),
            ("inner", "http://127.0.0.1:9001", "/svc/special"),
        ]);

        let hit = table.resolve("/svc/special/x").unwrap();
        let RouteTarget::Service(route) = hit.target else {
            panic!("expected service target");
        };
        assert_eq!(route.name, "inner");
        assert_eq!(hit.rest, "/x");
    }

    #[test]
    fn builtin_origins_map_to_closed_targets() {
        let table = table_with(&[("pap", "pap", "/pap"), ("userinfo", "userinfo", "/userinfo")]);

        assert!(matches!(
            table.resolve("/pap").unwrap().target,
            RouteTarget::Pap { authenticate: true }
        ));
        assert!(matches!(
            table.resolve("/userinfo").unwrap().target,
            RouteTarget::Userinfo { authenticate: true }
        ));
    }

    #[test]
    fn unmatched_path_is_none() {
        let table = table_with(&[("svc1", "http://127.0.0.1:9000", "/svc1")]);
        assert!(table.resolve("/unknown").is_none());
    }

    #[test]
    fn duplicate_prefix_is_rejected() {
        let mut config = Config::default();
        config
            .services
            .insert("a".to_string(), service("http://127.0.0.1:9000", "/svc"));
        config
            .services
            .insert("b".to_string(), service("http://127.0.0.1:9001", "/svc"));
        assert!(RouteTable::build(&config).is_err());
    }

    #[test]
    fn root_service_catches_everything_else() {
        let table = table_with(&[
            ("root", "http://127.0.0.1:9000", "/"),
            ("svc1", "http://127.0.0.1:9001", "/svc1"),
        ]);

        let hit = table.resolve("/anything/else").unwrap();
        let RouteTarget::Service(route) = hit.target else {
            panic!("expected service target");
        };
        assert_eq!(route.name, "root");
        assert_eq!(hit.rest, "/anything/else");

        // The more specific service still wins
        let hit = table.resolve("/svc1/x").unwrap();
        let RouteTarget::Service(route) = hit.target else {
            panic!("expected service target");
        };
        assert_eq!(route.name, "svc1");
    }
}
