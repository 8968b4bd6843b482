//! Route lookup and request rewriting.
//!
//! Upstreams are selected by longest path prefix; a `/` prefix is the
//! catch-all. Targets are parsed once at construction, so a malformed
//! target URL refuses to start rather than failing per request.

use http::header::{HeaderName, HeaderValue, HOST};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::Request;
use serde::{Deserialize, Serialize};

/// A single proxy target: a name, the path prefix that selects it, and the
/// base URL requests are rewritten against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub name: String,
    /// URL path prefix to match; `/` is the catch-all.
    pub prefix: String,
    /// Target base URL, e.g. `http://localhost:8081`.
    pub target: String,
}

/// Error type for router construction.
#[derive(Debug)]
pub enum RouterError {
    /// Target URL failed to parse.
    InvalidTarget {
        upstream: String,
        target: String,
        reason: String,
    },
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::InvalidTarget {
                upstream,
                target,
                reason,
            } => write!(
                f,
                "invalid target {:?} for upstream {:?}: {}",
                target, upstream, reason
            ),
        }
    }
}

impl std::error::Error for RouterError {}

/// An upstream with its target pre-parsed for rewriting.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    upstream: Upstream,
    scheme: Scheme,
    authority: Authority,
    /// Target base path with no trailing slash; empty when the target has
    /// no meaningful path component.
    base_path: String,
}

impl Route {
    pub(crate) fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Director: point `req` at this route's target.
    ///
    /// Rewrites scheme and authority, prepends the target base path, sets
    /// the `Host` header, and appends the client address to
    /// `X-Forwarded-For` (creating it if absent).
    pub(crate) fn rewrite<B>(
        &self,
        req: &mut Request<B>,
        remote_addr: &str,
    ) -> Result<(), http::Error> {
        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());

        if !self.base_path.is_empty() {
            let original = parts
                .path_and_query
                .as_ref()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let joined: PathAndQuery = format!("{}{}", self.base_path, original).parse()?;
            parts.path_and_query = Some(joined);
        } else if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }

        *req.uri_mut() = Uri::from_parts(parts)?;

        req.headers_mut()
            .insert(HOST, HeaderValue::from_str(self.authority.as_str())?);

        let xff = HeaderName::from_static("x-forwarded-for");
        let prior: Vec<String> = req
            .headers()
            .get_all(&xff)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        let forwarded = if prior.is_empty() {
            remote_addr.to_string()
        } else {
            format!("{}, {}", prior.join(", "), remote_addr)
        };
        req.headers_mut()
            .insert(xff, HeaderValue::from_str(&forwarded)?);

        Ok(())
    }
}

/// Routes incoming requests to upstreams by path prefix. Longer prefixes
/// take precedence; equal lengths keep registration order.
#[derive(Debug)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Validate and prepare the given upstreams for routing.
    pub fn new(upstreams: Vec<Upstream>) -> Result<Router, RouterError> {
        let mut routes = Vec::with_capacity(upstreams.len());
        for mut upstream in upstreams {
            if upstream.prefix.is_empty() {
                upstream.prefix = "/".to_string();
            }
            let uri: Uri = upstream.target.parse().map_err(|e: http::uri::InvalidUri| {
                RouterError::InvalidTarget {
                    upstream: upstream.name.clone(),
                    target: upstream.target.clone(),
                    reason: e.to_string(),
                }
            })?;
            let scheme = uri.scheme().cloned().ok_or_else(|| RouterError::InvalidTarget {
                upstream: upstream.name.clone(),
                target: upstream.target.clone(),
                reason: "missing scheme".to_string(),
            })?;
            let authority = uri
                .authority()
                .cloned()
                .ok_or_else(|| RouterError::InvalidTarget {
                    upstream: upstream.name.clone(),
                    target: upstream.target.clone(),
                    reason: "missing host".to_string(),
                })?;
            let base_path = uri.path().trim_end_matches('/').to_string();
            routes.push(Route {
                upstream,
                scheme,
                authority,
                base_path,
            });
        }
        // Longest prefix wins; sort_by is stable, so ties keep insertion order.
        routes.sort_by(|a, b| b.upstream.prefix.len().cmp(&a.upstream.prefix.len()));
        Ok(Router { routes })
    }

    /// Best-matching route for a request path, or `None`.
    pub(crate) fn match_route(&self, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.upstream.prefix == "/" || path.starts_with(&r.upstream.prefix))
    }

    /// Best-matching upstream for a request path, or `None`.
    pub fn match_upstream(&self, path: &str) -> Option<&Upstream> {
        self.match_route(path).map(Route::upstream)
    }

    /// Configured upstreams in matching precedence order, for display.
    pub fn upstreams(&self) -> Vec<Upstream> {
        self.routes.iter().map(|r| r.upstream.clone()).collect()
    }
}
