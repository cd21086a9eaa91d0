//! Routing table derived from membership events.
//!
//! The matcher keeps the set of known upstreams plus two memoization caches
//! (hostname and prefix) that fill lazily on first hit and are purged when
//! the upstream they point to is removed. Lookups take the shared lock;
//! cache fills and event application take the exclusive lock.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::core::{
    bus::InlineConsumer,
    error::GatewayError,
    event::Event,
    upstream::{prefix_matches, Upstream, UpstreamId},
};

/// How a request was matched to its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Hostname,
    Prefix,
}

/// The result of a successful route lookup.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub upstream: Arc<Upstream>,
    pub kind: MatchKind,
    /// The matched prefix, set only for prefix matches. The pipeline strips
    /// it from the forwarded path.
    pub prefix: Option<String>,
}

#[derive(Default)]
struct MatcherTables {
    known: HashMap<UpstreamId, Arc<Upstream>>,
    by_host: HashMap<String, UpstreamId>,
    by_prefix: HashMap<String, UpstreamId>,
}

/// Answers per-request `match` lookups against the current membership view.
#[derive(Default)]
pub struct UpstreamMatcher {
    tables: RwLock<MatcherTables>,
}

enum CacheFill {
    Host(String, UpstreamId),
    Prefix(String, UpstreamId),
}

impl UpstreamMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a request by host, then by longest path-component prefix.
    /// Hostname matches take precedence; ties resolve by upstream id order.
    pub fn match_request(&self, host: &str, path: &str) -> Result<RouteMatch, GatewayError> {
        let host = host
            .split(':')
            .next()
            .unwrap_or(host)
            .to_ascii_lowercase();

        let (result, fill) = {
            let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
            self.lookup(&tables, &host, path)
        };

        // Memoize outside the shared lock; the entry is only written if the
        // upstream is still known, so the caches never point at a removed id.
        if let Some(fill) = fill {
            let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
            match fill {
                CacheFill::Host(host, id) => {
                    if tables.known.contains_key(&id) {
                        tables.by_host.insert(host, id);
                    }
                }
                CacheFill::Prefix(prefix, id) => {
                    if tables.known.contains_key(&id) {
                        tables.by_prefix.insert(prefix, id);
                    }
                }
            }
        }

        result
    }

    fn lookup(
        &self,
        tables: &MatcherTables,
        host: &str,
        path: &str,
    ) -> (Result<RouteMatch, GatewayError>, Option<CacheFill>) {
        // Hostname: cache, then a scan over known upstreams.
        if let Some(upstream) = tables
            .by_host
            .get(host)
            .and_then(|id| tables.known.get(id))
        {
            return (
                Ok(RouteMatch {
                    upstream: upstream.clone(),
                    kind: MatchKind::Hostname,
                    prefix: None,
                }),
                None,
            );
        }

        if let Some(upstream) = tables
            .known
            .values()
            .filter(|u| u.has_hostname(host))
            .min_by_key(|u| u.id)
        {
            return (
                Ok(RouteMatch {
                    upstream: upstream.clone(),
                    kind: MatchKind::Hostname,
                    prefix: None,
                }),
                Some(CacheFill::Host(host.to_string(), upstream.id)),
            );
        }

        // Prefix: the longest known prefix that is a path-component prefix
        // of the request path.
        let Some(prefix) = tables
            .known
            .values()
            .flat_map(|u| u.prefixes.iter())
            .filter(|p| prefix_matches(p.as_str(), path))
            .max_by_key(|p| p.len())
        else {
            return (Err(GatewayError::UpstreamNotFound), None);
        };

        if let Some(upstream) = tables
            .by_prefix
            .get(prefix.as_str())
            .and_then(|id| tables.known.get(id))
        {
            return (
                Ok(RouteMatch {
                    upstream: upstream.clone(),
                    kind: MatchKind::Prefix,
                    prefix: Some(prefix.clone()),
                }),
                None,
            );
        }

        match tables
            .known
            .values()
            .filter(|u| u.has_prefix(prefix))
            .min_by_key(|u| u.id)
        {
            Some(upstream) => (
                Ok(RouteMatch {
                    upstream: upstream.clone(),
                    kind: MatchKind::Prefix,
                    prefix: Some(prefix.clone()),
                }),
                Some(CacheFill::Prefix(prefix.clone(), upstream.id)),
            ),
            None => (Err(GatewayError::UpstreamNotFound), None),
        }
    }

    /// Number of upstreams currently known.
    pub fn known_count(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .known
            .len()
    }

    /// Whether the given upstream id is currently known.
    pub fn knows(&self, id: UpstreamId) -> bool {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .known
            .contains_key(&id)
    }

    fn apply_added(&self, upstream: Arc<Upstream>) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.known.insert(upstream.id, upstream);
        // Caches fill lazily on the next match.
    }

    fn apply_removed(&self, id: UpstreamId) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.known.remove(&id);
        tables.by_host.retain(|_, cached| *cached != id);
        tables.by_prefix.retain(|_, cached| *cached != id);
    }
}

impl InlineConsumer for UpstreamMatcher {
    fn on_event(&self, event: &Event) {
        match event {
            Event::UpstreamAdded(upstream) => self.apply_added(upstream.clone()),
            Event::UpstreamRemoved(id) => self.apply_removed(*id),
            other => {
                tracing::error!(kind = ?other.kind(), "matcher received an unexpected event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::upstream::{UpstreamSpec, UpstreamTimeouts};

    fn upstream(name: &str, hostnames: &[&str], prefixes: &[&str]) -> Arc<Upstream> {
        Arc::new(
            UpstreamSpec {
                id: None,
                name: name.into(),
                hostnames: hostnames.iter().map(|s| s.to_string()).collect(),
                prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
                timeouts: UpstreamTimeouts::default(),
            }
            .into_upstream()
            .unwrap(),
        )
    }

    fn matcher_with(upstreams: &[Arc<Upstream>]) -> UpstreamMatcher {
        let matcher = UpstreamMatcher::new();
        for u in upstreams {
            matcher.apply_added(u.clone());
        }
        matcher
    }

    #[test]
    fn matches_by_hostname_case_insensitively() {
        let u = upstream("api", &["api.test"], &[]);
        let matcher = matcher_with(&[u.clone()]);

        let hit = matcher.match_request("API.Test", "/foo").unwrap();
        assert_eq!(hit.upstream.id, u.id);
        assert_eq!(hit.kind, MatchKind::Hostname);
        assert!(hit.prefix.is_none());
    }

    #[test]
    fn strips_port_from_host() {
        let u = upstream("api", &["api.test"], &[]);
        let matcher = matcher_with(&[u.clone()]);
        assert!(matcher.match_request("api.test:8080", "/foo").is_ok());
    }

    #[test]
    fn hostname_takes_precedence_over_prefix() {
        let by_host = upstream("by-host", &["api.test"], &[]);
        let by_prefix = upstream("by-prefix", &[], &["/foo"]);
        let matcher = matcher_with(&[by_host.clone(), by_prefix]);

        let hit = matcher.match_request("api.test", "/foo/bar").unwrap();
        assert_eq!(hit.upstream.id, by_host.id);
        assert_eq!(hit.kind, MatchKind::Hostname);
    }

    #[test]
    fn longest_prefix_wins() {
        let short = upstream("short", &[], &["/api"]);
        let long = upstream("long", &[], &["/api/v2"]);
        let matcher = matcher_with(&[short.clone(), long.clone()]);

        let hit = matcher.match_request("anything", "/api/v2/users").unwrap();
        assert_eq!(hit.upstream.id, long.id);
        assert_eq!(hit.prefix.as_deref(), Some("/api/v2"));

        let hit = matcher.match_request("anything", "/api/users").unwrap();
        assert_eq!(hit.upstream.id, short.id);
    }

    #[test]
    fn prefix_matching_respects_path_components() {
        let u = upstream("api", &[], &["/api"]);
        let matcher = matcher_with(&[u]);

        assert!(matcher.match_request("h", "/api/x").is_ok());
        assert!(matcher.match_request("h", "/api").is_ok());
        assert!(matches!(
            matcher.match_request("h", "/api2/x"),
            Err(GatewayError::UpstreamNotFound)
        ));
    }

    #[test]
    fn ties_resolve_by_upstream_id_order() {
        let a = upstream("a", &["shared.test"], &[]);
        let b = upstream("b", &["shared.test"], &[]);
        let expected = a.id.min(b.id);
        let matcher = matcher_with(&[a, b]);

        let hit = matcher.match_request("shared.test", "/").unwrap();
        assert_eq!(hit.upstream.id, expected);
        // And again through the now-populated cache.
        let hit = matcher.match_request("shared.test", "/").unwrap();
        assert_eq!(hit.upstream.id, expected);
    }

    #[test]
    fn removal_purges_caches() {
        let u = upstream("api", &["api.test"], &["/api"]);
        let matcher = matcher_with(&[u.clone()]);

        // Populate both caches.
        matcher.match_request("api.test", "/x").unwrap();
        matcher.match_request("other", "/api/x").unwrap();

        matcher.apply_removed(u.id);
        assert!(matches!(
            matcher.match_request("api.test", "/x"),
            Err(GatewayError::UpstreamNotFound)
        ));
        assert!(matches!(
            matcher.match_request("other", "/api/x"),
            Err(GatewayError::UpstreamNotFound)
        ));
        assert_eq!(matcher.known_count(), 0);
    }

    #[test]
    fn replayed_event_sequence_converges() {
        // Final state equals {added and never later removed}.
        let keep = upstream("keep", &["keep.test"], &[]);
        let drop_ = upstream("drop", &["drop.test"], &[]);
        let matcher = UpstreamMatcher::new();

        matcher.on_event(&Event::UpstreamAdded(keep.clone()));
        matcher.on_event(&Event::UpstreamAdded(drop_.clone()));
        matcher.on_event(&Event::UpstreamRemoved(drop_.id));

        assert!(matcher.knows(keep.id));
        assert!(!matcher.knows(drop_.id));
        assert!(matcher.match_request("keep.test", "/").is_ok());
        assert!(matcher.match_request("drop.test", "/").is_err());
    }
}
