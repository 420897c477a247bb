//! Ordered server address list with failover bookkeeping.
//!
//! The list tracks both the addresses as configured (`original`) and the
//! working set mutated by failover (`current`). Removing dead nodes only
//! touches the working set, so exhausting it lets the caller reload the
//! configured addresses and start over.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ConnectionStrategy;
use crate::error::DriverError;
use crate::session::ClientSession;

/// Default port for plain connections.
pub const DEFAULT_PORT: u16 = 7420;
/// Default port for TLS connections.
pub const DEFAULT_SSL_PORT: u16 = 7421;

#[derive(Debug)]
struct Inner {
    current: Vec<String>,
    original: Vec<String>,
    cursor: usize,
}

/// Thread-safe ordered set of `host:port` strings for one storage.
pub struct AddressList {
    inner: Mutex<Inner>,
    use_ssl: bool,
}

impl AddressList {
    pub fn new<S: AsRef<str>>(hosts: &[S], use_ssl: bool) -> Result<Self, DriverError> {
        let list = Self {
            inner: Mutex::new(Inner {
                current: Vec::new(),
                original: Vec::new(),
                cursor: 0,
            }),
            use_ssl,
        };
        for host in hosts {
            list.add_host(host.as_ref());
        }
        if list.is_empty() {
            return Err(DriverError::Config(
                "at least one server address is required".to_string(),
            ));
        }
        Ok(list)
    }

    fn normalize(&self, host: &str) -> String {
        let host = host.trim();
        if host.contains(':') {
            host.to_string()
        } else {
            let port = if self.use_ssl {
                DEFAULT_SSL_PORT
            } else {
                DEFAULT_PORT
            };
            format!("{host}:{port}")
        }
    }

    /// Normalize and append a host, skipping duplicates. Returns the
    /// normalized form.
    pub fn add_host(&self, host: &str) -> String {
        let url = self.normalize(host);
        let mut inner = self.inner.lock();
        if !inner.current.contains(&url) {
            inner.current.push(url.clone());
        }
        if !inner.original.contains(&url) {
            inner.original.push(url.clone());
        }
        url
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().current.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().current.len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.inner.lock().current.clone()
    }

    pub fn original_urls(&self) -> Vec<String> {
        self.inner.lock().original.clone()
    }

    /// Advance the shared round-robin cursor; used only when establishing a
    /// brand-new connection.
    pub fn next_for_connect(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        if inner.current.is_empty() {
            return None;
        }
        let index = inner.cursor % inner.current.len();
        inner.cursor = (index + 1) % inner.current.len();
        Some(inner.current[index].clone())
    }

    /// Return the session's pinned URL, or advance the session's own
    /// rotation index over the current list and pin the result.
    pub fn current_or_next(&self, advance: bool, session: &ClientSession) -> Option<String> {
        if !advance {
            if let Some(url) = session.pinned_url() {
                return Some(url);
            }
        }
        let candidates = self.urls();
        if candidates.is_empty() {
            return None;
        }
        let index = session.next_url_index(candidates.len());
        let url = candidates[index].clone();
        session.pin_url(&url);
        Some(url)
    }

    /// Drop a dead URL from the working set and return the new head, or
    /// `None` when the working set is now empty.
    pub fn remove_and_get_next(&self, url: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        inner.current.retain(|existing| existing != url);
        inner.cursor = 0;
        let next = inner.current.first().cloned();
        info!(removed = url, next = next.as_deref(), "server removed from address list");
        next
    }

    /// Restore the working set from the configured addresses.
    pub fn reload_original(&self) {
        let mut inner = self.inner.lock();
        inner.current = inner.original.clone();
        inner.cursor = 0;
    }

    /// Merge addresses announced by the cluster (distributed configuration
    /// pushes) into both lists.
    pub fn merge_hosts<S: AsRef<str>>(&self, hosts: &[S]) {
        for host in hosts {
            self.add_host(host.as_ref());
        }
    }

    /// Pick a target URL for the executor according to the configured
    /// strategy. Reloads the configured addresses once if the working set
    /// was exhausted.
    pub fn next_available(
        &self,
        strategy: ConnectionStrategy,
        is_connect: bool,
        session: &Arc<ClientSession>,
    ) -> Result<String, DriverError> {
        if self.is_empty() {
            self.reload_original();
        }
        let selected = match strategy {
            ConnectionStrategy::Sticky => self.current_or_next(false, session),
            ConnectionStrategy::RoundRobinConnect => {
                if is_connect {
                    let url = self.next_for_connect();
                    if let Some(url) = &url {
                        session.pin_url(url);
                    }
                    url
                } else {
                    self.current_or_next(false, session)
                }
            }
            ConnectionStrategy::RoundRobinRequest => self.current_or_next(true, session),
        };
        selected.ok_or_else(|| DriverError::NoReachableServer(self.original_urls()))
    }

    /// Best-effort peer discovery: when a single bootstrap host was
    /// configured, look up its TXT records and merge any `s=<host>` entries.
    /// Lookup failures are swallowed.
    pub async fn discover_peers(&self, timeout: Duration) {
        let bootstrap = {
            let inner = self.inner.lock();
            if inner.original.len() != 1 {
                return;
            }
            inner.original[0].clone()
        };
        let host = bootstrap.split(':').next().unwrap_or(&bootstrap).to_string();

        let resolver = hickory_resolver::TokioAsyncResolver::tokio(
            hickory_resolver::config::ResolverConfig::default(),
            hickory_resolver::config::ResolverOpts::default(),
        );
        let lookup = match tokio::time::timeout(timeout, resolver.txt_lookup(host.clone())).await {
            Ok(Ok(lookup)) => lookup,
            Ok(Err(e)) => {
                debug!(host, error = %e, "peer discovery lookup failed");
                return;
            }
            Err(_) => {
                debug!(host, "peer discovery lookup timed out");
                return;
            }
        };

        for txt in lookup.iter() {
            for data in txt.txt_data() {
                let entry = String::from_utf8_lossy(data);
                for part in entry.split_whitespace() {
                    if let Some(peer) = part.strip_prefix("s=") {
                        if !peer.is_empty() {
                            let added = self.add_host(peer);
                            debug!(peer = added, "peer discovered via DNS");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;

    fn session() -> Arc<ClientSession> {
        SessionRegistry::new().new_session("admin", "secret")
    }

    #[test]
    fn test_default_port_normalization() {
        let list = AddressList::new(&["alpha", "beta:9000", "alpha"], false).unwrap();
        assert_eq!(list.urls(), vec!["alpha:7420", "beta:9000"]);

        let tls = AddressList::new(&["alpha"], true).unwrap();
        assert_eq!(tls.urls(), vec!["alpha:7421"]);
    }

    #[test]
    fn test_empty_construction_rejected() {
        let hosts: [&str; 0] = [];
        assert!(matches!(
            AddressList::new(&hosts, false),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn test_round_robin_visits_each_once_per_cycle() {
        let list = AddressList::new(&["a", "b", "c"], false).unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(list.next_for_connect().unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec!["a:7420", "b:7420", "c:7420"]);
        // Wraps deterministically.
        assert_eq!(list.next_for_connect().unwrap(), "a:7420");
    }

    #[test]
    fn test_remove_and_reload() {
        let list = AddressList::new(&["only"], false).unwrap();
        assert_eq!(list.remove_and_get_next("only:7420"), None);
        assert!(list.is_empty());

        list.reload_original();
        assert_eq!(list.urls(), vec!["only:7420"]);
    }

    #[test]
    fn test_remove_resets_cursor() {
        let list = AddressList::new(&["a", "b", "c"], false).unwrap();
        list.next_for_connect();
        list.next_for_connect();
        assert_eq!(list.remove_and_get_next("b:7420"), Some("a:7420".to_string()));
        assert_eq!(list.next_for_connect().unwrap(), "a:7420");
    }

    #[test]
    fn test_sticky_returns_pinned_url() {
        let list = AddressList::new(&["a", "b"], false).unwrap();
        let session = session();
        let first = list
            .next_available(ConnectionStrategy::Sticky, false, &session)
            .unwrap();
        for _ in 0..5 {
            let again = list
                .next_available(ConnectionStrategy::Sticky, false, &session)
                .unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_round_robin_request_rotates_per_session() {
        let list = AddressList::new(&["a", "b"], false).unwrap();
        let session = session();
        let first = list
            .next_available(ConnectionStrategy::RoundRobinRequest, false, &session)
            .unwrap();
        let second = list
            .next_available(ConnectionStrategy::RoundRobinRequest, false, &session)
            .unwrap();
        assert_ne!(first, second);
        let third = list
            .next_available(ConnectionStrategy::RoundRobinRequest, false, &session)
            .unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_exhausted_list_reloads_original() {
        let list = AddressList::new(&["a"], false).unwrap();
        list.remove_and_get_next("a:7420");
        assert!(list.is_empty());

        let session = session();
        let url = list
            .next_available(ConnectionStrategy::Sticky, false, &session)
            .unwrap();
        assert_eq!(url, "a:7420");
    }

    #[test]
    fn test_merge_hosts_deduplicates() {
        let list = AddressList::new(&["a"], false).unwrap();
        list.merge_hosts(&["a:7420", "b", "c:9999"]);
        assert_eq!(list.urls(), vec!["a:7420", "b:7420", "c:9999"]);
        assert_eq!(list.original_urls(), vec!["a:7420", "b:7420", "c:9999"]);
    }
}
