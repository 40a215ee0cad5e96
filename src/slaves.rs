use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use tokio::sync::RwLock;

/// A peer server this instance may redirect clients to when full.
#[derive(Debug, Clone)]
pub struct SlaveHost {
    pub server: String,
    pub port: u16,
    pub count: usize,
}

/// Set of peer hosts for client redirection, reference counted by the
/// number of times `add` has been called for a given `(server, port)`.
pub struct SlaveHostTable {
    hosts: RwLock<Vec<SlaveHost>>,
    slave_count: AtomicUsize,
}

impl SlaveHostTable {
    pub fn new() -> Self {
        SlaveHostTable {
            hosts: RwLock::new(Vec::new()),
            slave_count: AtomicUsize::new(0),
        }
    }

    pub fn slave_count(&self) -> usize {
        self.slave_count.load(Ordering::Acquire)
    }

    /// Parse a `server:port` header and add (or bump the refcount of) the
    /// slave host it names. Rejects headers without a `:` separator.
    pub async fn add(&self, header: &str) -> bool {
        let Some((server, port)) = parse_host_header(header) else {
            return false;
        };

        let mut hosts = self.hosts.write().await;
        if let Some(existing) = hosts.iter_mut().find(|h| h.server == server && h.port == port) {
            existing.count += 1;
        } else {
            hosts.insert(0, SlaveHost { server, port, count: 1 });
            self.slave_count.fetch_add(1, Ordering::AcqRel);
        }
        true
    }

    /// Parse an `ice-redirect` header value and decrement the named host's
    /// refcount, unlinking it once it reaches zero.
    pub async fn remove(&self, ice_redirect_header: &str) -> bool {
        let Some((server, port)) = parse_host_header(ice_redirect_header) else {
            return false;
        };

        let mut hosts = self.hosts.write().await;
        if let Some(index) = hosts.iter().position(|h| h.server == server && h.port == port) {
            hosts[index].count -= 1;
            if hosts[index].count == 0 {
                hosts.remove(index);
                self.slave_count.fetch_sub(1, Ordering::AcqRel);
            }
            true
        } else {
            false
        }
    }

    /// Check whether `(server, port)` is already a known slave host.
    pub async fn contains(&self, server: &str, port: u16) -> bool {
        let hosts = self.hosts.read().await;
        hosts.iter().any(|h| h.server == server && h.port == port)
    }

    /// Draw a uniformly random slave host, if any are known.
    pub async fn pick_random(&self) -> Option<SlaveHost> {
        let hosts = self.hosts.read().await;
        if hosts.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..hosts.len());
        hosts.get(index).cloned()
    }
}

impl Default for SlaveHostTable {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_host_header(header: &str) -> Option<(String, u16)> {
    let (server, port) = header.split_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((server.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_accumulates_refcount() {
        let table = SlaveHostTable::new();
        assert!(table.add("x:1").await);
        assert!(table.add("x:1").await);
        assert_eq!(table.slave_count(), 1);
    }

    #[tokio::test]
    async fn test_add_rejects_missing_colon() {
        let table = SlaveHostTable::new();
        assert!(!table.add("noport").await);
        assert_eq!(table.slave_count(), 0);
    }

    #[tokio::test]
    async fn test_add_two_distinct_hosts() {
        let table = SlaveHostTable::new();
        table.add("x:1").await;
        table.add("y:2").await;
        assert_eq!(table.slave_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_decrements_then_unlinks() {
        let table = SlaveHostTable::new();
        table.add("x:1").await;
        table.add("x:1").await;
        assert!(table.remove("x:1").await);
        assert_eq!(table.slave_count(), 1, "refcount of 2 decremented to 1 should not unlink");

        assert!(table.remove("x:1").await);
        assert_eq!(table.slave_count(), 0, "refcount reaching 0 must unlink the host");
    }

    #[tokio::test]
    async fn test_pick_random_returns_known_host() {
        let table = SlaveHostTable::new();
        table.add("x:1").await;
        table.add("y:2").await;

        let picked = table.pick_random().await.expect("one of two hosts");
        assert!(picked.server == "x" || picked.server == "y");
    }

    #[tokio::test]
    async fn test_pick_random_empty_table() {
        let table = SlaveHostTable::new();
        assert!(table.pick_random().await.is_none());
    }

    #[tokio::test]
    async fn test_contains() {
        let table = SlaveHostTable::new();
        table.add("x:1").await;
        assert!(table.contains("x", 1).await);
        assert!(!table.contains("y", 2).await);
    }
}
