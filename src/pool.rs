//! Per-address pool of live transport connections.
//!
//! Each `host:port` owns a bounded bucket of free connections. Acquiring
//! moves a connection out of the bucket, so a connection is never visible to
//! two callers at once; the `locked` marker is belt-and-braces against a
//! holder that returned a connection without unlocking it, which evicts the
//! connection instead of reusing it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::DriverError;

/// A transport handle bound to exactly one `host:port`.
#[derive(Debug)]
pub struct Connection {
    url: String,
    stream: TcpStream,
    locked: bool,
    fresh: bool,
    last_used: Instant,
}

impl Connection {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, DriverError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(url))
            .await
            .map_err(|_| {
                DriverError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to '{url}' timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;
        Ok(Self {
            url: url.to_string(),
            stream,
            locked: true,
            fresh: true,
            last_used: Instant::now(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    pub fn is_connected(&self) -> bool {
        self.stream.peer_addr().is_ok()
    }

    /// True until the connection has served one request and been returned
    /// to the pool. Write failures on a reused connection indicate a stale
    /// socket rather than an unreachable peer.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Take exclusive use of the connection. False means the previous
    /// holder never unlocked it.
    fn try_lock(&mut self) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        true
    }

    fn unlock(&mut self) {
        self.locked = false;
        self.fresh = false;
        self.last_used = Instant::now();
    }
}

struct BucketInner {
    free: VecDeque<Connection>,
    total: usize,
}

struct Bucket {
    inner: Mutex<BucketInner>,
    returned: Notify,
}

impl Bucket {
    fn new() -> Self {
        Self {
            inner: Mutex::new(BucketInner {
                free: VecDeque::new(),
                total: 0,
            }),
            returned: Notify::new(),
        }
    }
}

/// Shared pool over all server addresses of one storage.
pub struct ConnectionPool {
    buckets: DashMap<String, Arc<Bucket>>,
    capacity: usize,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn bucket(&self, url: &str) -> Arc<Bucket> {
        self.buckets
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Bucket::new()))
            .clone()
    }

    /// Return a free connection for `url`, creating a new transport if none
    /// is free and the bucket is below capacity. Waits up to
    /// `config.acquire_timeout` for a slot otherwise.
    pub async fn acquire(
        &self,
        url: &str,
        config: &ClientConfig,
    ) -> Result<Connection, DriverError> {
        let bucket = self.bucket(url);
        let deadline = Instant::now() + config.acquire_timeout;

        loop {
            enum Plan {
                Reuse(Connection),
                Create,
                Wait,
            }

            let plan = {
                let mut inner = bucket.inner.lock();
                loop {
                    match inner.free.pop_front() {
                        Some(mut conn) => {
                            if !conn.try_lock() {
                                // Previous holder crashed without
                                // unlocking. Evict and keep looking.
                                warn!(url, "evicting connection returned in locked state");
                                inner.total -= 1;
                                continue;
                            }
                            if !conn.is_connected() {
                                inner.total -= 1;
                                continue;
                            }
                            break Plan::Reuse(conn);
                        }
                        None => {
                            if inner.total < self.capacity {
                                inner.total += 1;
                                break Plan::Create;
                            }
                            break Plan::Wait;
                        }
                    }
                }
            };

            match plan {
                Plan::Reuse(conn) => return Ok(conn),
                Plan::Create => {
                    match Connection::connect(url, config.connect_timeout).await {
                        Ok(conn) => return Ok(conn),
                        Err(e) => {
                            bucket.inner.lock().total -= 1;
                            bucket.returned.notify_one();
                            return Err(e);
                        }
                    }
                }
                Plan::Wait => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(DriverError::PoolTimeout(url.to_string()));
                    }
                    if tokio::time::timeout(remaining, bucket.returned.notified())
                        .await
                        .is_err()
                    {
                        return Err(DriverError::PoolTimeout(url.to_string()));
                    }
                }
            }
        }
    }

    /// Return a connection to the free set if it is still live; close and
    /// evict it otherwise.
    pub fn release(&self, mut conn: Connection) {
        let bucket = self.bucket(conn.url());
        if conn.is_connected() {
            conn.unlock();
            bucket.inner.lock().free.push_back(conn);
        } else {
            debug!(url = conn.url(), "dropping dead connection on release");
            bucket.inner.lock().total -= 1;
        }
        bucket.returned.notify_one();
    }

    /// Forcibly close and evict, used on any I/O failure.
    pub fn remove(&self, conn: Connection) {
        let bucket = self.bucket(conn.url());
        bucket.inner.lock().total -= 1;
        bucket.returned.notify_one();
        drop(conn);
    }

    /// Take a connection out of the pool's accounting entirely. Used for
    /// the dedicated push socket, which is owned by its listener from then
    /// on.
    pub fn detach(&self, conn: Connection) -> TcpStream {
        let bucket = self.bucket(conn.url());
        bucket.inner.lock().total -= 1;
        bucket.returned.notify_one();
        conn.into_stream()
    }

    /// Close and evict free connections unused longer than `timeout`.
    pub fn sweep_idle(&self, timeout: Duration) {
        for entry in self.buckets.iter() {
            let bucket = entry.value();
            let mut inner = bucket.inner.lock();
            let before = inner.free.len();
            inner
                .free
                .retain(|conn| conn.last_used.elapsed() < timeout);
            let evicted = before - inner.free.len();
            if evicted > 0 {
                inner.total -= evicted;
                debug!(url = entry.key(), evicted, "idle connections swept");
                bucket.returned.notify_one();
            }
        }
    }

    /// Number of pooled connections (free plus handed out) for `url`.
    pub fn live_count(&self, url: &str) -> usize {
        self.buckets
            .get(url)
            .map(|bucket| bucket.inner.lock().total)
            .unwrap_or(0)
    }
}
