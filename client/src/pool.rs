use core::time::Duration;

use std::sync::{Arc, Mutex, Weak};

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{address::Address, connection::Connection, route::Route, task::TaskQueue};

/// Set of live connections shared by every call of a client.
#[derive(Clone)]
pub(crate) struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    state: Mutex<State>,
    max_idle: usize,
    keep_alive: Duration,
    queue: TaskQueue,
}

struct State {
    conns: Vec<Arc<Connection>>,
    cleanup_scheduled: bool,
}

impl Pool {
    pub(crate) fn new(max_idle: usize, keep_alive: Duration, queue: TaskQueue) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(State {
                    conns: Vec::new(),
                    cleanup_scheduled: false,
                }),
                max_idle,
                keep_alive,
                queue,
            }),
        }
    }

    /// Find a pooled connection for `address` and claim an exchange on it. First match wins.
    ///
    /// With `require_multiplexed` only http/2 connections are considered. `routes` enables
    /// reuse of a connection established for another host.
    pub(crate) fn acquire(&self, address: &Address, routes: Option<&[Route]>, require_multiplexed: bool) -> Option<Lease> {
        let state = self.inner.state.lock().unwrap();
        state
            .conns
            .iter()
            .filter(|c| !require_multiplexed || c.is_multiplexed())
            .find(|c| c.try_acquire(address, routes))
            .map(|c| Lease::new(c.clone(), &self.inner, true))
    }

    /// Add a freshly connected connection and claim an exchange on it.
    ///
    /// When an eligible http/2 connection for the address appeared while dialing, that one is
    /// used and the new connection is closed.
    pub(crate) fn register_or_coalesce(&self, conn: Connection, address: &Address, routes: &[Route]) -> Lease {
        let conn = Arc::new(conn);

        let existing = {
            let mut state = self.inner.state.lock().unwrap();

            let existing = if conn.is_multiplexed() {
                state
                    .conns
                    .iter()
                    .filter(|c| c.is_multiplexed())
                    .find(|c| c.try_acquire(address, Some(routes)))
                    .cloned()
            } else {
                None
            };

            if existing.is_none() {
                conn.try_acquire(address, Some(routes));
                debug!("connection {} to {} registered", conn.id(), conn.route());
                state.conns.push(conn.clone());
                self.inner.schedule_cleanup(&mut state);
            }

            existing
        };

        match existing {
            Some(existing) => {
                debug!(
                    "connection {} coalesced into pooled connection {}",
                    conn.id(),
                    existing.id()
                );
                conn.close();
                Lease::new(existing, &self.inner, true)
            }
            None => Lease::new(conn, &self.inner, false),
        }
    }

    /// callback for an http/2 engine that stopped taking streams.
    pub(crate) fn shutdown_hook(&self, id: u64) -> Box<dyn FnOnce() + Send> {
        let pool = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(pool) = pool.upgrade() {
                pool.remove(id);
            }
        })
    }

    /// Close idle connections now. Busy ones take no new exchanges and close when released.
    pub(crate) fn evict_all(&self) {
        let evicted = {
            let mut state = self.inner.state.lock().unwrap();
            let (idle, busy): (Vec<_>, Vec<_>) = state.conns.drain(..).partition(|c| c.idle_at().is_some());
            busy.iter().for_each(|c| c.set_no_new_exchanges());
            state.conns = busy;
            idle
        };

        for conn in evicted {
            debug!("connection {} evicted", conn.id());
            conn.close();
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.inner.state.lock().unwrap().conns.len()
    }

    pub(crate) fn idle_connection_count(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.conns.iter().filter(|c| c.idle_at().is_some()).count()
    }

    #[cfg(test)]
    pub(crate) fn cleanup(&self, now: Instant) -> Option<Duration> {
        self.inner.cleanup(now)
    }
}

impl PoolInner {
    fn schedule_cleanup(self: &Arc<Self>, state: &mut State) {
        if state.cleanup_scheduled {
            return;
        }
        state.cleanup_scheduled = true;

        let pool = Arc::downgrade(self);
        self.queue.schedule("connection pool cleanup", Duration::ZERO, move || {
            pool.upgrade().and_then(|pool| pool.cleanup(Instant::now()))
        });
    }

    /// One eviction pass. Returns the delay until the next pass, or `None` once the pool is
    /// empty.
    fn cleanup(&self, now: Instant) -> Option<Duration> {
        let evicted = {
            let mut state = self.state.lock().unwrap();

            let mut in_use = 0;
            let mut idle = 0;
            let mut longest: Option<(usize, Duration)> = None;

            for (i, conn) in state.conns.iter().enumerate() {
                match conn.idle_at() {
                    None => in_use += 1,
                    Some(at) => {
                        idle += 1;
                        let idle_for = now.saturating_duration_since(at);
                        if longest.is_none_or(|(_, d)| idle_for > d) {
                            longest = Some((i, idle_for));
                        }
                    }
                }
            }

            match longest {
                Some((i, idle_for)) if idle_for >= self.keep_alive || idle > self.max_idle => {
                    let conn = state.conns.remove(i);
                    conn.set_no_new_exchanges();
                    conn
                }
                Some((_, idle_for)) => {
                    trace!("pool cleanup: {idle} idle, {in_use} in use");
                    return Some(self.keep_alive - idle_for);
                }
                None if in_use > 0 => return Some(self.keep_alive),
                None => {
                    state.cleanup_scheduled = false;
                    return None;
                }
            }
        };

        debug!("connection {} evicted after idling", evicted.id());
        evicted.close();

        // look again right away.
        Some(Duration::ZERO)
    }

    fn take(&self, id: u64) -> Option<Arc<Connection>> {
        let mut state = self.state.lock().unwrap();
        let i = state.conns.iter().position(|c| c.id() == id)?;
        Some(state.conns.remove(i))
    }

    fn remove(&self, id: u64) {
        if let Some(conn) = self.take(id) {
            debug!("connection {id} removed from pool");
            conn.close();
        }
    }

    fn released(self: &Arc<Self>, conn: &Arc<Connection>) {
        if conn.is_no_new_exchanges() || self.max_idle == 0 {
            self.take(conn.id());
            conn.close();
            return;
        }

        let evicted = {
            let mut state = self.state.lock().unwrap();
            self.schedule_cleanup(&mut state);
            state.evict_over_max_idle(self.max_idle)
        };

        // the cleanup task may sleep for a whole keep alive. the idle limit holds right away.
        if let Some(evicted) = evicted {
            debug!("connection {} evicted over idle limit", evicted.id());
            evicted.close();
        }
    }
}

impl State {
    /// remove the longest idle connection when more than `max_idle` are idle.
    fn evict_over_max_idle(&mut self, max_idle: usize) -> Option<Arc<Connection>> {
        let idle = self.conns.iter().filter(|c| c.idle_at().is_some()).count();
        if idle <= max_idle {
            return None;
        }

        let (i, _) = self
            .conns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.idle_at().map(|at| (i, at)))
            .min_by_key(|(_, at)| *at)?;

        let conn = self.conns.remove(i);
        conn.set_no_new_exchanges();
        Some(conn)
    }
}

/// One exchange's claim on a pooled connection. Dropping it releases the exchange.
pub(crate) struct Lease {
    conn: Arc<Connection>,
    pool: Weak<PoolInner>,
    reused: bool,
}

impl Lease {
    fn new(conn: Arc<Connection>, pool: &Arc<PoolInner>, reused: bool) -> Self {
        Self {
            conn,
            pool: Arc::downgrade(pool),
            reused,
        }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// true when the connection carried an exchange before this one.
    pub(crate) fn is_reused(&self) -> bool {
        self.reused
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.conn.release() {
            if let Some(pool) = self.pool.upgrade() {
                pool.released(&self.conn);
            } else {
                self.conn.close();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex as StdMutex;

    use tokio::io::{duplex, DuplexStream};

    use crate::{
        address::Protocol,
        connection::{next_id, Transport},
        h1::proto::H1Stream,
        h2::connection::H2Connection,
        http::Uri,
        proxy::Proxy,
        task::TaskRunner,
    };

    use super::*;

    fn connection(address: &Address) -> Connection {
        let route = Route::new(address.clone(), Proxy::Direct, "127.0.0.1:80".parse().unwrap());
        let (io, _) = duplex(64);
        Connection::new(
            next_id(),
            route,
            Protocol::Http11,
            None,
            Transport::H1(StdMutex::new(Some(H1Stream::new(Box::new(io))))),
            None,
        )
    }

    fn address(uri: &'static str) -> Address {
        Address::from_uri(&Uri::from_static(uri), &[Protocol::Http11], None).unwrap()
    }

    async fn h2_connection(address: &Address) -> (Connection, DuplexStream) {
        let (h2, peer) = H2Connection::in_memory().await;
        let route = Route::new(address.clone(), Proxy::Direct, "127.0.0.1:443".parse().unwrap());
        let conn = Connection::new(next_id(), route, Protocol::Http2, None, Transport::H2(h2), None);
        (conn, peer)
    }

    // two calls dialed the same address at once. the connection registered second is closed and
    // its call rides the pooled one.
    #[tokio::test]
    async fn coalesce_racing_h2_dial() {
        let runner = TaskRunner::new(1);
        let pool = Pool::new(5, Duration::from_secs(300), runner.queue("pool"));
        let a = Address::from_uri(&Uri::from_static("https://a.com/"), &[Protocol::Http2], None).unwrap();

        let (first, _peer1) = h2_connection(&a).await;
        let first_id = first.id();
        let (second, _peer2) = h2_connection(&a).await;

        let lease1 = pool.register_or_coalesce(first, &a, &[]);
        assert!(!lease1.is_reused());

        let lease2 = pool.register_or_coalesce(second, &a, &[]);
        assert!(lease2.is_reused());
        assert_eq!(lease2.connection().id(), first_id);
        assert_eq!(pool.connection_count(), 1);

        // both exchanges share the pooled connection.
        assert_eq!(lease1.connection().exchanges(), 2);
        drop(lease1);
        drop(lease2);
        assert_eq!(pool.idle_connection_count(), 1);

        let lease = pool.acquire(&a, None, false).unwrap();
        assert!(lease.is_reused());
        assert_eq!(lease.connection().id(), first_id);
    }

    #[tokio::test(start_paused = true)]
    async fn reuse_after_release() {
        let runner = TaskRunner::new(1);
        let pool = Pool::new(5, Duration::from_secs(300), runner.queue("pool"));
        let a = address("http://a.com/");

        assert!(pool.acquire(&a, None, false).is_none());

        let lease = pool.register_or_coalesce(connection(&a), &a, &[]);
        assert!(!lease.is_reused());
        let id = lease.connection().id();

        // held by the first exchange.
        assert!(pool.acquire(&a, None, false).is_none());
        drop(lease);

        let lease = pool.acquire(&a, None, false).unwrap();
        assert!(lease.is_reused());
        assert_eq!(lease.connection().id(), id);
        assert!(pool.acquire(&a, None, true).is_none());
        assert!(pool.acquire(&address("http://b.com/"), None, false).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_keep_alive() {
        let runner = TaskRunner::new(1);
        let keep_alive = Duration::from_secs(10);
        let pool = Pool::new(5, keep_alive, runner.queue("pool"));
        let a = address("http://a.com/");

        let lease = pool.register_or_coalesce(connection(&a), &a, &[]);
        let now = Instant::now();

        // in use: check again after a full keep alive.
        assert_eq!(pool.cleanup(now), Some(keep_alive));
        drop(lease);

        let idle_at = Instant::now();
        assert_eq!(pool.cleanup(idle_at + Duration::from_secs(4)), Some(Duration::from_secs(6)));
        assert_eq!(pool.connection_count(), 1);

        assert_eq!(pool.cleanup(idle_at + keep_alive), Some(Duration::ZERO));
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.cleanup(idle_at + keep_alive), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_max_idle_longest_first() {
        let runner = TaskRunner::new(1);
        let pool = Pool::new(1, Duration::from_secs(300), runner.queue("pool"));
        let a = address("http://a.com/");

        let first = pool.register_or_coalesce(connection(&a), &a, &[]);
        let first_id = first.connection().id();
        drop(first);

        tokio::time::advance(Duration::from_secs(1)).await;

        let second = pool.register_or_coalesce(connection(&a), &a, &[]);
        let second_id = second.connection().id();
        drop(second);

        assert_eq!(pool.cleanup(Instant::now()), Some(Duration::ZERO));
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.acquire(&a, None, false).unwrap().connection().id(), second_id);
        assert_ne!(first_id, second_id);
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_by_background_task() {
        let runner = TaskRunner::new(1);
        let pool = Pool::new(5, Duration::from_secs(10), runner.queue("pool"));
        let a = address("http://a.com/");

        drop(pool.register_or_coalesce(connection(&a), &a, &[]));
        assert_eq!(pool.idle_connection_count(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn max_idle_enforced_on_release() {
        let runner = TaskRunner::new(1);
        let pool = Pool::new(1, Duration::from_secs(300), runner.queue("pool"));
        let a = address("http://a.com/");

        let first = pool.register_or_coalesce(connection(&a), &a, &[]);
        let second = pool.register_or_coalesce(connection(&a), &a, &[]);
        let second_id = second.connection().id();

        // cleanup runs while both are busy and goes to sleep for a full keep alive.
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(first);
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(second);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.idle_connection_count(), 1);
        assert_eq!(pool.acquire(&a, None, false).unwrap().connection().id(), second_id);
    }

    #[tokio::test(start_paused = true)]
    async fn evict_all_marks_busy() {
        let runner = TaskRunner::new(1);
        let pool = Pool::new(5, Duration::from_secs(300), runner.queue("pool"));
        let a = address("http://a.com/");

        let busy = pool.register_or_coalesce(connection(&a), &a, &[]);
        drop(pool.register_or_coalesce(connection(&a), &a, &[]));
        assert_eq!(pool.connection_count(), 2);

        pool.evict_all();
        assert_eq!(pool.connection_count(), 1);
        assert!(busy.connection().is_no_new_exchanges());

        // removed once the last exchange completes.
        drop(busy);
        assert_eq!(pool.connection_count(), 0);
        assert!(pool.acquire(&a, None, false).is_none());
    }
}
