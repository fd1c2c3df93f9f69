use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use std::sync::Mutex;

use tokio::time::Instant;
use tracing::debug;

use crate::{
    address::{Address, Protocol},
    h1::proto::H1Stream,
    h2::connection::H2Connection,
    route::Route,
    task::TaskQueue,
    tls::Handshake,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// allocate a process unique connection id.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Protocol engine of a connection.
pub(crate) enum Transport {
    /// held by at most one exchange. `None` while checked out.
    H1(Mutex<Option<H1Stream>>),
    H2(H2Connection),
}

struct State {
    /// irreversible. set on GOAWAY, fatal error, or eviction.
    no_new_exchanges: bool,
    exchanges: usize,
    idle_at: Instant,
}

/// One physical connection and its negotiated protocol.
pub struct Connection {
    id: u64,
    route: Route,
    protocol: Protocol,
    handshake: Option<Handshake>,
    created_at: Instant,
    state: Mutex<State>,
    pub(crate) transport: Transport,
    /// maintenance queue of http/2 PING.
    queue: Option<TaskQueue>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        route: Route,
        protocol: Protocol,
        handshake: Option<Handshake>,
        transport: Transport,
        queue: Option<TaskQueue>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            route,
            protocol,
            handshake,
            created_at: now,
            state: Mutex::new(State {
                no_new_exchanges: false,
                exchanges: 0,
                idle_at: now,
            }),
            transport,
            queue,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self.transport, Transport::H2(_))
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// true when the connection can never carry another exchange.
    pub fn is_no_new_exchanges(&self) -> bool {
        self.state.lock().unwrap().no_new_exchanges || !self.transport_accepting()
    }

    fn transport_accepting(&self) -> bool {
        match self.transport {
            Transport::H1(ref stream) => stream.lock().unwrap().is_some(),
            Transport::H2(ref h2) => h2.is_accepting(),
        }
    }

    /// Can this connection carry an exchange for `address`? `routes` are the resolved routes of
    /// the address and enable reuse across hostnames.
    fn is_eligible(&self, state: &State, address: &Address, routes: Option<&[Route]>) -> bool {
        if state.no_new_exchanges {
            return false;
        }

        match self.transport {
            Transport::H1(ref stream) => {
                if state.exchanges > 0 || stream.lock().unwrap().is_none() {
                    return false;
                }
            }
            Transport::H2(ref h2) => {
                if !h2.is_accepting() {
                    return false;
                }
            }
        }

        if self.route.address() == address {
            return true;
        }

        self.is_coalescable(address, routes)
    }

    // reuse of an http/2 connection for a different host that resolves to the same peer and is
    // covered by the certificate the peer presented.
    fn is_coalescable(&self, address: &Address, routes: Option<&[Route]>) -> bool {
        let Some(routes) = routes else {
            return false;
        };

        if !self.is_multiplexed() || !address.is_tls() || !self.route.proxy().is_direct() {
            return false;
        }

        if !self.route.address().equals_non_host(address) {
            return false;
        }

        let same_peer = routes
            .iter()
            .any(|r| r.proxy().is_direct() && r.socket_addr() == self.route.socket_addr());

        same_peer
            && self
                .handshake
                .as_ref()
                .is_some_and(|handshake| handshake.is_valid_for(address.host()))
    }

    /// Claim one exchange slot if eligible. Checked and claimed under the same lock.
    pub(crate) fn try_acquire(&self, address: &Address, routes: Option<&[Route]>) -> bool {
        let mut state = self.state.lock().unwrap();
        if !self.is_eligible(&state, address, routes) {
            return false;
        }
        state.exchanges += 1;
        true
    }

    /// Return one exchange slot. Returns true when the connection became idle.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.exchanges = state.exchanges.saturating_sub(1);
        if state.exchanges == 0 {
            state.idle_at = Instant::now();
            return true;
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn exchanges(&self) -> usize {
        self.state.lock().unwrap().exchanges
    }

    /// idle since, or `None` while carrying exchanges.
    pub(crate) fn idle_at(&self) -> Option<Instant> {
        let state = self.state.lock().unwrap();
        (state.exchanges == 0).then_some(state.idle_at)
    }

    pub(crate) fn set_no_new_exchanges(&self) {
        self.state.lock().unwrap().no_new_exchanges = true;
    }

    /// Take the http/1 transport for an exchange.
    pub(crate) fn take_h1(&self) -> Option<H1Stream> {
        match self.transport {
            Transport::H1(ref stream) => stream.lock().unwrap().take(),
            Transport::H2(_) => None,
        }
    }

    /// Return the http/1 transport after a complete exchange.
    pub(crate) fn put_h1(&self, h1: H1Stream) {
        if let Transport::H1(ref stream) = self.transport {
            *stream.lock().unwrap() = Some(h1);
        }
    }

    pub(crate) fn h2(&self) -> Option<&H2Connection> {
        match self.transport {
            Transport::H2(ref h2) => Some(h2),
            Transport::H1(_) => None,
        }
    }

    /// Mark "no new exchanges" and release the transport. In flight http/2 streams fail.
    pub(crate) fn close(&self) {
        self.set_no_new_exchanges();

        match self.transport {
            Transport::H1(ref stream) => drop(stream.lock().unwrap().take()),
            Transport::H2(ref h2) => h2.close(),
        }

        if let Some(ref queue) = self.queue {
            queue.cancel_all();
            let queue = queue.clone();
            // the PING task may hold the last reference and call in here. never block on it.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { queue.shutdown().await });
            }
        }

        debug!("connection {} to {} closed", self.id, self.route);
    }
}
