//! admission of asynchronous calls.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Bounds how many enqueued calls run at once, in total and per host.
#[derive(Clone, Debug)]
pub(crate) struct Dispatcher {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    max_requests: Arc<Semaphore>,
    max_requests_per_host: usize,
    hosts: Mutex<HashMap<String, Host>>,
    running: AtomicUsize,
    queued: AtomicUsize,
}

/// Admission state of one host. Dropped once no call waits for or runs against it.
#[derive(Debug)]
struct Host {
    sem: Arc<Semaphore>,
    users: usize,
}

impl Dispatcher {
    pub(crate) fn new(max_requests: usize, max_requests_per_host: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_requests: Arc::new(Semaphore::new(max_requests)),
                max_requests_per_host,
                hosts: Mutex::new(HashMap::new()),
                running: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a slot of given host. The call counts as queued while waiting.
    pub(crate) async fn acquire(&self, host: &str) -> Permit {
        let inner = &self.inner;

        let (slot, host_sem) = {
            let mut hosts = inner.hosts.lock().unwrap();
            let entry = hosts.entry(host.to_owned()).or_insert_with(|| Host {
                sem: Arc::new(Semaphore::new(inner.max_requests_per_host)),
                users: 0,
            });
            entry.users += 1;
            let slot = HostSlot {
                dispatcher: self.clone(),
                host: host.to_owned(),
            };
            (slot, entry.sem.clone())
        };

        inner.queued.fetch_add(1, Ordering::SeqCst);
        let guard = Queued(inner);

        // per host first so a call waiting on a busy host does not hold a global slot.
        // semaphores are never closed.
        let host_permit = host_sem.acquire_owned().await.ok();
        let permit = inner.max_requests.clone().acquire_owned().await.ok();

        drop(guard);
        inner.running.fetch_add(1, Ordering::SeqCst);

        trace!("call to {host} admitted");

        Permit {
            permits: (host_permit, permit),
            slot,
        }
    }

    /// Count a call executed directly by the caller. It bypasses the limits.
    pub(crate) fn track(&self) -> Running {
        self.inner.running.fetch_add(1, Ordering::SeqCst);
        Running(self.clone())
    }

    pub(crate) fn running_calls_count(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub(crate) fn queued_calls_count(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }
}

struct Queued<'a>(&'a Inner);

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running directly executed call.
pub(crate) struct Running(Dispatcher);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.inner.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Interest of one call in a host, waiting or running.
#[derive(Debug)]
struct HostSlot {
    dispatcher: Dispatcher,
    host: String,
}

impl Drop for HostSlot {
    fn drop(&mut self) {
        let mut hosts = self.dispatcher.inner.hosts.lock().unwrap();
        if let Some(entry) = hosts.get_mut(&self.host) {
            entry.users -= 1;
            if entry.users == 0 {
                hosts.remove(&self.host);
            }
        }
    }
}

/// Slot of one running enqueued call.
#[derive(Debug)]
pub(crate) struct Permit {
    permits: (Option<OwnedSemaphorePermit>, Option<OwnedSemaphorePermit>),
    slot: HostSlot,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.slot.dispatcher.inner.running.fetch_sub(1, Ordering::SeqCst);
    }
}
