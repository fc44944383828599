//! Ports: the rendezvous between clients asking for sessions and a
//! server accepting them.
//!
//! The client half enforces the session budget; the server half queues
//! freshly created server sessions until they are accepted.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::class_token::ObjectKind;
use crate::object::{AutoObject, ObjRef, ObjectCore, TypedObject};
use crate::process::KProcess;
use crate::resource_limit::LimitableResource;
use crate::result::{KResult, KernelError};
use crate::session::{KClientSession, KSession, KServerSession};
use crate::sync::{SchedulerGuard, SchedulerLock, SynchronizationObject, WaiterRegistry};
use crate::KernelCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortState {
    Normal,
    ClientClosed,
    ServerClosed,
}

/// The parent tying the two halves together and carrying the shared state.
pub struct KPort {
    core: ObjectCore,
    state: Mutex<PortState>,
    client: Mutex<Option<Arc<KClientPort>>>,
    server: Mutex<Option<Arc<KServerPort>>>,
}

/// Client half: connection point with a hard cap on live sessions.
pub struct KClientPort {
    core: ObjectCore,
    parent: Mutex<Option<ObjRef<KPort>>>,
    num_sessions: AtomicI32,
    peak_sessions: AtomicI32,
    max_sessions: i32,
    scheduler: Arc<SchedulerLock>,
    waiters: WaiterRegistry,
}

/// Server half: FIFO of server sessions awaiting acceptance. Signaled
/// while the queue is non-empty.
pub struct KServerPort {
    core: ObjectCore,
    parent: Mutex<Option<ObjRef<KPort>>>,
    queue: Mutex<VecDeque<ObjRef<KServerSession>>>,
    waiters: WaiterRegistry,
}

impl KPort {
    /// Create a port pair with the given session cap.
    pub fn new(
        kernel: &KernelCore,
        max_sessions: i32,
        name: Option<&str>,
    ) -> (ObjRef<KPort>, ObjRef<KClientPort>, ObjRef<KServerPort>) {
        let port = ObjRef::new(KPort {
            core: ObjectCore::new(kernel.counters(), ObjectKind::Port),
            state: Mutex::new(PortState::Normal),
            client: Mutex::new(None),
            server: Mutex::new(None),
        });
        if let Some(name) = name {
            port.core().set_name(name);
        }

        let client = ObjRef::new(KClientPort {
            core: ObjectCore::new(kernel.counters(), ObjectKind::ClientPort),
            parent: Mutex::new(Some(port.clone())),
            num_sessions: AtomicI32::new(0),
            peak_sessions: AtomicI32::new(0),
            max_sessions,
            scheduler: kernel.scheduler_handle(),
            waiters: WaiterRegistry::default(),
        });
        let server = ObjRef::new(KServerPort {
            core: ObjectCore::new(kernel.counters(), ObjectKind::ServerPort),
            parent: Mutex::new(Some(port.clone())),
            queue: Mutex::new(VecDeque::new()),
            waiters: WaiterRegistry::default(),
        });

        *port.client.lock() = Some(Arc::clone(client.as_arc()));
        *port.server.lock() = Some(Arc::clone(server.as_arc()));

        (port, client, server)
    }

    /// Hand a new server session to the server half. Fails once either
    /// half has been closed.
    fn enqueue_session(
        &self,
        kernel: &KernelCore,
        session: ObjRef<KServerSession>,
    ) -> KResult<()> {
        let guard = kernel.lock_scheduler();
        if *self.state.lock() != PortState::Normal {
            return Err(KernelError::PortClosed);
        }
        let server = self
            .server
            .lock()
            .as_ref()
            .cloned()
            .ok_or(KernelError::PortClosed)?;
        server.enqueue(&guard, session);
        Ok(())
    }

    fn on_client_closed(&self) {
        let mut state = self.state.lock();
        if *state == PortState::Normal {
            *state = PortState::ClientClosed;
        }
        self.client.lock().take();
    }

    fn on_server_closed(&self) {
        let mut state = self.state.lock();
        if *state == PortState::Normal {
            *state = PortState::ServerClosed;
        }
        self.server.lock().take();
    }

    fn is_server_closed(&self) -> bool {
        *self.state.lock() == PortState::ServerClosed
    }
}

impl KClientPort {
    /// Create a session through this port. Reserves one unit of session
    /// quota from `process` and one slot against the port cap; both are
    /// unwound on failure, and the quota transfers to the session on
    /// success.
    pub fn create_session(
        &self,
        kernel: &KernelCore,
        process: &ObjRef<KProcess>,
    ) -> KResult<ObjRef<KClientSession>> {
        let parent = self
            .parent
            .lock()
            .as_ref()
            .cloned()
            .ok_or(KernelError::PortClosed)?;
        if parent.is_server_closed() {
            return Err(KernelError::PortClosed);
        }
        let self_arc = parent
            .client
            .lock()
            .as_ref()
            .cloned()
            .ok_or(KernelError::PortClosed)?;

        process
            .resource_limit()
            .reserve(LimitableResource::Sessions, 1, None)?;

        // Claim a slot against the cap; the peak records the count each
        // successful claim installs.
        loop {
            let current = self.num_sessions.load(Ordering::Acquire);
            if current >= self.max_sessions {
                process
                    .resource_limit()
                    .release(LimitableResource::Sessions, 1);
                return Err(KernelError::OutOfSessions);
            }
            if self
                .num_sessions
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.peak_sessions.fetch_max(current + 1, Ordering::AcqRel);
                break;
            }
        }

        let port_ref = ObjRef::from_arc(&self_arc);
        let name = self.core.name();
        let (_session, client_session, server_session) =
            KSession::new(kernel, process, Some(port_ref), name.as_deref());

        trace!(port = ?name, sessions = self.num_sessions.load(Ordering::Relaxed), "session created");

        // Failure here unwinds through the session's own teardown, which
        // returns the slot and the quota.
        parent.enqueue_session(kernel, server_session)?;
        Ok(client_session)
    }

    /// Called when a session created through this port is finalized.
    pub(crate) fn on_session_finalized(&self) {
        let prev = self.num_sessions.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if prev == self.max_sessions {
            let guard = self.scheduler.lock();
            self.notify_available(&guard);
        }
    }

    pub fn num_sessions(&self) -> i32 {
        self.num_sessions.load(Ordering::Acquire)
    }

    pub fn peak_sessions(&self) -> i32 {
        self.peak_sessions.load(Ordering::Acquire)
    }

    pub fn max_sessions(&self) -> i32 {
        self.max_sessions
    }
}

impl KServerPort {
    fn enqueue(&self, guard: &SchedulerGuard<'_>, session: ObjRef<KServerSession>) {
        let mut queue = self.queue.lock();
        queue.push_back(session);
        if queue.len() == 1 {
            self.notify_available(guard);
        }
    }

    /// Pop the oldest pending session, if any.
    pub fn accept_session(&self, kernel: &KernelCore) -> Option<ObjRef<KServerSession>> {
        let _guard = kernel.lock_scheduler();
        self.queue.lock().pop_front()
    }
}

impl AutoObject for KPort {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_destroy(&self) {
        self.client.lock().take();
        self.server.lock().take();
    }
}

impl TypedObject for KPort {
    const KIND: ObjectKind = ObjectKind::Port;
}

impl AutoObject for KClientPort {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_destroy(&self) {
        if let Some(parent) = self.parent.lock().take() {
            parent.on_client_closed();
        }
    }
}

impl TypedObject for KClientPort {
    const KIND: ObjectKind = ObjectKind::ClientPort;
}

impl SynchronizationObject for KClientPort {
    /// Signaled while there is room for another session.
    fn is_signaled(&self, _guard: &SchedulerGuard<'_>) -> bool {
        self.num_sessions.load(Ordering::Acquire) < self.max_sessions
    }

    fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }
}

impl AutoObject for KServerPort {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_destroy(&self) {
        if let Some(parent) = self.parent.lock().take() {
            parent.on_server_closed();
        }
        self.queue.lock().clear();
    }
}

impl TypedObject for KServerPort {
    const KIND: ObjectKind = ObjectKind::ServerPort;
}

impl SynchronizationObject for KServerPort {
    fn is_signaled(&self, _guard: &SchedulerGuard<'_>) -> bool {
        !self.queue.lock().is_empty()
    }

    fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }
}
