//! Sessions: the client/server channel carrying synchronous requests.
//!
//! A client thread enqueues a request on the server half and blocks on a
//! per-request completion until the server replies or the session dies.
//! The server half is a waitable object, signaled while a request is
//! pending and none is being processed.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::class_token::ObjectKind;
use crate::object::{AutoObject, ObjRef, ObjectCore, PostDestroyArg, TypedObject};
use crate::port::KClientPort;
use crate::process::KProcess;
use crate::resource_limit::LimitableResource;
use crate::result::{KResult, KernelError};
use crate::sync::{SchedulerGuard, SchedulerLock, SynchronizationObject, WaiterRegistry};
use crate::thread::KThread;
use crate::KernelCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Normal,
    ClientClosed,
    ServerClosed,
}

/// Completion slot a blocked client thread parks on. Completes at most
/// once; later completions are ignored.
pub(crate) struct RequestCompletion {
    result: Mutex<Option<KResult<()>>>,
    cond: Condvar,
}

impl RequestCompletion {
    fn new() -> Arc<Self> {
        Arc::new(RequestCompletion {
            result: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, result: KResult<()>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.cond.notify_all();
        }
    }

    fn wait(&self) -> KResult<()> {
        let mut slot = self.result.lock();
        while slot.is_none() {
            self.cond.wait(&mut slot);
        }
        slot.as_ref().expect("completion awoke empty").clone()
    }
}

/// One in-flight synchronous request.
pub struct SessionRequest {
    thread: ObjRef<KThread>,
    completion: Arc<RequestCompletion>,
}

impl SessionRequest {
    pub fn thread(&self) -> &ObjRef<KThread> {
        &self.thread
    }
}

/// Parent object carrying shared state and the quota charge.
pub struct KSession {
    core: ObjectCore,
    state: Mutex<SessionState>,
    client: Mutex<Option<Arc<KClientSession>>>,
    server: Mutex<Option<Arc<KServerSession>>>,
    port: Mutex<Option<ObjRef<KClientPort>>>,
    owner: ObjRef<KProcess>,
    scheduler: Arc<SchedulerLock>,
}

/// Client half. Not waitable.
pub struct KClientSession {
    core: ObjectCore,
    parent: Mutex<Option<ObjRef<KSession>>>,
}

/// Server half. Waitable; signaled when a request is pending with none
/// in flight, or when the client half has been closed.
pub struct KServerSession {
    core: ObjectCore,
    parent: Mutex<Option<ObjRef<KSession>>>,
    queue: Mutex<VecDeque<SessionRequest>>,
    current: Mutex<Option<SessionRequest>>,
    waiters: WaiterRegistry,
}

impl KSession {
    /// Create a session pair. The caller must have reserved one unit of
    /// session quota from `owner`; ownership of that reservation passes
    /// to the pair and is released when it is destroyed.
    pub fn new(
        kernel: &KernelCore,
        owner: &ObjRef<KProcess>,
        port: Option<ObjRef<KClientPort>>,
        name: Option<&str>,
    ) -> (
        ObjRef<KSession>,
        ObjRef<KClientSession>,
        ObjRef<KServerSession>,
    ) {
        let session = ObjRef::new(KSession {
            core: ObjectCore::new(kernel.counters(), ObjectKind::Session),
            state: Mutex::new(SessionState::Normal),
            client: Mutex::new(None),
            server: Mutex::new(None),
            port: Mutex::new(port),
            owner: owner.clone(),
            scheduler: kernel.scheduler_handle(),
        });
        if let Some(name) = name {
            session.core().set_name(name);
        }

        let client = ObjRef::new(KClientSession {
            core: ObjectCore::new(kernel.counters(), ObjectKind::ClientSession),
            parent: Mutex::new(Some(session.clone())),
        });
        let server = ObjRef::new(KServerSession {
            core: ObjectCore::new(kernel.counters(), ObjectKind::ServerSession),
            parent: Mutex::new(Some(session.clone())),
            queue: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            waiters: WaiterRegistry::default(),
        });

        *session.client.lock() = Some(Arc::clone(client.as_arc()));
        *session.server.lock() = Some(Arc::clone(server.as_arc()));

        (session, client, server)
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn is_client_closed(&self) -> bool {
        self.state() == SessionState::ClientClosed
    }

    fn on_client_closed(&self) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Normal {
                return;
            }
            *state = SessionState::ClientClosed;
        }
        let server = self.server.lock().as_ref().cloned();
        if let Some(server) = server {
            let guard = self.scheduler.lock();
            server.on_client_closed(&guard);
        }
    }

    fn on_server_closed(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Normal {
            *state = SessionState::ServerClosed;
        }
    }

    fn server_arc(&self) -> Option<Arc<KServerSession>> {
        self.server.lock().as_ref().cloned()
    }
}

impl KClientSession {
    /// Send a synchronous request and block the calling thread until the
    /// server replies or the session is torn down.
    pub fn send_sync_request(
        &self,
        kernel: &KernelCore,
        thread: &ObjRef<KThread>,
    ) -> KResult<()> {
        let parent = self
            .parent
            .lock()
            .as_ref()
            .cloned()
            .ok_or(KernelError::SessionClosed)?;

        let completion = {
            let guard = kernel.lock_scheduler();
            if parent.state() != SessionState::Normal {
                return Err(KernelError::SessionClosed);
            }
            let server = parent.server_arc().ok_or(KernelError::SessionClosed)?;
            let completion = RequestCompletion::new();
            server.enqueue_request(
                &guard,
                SessionRequest {
                    thread: thread.clone(),
                    completion: Arc::clone(&completion),
                },
            );
            completion
        };

        completion.wait()
    }
}

impl KServerSession {
    fn enqueue_request(&self, guard: &SchedulerGuard<'_>, request: SessionRequest) {
        let mut queue = self.queue.lock();
        queue.push_back(request);
        if queue.len() == 1 && self.current.lock().is_none() {
            self.notify_available(guard);
        }
    }

    /// Take the oldest pending request, making it current. Returns the
    /// requesting thread, whose command buffer holds the message.
    pub fn receive_request(&self, kernel: &KernelCore) -> KResult<ObjRef<KThread>> {
        let _guard = kernel.lock_scheduler();
        if let Some(parent) = self.parent.lock().as_ref() {
            if parent.is_client_closed() {
                return Err(KernelError::SessionClosed);
            }
        }
        let request = self
            .queue
            .lock()
            .pop_front()
            .ok_or(KernelError::NotFound)?;
        let thread = request.thread.clone();
        let mut current = self.current.lock();
        debug_assert!(current.is_none(), "request received while one is in flight");
        *current = Some(request);
        Ok(thread)
    }

    /// Complete the current request, waking the blocked client thread.
    /// Fails with `SessionClosed` if the client half died mid-request.
    pub fn send_reply(&self, kernel: &KernelCore) -> KResult<()> {
        let guard = kernel.lock_scheduler();
        let request = self
            .current
            .lock()
            .take()
            .ok_or(KernelError::InvalidState)?;

        let client_closed = self
            .parent
            .lock()
            .as_ref()
            .map(|p| p.is_client_closed())
            .unwrap_or(true);

        if client_closed {
            request.completion.complete(Err(KernelError::SessionClosed));
            return Err(KernelError::SessionClosed);
        }

        request.completion.complete(Ok(()));
        if !self.queue.lock().is_empty() {
            self.notify_available(&guard);
        }
        trace!(session = self.core.id(), "request replied");
        Ok(())
    }

    /// Client half is gone: fail everything outstanding and signal so a
    /// waiting server observes `SessionClosed` on its next receive.
    fn on_client_closed(&self, guard: &SchedulerGuard<'_>) {
        for request in self.queue.lock().drain(..) {
            request.completion.complete(Err(KernelError::SessionClosed));
        }
        if let Some(request) = self.current.lock().as_ref() {
            request.completion.complete(Err(KernelError::SessionClosed));
        }
        self.notify_available(guard);
    }
}

impl AutoObject for KSession {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_destroy(&self) {
        self.client.lock().take();
        self.server.lock().take();
        if let Some(port) = self.port.lock().take() {
            port.on_session_finalized();
        }
    }

    fn post_destroy_argument(&self) -> PostDestroyArg {
        PostDestroyArg::ReleaseResource {
            owner: self.owner.clone(),
            resource: LimitableResource::Sessions,
            amount: 1,
        }
    }
}

impl TypedObject for KSession {
    const KIND: ObjectKind = ObjectKind::Session;
}

impl AutoObject for KClientSession {
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

impl TypedObject for KClientSession {
    const KIND: ObjectKind = ObjectKind::ClientSession;
}

impl AutoObject for KServerSession {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_destroy(&self) {
        for request in self.queue.lock().drain(..) {
            request.completion.complete(Err(KernelError::SessionClosed));
        }
        if let Some(request) = self.current.lock().take() {
            request.completion.complete(Err(KernelError::SessionClosed));
        }
        if let Some(parent) = self.parent.lock().take() {
            parent.on_server_closed();
        }
    }
}

impl TypedObject for KServerSession {
    const KIND: ObjectKind = ObjectKind::ServerSession;
}

impl SynchronizationObject for KServerSession {
    fn is_signaled(&self, _guard: &SchedulerGuard<'_>) -> bool {
        if let Some(parent) = self.parent.lock().as_ref() {
            if parent.is_client_closed() {
                return true;
            }
        }
        !self.queue.lock().is_empty() && self.current.lock().is_none()
    }

    fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }
}
