//! The service dispatch engine.
//!
//! One manager owns a set of server ports and the sessions accepted from
//! them. Any number of host worker threads may serve it, but only one at
//! a time holds the serve mutex and blocks in the multi-object wait; a
//! signaled port or session is removed from the tracked set before the
//! serve mutex is released, so no two threads ever dispatch the same
//! object concurrently. Two internal events steer the loop: the wakeup
//! event forces re-evaluation after the tracked set changes, and the
//! deferral event retries requests a handler parked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, info_span, warn};

use hle_kernel::{
    wait_synchronization, GuestMemory, KEvent, KReadableEvent, KServerPort, KServerSession,
    KernelCore, KernelError, ObjRef, KResult, ResultCode, SynchronizationObject,
};

use crate::hle_ipc::{
    HLERequestContext, HandleResult, SessionHandlerRef, SessionRequestManager,
};
use crate::ipc::{CommandType, ControlCommand, DomainCommand};
use crate::ipc_helpers::ResponseBuilder;

/// Size reported to clients querying the pointer buffer.
const POINTER_BUFFER_SIZE: u16 = 0x8000;

/// Produces a fresh handler for each session accepted from a port.
pub type HandlerFactory = Box<dyn Fn() -> SessionHandlerRef + Send + Sync>;

struct PortEntry {
    port: ObjRef<KServerPort>,
    factory: HandlerFactory,
}

struct SessionEntry {
    session: ObjRef<KServerSession>,
    manager: Arc<SessionRequestManager>,
}

struct DeferredRequest {
    entry: SessionEntry,
    ctx: HLERequestContext,
}

#[derive(Default)]
struct Tracked {
    ports: HashMap<u64, PortEntry>,
    sessions: HashMap<u64, SessionEntry>,
    deferrals: Vec<DeferredRequest>,
}

#[derive(Clone, Copy)]
enum WaitTag {
    Wakeup,
    Deferral,
    Port(u64),
    Session(u64),
}

enum Disposition {
    Replied,
    Deferred(HLERequestContext),
    Closed,
}

pub struct ServerManager {
    kernel: Arc<KernelCore>,
    memory: Arc<dyn GuestMemory>,
    serve_mutex: Mutex<()>,
    tracked: Mutex<Tracked>,
    wakeup_event: ObjRef<KEvent>,
    wakeup_readable: ObjRef<KReadableEvent>,
    deferral_event: ObjRef<KEvent>,
    deferral_readable: ObjRef<KReadableEvent>,
    stop_requested: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ServerManager {
    pub fn new(kernel: Arc<KernelCore>, memory: Arc<dyn GuestMemory>) -> KResult<Arc<Self>> {
        let (wakeup_event, wakeup_readable, _wakeup_writable) = KEvent::new(&kernel, None)?;
        let (deferral_event, deferral_readable, _deferral_writable) = KEvent::new(&kernel, None)?;
        Ok(Arc::new(ServerManager {
            kernel,
            memory,
            serve_mutex: Mutex::new(()),
            tracked: Mutex::new(Tracked::default()),
            wakeup_event,
            wakeup_readable,
            deferral_event,
            deferral_readable,
            stop_requested: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Create a port, publish its client half under `name`, and serve its
    /// server half with sessions handled by `factory` products.
    pub fn register_named_service(
        &self,
        name: &str,
        max_sessions: i32,
        factory: HandlerFactory,
    ) -> KResult<()> {
        let (_port, client_port, server_port) =
            hle_kernel::KPort::new(&self.kernel, max_sessions, Some(name));
        self.kernel.manage_named_port(name, client_port)?;
        self.register_server(server_port, factory);
        Ok(())
    }

    /// Serve an existing server port.
    pub fn register_server(&self, port: ObjRef<KServerPort>, factory: HandlerFactory) {
        let id = port.object_id();
        self.tracked
            .lock()
            .ports
            .insert(id, PortEntry { port, factory });
        self.wakeup();
    }

    /// Serve an already accepted session.
    pub fn register_session(
        &self,
        session: ObjRef<KServerSession>,
        manager: Arc<SessionRequestManager>,
    ) {
        let id = session.object_id();
        self.tracked
            .lock()
            .sessions
            .insert(id, SessionEntry { session, manager });
        self.wakeup();
    }

    /// Wake the serving thread so deferred requests get retried.
    pub fn signal_deferral_event(&self) {
        self.deferral_event.signal(&self.kernel);
    }

    /// Ask every serving thread to wind down.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wakeup();
    }

    fn wakeup(&self) {
        self.wakeup_event.signal(&self.kernel);
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Serve until [`ServerManager::stop`] is called.
    pub fn run(&self) -> KResult<()> {
        let span = info_span!("server_manager");
        let _enter = span.enter();
        while !self.stopping() {
            self.step()?;
        }
        Ok(())
    }

    /// Spawn an additional named host thread serving this manager.
    pub fn start_additional_thread(self: &Arc<Self>, name: &str) {
        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                if let Err(err) = manager.run() {
                    error!(%err, "server worker exited with error");
                }
            })
            .expect("spawning a server worker");
        self.workers.lock().push(handle);
    }

    /// Stop and join every additional worker thread.
    pub fn stop_and_join(&self) {
        self.stop();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// One wait-and-dispatch step.
    fn step(&self) -> KResult<()> {
        let serve_guard = self.serve_mutex.lock();
        if self.stopping() {
            return Ok(());
        }

        // Snapshot the waitable set with temporary opens; the clones keep
        // every object alive across the wait.
        let mut objects: Vec<ObjRef<dyn SynchronizationObject>> = Vec::new();
        let mut tags: Vec<WaitTag> = Vec::new();
        objects.push(self.wakeup_readable.clone().upcast_sync());
        tags.push(WaitTag::Wakeup);
        objects.push(self.deferral_readable.clone().upcast_sync());
        tags.push(WaitTag::Deferral);
        {
            let tracked = self.tracked.lock();
            for (id, entry) in &tracked.ports {
                objects.push(entry.port.clone().upcast_sync());
                tags.push(WaitTag::Port(*id));
            }
            for (id, entry) in &tracked.sessions {
                objects.push(entry.session.clone().upcast_sync());
                tags.push(WaitTag::Session(*id));
            }
        }

        let refs: Vec<&dyn SynchronizationObject> = objects.iter().map(|o| &**o).collect();
        let index = wait_synchronization(&self.kernel, None, &refs, None)?;

        match tags[index] {
            WaitTag::Wakeup => {
                self.wakeup_readable.clear();
                Ok(())
            }
            WaitTag::Deferral => {
                self.deferral_readable.clear();
                drop(serve_guard);
                self.process_deferrals()
            }
            WaitTag::Port(id) => {
                // Claim the port before releasing the serve mutex so no
                // other thread accepts from it concurrently.
                let entry = self.tracked.lock().ports.remove(&id);
                drop(serve_guard);
                if let Some(entry) = entry {
                    self.process_port(entry);
                }
                Ok(())
            }
            WaitTag::Session(id) => {
                let entry = self.tracked.lock().sessions.remove(&id);
                drop(serve_guard);
                if let Some(entry) = entry {
                    self.process_session(entry)?;
                }
                Ok(())
            }
        }
    }

    fn process_port(&self, entry: PortEntry) {
        if let Some(session) = entry.port.accept_session(&self.kernel) {
            let handler = (entry.factory)();
            debug!(service = handler.service_name(), "session accepted");
            let manager = SessionRequestManager::new(handler);
            self.register_session(session, manager);
        }
        let id = entry.port.object_id();
        self.tracked.lock().ports.insert(id, entry);
        self.wakeup();
    }

    fn process_session(&self, entry: SessionEntry) -> KResult<()> {
        let thread = match entry.session.receive_request(&self.kernel) {
            Ok(thread) => thread,
            Err(KernelError::SessionClosed) => {
                self.close_session(entry);
                return Ok(());
            }
            Err(KernelError::NotFound) => {
                // Raced with another wakeup; nothing pending after all.
                self.reinsert_session(entry);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let ctx = match HLERequestContext::new(
            Arc::clone(&self.kernel),
            Arc::clone(&self.memory),
            entry.session.clone(),
            Arc::clone(&entry.manager),
            thread,
        ) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(
                    session = entry.session.object_id(),
                    %err,
                    "malformed command buffer, closing session"
                );
                self.close_session(entry);
                return Ok(());
            }
        };

        match self.dispatch(&entry, ctx)? {
            Disposition::Replied => {
                self.reinsert_session(entry);
            }
            Disposition::Deferred(ctx) => {
                debug!(session = entry.session.object_id(), "request deferred");
                self.tracked
                    .lock()
                    .deferrals
                    .push(DeferredRequest { entry, ctx });
            }
            Disposition::Closed => {
                self.close_session(entry);
            }
        }
        Ok(())
    }

    fn dispatch(&self, entry: &SessionEntry, mut ctx: HLERequestContext) -> KResult<Disposition> {
        match ctx.command_type() {
            CommandType::Close => Ok(Disposition::Closed),
            command_type if command_type.is_control() => {
                self.handle_control(&mut ctx);
                self.reply(entry, ctx)
            }
            command_type if command_type.is_request() => {
                let outcome = if let Some(header) = ctx.domain_message_header() {
                    match header.command() {
                        DomainCommand::SendMessage => {
                            match entry.manager.domain_handler(header.object_id) {
                                Ok(handler) => handler.handle_sync_request(&mut ctx),
                                Err(err) => {
                                    warn!(object_id = header.object_id, "bad domain object id");
                                    let mut rb = ResponseBuilder::new(&mut ctx, 2);
                                    rb.push_result(err.to_result_code());
                                    rb.finish();
                                    Ok(HandleResult::Reply)
                                }
                            }
                        }
                        DomainCommand::CloseVirtualHandle => {
                            let result = entry
                                .manager
                                .close_domain_handler(header.object_id)
                                .map(|_| ResultCode::SUCCESS)
                                .unwrap_or_else(|err| err.to_result_code());
                            let mut rb = ResponseBuilder::new(&mut ctx, 2);
                            rb.push_result(result);
                            rb.finish();
                            Ok(HandleResult::Reply)
                        }
                        DomainCommand::Unknown(raw) => {
                            warn!(raw, "unknown domain command");
                            let mut rb = ResponseBuilder::new(&mut ctx, 2);
                            rb.push_result(KernelError::InvalidState.to_result_code());
                            rb.finish();
                            Ok(HandleResult::Reply)
                        }
                    }
                } else {
                    let handler = entry
                        .manager
                        .session_handler()
                        .expect("session served without a handler");
                    handler.handle_sync_request(&mut ctx)
                };

                match outcome {
                    Ok(HandleResult::Reply) => self.reply(entry, ctx),
                    Ok(HandleResult::Defer) => Ok(Disposition::Deferred(ctx)),
                    Err(KernelError::SessionClosed) => Ok(Disposition::Closed),
                    Err(err) => panic!("service handler failed: {err}"),
                }
            }
            _ => {
                warn!("request with invalid command type");
                let mut rb = ResponseBuilder::new(&mut ctx, 2);
                rb.push_result(KernelError::InvalidState.to_result_code());
                rb.finish();
                self.reply(entry, ctx)
            }
        }
    }

    fn handle_control(&self, ctx: &mut HLERequestContext) {
        match ControlCommand::from_raw(ctx.command() as u32) {
            ControlCommand::ConvertSessionToDomain => {
                let object_id = ctx.manager().convert_to_domain();
                let mut rb = ResponseBuilder::new(ctx, 3);
                rb.push_result(ResultCode::SUCCESS);
                rb.push_u32(object_id);
                rb.finish();
            }
            ControlCommand::QueryPointerBufferSize => {
                let mut rb = ResponseBuilder::new(ctx, 3);
                rb.push_result(ResultCode::SUCCESS);
                rb.push_u16(POINTER_BUFFER_SIZE);
                rb.finish();
            }
            ControlCommand::Unknown(raw) => {
                warn!(raw, "unknown control command");
                let mut rb = ResponseBuilder::new(ctx, 2);
                rb.push_result(KernelError::InvalidState.to_result_code());
                rb.finish();
            }
        }
    }

    fn reply(&self, entry: &SessionEntry, mut ctx: HLERequestContext) -> KResult<Disposition> {
        ctx.write_outgoing()?;
        match entry.session.send_reply(&self.kernel) {
            Ok(()) => Ok(Disposition::Replied),
            Err(KernelError::SessionClosed) => Ok(Disposition::Closed),
            Err(err) => Err(err),
        }
    }

    fn reinsert_session(&self, entry: SessionEntry) {
        let id = entry.session.object_id();
        self.tracked.lock().sessions.insert(id, entry);
        self.wakeup();
    }

    fn close_session(&self, entry: SessionEntry) {
        if let Some(handler) = entry.manager.session_handler() {
            handler.client_disconnected(&entry.session);
        }
        debug!(session = entry.session.object_id(), "session closed");
        // Dropping the references tears the server half down.
    }

    /// Retry every parked request once; whatever defers again is parked
    /// again.
    fn process_deferrals(&self) -> KResult<()> {
        let deferred = std::mem::take(&mut self.tracked.lock().deferrals);
        if deferred.is_empty() {
            return Ok(());
        }
        debug!(count = deferred.len(), "retrying deferred requests");

        let mut still_deferred = Vec::new();
        for DeferredRequest { entry, mut ctx } in deferred {
            let handler = entry
                .manager
                .session_handler()
                .expect("deferred request without a handler");
            match handler.handle_sync_request(&mut ctx) {
                Ok(HandleResult::Reply) => match self.reply(&entry, ctx)? {
                    Disposition::Replied => self.reinsert_session(entry),
                    Disposition::Closed => self.close_session(entry),
                    Disposition::Deferred(_) => unreachable!("reply cannot defer"),
                },
                Ok(HandleResult::Defer) => {
                    still_deferred.push(DeferredRequest { entry, ctx });
                }
                Err(KernelError::SessionClosed) => self.close_session(entry),
                Err(err) => panic!("service handler failed: {err}"),
            }
        }
        self.tracked.lock().deferrals.extend(still_deferred);
        Ok(())
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        self.stop();
    }
}
