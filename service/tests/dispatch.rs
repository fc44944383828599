//! Full service round trips through the dispatch loop: name resolution
//! via `sm:`, request/reply traffic, deferral retries, domain
//! conversion, and teardown.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use hle_kernel::{
    GuestMemory, KClientSession, KServerPort, KServerSession, KernelError, ObjRef, ResultCode,
};
use hle_service::sm;
use hle_service::{
    HLERequestContext, HandleResult, RequestParser, ResponseBuilder, ServerManager,
    ServiceManager, SessionRequestHandler,
};

use common::{sync_request, ClientRequest, ClientResponse, TestEnv};

struct EchoHandler {
    disconnects: Arc<AtomicUsize>,
}

mod echo_cmd {
    pub const ADD: u64 = 0;
}

impl SessionRequestHandler for EchoHandler {
    fn service_name(&self) -> &'static str {
        "echo"
    }

    fn handle_sync_request(
        &self,
        ctx: &mut HLERequestContext,
    ) -> hle_kernel::KResult<HandleResult> {
        match ctx.command() {
            echo_cmd::ADD => {
                let mut parser = RequestParser::new(ctx);
                let lhs = parser.pop_u32();
                let rhs = parser.pop_u32();
                let mut rb = ResponseBuilder::new(ctx, 3);
                rb.push_result(ResultCode::SUCCESS);
                rb.push_u32(lhs.wrapping_add(rhs));
                rb.finish();
            }
            _ => {
                let mut rb = ResponseBuilder::new(ctx, 2);
                rb.push_result(KernelError::InvalidState.to_result_code());
                rb.finish();
            }
        }
        Ok(HandleResult::Reply)
    }

    fn client_disconnected(&self, _session: &ObjRef<KServerSession>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    env: TestEnv,
    server_manager: Arc<ServerManager>,
    service_manager: Arc<ServiceManager>,
}

impl Fixture {
    fn new() -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let env = TestEnv::new();
        let server_manager = ServerManager::new(
            Arc::clone(&env.kernel),
            Arc::clone(&env.memory) as Arc<dyn GuestMemory>,
        )
        .unwrap();
        let service_manager = ServiceManager::new(Arc::clone(&env.kernel));
        sm::install(&service_manager, &server_manager).unwrap();
        server_manager.start_additional_thread("ipc:server");
        Fixture {
            env,
            server_manager,
            service_manager,
        }
    }

    fn register_echo(&self, disconnects: &Arc<AtomicUsize>) {
        let port = self.service_manager.register_service("echo", 8).unwrap();
        let disconnects = Arc::clone(disconnects);
        self.server_manager.register_server(
            port,
            Box::new(move || {
                Arc::new(EchoHandler {
                    disconnects: Arc::clone(&disconnects),
                })
            }),
        );
    }
}

/// Handler whose command 0 blocks until the gate is opened; replies carry
/// the order in which requests entered the handler.
struct GateHandler {
    entered: AtomicUsize,
    open: Mutex<bool>,
    cond: Condvar,
}

impl GateHandler {
    fn new() -> Arc<GateHandler> {
        Arc::new(GateHandler {
            entered: AtomicUsize::new(0),
            open: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn open_gate(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }
}

impl SessionRequestHandler for GateHandler {
    fn service_name(&self) -> &'static str {
        "gate"
    }

    fn handle_sync_request(
        &self,
        ctx: &mut HLERequestContext,
    ) -> hle_kernel::KResult<HandleResult> {
        let order = self.entered.fetch_add(1, Ordering::SeqCst);
        if ctx.command() == 0 {
            let mut open = self.open.lock();
            while !*open {
                self.cond.wait(&mut open);
            }
        }
        let mut rb = ResponseBuilder::new(ctx, 3);
        rb.push_result(ResultCode::SUCCESS);
        rb.push_u32(order as u32);
        rb.finish();
        Ok(HandleResult::Reply)
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn services_are_resolved_and_served_end_to_end() {
    let fixture = Fixture::new();
    let disconnects = Arc::new(AtomicUsize::new(0));
    fixture.register_echo(&disconnects);
    let env = &fixture.env;

    let sm_session = env
        .kernel
        .connect_to_named_port(&env.process, "sm:")
        .unwrap();
    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &sm_session,
        &env.thread,
        ClientRequest::request(1).arg_raw(b"echo\0\0\0\0").build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    let handle = response.move_handles()[0];
    let echo_session = env
        .process
        .handle_table()
        .get_typed::<KClientSession>(handle)
        .unwrap();

    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &echo_session,
        &env.thread,
        ClientRequest::request(echo_cmd::ADD)
            .arg_u32(40)
            .arg_u32(2)
            .build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    assert_eq!(response.pop_u32(), 42);

    // A close request tears the session down instead of replying.
    let closed = sync_request(
        &env.memory,
        &env.kernel,
        &echo_session,
        &env.thread,
        ClientRequest::close(),
    );
    assert!(matches!(closed, Err(KernelError::SessionClosed)));
    wait_until("the disconnect notification", || {
        disconnects.load(Ordering::SeqCst) == 1
    });

    fixture.server_manager.stop_and_join();
}

#[test]
fn lookups_for_unregistered_services_defer_until_registration() {
    let fixture = Fixture::new();
    let env = &fixture.env;

    let kernel = Arc::clone(&env.kernel);
    let memory = Arc::clone(&env.memory);
    let process = env.process.clone();
    let waiter_thread = env.spawn_thread("waiter", 0x2000);
    let waiter = thread::spawn(move || {
        let sm_session = kernel.connect_to_named_port(&process, "sm:")?;
        sync_request(
            &memory,
            &kernel,
            &sm_session,
            &waiter_thread,
            ClientRequest::request(1).arg_raw(b"late\0\0\0\0").build(),
        )
    });

    // Give the lookup time to land in the deferred list.
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    // Register the service over the wire; the reply moves back the
    // server port and the registration retries the parked lookup.
    let sm_session = env
        .kernel
        .connect_to_named_port(&env.process, "sm:")
        .unwrap();
    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &sm_session,
        &env.thread,
        ClientRequest::request(2)
            .arg_raw(b"late\0\0\0\0")
            .arg_u32(8)
            .build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    let port_handle = response.move_handles()[0];
    let server_port = env
        .process
        .handle_table()
        .get_typed::<KServerPort>(port_handle)
        .unwrap();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let handler_disconnects = Arc::clone(&disconnects);
    fixture.server_manager.register_server(
        server_port,
        Box::new(move || {
            Arc::new(EchoHandler {
                disconnects: Arc::clone(&handler_disconnects),
            })
        }),
    );

    let reply = waiter.join().unwrap().unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    let handle = response.move_handles()[0];
    assert!(env
        .process
        .handle_table()
        .get_typed::<KClientSession>(handle)
        .is_ok());

    fixture.server_manager.stop_and_join();
}

#[test]
fn in_process_registration_retries_parked_lookups() {
    let fixture = Fixture::new();
    let env = &fixture.env;

    let kernel = Arc::clone(&env.kernel);
    let memory = Arc::clone(&env.memory);
    let process = env.process.clone();
    let waiter_thread = env.spawn_thread("waiter", 0x2000);
    let waiter = thread::spawn(move || {
        let sm_session = kernel.connect_to_named_port(&process, "sm:")?;
        sync_request(
            &memory,
            &kernel,
            &sm_session,
            &waiter_thread,
            ClientRequest::request(1).arg_raw(b"tardy\0\0\0").build(),
        )
    });

    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    // Register through the in-process API; no wire traffic is involved,
    // so the registration itself must wake the parked lookup.
    let disconnects = Arc::new(AtomicUsize::new(0));
    let port = fixture.service_manager.register_service("tardy", 8).unwrap();
    let handler_disconnects = Arc::clone(&disconnects);
    fixture.server_manager.register_server(
        port,
        Box::new(move || {
            Arc::new(EchoHandler {
                disconnects: Arc::clone(&handler_disconnects),
            })
        }),
    );

    let reply = waiter.join().unwrap().unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    assert!(env
        .process
        .handle_table()
        .get_typed::<KClientSession>(response.move_handles()[0])
        .is_ok());

    fixture.server_manager.stop_and_join();
}

#[test]
fn garbage_handles_in_requests_do_not_wedge_the_service() {
    let fixture = Fixture::new();
    let disconnects = Arc::new(AtomicUsize::new(0));
    fixture.register_echo(&disconnects);
    let env = &fixture.env;

    let sm_session = env
        .kernel
        .connect_to_named_port(&env.process, "sm:")
        .unwrap();
    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &sm_session,
        &env.thread,
        ClientRequest::request(1).arg_raw(b"echo\0\0\0\0").build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    let echo_session = env
        .process
        .handle_table()
        .get_typed::<KClientSession>(response.move_handles()[0])
        .unwrap();

    // Handles the sender never owned ride along with a valid request.
    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &echo_session,
        &env.thread,
        ClientRequest::request(echo_cmd::ADD)
            .copy_handle(0xdead_beef)
            .move_handle(0xfeed_f00d)
            .arg_u32(2)
            .arg_u32(3)
            .build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    assert_eq!(response.pop_u32(), 5);

    // The dispatcher survived and keeps serving well-formed traffic.
    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &echo_session,
        &env.thread,
        ClientRequest::request(echo_cmd::ADD)
            .arg_u32(40)
            .arg_u32(2)
            .build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    assert_eq!(response.pop_u32(), 42);

    fixture.server_manager.stop_and_join();
}

#[test]
fn requests_on_one_session_are_served_one_at_a_time() {
    let fixture = Fixture::new();
    // A second worker so a blocked handler cannot mask double dispatch.
    fixture.server_manager.start_additional_thread("ipc:server-2");
    let env = &fixture.env;

    let handler = GateHandler::new();
    let factory_handler = Arc::clone(&handler);
    fixture
        .server_manager
        .register_named_service(
            "gate",
            8,
            Box::new(move || {
                Arc::clone(&factory_handler) as hle_service::SessionHandlerRef
            }),
        )
        .unwrap();

    let session = env
        .kernel
        .connect_to_named_port(&env.process, "gate")
        .unwrap();

    let first_thread = env.spawn_thread("client-1", 0x3000);
    let first_session = session.clone();
    let kernel = Arc::clone(&env.kernel);
    let memory = Arc::clone(&env.memory);
    let first = thread::spawn(move || {
        sync_request(
            &memory,
            &kernel,
            &first_session,
            &first_thread,
            ClientRequest::request(0).build(),
        )
    });
    wait_until("the first request to enter the handler", || {
        handler.entered.load(Ordering::SeqCst) == 1
    });

    let second_thread = env.spawn_thread("client-2", 0x4000);
    let second_session = session.clone();
    let kernel = Arc::clone(&env.kernel);
    let memory = Arc::clone(&env.memory);
    let second = thread::spawn(move || {
        sync_request(
            &memory,
            &kernel,
            &second_session,
            &second_thread,
            ClientRequest::request(1).build(),
        )
    });

    // The second request must not reach the handler while the first is
    // still in flight, even with a spare worker available.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(handler.entered.load(Ordering::SeqCst), 1);

    handler.open_gate();
    let mut first_reply = ClientResponse::parse(first.join().unwrap().unwrap());
    assert!(first_reply.pop_result().is_success());
    assert_eq!(first_reply.pop_u32(), 0);
    let mut second_reply = ClientResponse::parse(second.join().unwrap().unwrap());
    assert!(second_reply.pop_result().is_success());
    assert_eq!(second_reply.pop_u32(), 1);

    fixture.server_manager.stop_and_join();
}

#[test]
fn sessions_convert_to_domains_over_the_wire() {
    let fixture = Fixture::new();
    let disconnects = Arc::new(AtomicUsize::new(0));
    fixture.register_echo(&disconnects);
    let env = &fixture.env;

    let sm_session = env
        .kernel
        .connect_to_named_port(&env.process, "sm:")
        .unwrap();
    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &sm_session,
        &env.thread,
        ClientRequest::request(1).arg_raw(b"echo\0\0\0\0").build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    let echo_session = env
        .process
        .handle_table()
        .get_typed::<KClientSession>(response.move_handles()[0])
        .unwrap();

    // Control: pointer buffer size query.
    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &echo_session,
        &env.thread,
        ClientRequest::control(3).build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    assert_eq!(response.pop_u32(), 0x8000);

    // Control: convert to domain; the session handler becomes object 1.
    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &echo_session,
        &env.thread,
        ClientRequest::control(0).build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse(reply);
    assert!(response.pop_result().is_success());
    assert_eq!(response.pop_u32(), 1);

    // Commands now go through the domain message header.
    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &echo_session,
        &env.thread,
        ClientRequest::request(echo_cmd::ADD)
            .domain(1, 1)
            .arg_u32(1)
            .arg_u32(2)
            .build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse_domain(reply);
    assert!(response.pop_result().is_success());
    assert_eq!(response.pop_u32(), 3);

    // Closing the virtual handle makes the object id invalid.
    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &echo_session,
        &env.thread,
        ClientRequest::request(0).domain(2, 1).build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse_domain(reply);
    assert!(response.pop_result().is_success());

    let reply = sync_request(
        &env.memory,
        &env.kernel,
        &echo_session,
        &env.thread,
        ClientRequest::request(echo_cmd::ADD)
            .domain(1, 1)
            .arg_u32(1)
            .arg_u32(2)
            .build(),
    )
    .unwrap();
    let mut response = ClientResponse::parse_domain(reply);
    assert!(response.pop_result().is_error());

    fixture.server_manager.stop_and_join();
}
