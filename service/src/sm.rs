//! The `sm:` service directory.
//!
//! Services register a port under a short name; clients resolve the name
//! to a fresh session. An in-process registration API covers host-side
//! services, and an IPC handler exposes the guest-facing commands. A
//! lookup for a name that is not registered yet is deferred rather than
//! failed, and registration pokes the server manager's deferral event so
//! parked lookups get retried.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use hle_kernel::{
    KClientPort, KPort, KServerPort, KernelCore, ObjRef, KResult, ResultCode, MODULE_SM,
};

use crate::hle_ipc::{HLERequestContext, HandleResult, SessionRequestHandler};
use crate::ipc_helpers::{RequestParser, ResponseBuilder};
use crate::server_manager::ServerManager;

/// Sessions each registered service port may have open at once.
const SM_MAX_SESSIONS: i32 = 0x40;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SmError {
    #[error("a service is already registered under this name")]
    AlreadyRegistered,
    #[error("the service registry is full")]
    TooManyServices,
    #[error("service names are 1 to 8 printable characters")]
    InvalidServiceName,
    #[error("no service is registered under this name")]
    NotRegistered,
}

impl SmError {
    pub fn to_result_code(self) -> ResultCode {
        let description = match self {
            SmError::AlreadyRegistered => 4,
            SmError::TooManyServices => 5,
            SmError::InvalidServiceName => 6,
            SmError::NotRegistered => 7,
        };
        ResultCode::new(MODULE_SM, description)
    }
}

pub const MAX_SERVICE_NAME_LEN: usize = 8;

fn validate_service_name(name: &str) -> Result<(), SmError> {
    if name.is_empty() || name.len() > MAX_SERVICE_NAME_LEN {
        return Err(SmError::InvalidServiceName);
    }
    if !name.bytes().all(|b| (0x21..0x7f).contains(&b)) {
        return Err(SmError::InvalidServiceName);
    }
    Ok(())
}

/// Decode a fixed 8-byte service name field: the name runs up to the
/// first NUL.
fn name_from_wire(raw: &[u8; MAX_SERVICE_NAME_LEN]) -> Result<String, SmError> {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let name = std::str::from_utf8(&raw[..len]).map_err(|_| SmError::InvalidServiceName)?;
    validate_service_name(name)?;
    Ok(name.to_owned())
}

/// The registry mapping service names to client ports.
pub struct ServiceManager {
    kernel: Arc<KernelCore>,
    registry: Mutex<HashMap<String, ObjRef<KClientPort>>>,
    server_manager: Mutex<Weak<ServerManager>>,
}

impl ServiceManager {
    pub fn new(kernel: Arc<KernelCore>) -> Arc<ServiceManager> {
        Arc::new(ServiceManager {
            kernel,
            registry: Mutex::new(HashMap::new()),
            server_manager: Mutex::new(Weak::new()),
        })
    }

    /// Register `name` and return the server half of its port. Every
    /// registration, in-process or over the wire, pokes the deferral
    /// event so parked lookups get retried.
    pub fn register_service(
        &self,
        name: &str,
        max_sessions: i32,
    ) -> Result<ObjRef<KServerPort>, SmError> {
        validate_service_name(name)?;
        let mut registry = self.registry.lock();
        if registry.contains_key(name) {
            return Err(SmError::AlreadyRegistered);
        }
        let (_port, client_port, server_port) = KPort::new(&self.kernel, max_sessions, Some(name));
        registry.insert(name.to_owned(), client_port);
        drop(registry);
        info!(service = name, max_sessions, "service registered");
        if let Some(server_manager) = self.server_manager.lock().upgrade() {
            server_manager.signal_deferral_event();
        }
        Ok(server_port)
    }

    pub fn unregister_service(&self, name: &str) -> Result<(), SmError> {
        validate_service_name(name)?;
        match self.registry.lock().remove(name) {
            Some(_) => {
                info!(service = name, "service unregistered");
                Ok(())
            }
            None => Err(SmError::NotRegistered),
        }
    }

    /// Look up the client port registered under `name`.
    pub fn get_service_port(&self, name: &str) -> Result<ObjRef<KClientPort>, SmError> {
        validate_service_name(name)?;
        self.registry
            .lock()
            .get(name)
            .cloned()
            .ok_or(SmError::NotRegistered)
    }
}

/// Guest-facing IPC front end for [`ServiceManager`].
pub struct SmHandler {
    service_manager: Arc<ServiceManager>,
}

mod cmd {
    pub const REGISTER_CLIENT: u64 = 0;
    pub const GET_SERVICE_HANDLE: u64 = 1;
    pub const REGISTER_SERVICE: u64 = 2;
    pub const UNREGISTER_SERVICE: u64 = 3;
}

impl SmHandler {
    pub fn new(service_manager: Arc<ServiceManager>) -> SmHandler {
        SmHandler { service_manager }
    }

    fn register_client(&self, ctx: &mut HLERequestContext) {
        let mut rb = ResponseBuilder::new(ctx, 2);
        rb.push_result(ResultCode::SUCCESS);
        rb.finish();
    }

    fn get_service_handle(&self, ctx: &mut HLERequestContext) -> KResult<HandleResult> {
        let mut parser = RequestParser::new(ctx);
        let raw_name: [u8; MAX_SERVICE_NAME_LEN] = parser.pop_raw();

        let name = match name_from_wire(&raw_name) {
            Ok(name) => name,
            Err(err) => {
                let mut rb = ResponseBuilder::new(ctx, 2);
                rb.push_result(err.to_result_code());
                rb.finish();
                return Ok(HandleResult::Reply);
            }
        };

        let port = match self.service_manager.get_service_port(&name) {
            Ok(port) => port,
            Err(SmError::NotRegistered) => {
                // Not up yet; park the request until a registration
                // signals the deferral event.
                debug!(service = %name, "service not registered yet, deferring");
                return Ok(HandleResult::Defer);
            }
            Err(err) => {
                let mut rb = ResponseBuilder::new(ctx, 2);
                rb.push_result(err.to_result_code());
                rb.finish();
                return Ok(HandleResult::Reply);
            }
        };

        let process = ctx.process().clone();
        let client_session = match port.create_session(ctx.kernel(), &process) {
            Ok(session) => session,
            Err(err) => {
                warn!(service = %name, %err, "session creation failed");
                let mut rb = ResponseBuilder::new(ctx, 2);
                rb.push_result(err.to_result_code());
                rb.finish();
                return Ok(HandleResult::Reply);
            }
        };
        debug!(service = %name, "service session opened");

        let mut rb = ResponseBuilder::with_objects(ctx, 2, 0, 1);
        rb.push_result(ResultCode::SUCCESS);
        rb.push_move_session(client_session);
        rb.finish();
        Ok(HandleResult::Reply)
    }

    fn register_service(&self, ctx: &mut HLERequestContext) {
        let mut parser = RequestParser::new(ctx);
        let raw_name: [u8; MAX_SERVICE_NAME_LEN] = parser.pop_raw();
        let max_sessions = parser.pop_u32() as i32;

        let outcome = name_from_wire(&raw_name)
            .and_then(|name| self.service_manager.register_service(&name, max_sessions));

        match outcome {
            Ok(server_port) => {
                let mut rb = ResponseBuilder::with_objects(ctx, 2, 0, 1);
                rb.push_result(ResultCode::SUCCESS);
                rb.push_move_object(server_port.upcast());
                rb.finish();
            }
            Err(err) => {
                warn!(%err, "service registration rejected");
                let mut rb = ResponseBuilder::new(ctx, 2);
                rb.push_result(err.to_result_code());
                rb.finish();
            }
        }
    }

    fn unregister_service(&self, ctx: &mut HLERequestContext) {
        let mut parser = RequestParser::new(ctx);
        let raw_name: [u8; MAX_SERVICE_NAME_LEN] = parser.pop_raw();

        let result = name_from_wire(&raw_name)
            .and_then(|name| self.service_manager.unregister_service(&name))
            .map(|_| ResultCode::SUCCESS)
            .unwrap_or_else(|err| err.to_result_code());

        let mut rb = ResponseBuilder::new(ctx, 2);
        rb.push_result(result);
        rb.finish();
    }
}

impl SessionRequestHandler for SmHandler {
    fn service_name(&self) -> &'static str {
        "sm:"
    }

    fn handle_sync_request(&self, ctx: &mut HLERequestContext) -> KResult<HandleResult> {
        match ctx.command() {
            cmd::REGISTER_CLIENT => self.register_client(ctx),
            cmd::GET_SERVICE_HANDLE => return self.get_service_handle(ctx),
            cmd::REGISTER_SERVICE => self.register_service(ctx),
            cmd::UNREGISTER_SERVICE => self.unregister_service(ctx),
            unknown => {
                warn!(command = unknown, "unknown sm command");
                let mut rb = ResponseBuilder::new(ctx, 2);
                rb.push_result(hle_kernel::KernelError::InvalidState.to_result_code());
                rb.finish();
            }
        }
        Ok(HandleResult::Reply)
    }
}

/// Publish the `sm:` named port on `server_manager`, backed by
/// `service_manager`.
pub fn install(
    service_manager: &Arc<ServiceManager>,
    server_manager: &Arc<ServerManager>,
) -> KResult<()> {
    *service_manager.server_manager.lock() = Arc::downgrade(server_manager);
    let sm = Arc::clone(service_manager);
    server_manager.register_named_service(
        "sm:",
        SM_MAX_SESSIONS,
        Box::new(move || Arc::new(SmHandler::new(Arc::clone(&sm)))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_are_validated() {
        assert_eq!(validate_service_name(""), Err(SmError::InvalidServiceName));
        assert_eq!(
            validate_service_name("overlong service name"),
            Err(SmError::InvalidServiceName)
        );
        assert_eq!(
            validate_service_name("has spc"),
            Err(SmError::InvalidServiceName)
        );
        assert_eq!(validate_service_name("fsp-srv"), Ok(()));
        assert_eq!(validate_service_name("sm:"), Ok(()));
    }

    #[test]
    fn wire_names_stop_at_the_first_nul() {
        let name = name_from_wire(b"time\0\0\0\0").unwrap();
        assert_eq!(name, "time");
        assert!(name_from_wire(&[0u8; 8]).is_err());
    }

    #[test]
    fn registry_round_trip() {
        let kernel = Arc::new(KernelCore::new());
        let sm = ServiceManager::new(kernel);

        let _server = sm.register_service("test", 4).unwrap();
        assert_eq!(
            sm.register_service("test", 4).unwrap_err(),
            SmError::AlreadyRegistered
        );
        assert!(sm.get_service_port("test").is_ok());
        assert_eq!(
            sm.get_service_port("other").unwrap_err(),
            SmError::NotRegistered
        );

        sm.unregister_service("test").unwrap();
        assert_eq!(
            sm.unregister_service("test").unwrap_err(),
            SmError::NotRegistered
        );
    }
}
