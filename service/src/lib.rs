//! High-level-emulated service layer on top of [`hle_kernel`].
//!
//! [`ipc`] holds the bit-exact command buffer wire structures, [`hle_ipc`]
//! parses and writes command buffers around a [`hle_ipc::HLERequestContext`],
//! [`ipc_helpers`] gives handlers a word-oriented parser and response
//! builder, [`server_manager`] runs the wait-and-dispatch loop over ports
//! and sessions, and [`sm`] is the service directory clients resolve names
//! through.

pub mod hle_ipc;
pub mod ipc;
pub mod ipc_helpers;
pub mod server_manager;
pub mod sm;

pub use hle_ipc::{
    HLERequestContext, HandleResult, SessionHandlerRef, SessionRequestHandler,
    SessionRequestManager,
};
pub use ipc_helpers::{RequestParser, ResponseBuilder};
pub use server_manager::{HandlerFactory, ServerManager};
pub use sm::{ServiceManager, SmError};
