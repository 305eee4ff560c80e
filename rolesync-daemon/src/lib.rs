//! Rolesync daemon: platform event loop, reconciliation, and control socket.

mod error;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_event, request_intents, request_rebuild, request_roles, request_status, request_stop,
    request_sync, request_sync_all, send_request, send_request_with_progress, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, start_blocking, EventStats};
