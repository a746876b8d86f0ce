//! Accept loop and shared server state.

pub mod listener;
pub mod registry;

pub use registry::Registry;

use std::sync::Arc;

use crate::backend::handler::Handlers;
use crate::config::Limits;
use crate::routing::RouteTable;

/// Read-only state shared by every connection task.
pub struct ServerContext {
    pub routes: Arc<RouteTable>,
    pub registry: Registry,
    pub handlers: Handlers,
    pub limits: Limits,
    pub upload_store: Option<String>,
}
