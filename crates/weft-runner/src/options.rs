//! Runner options.

use std::sync::Arc;
use weft_contract::{
    Authorizer, CredentialStoreFactory, MonitorFactory, RuntimeManager,
};

/// Construction options for a [`crate::Runner`]. Unset fields fall back to
/// defaults: a no-op monitor, an accept-all authorizer, and a process-local
/// credential store.
#[derive(Clone, Default)]
pub struct Options {
    pub monitor_factory: Option<Arc<dyn MonitorFactory>>,
    pub runtime_manager: Option<Arc<dyn RuntimeManager>>,
    pub credential_store_factory: Option<Arc<dyn CredentialStoreFactory>>,
    /// First port handed to external-command tools; 0 leaves ports
    /// unmanaged.
    pub start_port: u16,
    /// Last port of the range, inclusive. 0 collapses the range to
    /// `start_port`.
    pub end_port: u16,
    /// CLI credential overrides, `tool:KEY=value[,KEY=value...]` per item.
    pub credential_overrides: Vec<String>,
    /// Run sibling sub-calls one at a time, in call-id order.
    pub sequential: bool,
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

/// Merge a sequence of option sets; later set fields win.
pub fn complete(opts: impl IntoIterator<Item = Options>) -> Options {
    let mut result = Options::default();
    for opt in opts {
        if opt.monitor_factory.is_some() {
            result.monitor_factory = opt.monitor_factory;
        }
        if opt.runtime_manager.is_some() {
            result.runtime_manager = opt.runtime_manager;
        }
        if opt.credential_store_factory.is_some() {
            result.credential_store_factory = opt.credential_store_factory;
        }
        if opt.start_port != 0 {
            result.start_port = opt.start_port;
        }
        if opt.end_port != 0 {
            result.end_port = opt.end_port;
        }
        if !opt.credential_overrides.is_empty() {
            result.credential_overrides = opt.credential_overrides;
        }
        if opt.sequential {
            result.sequential = true;
        }
        if opt.authorizer.is_some() {
            result.authorizer = opt.authorizer;
        }
    }

    if result.end_port == 0 {
        result.end_port = result.start_port;
    }
    if result.start_port == 0 {
        result.start_port = result.end_port;
    }

    result
}
