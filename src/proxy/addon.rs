//! Addon hook dispatch.
//!
//! Addons observe and mutate flows at four fixed points in the lifecycle.
//! The hook set is closed; an addon implements whichever of the default
//! no-op methods it needs. Hooks run synchronously on the request task and
//! in registration order, so a slow hook blocks forwarding.

use std::sync::{Arc, RwLock};

use crate::proxy::flow::Flow;

/// Lifecycle hooks for a flow. All methods default to no-ops.
pub trait Addon: Send + Sync {
    /// Fired after the request body is captured, before the upstream call.
    fn on_request(&self, flow: &Flow) {
        let _ = flow;
    }

    /// Fired after the response body is captured, before the client send.
    fn on_response(&self, flow: &Flow) {
        let _ = flow;
    }

    /// Fired immediately after `on_response` on the success path.
    fn on_complete(&self, flow: &Flow) {
        let _ = flow;
    }

    /// Fired once, instead of response/complete, on upstream failure.
    fn on_error(&self, flow: &Flow, error: &str) {
        let _ = (flow, error);
    }
}

/// Dispatches flow lifecycle events to registered addons in order.
pub struct AddonManager {
    addons: RwLock<Vec<Arc<dyn Addon>>>,
}

impl AddonManager {
    pub fn new() -> AddonManager {
        AddonManager {
            addons: RwLock::new(Vec::new()),
        }
    }

    /// Register an addon. Registration order is dispatch order.
    pub fn add(&self, addon: impl Addon + 'static) {
        self.addons.write().unwrap().push(Arc::new(addon));
    }

    pub fn fire_request(&self, flow: &Flow) {
        for addon in self.snapshot() {
            addon.on_request(flow);
        }
    }

    pub fn fire_response(&self, flow: &Flow) {
        for addon in self.snapshot() {
            addon.on_response(flow);
        }
    }

    pub fn fire_complete(&self, flow: &Flow) {
        for addon in self.snapshot() {
            addon.on_complete(flow);
        }
    }

    pub fn fire_error(&self, flow: &Flow, error: &str) {
        for addon in self.snapshot() {
            addon.on_error(flow, error);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Addon>> {
        self.addons.read().unwrap().clone()
    }
}

impl Default for AddonManager {
    fn default() -> Self {
        AddonManager::new()
    }
}
