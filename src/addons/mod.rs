//! Built-in proxy addons.

mod log;

pub use log::LogAddon;

use crate::proxy::addon::Addon;
use crate::proxy::flow::Flow;

/// Adapter that runs a closure on every completed flow.
///
/// A hook point for per-flow extensions that do not warrant a full addon
/// type of their own.
pub struct OnComplete<F>(pub F);

impl<F> Addon for OnComplete<F>
where
    F: Fn(&Flow) + Send + Sync,
{
    fn on_complete(&self, flow: &Flow) {
        (self.0)(flow);
    }
}
