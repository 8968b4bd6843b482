//! Traffic-plane core.
//!
//! The engine mediates every HTTP exchange; the router selects an upstream
//! by longest path prefix; the store retains a bounded ring of flows and
//! fans lifecycle events out to subscribers; the addon pipeline runs hooks
//! at fixed lifecycle points.

pub mod addon;
mod body;
pub mod engine;
pub mod flow;
pub mod recorder;
pub mod router;
pub mod store;

pub use addon::{Addon, AddonManager};
pub use engine::{Engine, Options, ReplayError};
pub use flow::{
    CapturedRequest, CapturedResponse, Flow, FlowEvent, FlowEventType, FlowRef, FlowSnapshot,
    FlowState,
};
pub use recorder::ResponseRecorder;
pub use router::{Router, RouterError, Upstream};
pub use store::{FlowStore, Subscription};
