//! flowtap: an interactive, inspecting reverse proxy for local development.
//!
//! A single listening port accepts HTTP requests, routes each to one of
//! several upstream origins by path prefix, forwards the exchange
//! transparently, and captures a bounded record of every request/response
//! pair (a "flow") for inspection, filtering, and replay.
//!
//! # Architecture Overview
//!
//! ```text
//! client ──► Engine.handle ──► Router.match ──► upstream dispatch
//!                 │                                    │
//!                 ├── flow + store.add                 │
//!                 ├── bounded body capture             ▼
//!                 ├── addon hooks            upstream response
//!                 │                                    │
//!                 │◄── capture / hooks / publish ◄─────┘
//!                 ▼
//!           response to client
//!
//!           store ──► subscribers (terminal view, web hub, custom)
//! ```
//!
//! All mutable state lives in [`proxy::Engine`], [`proxy::FlowStore`], and
//! [`proxy::AddonManager`] instances; multiple engines may coexist in one
//! process.

// Traffic-plane core
pub mod proxy;

// Flow query language
pub mod filter;

// Built-in addons
pub mod addons;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;

pub use config::ProxyConfig;
pub use filter::Filter;
pub use lifecycle::Shutdown;
pub use proxy::{Engine, Options};
