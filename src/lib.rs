//! waggle: host telemetry agent.
//!
//! Exposes machine and application metrics to a remote collection
//! service. Each external request fans out over three sources (a
//! directory of executable plugins, in-process builtin collectors, and a
//! locally accumulated statsd set) and returns the merged document.
//! Delivery is pull (inbound HTTP(S) listeners) and push-through-pull
//! (an outbound reverse tunnel a broker sends requests into, see the
//! `waggle-reverse` crate).
//!
//! ## Modules
//!
//! * `config` - TOML configuration with validation and defaults.
//! * `core` - collector contract, plugin runner, builtins, statsd
//!   listener, and the agent orchestrator.
//! * `server` - the inbound HTTP(S) adapter and tunnel dispatcher.
//! * `metrics` - metric model and wire envelope.
//! * `stats` - process-wide operational stats store.
//! * `logger` - tracing subscriber setup.

pub mod config;
pub mod core;
pub mod logger;
pub mod metrics;
pub mod server;
pub mod stats;
