//! tandem orchestration engine
//!
//! Coordinates UI test execution across several devices that act in concert.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Orchestrator                                                │
//! │    ├── initialize_sessions(configs)   (connect + retry)     │
//! │    ├── execute(script) -> CollaborativeExecutionResult      │
//! │    │     ├── device   { device, steps }   sequential        │
//! │    │     ├── parallel { blocks }          fan-out/fan-in    │
//! │    │     └── sync     { id, timeout_ms }  quiescence wait   │
//! │    └── pause / resume / stop, shared data                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DeviceSession (trait)                                      │
//! │    └── BrowserSession -> node + Playwright driver           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ResultAggregator                                           │
//! │    └── stats, device comparison, failure patterns, timeline │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregator;
pub mod orchestrator;
pub mod retry;
pub mod session;

pub use aggregator::{AggregatedResult, ResultAggregator};
pub use orchestrator::{NoopEvents, Orchestrator, OrchestratorBuilder, OrchestratorConfig, OrchestratorEvents, SharedData};
pub use retry::{with_retry, RetryConfig};
pub use session::{
    BrowserDriverConfig, BrowserEngine, BrowserSession, DefaultSessionFactory, DeviceSession, SessionCore,
    SessionFactory,
};
