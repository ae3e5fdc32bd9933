//! flowprobe library
//!
//! Drives a remote Chrome through an OpenID Connect redirect chain and checks the
//! observed network timeline and cookie jar against a scenario.

pub mod config;
pub mod cookies;
pub mod correlator;
pub mod errors;
pub mod expect;
pub mod flow;
pub mod metrics;
pub mod relay;
pub mod scenario;

pub use errors::FlowError;
pub use expect::{match_timeline, ExpectedEvent, MatchReport, Mismatch};
pub use flow::{FlowConfig, FlowOutcome, FlowReport, FlowRunner, FlowStage};
pub use scenario::Scenario;
