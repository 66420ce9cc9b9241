//! tradegate: a crash-safe decide → gate → execute trading core.
//!
//! The [`engine::Engine`] drives a finite-state machine over injected
//! collaborators: a [`broker::Broker`] for market data and execution, a
//! [`strategy::Strategy`] for proposals, a [`store::Store`] for snapshots and
//! the append-only event log, and a [`feedback::Feedback`] diagnostician.
//! Every capital-touching call is preceded by a preflight re-check and every
//! cycle in a live mode starts with a reconciliation against the broker.

pub mod action;
pub mod broker;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod logging;
pub mod risk;
pub mod state_machine;
pub mod status_server;
pub mod store;
pub mod strategy;
pub mod world;
