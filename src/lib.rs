//! isomer runs a local Bitcoin regtest stack: the chain daemon plus the
//! indexers and gateway that depend on it. It installs verified binaries,
//! generates their configuration, starts them in dependency order, watches
//! their health and output, and exposes the whole stack through a single
//! [`engine::Engine`] facade, a control socket and a CLI.

/// Binary acquisition and verification.
pub mod binaries;

/// CLI interface.
pub mod cli;

/// Settings management.
pub mod config;

/// Orchestration facade.
pub mod engine;

/// Error handling.
pub mod error;

/// Engine notifications.
pub mod events;

/// Per-service launch configuration.
pub mod generator;

/// Readiness probing.
pub mod health;

/// IPC helpers for communicating with a running engine.
pub mod ipc;

/// Log aggregation.
pub mod logs;

/// Service registry.
pub mod manifest;

/// Chain daemon JSON-RPC client.
pub mod rpc;

/// On-disk layout of the data root.
pub mod runtime;

/// Control socket server.
pub mod server;

/// Service state machine.
pub mod state;

/// Process supervision.
pub mod supervisor;
