//! Node gateway.
//!
//! Agents hold a persistent WebSocket to the gateway. The gateway tracks
//! which nodes are live, routes their telemetry into the record store, and
//! lets operators send commands to one node or all of them, optionally
//! waiting for the correlated response.

pub mod api;
pub mod auth;
pub mod commands;
pub mod connection;
pub mod events;
pub mod fanout;
pub mod heartbeat;
pub mod metrics;
pub mod persist;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;

pub use commands::{CommandEngine, CommandRequest};
pub use events::{EventBus, GatewayEvent};
pub use fanout::BroadcastSummary;
pub use registry::{ConnectedNode, ConnectionRegistry};
pub use server::{serve, start_gateway};
pub use state::GatewayState;
