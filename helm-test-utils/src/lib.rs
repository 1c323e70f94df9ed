//! Scripted collaborators and a WebSocket client that exercise the Helm control plane
//! end to end.

pub mod gateway;
pub mod strategy;
pub mod websocket;

pub use gateway::{GatewayCall, GatewayOp, MockGateway};
pub use strategy::MockStrategyDriver;
pub use websocket::WsTestClient;
