pub mod app;
pub mod control;
pub mod heartbeat;
pub mod http;
pub mod registry;
pub mod risk;
pub mod runtime;
pub mod state;
pub mod telemetry;
pub mod transport;

pub use app::run as run_app;
pub use runtime::{Collaborators, ControlPlane, ShutdownSignal};
