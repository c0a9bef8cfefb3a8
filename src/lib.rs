//! Library crate for a socket-activation unit controller: validates a
//! socket unit's configuration, owns its port table, and drives its
//! 12-state FSM across start/stop requests, descriptor readiness, control
//! process exits, and phase timeouts. `sockunitd` (`main.rs`) is the thin
//! executable wrapper around this crate's [`controller::SocketUnit`].

pub mod address;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod environment;
pub mod error;
pub mod events;
pub mod instance;
pub mod manager;
pub mod options;
pub mod port;
pub mod serialize;
pub mod signals;
pub mod spawn;
pub mod state;

pub use config::{ExecCommand, ListenDirective, Phase, SocketUnitConfig};
pub use controller::{RequestOutcome, SocketUnit};
pub use environment::Environment;
pub use error::{SocketError, SocketResult};
pub use events::{ControllerEvent, ExitStatus, UnitManager, WatchHandle};
pub use manager::TokioManager;
pub use state::SocketState;
