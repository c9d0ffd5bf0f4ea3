//! Tick-synchronized bridge between a host simulation and external optimizers
//!
//! This crate provides:
//! - Transport abstractions (AsyncReader/AsyncWriter traits)
//! - TCP and Unix socket transports addressed as `tcp://` / `ipc://`
//! - The transport channel with reconnect and an outbound dispatcher
//! - Bounded inbound/outbound queues crossing the thread boundary, plus the
//!   lifecycle and close-signal paths beside them
//! - Launching and supervising optimizer processes
//! - The session registry and the per-tick synchronizer
//! - Host-facing traits and the `Bridge` lifecycle

pub mod backoff;
pub mod bridge;
pub mod channel;
pub mod host;
pub mod process;
pub mod queue;
pub mod session;
pub mod sync;
pub mod tcp;
pub mod transport;
#[cfg(unix)]
pub mod unix;

pub use bridge::Bridge;
pub use channel::{ChannelState, TransportChannel};
pub use host::{SimulationState, TickHook};
pub use process::OptimizerProcess;
pub use queue::{
    BridgeQueues, CloseSignals, InboundItem, InboundQueue, OutboundItem, OutboundQueue, SessionBatch,
    SessionEvent, SessionEvents, Target,
};
pub use session::{PeerId, Session, SessionRegistry, SessionState};
pub use sync::{BridgeStats, TickReport, TickSynchronizer, validate_command};
pub use transport::{AsyncReader, AsyncWriter, Endpoint};
