//! Device protocol layer for PlugLink.
//!
//! Normalizes three smart-plug generations behind one adapter interface,
//! dispatches commands local-first with cloud fallback, and tracks
//! per-device liveness on two independent clocks (consumption freshness and
//! connectivity).

pub mod commands;
pub mod error;
pub mod gen1;
pub mod gen2;
pub mod gen3;
pub mod protocol;
pub mod router;
pub mod status;
pub mod tracker;

pub use commands::{DeviceCommander, DeviceHandle, HttpGateway, HttpReply, ReqwestGateway};
pub use error::{CommandError, CommandResult, ProtocolError, ProtocolResult};
pub use protocol::{
    adapter_for, CloudCall, CommandRequest, Generation, IndicatorMode, LocalCall, ProtocolAdapter,
};
pub use router::StatusRouter;
pub use status::{DeviceStatus, PowerReadings, RelayState, WifiInfo};
pub use tracker::{NullSink, OfflineTracker, StatusSink};
