pub mod bridge;
pub mod control;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod sim;
pub mod state;
pub mod transport;

pub use bridge::{serve_bridge, BridgeConfig};
pub use control::{
    run_commands, BiasController, Command, CycleController, CycleExit, PollSample, Poller,
    RampEngine, RampOutcome,
};
pub use driver::{bias_setpoint, Keithley, SharedInstrument, DEFAULT_MODEL};
pub use error::{ControlError, DriverError, DriverResult, TransportError};
pub use metrics::{init_metrics, serve_metrics};
pub use protocol::{IncomingMessage, ProtocolVersion, StateMsg};
pub use sim::{SimHandle, SimulatedSource};
pub use state::{BiasSnapshot, ControlEvent, StateExchange};
pub use transport::{open_serial, DeviceLink, LineIo, LineStream, SerialSettings};
