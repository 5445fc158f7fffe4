//! Looper Remote - remote control client for an OSC-driven looping engine
//!
//! The library is the engine communication layer: an OSC transport, the
//! connect-or-spawn handshake, a topic-keyed subscription bus and the
//! session façade that composes them.

pub mod bus;
pub mod config;
pub mod error;
pub mod launcher;
pub mod locator;
pub mod mapping;
pub mod session;
pub mod transport;

pub use bus::{subscriber, Subscriber, SubscriptionBus};
pub use error::EngineError;
pub use launcher::{CommandLauncher, EngineLauncher};
pub use locator::{EngineAddress, EngineLocator, LocatorOptions, LocatorState, PingAck};
pub use mapping::{DecodeError, LoopAction, MidiMappingInfo, MidiType, ValidationError};
pub use session::{
    BatchOutcome, ChangeKind, EngineMirror, EngineSession, EngineUpdate, SessionConfig,
    ShutdownPolicy, Topic,
};
pub use transport::OscTransport;
