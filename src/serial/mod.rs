//! Half-duplex serial protocol engine.

pub mod engine;

pub use engine::{
    spawn, EngineRequest, RequestKind, ResponseKind, RetryPolicy, SerialEngineHandle, SerialError, SerialStats,
    SerialStatsSnapshot,
};
