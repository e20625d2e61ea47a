//! Client library for the controlbus middleware.
//!
//! The layers, bottom up:
//!
//! - [`broker`] and [`registry`]: transport seams. Everything above talks
//!   to `dyn Broker` and `dyn SchemaRegistry`; in-memory implementations
//!   back the tests.
//! - `consumer` and [`throttle`]: the isolated read side. One task polls
//!   the broker, decodes and classifies records, applies adaptive
//!   per-topic throttling to telemetry, and feeds a bounded queue.
//! - [`session`]: one per component instance. Owns topic registrations,
//!   the read loop that fans samples out to readers, the command sequence
//!   generator and ack correlation, and shutdown.
//! - [`topics`]: typed readers, writers, and both ends of the
//!   command/acknowledgement protocol.
//! - [`controller`], [`remote`], [`csc`]: the user-facing endpoints — the
//!   server side, the client side, and the lifecycle state machine.

pub mod broker;
pub mod config;
pub(crate) mod consumer;
pub mod controller;
pub mod csc;
pub mod error;
pub mod registry;
pub mod remote;
pub mod session;
pub mod throttle;
pub mod topics;

pub use broker::{Broker, BrokerSubscription, MemoryBroker, RawRecord};
pub use config::{MiddlewareConfig, MiddlewareConfigBuilder};
pub use controller::Controller;
pub use csc::{Csc, CscBuilder, LifecycleHooks, NoHooks};
pub use error::{Error, Result};
pub use registry::{MemoryRegistry, SchemaRegistry};
pub use remote::Remote;
pub use session::Session;
pub use throttle::{ThrottleMetrics, ThrottleSettings};
pub use topics::{CommandExecutor, CommandHandler, ReadTopic, RemoteCommand, TypedSample, WriteTopic};

// Core wire types are part of the public API.
pub use controlbus_core as core;
pub use controlbus_core::{Ack, AckCode, SummaryState, TopicKey, TopicKind};
