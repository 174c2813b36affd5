//! Shared firmware core for irrigation field nodes and the edge gateway:
//! radio framing, flood-mesh forwarding, the irrigation state machine and
//! the command/telemetry plumbing between them.

pub mod ack;
pub mod codec;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod irrigation;
pub mod mesh;
pub mod message;
pub mod packet;
pub mod radio;
pub mod recent;
pub mod registry;
pub mod sensor;
pub mod service;
pub mod telemetry;

pub use error::{Error, Result};
