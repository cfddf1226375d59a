//! Transport Adapter: a uniform `open`/`request`/`notify`/`close`
//! surface over stdio, HTTP, SSE and streamable-HTTP upstream servers.
//!
//! Polymorphism over transport kinds is expressed the way the rest of this
//! workspace expresses it: one object-safe [`Transport`] trait returning
//! `Pin<Box<dyn Future<...> + Send + '_>>` futures, implemented once per
//! kind. Adding a new kind never requires touching anything above this
//! crate.

mod config;
mod error;
mod http;
mod message;
mod ring_buffer;
mod stdio;
mod traits;
mod types;

pub use config::{LimitsConfig, TimeoutConfig};
pub use error::{TransportError, TransportResult};
pub use http::{HttpTransport, HttpTransportConfig};
pub use message::{TransportMessage, TransportMessageMetadata};
pub use ring_buffer::RingBuffer;
pub use stdio::{StdioTransport, StdioTransportConfig};
pub use traits::{Transport, TransportFactory};
pub use types::{ExitClass, ProcessExitSignal, TransportCapabilities, TransportKind, TransportState};
