//! A reverse proxy for the Minecraft Java Edition protocol.
//!
//! A single listener accepts connections and inspects the first two
//! packets (the Handshake, then either a Status Request or a Login Start)
//! to learn which virtual server the client asked for. A pool of
//! connection-processing nodes parses those packets, the gateway routes
//! each connection to a configured backend by domain, and from then on
//! bytes are shuttled in both directions untouched.
//!
//! Pipeline:
//! listener -> processing nodes -> gateway -> backend dial -> pump

pub mod config;
pub mod cpn;
pub mod event;
pub mod gateway;
pub mod pipe;
pub mod protocol;
pub mod proxy;
pub mod proxy_protocol;
pub mod server;

pub use config::{Config, ServerConfig};
pub use event::{Bus, Event, EventData, Reply, Topic};
pub use proxy::Proxy;
