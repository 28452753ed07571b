//! The CSE server: request routing, handlers and the listener that feeds
//! them.
//!
//! vCD forwards tenant calls under `/api/cse` as JSON envelopes, over its
//! MQTT bus or the HTTP listener; each one is routed to an
//! [`router::Operation`] and answered with a response envelope, errors
//! included.

pub mod clusters;
pub mod errors;
pub mod handlers;
pub mod http;
pub mod mqtt;
pub mod router;

pub use errors::RequestError;
pub use errors::RequestResult;
pub use handlers::dispatch;
pub use handlers::ServerState;
pub use http::RequestListener;
pub use mqtt::BusListener;
pub use router::Operation;
