//! skein-client: the client side of the skein RPC framework.
//!
//! Bridges user-provided request values or streams and consumer-facing
//! response values or streams with the underlying transport call:
//!
//! ```ignore
//! let (connector, listener) = skein_transport::mem::pair("echo");
//! // ... serve a Server on `listener` ...
//! let channel = Channel::new(connector);
//! let client = Client::new(channel.clone());
//! let res = client.unary(&methods::ECHO, request, CallOptions::new()).await?;
//! channel.close();
//! ```

pub mod call;
pub mod channel;
pub mod client;
pub mod error;
pub mod options;

pub use call::Responses;
pub use channel::Channel;
pub use client::Client;
pub use error::CallError;
pub use options::{CallDefaults, CallOptions};
