//! skein-core: shared types for the skein RPC framework.
//!
//! Everything the server, client, and transport crates agree on lives here:
//! - [`Metadata`]: ordered multimap of call metadata (text and binary keys)
//! - [`Status`]: canonical gRPC status codes
//! - [`ServerError`] / [`ClientError`]: the two user-visible error kinds
//! - [`AbortSignal`] / [`AbortController`]: latched, edge-triggered cancellation
//! - [`ServiceDescriptor`] / [`MethodDescriptor`] / [`MethodSpec`]: method schema
//! - [`Codec`]: pluggable per-message serialization

pub mod codec;
pub mod descriptor;
pub mod error;
pub mod metadata;
pub mod signal;
pub mod status;

pub use codec::{BincodeCodec, Codec, CodecError, ProstCodec};
pub use descriptor::{MethodDescriptor, MethodSpec, ServiceDescriptor};
pub use error::{BoxError, ClientError, ServerError};
pub use metadata::{Metadata, MetadataError, MetadataValue};
pub use signal::{AbortCause, AbortController, AbortSignal};
pub use status::Status;
