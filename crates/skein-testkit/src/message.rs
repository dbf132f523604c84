//! The test service schema: messages plus one method per call kind.

use serde::{Deserialize, Serialize};
use skein_core::{BincodeCodec, MethodSpec};

/// Fully qualified test service name.
pub const SERVICE_NAME: &str = "skein.test.Test";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRequest {
    pub id: String,
}

impl TestRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResponse {
    pub id: String,
}

impl TestResponse {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Method specs shared by the server registrations and the client calls.
pub mod methods {
    use super::*;

    pub fn unary() -> MethodSpec<TestRequest, TestResponse> {
        MethodSpec::unary(
            SERVICE_NAME,
            "Unary",
            BincodeCodec::new(),
            BincodeCodec::new(),
        )
    }

    pub fn server_stream() -> MethodSpec<TestRequest, TestResponse> {
        MethodSpec::server_streaming(
            SERVICE_NAME,
            "ServerStream",
            BincodeCodec::new(),
            BincodeCodec::new(),
        )
    }

    pub fn client_stream() -> MethodSpec<TestRequest, TestResponse> {
        MethodSpec::client_streaming(
            SERVICE_NAME,
            "ClientStream",
            BincodeCodec::new(),
            BincodeCodec::new(),
        )
    }

    pub fn duplex_stream() -> MethodSpec<TestRequest, TestResponse> {
        MethodSpec::duplex_streaming(
            SERVICE_NAME,
            "DuplexStream",
            BincodeCodec::new(),
            BincodeCodec::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::Codec;

    #[test]
    fn test_message_roundtrip() {
        let codec = BincodeCodec::<TestRequest>::new();
        let req = TestRequest::new("test-0");
        let decoded = codec.decode(codec.encode(&req).unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_method_paths() {
        assert_eq!(methods::unary().path(), "/skein.test.Test/Unary");
        assert_eq!(
            methods::duplex_stream().path(),
            "/skein.test.Test/DuplexStream"
        );
        assert!(methods::client_stream().descriptor().client_streaming());
        assert!(!methods::client_stream().descriptor().server_streaming());
    }
}
