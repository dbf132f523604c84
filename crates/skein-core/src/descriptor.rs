//! Service and method schema.
//!
//! A [`ServiceDescriptor`] ties method names to canonical paths and
//! streaming flags. A [`MethodSpec`] additionally binds the codec pair for
//! one method, giving the client a statically typed call handle.

use crate::codec::Codec;
use std::fmt;
use std::sync::Arc;

/// One method's schema: name, canonical path, streaming flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    name: String,
    path: String,
    client_streaming: bool,
    server_streaming: bool,
}

impl MethodDescriptor {
    pub fn new(
        service: &str,
        name: &str,
        client_streaming: bool,
        server_streaming: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            path: format!("/{service}/{name}"),
            client_streaming,
            server_streaming,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical path, `/package.Service/Method`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn client_streaming(&self) -> bool {
        self.client_streaming
    }

    pub fn server_streaming(&self) -> bool {
        self.server_streaming
    }
}

/// A service's schema: fully qualified name plus its methods.
#[derive(Debug, Clone, Default)]
pub struct ServiceDescriptor {
    name: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    /// `name` is the fully qualified service name, `package.Service`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a method. Replaces an existing method of the same name.
    pub fn add_method(&mut self, client_streaming: bool, server_streaming: bool, name: &str) {
        self.methods.retain(|m| m.name() != name);
        self.methods.push(MethodDescriptor::new(
            &self.name,
            name,
            client_streaming,
            server_streaming,
        ));
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name() == name)
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }
}

/// Typed handle for one method: descriptor plus codec pair.
///
/// Built once per service (usually in a `const`-adjacent module alongside
/// the message types) and passed by reference to client calls.
pub struct MethodSpec<Req, Res> {
    descriptor: MethodDescriptor,
    request_codec: Arc<dyn Codec<Req>>,
    response_codec: Arc<dyn Codec<Res>>,
}

impl<Req, Res> Clone for MethodSpec<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            request_codec: Arc::clone(&self.request_codec),
            response_codec: Arc::clone(&self.response_codec),
        }
    }
}

impl<Req, Res> MethodSpec<Req, Res> {
    pub fn unary(
        service: &str,
        name: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Res> + 'static,
    ) -> Self {
        Self::with_flags(service, name, false, false, request_codec, response_codec)
    }

    pub fn server_streaming(
        service: &str,
        name: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Res> + 'static,
    ) -> Self {
        Self::with_flags(service, name, false, true, request_codec, response_codec)
    }

    pub fn client_streaming(
        service: &str,
        name: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Res> + 'static,
    ) -> Self {
        Self::with_flags(service, name, true, false, request_codec, response_codec)
    }

    pub fn duplex_streaming(
        service: &str,
        name: &str,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Res> + 'static,
    ) -> Self {
        Self::with_flags(service, name, true, true, request_codec, response_codec)
    }

    fn with_flags(
        service: &str,
        name: &str,
        client_streaming: bool,
        server_streaming: bool,
        request_codec: impl Codec<Req> + 'static,
        response_codec: impl Codec<Res> + 'static,
    ) -> Self {
        Self {
            descriptor: MethodDescriptor::new(service, name, client_streaming, server_streaming),
            request_codec: Arc::new(request_codec),
            response_codec: Arc::new(response_codec),
        }
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &str {
        self.descriptor.path()
    }

    pub fn request_codec(&self) -> &Arc<dyn Codec<Req>> {
        &self.request_codec
    }

    pub fn response_codec(&self) -> &Arc<dyn Codec<Res>> {
        &self.response_codec
    }
}

impl<Req, Res> fmt::Debug for MethodSpec<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSpec")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_path_canonical_form() {
        let m = MethodDescriptor::new("test.Test", "Unary", false, false);
        assert_eq!(m.path(), "/test.Test/Unary");
    }

    #[test]
    fn test_service_lookup() {
        let mut svc = ServiceDescriptor::new("test.Test");
        svc.add_method(false, true, "Watch");
        let m = svc.method("Watch").unwrap();
        assert!(m.server_streaming());
        assert!(!m.client_streaming());
        assert!(svc.method("Nope").is_none());
    }

    #[test]
    fn test_add_method_replaces_same_name() {
        let mut svc = ServiceDescriptor::new("test.Test");
        svc.add_method(false, false, "Get");
        svc.add_method(true, true, "Get");
        assert_eq!(svc.methods().len(), 1);
        assert!(svc.method("Get").unwrap().client_streaming());
    }
}
