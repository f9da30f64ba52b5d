//! Upstream resolution is a collaborator concern: the proxy listener picks a
//! [`Director`] implementation that matches incoming requests to an upstream
//! authority (service discovery, path-prefix routing, URL rewriting). The
//! caching transport only needs the resolved authority string; it never
//! implements matching or rewriting itself.

/// Resolves an incoming request to the authority (`host[:port]`) of the
/// upstream that should serve it. Returning `None` means no upstream
/// matched and the caller should respond without invoking the transport.
pub trait Director: Send + Sync {
    fn resolve(&self, parts: &http::request::Parts) -> Option<String>;
}
