//! Coordination-store node layout: `/<namespace>/<root>/<service>/<id>`

use url::form_urlencoded;

/// Default root node under which all services are registered.
pub const DEFAULT_ROOT: &str = "herald";

/// Builds node paths for services and endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePaths {
    base: String,
}

impl ServicePaths {
    /// Layout rooted at `/<namespace>/<root>`, or `/<root>` without a namespace.
    pub fn new(namespace: Option<&str>, root: &str) -> Self {
        let mut base = String::new();
        for part in namespace.into_iter().chain(std::iter::once(root)) {
            let part = part.trim_matches('/');
            if !part.is_empty() {
                base.push('/');
                base.push_str(part);
            }
        }
        if base.is_empty() {
            base.push('/');
            base.push_str(DEFAULT_ROOT);
        }
        Self { base }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Parent node holding one child per registered endpoint of `service_name`.
    pub fn service_path(&self, service_name: &str) -> String {
        format!("{}/{}", self.base, encode_segment(service_name))
    }

    /// Ephemeral node for one endpoint.
    pub fn endpoint_path(&self, service_name: &str, id: &str) -> String {
        format!("{}/{}", self.service_path(service_name), encode_segment(id))
    }
}

impl Default for ServicePaths {
    fn default() -> Self {
        Self::new(None, DEFAULT_ROOT)
    }
}

/// Encode a name so it occupies exactly one path segment.
pub fn encode_segment(name: &str) -> String {
    form_urlencoded::byte_serialize(name.as_bytes()).collect()
}

/// Join a parent path and a child name.
pub fn child_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}
