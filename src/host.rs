use std::sync::Arc;

use tracing::debug;

use crate::conn::{ConnCore, ErrorFlags};
use crate::route::Route;

/// A named virtual server with its own ordered routes.
///
/// Host names are matched exactly (case-insensitively) or by a
/// `*suffix` wildcard; the bare name `*` matches every request.
#[derive(Debug)]
pub struct Host {
    name: String,
    routes: Vec<Arc<Route>>,
}

impl Host {
    /// Create a host for `name`.
    pub fn new(name: impl Into<String>) -> Host {
        Host {
            name: name.into(),
            routes: Vec::new(),
        }
    }

    /// The host name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a route. Routes match in insertion order; the first
    /// accepting route wins.
    pub fn add_route(&mut self, route: Route) {
        self.routes.push(Arc::new(route));
    }

    pub(crate) fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Whether this host serves requests for `authority`.
    pub fn matches(&self, authority: &str) -> bool {
        // Ignore any :port suffix on the Host header.
        let name = authority.rsplitn(2, ':').last().unwrap_or(authority);
        if let Some(suffix) = self.name.strip_prefix('*') {
            name.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase())
        } else {
            self.name.eq_ignore_ascii_case(name)
        }
    }
}

impl ConnCore {
    /// Select the virtual host after the `Host:` header is parsed. When
    /// no host matches, the first is used and a 404 is emitted.
    pub(crate) fn match_host(&mut self) {
        if self.hosts.is_empty() {
            self.error(503, ErrorFlags::default(), "No hosts configured");
            return;
        }
        let header = self
            .rx_ref()
            .host_header
            .clone()
            .unwrap_or_default();
        let found = self.hosts.iter().find(|host| host.matches(&header)).cloned();
        match found {
            Some(host) => {
                debug!(host = host.name(), "matched host");
                self.host = Some(host);
            }
            None => {
                self.host = Some(self.hosts[0].clone());
                let msg = format!("No host to serve request. Searching for {}", header);
                self.error(404, ErrorFlags::default(), msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_match() {
        let host = Host::new("www.example.com");
        assert!(host.matches("www.example.com"));
        assert!(host.matches("WWW.EXAMPLE.COM:8080"));
        assert!(!host.matches("example.com"));

        let wild = Host::new("*.example.com");
        assert!(wild.matches("www.example.com"));
        assert!(wild.matches("a.b.example.com:443"));
        assert!(!wild.matches("example.org"));

        let any = Host::new("*");
        assert!(any.matches("anything"));
        assert!(any.matches(""));
    }
}
