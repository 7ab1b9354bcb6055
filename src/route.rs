use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::auth::AuthConfig;
use crate::conn::{ConnCore, ConnState, ErrorFlags};
use crate::error::{Error, User};
use crate::stage::{MethodSet, Stage};

/// Cap on URI rewrites per request, to terminate rewrite loops.
const MAX_REWRITE: usize = 20;

/// Outcome of matching one route against a request.
#[derive(Debug)]
pub enum RouteMatch {
    /// Route accepted; its target applies.
    Ok,
    /// Try the next route.
    Reject,
    /// Restart routing with a rewritten URI.
    Reroute(String),
}

enum Target {
    /// Serve with this handler.
    Handler(Arc<dyn Stage>),
    /// Redirect to a location.
    Redirect(u16, String),
    /// Rewrite the URI and restart routing.
    Rewrite(String),
}

/// A URL pattern plus constraints that selects a handler.
pub struct Route {
    name: String,
    prefix: String,
    pattern: Option<Pattern>,
    methods: MethodSet,
    constraints: Vec<(String, Regex)>,
    auth: Option<Arc<AuthConfig>>,
    target: Target,
    output_filters: Vec<Arc<dyn Stage>>,
    input_filters: Vec<Arc<dyn Stage>>,
    auto_delete_uploads: bool,
    upload_dir: Option<std::path::PathBuf>,
}

struct Pattern {
    regex: Regex,
    names: Vec<String>,
}

impl Route {
    /// Start building a route.
    pub fn new(name: impl Into<String>) -> RouteBuilder {
        RouteBuilder {
            name: name.into(),
            prefix: String::from("/"),
            pattern: None,
            methods: MethodSet::all(),
            constraints: Vec::new(),
            auth: None,
            target: None,
            output_filters: None,
            input_filters: None,
            auto_delete_uploads: false,
            upload_dir: None,
        }
    }

    /// The route name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn auth(&self) -> Option<&Arc<AuthConfig>> {
        self.auth.as_ref()
    }

    pub(crate) fn output_filters(&self) -> &[Arc<dyn Stage>] {
        &self.output_filters
    }

    pub(crate) fn input_filters(&self) -> &[Arc<dyn Stage>] {
        &self.input_filters
    }

    /// Match this route against the current request. Pattern captures
    /// are stored into the form variables on acceptance.
    pub(crate) fn matches(&self, core: &mut ConnCore) -> RouteMatch {
        let path = {
            let rx = core.rx_ref();
            rx.parsed_uri
                .as_ref()
                .map(|uri| uri.path().to_string())
                .unwrap_or_else(|| rx.uri.clone())
        };
        if !path.starts_with(&self.prefix) {
            return RouteMatch::Reject;
        }
        let method_set = core.rx_ref().method_set;
        let is_meta = method_set.contains(MethodSet::OPTIONS) || method_set.contains(MethodSet::TRACE);
        if !is_meta && !self.methods.contains(method_set) {
            return RouteMatch::Reject;
        }
        for (header, regex) in &self.constraints {
            let value = core.rx_ref().headers.get(header).map(|v| v.to_string());
            match value {
                Some(value) if regex.is_match(&value) => {}
                _ => return RouteMatch::Reject,
            }
        }
        let mut captured = Vec::new();
        if let Some(ref pattern) = self.pattern {
            let caps = match pattern.regex.captures(&path) {
                Some(caps) => caps,
                None => return RouteMatch::Reject,
            };
            for name in &pattern.names {
                if let Some(m) = caps.name(name) {
                    captured.push((name.clone(), m.as_str().to_string()));
                }
            }
        }
        if let Target::Rewrite(ref template) = self.target {
            let mut uri = template.clone();
            for (name, value) in &captured {
                uri = uri.replace(&format!("{{{}}}", name), value);
            }
            return RouteMatch::Reroute(uri);
        }
        for (name, value) in captured {
            core.rx_mut().form_vars.set(name, value);
        }
        RouteMatch::Ok
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Builder for [`Route`].
pub struct RouteBuilder {
    name: String,
    prefix: String,
    pattern: Option<String>,
    methods: MethodSet,
    constraints: Vec<(String, String)>,
    auth: Option<Arc<AuthConfig>>,
    target: Option<Target>,
    output_filters: Option<Vec<Arc<dyn Stage>>>,
    input_filters: Option<Vec<Arc<dyn Stage>>>,
    auto_delete_uploads: bool,
    upload_dir: Option<std::path::PathBuf>,
}

impl RouteBuilder {
    /// Require the URI path to start with `prefix`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Match the path against a template such as `/users/{id}`; the
    /// `{name}` tokens capture into form variables.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Restrict accepted methods.
    pub fn methods(mut self, methods: MethodSet) -> Self {
        self.methods = methods;
        self
    }

    /// Require `header` to match `regex`.
    pub fn constraint(mut self, header: impl Into<String>, regex: impl Into<String>) -> Self {
        self.constraints.push((header.into(), regex.into()));
        self
    }

    /// Protect this route with an authentication configuration.
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Serve accepted requests with `handler`.
    pub fn handler(mut self, handler: Arc<dyn Stage>) -> Self {
        self.target = Some(Target::Handler(handler));
        self
    }

    /// Redirect accepted requests.
    pub fn redirect(mut self, status: u16, location: impl Into<String>) -> Self {
        self.target = Some(Target::Redirect(status, location.into()));
        self
    }

    /// Rewrite the URI (template may reference pattern captures) and
    /// restart routing.
    pub fn rewrite(mut self, template: impl Into<String>) -> Self {
        self.target = Some(Target::Rewrite(template.into()));
        self
    }

    /// Replace the default output filter chain.
    pub fn output_filters(mut self, filters: Vec<Arc<dyn Stage>>) -> Self {
        self.output_filters = Some(filters);
        self
    }

    /// Replace the default input filter chain.
    pub fn input_filters(mut self, filters: Vec<Arc<dyn Stage>>) -> Self {
        self.input_filters = Some(filters);
        self
    }

    /// Unlink upload spool files at request completion.
    pub fn auto_delete_uploads(mut self, auto_delete: bool) -> Self {
        self.auto_delete_uploads = auto_delete;
        self
    }

    /// Directory receiving upload spool files.
    pub fn upload_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }

    /// Compile the route. Fails when a pattern or constraint regex is
    /// invalid, or no target was configured.
    pub fn build_with(self, http: &crate::Http) -> crate::Result<Route> {
        let pattern = match self.pattern {
            Some(template) => Some(compile_pattern(&template)?),
            None => None,
        };
        let mut constraints = Vec::with_capacity(self.constraints.len());
        for (header, expr) in self.constraints {
            let regex = Regex::new(&expr).map_err(|e| Error::new_user(User::BadRoute).with(e))?;
            constraints.push((header, regex));
        }
        let target = self
            .target
            .ok_or_else(|| Error::new_user(User::BadRoute).with("route has no target"))?;
        Ok(Route {
            name: self.name,
            prefix: self.prefix,
            pattern,
            methods: self.methods,
            constraints,
            auth: self.auth,
            target,
            output_filters: self
                .output_filters
                .unwrap_or_else(|| http.default_output_filters()),
            input_filters: self
                .input_filters
                .unwrap_or_else(|| http.default_input_filters()),
            auto_delete_uploads: self.auto_delete_uploads,
            upload_dir: self.upload_dir,
        })
    }

    /// Compile the route against a default engine configuration.
    pub fn build(self) -> crate::Result<Route> {
        let http = crate::Http::new();
        self.build_with(&http)
    }
}

/// Translate a `/users/{id}` template into an anchored regex with named
/// captures.
fn compile_pattern(template: &str) -> crate::Result<Pattern> {
    let mut regex = String::from("^");
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        regex.push_str(&regex::escape(&rest[..open]));
        let close = rest[open..]
            .find('}')
            .ok_or_else(|| Error::new_user(User::BadRoute).with("unterminated {token}"))?;
        let name = &rest[open + 1..open + close];
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(Error::new_user(User::BadRoute).with("invalid {token} name"));
        }
        regex.push_str(&format!("(?P<{}>[^/]+)", name));
        names.push(name.to_string());
        rest = &rest[open + close + 1..];
    }
    regex.push_str(&regex::escape(rest));
    regex.push('$');
    let regex = Regex::new(&regex).map_err(|e| Error::new_user(User::BadRoute).with(e))?;
    Ok(Pattern { regex, names })
}

impl ConnCore {
    /// Route the parsed request: select a handler, run authentication
    /// and build the pipeline. Rewrites restart routing, capped to
    /// terminate loops.
    pub(crate) fn route_request(&mut self) {
        let host = match self.host.clone() {
            Some(host) => host,
            None => return,
        };
        let mut rewrites = 0;
        let selected = 'routing: loop {
            if rewrites > MAX_REWRITE {
                self.error(500, ErrorFlags::default(), "Too many request rewrites");
                return;
            }
            for route in host.routes() {
                match route.matches(self) {
                    RouteMatch::Reject => continue,
                    RouteMatch::Ok => break 'routing Some(route.clone()),
                    RouteMatch::Reroute(uri) => {
                        debug!(%uri, "rerouting");
                        let parsed = uri.parse::<http::Uri>().ok();
                        let rx = self.rx_mut();
                        rx.uri = uri;
                        rx.parsed_uri = parsed;
                        rewrites += 1;
                        continue 'routing;
                    }
                }
            }
            break None;
        };
        let route = match selected {
            Some(route) => route,
            None => {
                self.error(500, ErrorFlags::default(), "No route to serve request");
                return;
            }
        };
        debug!(route = route.name(), uri = %self.rx_ref().uri, "matched route");
        self.rx_mut().route = Some(route.clone());
        if let Some(auth) = route.auth() {
            let auth = auth.clone();
            if !crate::auth::check(self, &auth) {
                return;
            }
        }
        {
            let rx = self.rx_mut();
            rx.auto_delete = route.auto_delete_uploads;
            if rx.upload_dir.is_none() {
                rx.upload_dir = route.upload_dir.clone();
            }
        }
        match route.target {
            Target::Handler(ref handler) => {
                let method_set = self.rx_ref().method_set;
                let is_meta = method_set.contains(MethodSet::OPTIONS)
                    || method_set.contains(MethodSet::TRACE);
                if is_meta {
                    // OPTIONS and TRACE are answered by the pass handler
                    // on behalf of the selected handler.
                    let pass = self.http.pass_handler();
                    let tx = self.tx_mut();
                    tx.trace_methods = handler.methods();
                    tx.handler = Some(pass);
                } else {
                    self.tx_mut().handler = Some(handler.clone());
                }
                self.set_state(ConnState::Parsed);
                self.create_pipeline(Some(&route));
                let start_after = !is_meta
                    && (handler.start_after_content()
                        || self.rx_ref().form
                        || self.rx_ref().upload);
                self.rx_mut().start_after_content = start_after;
            }
            Target::Redirect(status, ref location) => {
                let location = location.clone();
                let pass = self.http.pass_handler();
                self.tx_mut().handler = Some(pass);
                self.set_state(ConnState::Parsed);
                self.create_pipeline(Some(&route));
                self.redirect(status, &location);
            }
            Target::Rewrite(_) => unreachable!("rewrites restart routing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_compiles_tokens() {
        let pattern = compile_pattern("/users/{id}/posts/{post_id}").unwrap();
        let caps = pattern.regex.captures("/users/42/posts/7").unwrap();
        assert_eq!(&caps["id"], "42");
        assert_eq!(&caps["post_id"], "7");
        assert!(pattern.regex.captures("/users/42").is_none());
        assert_eq!(pattern.names, vec!["id", "post_id"]);
    }

    #[test]
    fn pattern_rejects_bad_tokens() {
        assert!(compile_pattern("/a/{").is_err());
        assert!(compile_pattern("/a/{bad name}").is_err());
    }

    #[test]
    fn pattern_escapes_literals() {
        let pattern = compile_pattern("/a.b/{x}").unwrap();
        assert!(pattern.regex.is_match("/a.b/1"));
        assert!(!pattern.regex.is_match("/aXb/1"));
    }
}
