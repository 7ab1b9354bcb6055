//! Built-in handlers. Application handlers (files, CGI, proxies) live
//! outside the engine and plug in through the [`Stage`](crate::Stage)
//! contract; only the pass handler is part of the core.

pub mod pass;

pub use self::pass::PassHandler;
