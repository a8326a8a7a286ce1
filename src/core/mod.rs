pub(crate) mod affinity;
pub(crate) mod auth;
pub(crate) mod body;
pub(crate) mod cancel;
pub(crate) mod config;
pub(crate) mod content_encoding;
pub(crate) mod directives;
pub(crate) mod error;
pub(crate) mod extensions;
pub(crate) mod metrics;
pub(crate) mod observe;
pub(crate) mod orchestrator;
pub(crate) mod origin;
pub(crate) mod pipeline;
pub(crate) mod policy;
pub(crate) mod proxy;
pub(crate) mod request;
pub(crate) mod response;
pub(crate) mod retry;
pub(crate) mod store;
pub(crate) mod tls;
pub(crate) mod util;
