//! Named request hooks.
//!
//! Hooks are registered by the host before any shard is started and are
//! referenced from configuration by name, so a configuration can be handed to
//! any worker without shipping code along with it.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::request::{Context, RequestTemplate};

/// Runs before a template is serialized; the returned template is used for
/// that single request.
pub type SetupRequest = Arc<dyn Fn(RequestTemplate, &mut Context) -> RequestTemplate + Send + Sync>;

/// Runs after a response completes with its status code and body text.
pub type OnResponse = Arc<dyn Fn(u16, &str, &mut Context) + Send + Sync>;

/// Returns false when a response body is not what the run expects.
pub type VerifyBody = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Runs once on every new connection before it opens its socket.
pub type SetupClient = Arc<dyn Fn(&mut Connection) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub enum Hook {
    SetupRequest(SetupRequest),
    OnResponse(OnResponse),
    VerifyBody(VerifyBody),
    SetupClient(SetupClient),
}

impl Hook {
    fn kind(&self) -> &'static str {
        match self {
            Hook::SetupRequest(_) => "setup_request",
            Hook::OnResponse(_) => "on_response",
            Hook::VerifyBody(_) => "verify_body",
            Hook::SetupClient(_) => "setup_client",
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook::{}", self.kind())
    }
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Arc<DashMap<String, Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, hook: Hook) {
        self.hooks.insert(name.into(), hook);
    }

    pub fn register_setup_request<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(RequestTemplate, &mut Context) -> RequestTemplate + Send + Sync + 'static,
    {
        self.register(name, Hook::SetupRequest(Arc::new(hook)));
    }

    pub fn register_on_response<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(u16, &str, &mut Context) + Send + Sync + 'static,
    {
        self.register(name, Hook::OnResponse(Arc::new(hook)));
    }

    pub fn register_verify_body<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.register(name, Hook::VerifyBody(Arc::new(hook)));
    }

    pub fn register_setup_client<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(&mut Connection) -> Result<()> + Send + Sync + 'static,
    {
        self.register(name, Hook::SetupClient(Arc::new(hook)));
    }

    fn lookup(&self, name: &str) -> Result<Hook> {
        self.hooks
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::config(format!("no hook registered under '{}'", name)))
    }

    pub fn setup_request(&self, name: &str) -> Result<SetupRequest> {
        match self.lookup(name)? {
            Hook::SetupRequest(hook) => Ok(hook),
            other => Err(wrong_kind(name, "setup_request", &other)),
        }
    }

    pub fn on_response(&self, name: &str) -> Result<OnResponse> {
        match self.lookup(name)? {
            Hook::OnResponse(hook) => Ok(hook),
            other => Err(wrong_kind(name, "on_response", &other)),
        }
    }

    pub fn verify_body(&self, name: &str) -> Result<VerifyBody> {
        match self.lookup(name)? {
            Hook::VerifyBody(hook) => Ok(hook),
            other => Err(wrong_kind(name, "verify_body", &other)),
        }
    }

    pub fn setup_client(&self, name: &str) -> Result<SetupClient> {
        match self.lookup(name)? {
            Hook::SetupClient(hook) => Ok(hook),
            other => Err(wrong_kind(name, "setup_client", &other)),
        }
    }
}

fn wrong_kind(name: &str, expected: &str, found: &Hook) -> Error {
    Error::config(format!(
        "hook '{}' is a {} hook, expected {}",
        name,
        found.kind(),
        expected
    ))
}
