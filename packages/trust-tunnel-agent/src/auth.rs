//! Pluggable pre-session authorization.
//!
//! Plugins register a factory under a name at process start; the configured
//! name is resolved once at boot. Registering the same name twice is a
//! programmer error and panics. A configured-but-unregistered name must
//! refuse agent startup, while no configured name admits every request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once, OnceLock};

use thiserror::Error;

use crate::config::AuthConfig;
use crate::request::RequestInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Success,
    BadRequest,
    Forbidden,
    InternalServerErr,
}

impl Code {
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Success => 200,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::InternalServerErr => 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub code: Code,
    pub err_msg: String,
}

impl Response {
    pub fn success() -> Self {
        Self {
            code: Code::Success,
            err_msg: String::new(),
        }
    }

    pub fn denied(code: Code, err_msg: impl Into<String>) -> Self {
        Self {
            code,
            err_msg: err_msg.into(),
        }
    }
}

/// Decides whether a request may open a session against its target.
pub trait AuthHandler: Send + Sync {
    fn verify_access_permission(&self, req: &RequestInfo) -> Response;
}

pub type Factory = fn(&HashMap<String, String>) -> Arc<dyn AuthHandler>;

#[derive(Debug, Error)]
#[error("authorization handler not found: {0}")]
pub struct UnknownHandler(pub String);

fn factories() -> &'static Mutex<HashMap<String, Factory>> {
    static FACTORIES: OnceLock<Mutex<HashMap<String, Factory>>> = OnceLock::new();
    FACTORIES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers `factory` under `name`. Panics if the name is taken.
pub fn register_auth_handler_factory(name: &str, factory: Factory) {
    let mut map = factories().lock().unwrap_or_else(|e| e.into_inner());
    if map.contains_key(name) {
        panic!("auth handler already registered: {name}");
    }
    map.insert(name.to_string(), factory);
}

/// Builds the configured handler, or fails when the name is unregistered.
pub fn create_auth_handler(config: &AuthConfig) -> Result<Arc<dyn AuthHandler>, UnknownHandler> {
    let map = factories().lock().unwrap_or_else(|e| e.into_inner());
    let factory = map
        .get(&config.name)
        .ok_or_else(|| UnknownHandler(config.name.clone()))?;

    Ok(factory(&config.params))
}

/// Registers the built-in plugins exactly once.
pub fn register_builtin() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        register_auth_handler_factory("example", example::new_handler);
    });
}

/// Reference plugin: admits the user names listed in the comma-separated
/// `users` param. Real deployments register their own handler instead.
pub mod example {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use super::{AuthHandler, Code, Response};
    use crate::request::RequestInfo;

    pub struct ExampleHandler {
        allowed_users: HashSet<String>,
    }

    pub fn new_handler(params: &HashMap<String, String>) -> Arc<dyn AuthHandler> {
        let allowed_users = params
            .get("users")
            .map(|users| {
                users
                    .split(',')
                    .map(|user| user.trim().to_string())
                    .filter(|user| !user.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Arc::new(ExampleHandler { allowed_users })
    }

    impl AuthHandler for ExampleHandler {
        fn verify_access_permission(&self, req: &RequestInfo) -> Response {
            if req.user_name.is_empty() {
                return Response::denied(Code::BadRequest, "empty user name");
            }

            if self.allowed_users.contains(&req.user_name) {
                Response::success()
            } else {
                Response::denied(
                    Code::Forbidden,
                    format!("user {} is not allowed", req.user_name),
                )
            }
        }
    }
}
