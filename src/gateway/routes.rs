//! Route table entries.

use crate::http::request::Method;

/// Upstream group name of the identity service.
pub const IDENTITY_SERVICE: &str = "identity";

/// Credential issuance (login / token refresh).
pub const ISSUANCE_PATH: &str = "/auth/token";

/// Everything else under the identity service's auth API.
pub const AUTH_PATH: &str = "/auth/";

/// Protected user resources.
pub const USERS_PATH: &str = "/users/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    /// A valid bearer credential is required before forwarding
    Bearer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handling {
    /// Relay the upstream response unchanged
    Forward,
    /// Relay, moving the refresh token of a successful response into a cookie
    Issue,
}

/// One entry of the dispatcher's route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    prefix: String,
    method: Option<Method>,
    upstream: String,
    access: Access,
    handling: Handling,
}

impl Route {
    /// A public pass-through route for any method.
    pub fn forward(prefix: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            method: None,
            upstream: upstream.into(),
            access: Access::Public,
            handling: Handling::Forward,
        }
    }

    /// A public issuance route for any method.
    pub fn issue(prefix: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            handling: Handling::Issue,
            ..Self::forward(prefix, upstream)
        }
    }

    /// Restricts the route to one method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Requires a bearer credential.
    pub fn protected(mut self) -> Self {
        self.access = Access::Bearer;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn handling(&self) -> Handling {
        self.handling
    }

    pub fn matches_path(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    pub fn allows(&self, method: Method) -> bool {
        self.method.is_none_or(|m| m == method)
    }
}

/// The identity gateway's routes.
///
/// | Method | Prefix        | Auth   | Handling            |
/// |--------|---------------|--------|---------------------|
/// | POST   | `/auth/token` | none   | forward + transform |
/// | any    | `/auth/`      | none   | forward             |
/// | any    | `/users/`     | bearer | forward             |
pub fn identity_routes() -> Vec<Route> {
    vec![
        Route::issue(ISSUANCE_PATH, IDENTITY_SERVICE).method(Method::POST),
        Route::forward(AUTH_PATH, IDENTITY_SERVICE),
        Route::forward(USERS_PATH, IDENTITY_SERVICE).protected(),
    ]
}
