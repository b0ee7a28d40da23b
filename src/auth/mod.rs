mod basic;

pub use basic::BasicAuth;

use std::fmt;
use std::str::FromStr;

use tracing::debug;

/// What an operation does to a resource, as seen by the authorization policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    List,
    Read,
    Write,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::List => "list",
            Action::Read => "read",
            Action::Write => "write",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource name used for operations that span every state.
pub const ANY_RESOURCE: &str = "*";

/// Credentials presented with a single request.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    authorization: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Identity carrying the raw `Authorization` header value.
    pub fn from_authorization(value: impl Into<String>) -> Self {
        Self {
            authorization: Some(value.into()),
        }
    }

    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }
}

/// Why a request was rejected. Only ever logged, never sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    DenyAll,
    MissingCredentials,
    InvalidScheme,
    MalformedCredentials,
    BadCredentials,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RejectReason::DenyAll => "policy denies all requests",
            RejectReason::MissingCredentials => "missing authorization header",
            RejectReason::InvalidScheme => "invalid auth type",
            RejectReason::MalformedCredentials => "malformed credentials",
            RejectReason::BadCredentials => "credentials do not match",
        };
        f.write_str(msg)
    }
}

/// The authorization policy of the process. Built once at start-up.
#[derive(Debug, Clone, Default)]
pub enum AuthPolicy {
    /// Rejects everything.
    #[default]
    Deny,
    /// Accepts everything.
    Allow,
    /// Requires matching HTTP Basic credentials.
    Basic(BasicAuth),
}

impl AuthPolicy {
    pub fn authorize(
        &self,
        identity: &Identity,
        action: Action,
        resource: &str,
    ) -> Result<(), RejectReason> {
        let result = match self {
            AuthPolicy::Deny => Err(RejectReason::DenyAll),
            AuthPolicy::Allow => Ok(()),
            AuthPolicy::Basic(basic) => basic.check(identity.authorization()),
        };
        if let Err(reason) = result {
            debug!(policy = self.name(), %action, resource, %reason, "request rejected");
        }
        result
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthPolicy::Deny => "fail",
            AuthPolicy::Allow => "noop",
            AuthPolicy::Basic(_) => "basic",
        }
    }

    /// `WWW-Authenticate` challenge to send with a 401, if the policy has one.
    pub fn challenge(&self) -> Option<&'static str> {
        match self {
            AuthPolicy::Basic(_) => Some("Basic realm=\"tfstate\""),
            _ => None,
        }
    }

    /// Builds the policy from its configured name and optional credentials.
    pub fn from_config(
        plugin: AuthPlugin,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, String> {
        match plugin {
            AuthPlugin::Fail => Ok(AuthPolicy::Deny),
            AuthPlugin::Noop => Ok(AuthPolicy::Allow),
            AuthPlugin::Basic => match (username, password) {
                (Some(username), Some(password)) => {
                    Ok(AuthPolicy::Basic(BasicAuth::new(username, password)))
                }
                _ => Err(
                    "basic auth requires both a username and a password".to_string(),
                ),
            },
        }
    }
}

/// Configured name of the authorization policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    Fail,
    Noop,
    Basic,
}

impl FromStr for AuthPlugin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail" => Ok(AuthPlugin::Fail),
            "noop" => Ok(AuthPlugin::Noop),
            "basic" => Ok(AuthPlugin::Basic),
            _ => Err(format!("Unknown auth plugin: {}", s)),
        }
    }
}
