use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MCP_PREFIX: &str = "mcp_";
pub const PLUGIN_PREFIX: &str = "plugin_";
pub const DEVICE_MARKER: &str = "_device_";
pub const MAX_IDENTIFIER_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Mcp,
    Plugin,
    Web,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Mcp => "mcp",
            Role::Plugin => "plugin",
            Role::Web => "web",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("connection identifier is empty")]
    Empty,
    #[error("connection identifier exceeds {max} bytes")]
    TooLong { max: usize },
    #[error("connection identifier contains whitespace or control characters")]
    InvalidCharacters,
    #[error("mcp identifier '{0}' carries no access token")]
    MissingMcpToken(String),
    #[error("plugin identifier '{0}' must look like plugin_<token>_device_<epochMillis>")]
    MalformedPlugin(String),
}

/// Parsed form of the identifier a peer dials with.
///
/// `mcp_<token>` and `plugin_<token>_device_<millis>` share the token as
/// their routing key; every other identifier is a web peer whose routing key
/// is the identifier itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionIdentity {
    Mcp { token: String },
    Plugin { token: String, device_id: u64 },
    Web { id: String },
}

impl ConnectionIdentity {
    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        if input.is_empty() {
            return Err(IdentityError::Empty);
        }
        if input.len() > MAX_IDENTIFIER_BYTES {
            return Err(IdentityError::TooLong {
                max: MAX_IDENTIFIER_BYTES,
            });
        }
        if input
            .chars()
            .any(|ch| ch.is_whitespace() || ch.is_control())
        {
            return Err(IdentityError::InvalidCharacters);
        }

        if let Some(token) = input.strip_prefix(MCP_PREFIX) {
            if token.is_empty() {
                return Err(IdentityError::MissingMcpToken(input.to_string()));
            }
            return Ok(ConnectionIdentity::Mcp {
                token: token.to_string(),
            });
        }

        if let Some(rest) = input.strip_prefix(PLUGIN_PREFIX) {
            let malformed = || IdentityError::MalformedPlugin(input.to_string());
            let (token, device) = rest.rsplit_once(DEVICE_MARKER).ok_or_else(malformed)?;
            if token.is_empty() || device.is_empty() || !device.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(malformed());
            }
            let device_id = device.parse::<u64>().map_err(|_| malformed())?;
            return Ok(ConnectionIdentity::Plugin {
                token: token.to_string(),
                device_id,
            });
        }

        Ok(ConnectionIdentity::Web {
            id: input.to_string(),
        })
    }

    pub fn mcp(token: impl Into<String>) -> Self {
        ConnectionIdentity::Mcp {
            token: token.into(),
        }
    }

    pub fn plugin(token: impl Into<String>, device_id: u64) -> Self {
        ConnectionIdentity::Plugin {
            token: token.into(),
            device_id,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            ConnectionIdentity::Mcp { .. } => Role::Mcp,
            ConnectionIdentity::Plugin { .. } => Role::Plugin,
            ConnectionIdentity::Web { .. } => Role::Web,
        }
    }

    /// Routing key shared by every peer of one editing session.
    pub fn token(&self) -> &str {
        match self {
            ConnectionIdentity::Mcp { token } => token,
            ConnectionIdentity::Plugin { token, .. } => token,
            ConnectionIdentity::Web { id } => id,
        }
    }

    pub fn connection_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionIdentity::Mcp { token } => write!(f, "{MCP_PREFIX}{token}"),
            ConnectionIdentity::Plugin { token, device_id } => {
                write!(f, "{PLUGIN_PREFIX}{token}{DEVICE_MARKER}{device_id}")
            }
            ConnectionIdentity::Web { id } => f.write_str(id),
        }
    }
}

impl FromStr for ConnectionIdentity {
    type Err = IdentityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        ConnectionIdentity::parse(input)
    }
}

/// Pulls an access token out of a caller context value, accepting either a
/// bare token or an `Authorization`-style `Bearer <token>` string.
pub fn extract_access_token(context: &str) -> Option<&str> {
    let trimmed = context.trim();
    let token = match trimmed.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        Some(_) => return None,
        None => trimmed,
    };
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_identifier_shapes() {
        assert_eq!(
            ConnectionIdentity::parse("mcp_abc").unwrap(),
            ConnectionIdentity::mcp("abc")
        );
        assert_eq!(
            ConnectionIdentity::parse("plugin_abc_device_1700000000000").unwrap(),
            ConnectionIdentity::plugin("abc", 1_700_000_000_000)
        );
        let web = ConnectionIdentity::parse("abc").unwrap();
        assert_eq!(web.role(), Role::Web);
        assert_eq!(web.token(), "abc");
    }

    #[test]
    fn plugin_token_may_contain_the_device_marker() {
        let identity = ConnectionIdentity::parse("plugin_a_device_b_device_42").unwrap();
        assert_eq!(identity, ConnectionIdentity::plugin("a_device_b", 42));
        assert_eq!(identity.to_string(), "plugin_a_device_b_device_42");
    }

    #[test]
    fn rejects_malformed_identifiers_instead_of_misrouting() {
        assert_eq!(ConnectionIdentity::parse(""), Err(IdentityError::Empty));
        assert!(matches!(
            ConnectionIdentity::parse("mcp_"),
            Err(IdentityError::MissingMcpToken(_))
        ));
        for bad in [
            "plugin_abc",
            "plugin__device_12",
            "plugin_abc_device_",
            "plugin_abc_device_12x",
        ] {
            assert!(
                matches!(
                    ConnectionIdentity::parse(bad),
                    Err(IdentityError::MalformedPlugin(_))
                ),
                "{bad} should be rejected"
            );
        }
        assert_eq!(
            ConnectionIdentity::parse("has space"),
            Err(IdentityError::InvalidCharacters)
        );
        let long = "x".repeat(MAX_IDENTIFIER_BYTES + 1);
        assert!(matches!(
            ConnectionIdentity::parse(&long),
            Err(IdentityError::TooLong { .. })
        ));
    }

    #[test]
    fn peers_of_one_session_share_a_token() {
        let mcp = ConnectionIdentity::parse("mcp_abc").unwrap();
        let plugin = ConnectionIdentity::parse("plugin_abc_device_1").unwrap();
        let web = ConnectionIdentity::parse("abc").unwrap();
        assert_eq!(mcp.token(), plugin.token());
        assert_eq!(plugin.token(), web.token());
    }

    #[test]
    fn extracts_tokens_from_caller_context() {
        assert_eq!(extract_access_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_access_token("bearer   abc "), Some("abc"));
        assert_eq!(extract_access_token("abc"), Some("abc"));
        assert_eq!(extract_access_token("Basic abc"), None);
        assert_eq!(extract_access_token("   "), None);
    }
}
