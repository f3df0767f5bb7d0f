//! SSH Configuration

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Connection configuration as submitted by a client
///
/// Fields are lenient on the wire (`port` is a signed integer, credentials
/// optional) so validation can report every problem at once.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default)]
    pub hostname: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: i64,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// PEM-encoded private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Passphrase for an encrypted private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

fn default_port() -> i64 {
    22
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ConnectionConfig {
    pub fn with_password(
        hostname: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port: port as i64,
            username: username.into(),
            password: Some(password.into()),
            private_key: None,
            passphrase: None,
        }
    }

    pub fn with_private_key(
        hostname: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        private_key: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port: port as i64,
            username: username.into(),
            password: None,
            private_key: Some(private_key.into()),
            passphrase,
        }
    }

    /// Canonical form: surrounding whitespace stripped from hostname and
    /// username, hostname lowercased. Validation, rate limiting and the
    /// connection all see this form.
    pub fn normalized(mut self) -> Self {
        let hostname = self.hostname.trim().to_ascii_lowercase();
        let username = self.username.trim().to_string();
        self.hostname = hostname;
        self.username = username;
        self
    }

    /// Rate-limit identifier (`hostname:username`)
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.hostname, self.username)
    }

    /// Port as `u16`, if in range
    pub fn port_u16(&self) -> Option<u16> {
        u16::try_from(self.port).ok().filter(|p| *p != 0)
    }

    /// Resolved credential. Password wins if both are somehow set.
    pub fn auth(&self) -> Option<AuthMethod> {
        if let Some(password) = self.password.as_ref().filter(|p| !p.is_empty()) {
            return Some(AuthMethod::Password {
                password: Zeroizing::new(password.clone()),
            });
        }
        self.private_key
            .as_ref()
            .filter(|k| !k.trim().is_empty())
            .map(|pem| AuthMethod::PrivateKey {
                pem: Zeroizing::new(pem.clone()),
                passphrase: self.passphrase.clone().map(Zeroizing::new),
            })
    }
}

/// Authentication methods supported
#[derive(Clone)]
pub enum AuthMethod {
    /// Password authentication
    Password { password: Zeroizing<String> },

    /// Inline private key authentication
    PrivateKey {
        pem: Zeroizing<String>,
        passphrase: Option<Zeroizing<String>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let config: ConnectionConfig = serde_json::from_str(
            r#"{"hostname":"example.com","username":"u","password":"p"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.identifier(), "example.com:u");
        assert!(matches!(config.auth(), Some(AuthMethod::Password { .. })));
    }

    #[test]
    fn test_normalized_identifier() {
        let config = ConnectionConfig::with_password("\tExample.COM \n", 22, "  alice ", "p");
        let config = config.normalized();
        assert_eq!(config.hostname, "example.com");
        assert_eq!(config.username, "alice");
        assert_eq!(config.identifier(), "example.com:alice");
    }

    #[test]
    fn test_port_range() {
        let mut config = ConnectionConfig::with_password("h", 22, "u", "p");
        assert_eq!(config.port_u16(), Some(22));
        config.port = 70000;
        assert_eq!(config.port_u16(), None);
        config.port = 0;
        assert_eq!(config.port_u16(), None);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = ConnectionConfig::with_password("h", 22, "u", "hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
    }
}
