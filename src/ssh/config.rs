//! SSH Configuration

use serde::{Deserialize, Serialize};

use super::keys::{resolve_private_key, KeyError, ResolvedAuth};

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Terminal type requested for the PTY
    #[serde(default = "default_term")]
    pub term: String,

    /// Initial terminal columns
    #[serde(default = "default_cols")]
    pub cols: u32,

    /// Initial terminal rows
    #[serde(default = "default_rows")]
    pub rows: u32,

    /// How the server's host key is checked
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            auth,
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Authentication methods supported
///
/// Exactly one method is carried per connection; see [`AuthMethod::from_parts`]
/// for building one from loosely-typed request parameters.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication from raw key material
    Key {
        /// Private key text (OpenSSH or PEM)
        private_key: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// Delegate signing to the ssh-agent running alongside the bridge
    Agent,
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            private_key: private_key.into(),
            passphrase,
        }
    }

    /// Build a credential from optional parts, rejecting combinations that
    /// don't name exactly one method.
    pub fn from_parts(
        password: Option<String>,
        private_key: Option<String>,
        passphrase: Option<String>,
        allow_agent: bool,
    ) -> Result<Self, KeyError> {
        let password = password.filter(|p| !p.is_empty());
        let private_key = private_key.filter(|k| !k.trim().is_empty());
        let passphrase = passphrase.filter(|p| !p.is_empty());

        let given = [password.is_some(), private_key.is_some(), allow_agent]
            .iter()
            .filter(|set| **set)
            .count();
        if given == 0 {
            return Err(KeyError::MissingCredential);
        }
        if given > 1 || (passphrase.is_some() && private_key.is_none()) {
            return Err(KeyError::AmbiguousCredential);
        }

        Ok(match (password, private_key) {
            (Some(password), _) => Self::Password { password },
            (None, Some(private_key)) => Self::Key {
                private_key,
                passphrase,
            },
            (None, None) => Self::Agent,
        })
    }

    /// Turn the credential into an authentication handle. Never touches the network.
    pub fn resolve(&self) -> Result<ResolvedAuth, KeyError> {
        match self {
            AuthMethod::Password { password } => Ok(ResolvedAuth::Password(password.clone())),
            AuthMethod::Key {
                private_key,
                passphrase,
            } => resolve_private_key(private_key, passphrase.as_deref()).map(ResolvedAuth::Key),
            AuthMethod::Agent => Ok(ResolvedAuth::Agent),
        }
    }
}

// Keep secrets out of logs
impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password { .. }"),
            AuthMethod::Key { passphrase, .. } => f
                .debug_struct("Key")
                .field("encrypted", &passphrase.is_some())
                .finish_non_exhaustive(),
            AuthMethod::Agent => f.write_str("Agent"),
        }
    }
}

/// Host key verification policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "fingerprints", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Trust-on-first-use without a persisted store: every host key is
    /// accepted. This is the bridge's historical behavior and is insecure
    /// against an active man-in-the-middle.
    #[default]
    AcceptAny,

    /// Accept only host keys whose `SHA256:` fingerprint is listed
    Fingerprints(Vec<String>),
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_term() -> String {
    "xterm".to_string()
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            auth: AuthMethod::Agent,
            timeout_secs: default_timeout(),
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
            host_key_policy: HostKeyPolicy::AcceptAny,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_password() {
        let auth = AuthMethod::from_parts(Some("secret".into()), None, None, false).unwrap();
        assert!(matches!(auth, AuthMethod::Password { ref password } if password == "secret"));
    }

    #[test]
    fn test_from_parts_key_with_passphrase() {
        let auth =
            AuthMethod::from_parts(None, Some("KEY".into()), Some("pass".into()), false).unwrap();
        match auth {
            AuthMethod::Key {
                private_key,
                passphrase,
            } => {
                assert_eq!(private_key, "KEY");
                assert_eq!(passphrase.as_deref(), Some("pass"));
            }
            other => panic!("expected key credential, got {:?}", other),
        }
    }

    #[test]
    fn test_from_parts_agent() {
        let auth = AuthMethod::from_parts(None, None, None, true).unwrap();
        assert!(matches!(auth, AuthMethod::Agent));
    }

    #[test]
    fn test_from_parts_rejects_missing() {
        let err = AuthMethod::from_parts(Some(String::new()), None, None, false).unwrap_err();
        assert!(matches!(err, KeyError::MissingCredential));
    }

    #[test]
    fn test_from_parts_rejects_ambiguous() {
        let err =
            AuthMethod::from_parts(Some("pw".into()), Some("KEY".into()), None, false).unwrap_err();
        assert!(matches!(err, KeyError::AmbiguousCredential));

        let err = AuthMethod::from_parts(Some("pw".into()), None, None, true).unwrap_err();
        assert!(matches!(err, KeyError::AmbiguousCredential));

        let err = AuthMethod::from_parts(Some("pw".into()), None, Some("pass".into()), false)
            .unwrap_err();
        assert!(matches!(err, KeyError::AmbiguousCredential));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let debug = format!("{:?}", AuthMethod::password("hunter2"));
        assert!(!debug.contains("hunter2"));

        let debug = format!("{:?}", AuthMethod::key("PRIVATE", Some("hunter2".into())));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("PRIVATE"));
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: SshConfig = serde_json::from_str(
            r#"{"host":"example.com","username":"root","auth":{"type":"password","password":"x"}}"#,
        )
        .unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.term, "xterm");
        assert_eq!((config.cols, config.rows), (80, 24));
        assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptAny);
    }

    #[test]
    fn test_host_key_policy_fingerprints_from_json() {
        let policy: HostKeyPolicy =
            serde_json::from_str(r#"{"mode":"fingerprints","fingerprints":["SHA256:abc"]}"#)
                .unwrap();
        assert_eq!(policy, HostKeyPolicy::Fingerprints(vec!["SHA256:abc".into()]));
    }
}
