//! Application configuration.
//!
//! A fixed, typed configuration surface consumed at assembly: bind address,
//! optional TLS material paths, and the signing secret used by the auxiliary
//! helpers. Values load from the environment with an `ENSEMBLE_`-prefixed
//! variant taking precedence over the bare name.

use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub local_port: u16,
    pub hostname: String,
    /// PEM private key path; HTTPS is used only when both key and cert are set.
    pub https_key: Option<PathBuf>,
    /// PEM certificate path.
    pub https_cert: Option<PathBuf>,
    /// Secret for the JWT/crypto helpers.
    pub auth_salt: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            local_port: 10001,
            hostname: "localhost".to_string(),
            https_key: None,
            https_cert: None,
            auth_salt: "x".to_string(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("ENSEMBLE_{name}"))
        .or_else(|_| env::var(name))
        .ok()
}

impl AppConfig {
    /// Load configuration from `ENSEMBLE_LOCAL_PORT`, `ENSEMBLE_HOSTNAME`,
    /// `ENSEMBLE_HTTPS_KEY`, `ENSEMBLE_HTTPS_CERT` and `ENSEMBLE_AUTH_SALT`
    /// (or their unprefixed fallbacks), defaulting where unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            local_port: env_var("LOCAL_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.local_port),
            hostname: env_var("HOSTNAME").unwrap_or(defaults.hostname),
            https_key: env_var("HTTPS_KEY").map(PathBuf::from),
            https_cert: env_var("HTTPS_CERT").map(PathBuf::from),
            auth_salt: env_var("AUTH_SALT").unwrap_or(defaults.auth_salt),
        }
    }

    /// True when both TLS key and certificate are configured.
    pub fn tls_material(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.https_key, &self.https_cert) {
            (Some(key), Some(cert)) => Some((key, cert)),
            _ => None,
        }
    }

    /// `key=value` rendering of the set fields, logged once at startup.
    pub fn summary(&self) -> String {
        let mut parts = vec![
            format!("LOCAL_PORT={}", self.local_port),
            format!("HOSTNAME={}", self.hostname),
        ];
        if let Some(key) = &self.https_key {
            parts.push(format!("HTTPS_KEY={}", key.display()));
        }
        if let Some(cert) = &self.https_cert {
            parts.push(format!("HTTPS_CERT={}", cert.display()));
        }
        parts.push(format!("AUTH_SALT={}", self.auth_salt));
        parts.join(" ")
    }
}
