// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! Connection establishment settings

use std::env::{self, VarError};
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

/// All the settings required to establish a connection to a broker.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct ConnectOptions {
    /// FQDN or address of the host to connect to
    pub(crate) hostname: String,
    /// TCP port to connect to the host on
    #[builder(default = "1883")]
    pub(crate) port: u16,
    /// Client identifier. An empty id is replaced with a generated one.
    #[builder(default = "String::new()")]
    pub(crate) client_id: String,
    /// Request that the broker discard prior session state
    #[builder(default = "true")]
    pub(crate) clean_session: bool,
    /// Max time between communications before the broker may drop the session
    #[builder(default = "Duration::from_secs(1200)")]
    pub(crate) keep_alive: Duration,
    /// Per-request deadline for broker acknowledgement. `None` waits forever.
    #[builder(default = "None")]
    pub(crate) operation_timeout: Option<Duration>,
    /// Deadline for PINGRESP after a PINGREQ, and for CONNACK after channel-up
    #[builder(default = "Duration::from_secs(3)")]
    pub(crate) ping_timeout: Duration,
    /// Deadline for the TCP connect itself
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) connect_timeout: Duration,
    /// TLS negotiation settings. `None` connects in the clear.
    #[builder(default = "None")]
    pub(crate) tls: Option<TlsOptions>,
}

impl ConnectOptionsBuilder {
    /// Initialize the [`ConnectOptionsBuilder`] from environment variables
    /// (`MQTT_HOSTNAME`, `MQTT_PORT`, `MQTT_CLIENT_ID`, `MQTT_KEEP_ALIVE`,
    /// `MQTT_CLEAN_SESSION`).
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment
    /// variables are invalid.
    pub fn from_environment() -> Result<Self, String> {
        let hostname = string_from_environment("MQTT_HOSTNAME")?;
        let port = string_from_environment("MQTT_PORT")?
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| format!("MQTT_PORT: {e}"))?;
        let client_id = string_from_environment("MQTT_CLIENT_ID")?;
        let keep_alive = string_from_environment("MQTT_KEEP_ALIVE")?
            .map(|v| v.parse::<u32>().map(u64::from).map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("MQTT_KEEP_ALIVE: {e}"))?;
        let clean_session = string_from_environment("MQTT_CLEAN_SESSION")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("MQTT_CLEAN_SESSION: {e}"))?;

        if hostname.is_none() {
            log::warn!("MQTT_HOSTNAME is not set in environment");
        }

        Ok(Self {
            hostname,
            port,
            client_id,
            clean_session,
            keep_alive,
            operation_timeout: None,
            ping_timeout: None,
            connect_timeout: None,
            tls: None,
        })
    }

    /// Validate the settings.
    ///
    /// # Errors
    /// Returns a `String` describing the error if the combination of settings
    /// is invalid.
    fn validate(&self) -> Result<(), String> {
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() {
                return Err("Host name cannot be empty".to_string());
            }
        }
        let keep_alive = self
            .keep_alive
            .unwrap_or_else(|| Duration::from_secs(1200));
        if keep_alive.as_secs() < 2 || keep_alive.as_secs() > u64::from(u16::MAX) {
            return Err("Keep alive must be between 2 and 65535 seconds".to_string());
        }
        let ping_timeout = self.ping_timeout.unwrap_or_else(|| Duration::from_secs(3));
        if ping_timeout.is_zero() {
            return Err("Ping timeout cannot be zero".to_string());
        }
        // The keep-alive interval must leave room for a ping round trip
        if keep_alive.as_nanos() <= ping_timeout.as_nanos() {
            return Err("Keep alive must be greater than the ping timeout".to_string());
        }
        if let Some(Some(timeout)) = &self.operation_timeout {
            if timeout.is_zero() {
                return Err("Operation timeout cannot be zero".to_string());
            }
        }
        Ok(())
    }
}

/// Produce a client identifier for callers that did not pick one.
pub(crate) fn generate_client_id() -> String {
    format!("tether-{:08x}", rand::thread_rng().gen::<u32>())
}

/// TLS negotiation settings.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    /// Path to a PEM file used to validate server identity.
    /// OS trust roots are used when absent.
    pub ca_file: Option<PathBuf>,
    /// Path to a PEM file used to establish X509 client authentication
    pub cert_file: Option<PathBuf>,
    /// Path to a PEM file containing the key for `cert_file`
    pub key_file: Option<PathBuf>,
    /// Override for the server name checked against the certificate.
    /// The connection hostname is used when absent.
    pub server_name: Option<String>,
}

fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(format!("{key} is not valid unicode")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let options = ConnectOptionsBuilder::default()
            .hostname("localhost")
            .build()
            .unwrap();
        assert_eq!(options.port, 1883);
        assert!(options.clean_session);
        assert_eq!(options.keep_alive, Duration::from_secs(1200));
        assert_eq!(options.ping_timeout, Duration::from_secs(3));
        assert!(options.operation_timeout.is_none());
    }

    #[test]
    fn empty_hostname_is_rejected() {
        assert!(ConnectOptionsBuilder::default()
            .hostname("")
            .build()
            .is_err());
    }

    #[test]
    fn keep_alive_must_exceed_ping_timeout() {
        // 2s keep-alive with a 1s ping timeout is the smallest legal pairing
        assert!(ConnectOptionsBuilder::default()
            .hostname("localhost")
            .keep_alive(Duration::from_secs(2))
            .ping_timeout(Duration::from_secs(1))
            .build()
            .is_ok());
        assert!(ConnectOptionsBuilder::default()
            .hostname("localhost")
            .keep_alive(Duration::from_secs(2))
            .ping_timeout(Duration::from_secs(2))
            .build()
            .is_err());
        assert!(ConnectOptionsBuilder::default()
            .hostname("localhost")
            .keep_alive(Duration::from_secs(1))
            .build()
            .is_err());
    }

    #[test]
    fn generated_client_ids_are_unique_enough() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert!(a.starts_with("tether-"));
        assert_ne!(a, b);
    }
}
