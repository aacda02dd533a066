use crate::persistence::BrokerConnection;
use std::fmt;
use std::time::Duration;

/// rumqttc refuses keepalives below this
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Everything needed to open one broker session.
///
/// Built per connect attempt; the password is plaintext and only lives for
/// the duration of that attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_enabled: bool,
    pub keep_alive: Duration,
}

impl ConnectParams {
    /// Parameters for the stored broker record with an already decrypted password
    pub fn from_stored(config: BrokerConnection, password: Option<String>, keep_alive: Duration) -> Self {
        Self {
            host: config.host,
            port: config.port,
            client_id: config.client_id,
            username: config.username,
            password,
            tls_enabled: config.tls_enabled,
            keep_alive,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls_enabled", &self.tls_enabled)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_password() {
        let params = ConnectParams {
            host: "broker.lan".to_string(),
            port: 8883,
            client_id: "iot_server".to_string(),
            username: Some("relay".to_string()),
            password: Some("hunter2".to_string()),
            tls_enabled: true,
            keep_alive: Duration::from_secs(60),
        };
        let rendered = format!("{:?}", params);
        assert!(!rendered.contains("hunter2"));
        assert_eq!(params.endpoint(), "broker.lan:8883");
    }
}
