use std::env;
use std::time::Duration;

use transport_negotiation::SessionConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// First path segment of the echo and portal routes.
    pub prefix: String,
    /// How long an echo session may take to open its `echo` channel.
    pub session_ttl: Duration,
    /// Number of portal bots; zero disables `/join`.
    pub portal_slots: usize,
    /// Template for every server-side session.
    pub session: SessionConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("SIGNAL_ECHO_PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(defaults.port),
            prefix: env::var("SIGNAL_ECHO_PREFIX")
                .ok()
                .map(|prefix| prefix.trim_matches('/').to_string())
                .filter(|prefix| !prefix.is_empty())
                .unwrap_or(defaults.prefix),
            session_ttl: env::var("SIGNAL_ECHO_SESSION_TTL_SECS")
                .ok()
                .and_then(|secs| secs.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_ttl),
            portal_slots: env::var("SIGNAL_ECHO_PORTAL_SLOTS")
                .ok()
                .and_then(|slots| slots.parse().ok())
                .unwrap_or(defaults.portal_slots),
            session: SessionConfig::from_env("signal-echo"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            prefix: "test".to_string(),
            session_ttl: Duration::from_secs(15),
            portal_slots: 0,
            session: SessionConfig::new("signal-echo"),
        }
    }
}
