use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// STUN/TURN server entry handed to the connection primitive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn with_credentials(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::new("stun:stun.l.google.com:19302"),
        IceServer::new("stun:freestun.net:3478"),
    ]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IceTimeouts {
    pub disconnected: Duration,
    pub failed: Duration,
    pub keep_alive: Duration,
}

impl Default for IceTimeouts {
    fn default() -> Self {
        Self {
            disconnected: Duration::from_secs(5),
            failed: Duration::from_secs(25),
            keep_alive: Duration::from_secs(2),
        }
    }
}

/// Per-session settings consumed by the negotiation core.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Name used in logs and as the registry key.
    pub label: String,
    /// The polite side yields to a colliding inbound offer.
    pub polite: bool,
    /// Promote negotiation chatter from trace to debug.
    pub debug: bool,
    pub ice_servers: Vec<IceServer>,
    /// Roll back a local offer explicitly before applying a colliding remote
    /// offer. Required by primitives that do not roll back on their own.
    pub explicit_rollback: bool,
    pub ice_timeouts: IceTimeouts,
}

impl SessionConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            polite: false,
            debug: false,
            ice_servers: default_ice_servers(),
            explicit_rollback: true,
            ice_timeouts: IceTimeouts::default(),
        }
    }

    pub fn builder(label: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: Self::new(label),
        }
    }

    pub fn from_env(label: impl Into<String>) -> Self {
        let mut config = Self::new(label);
        config.polite = env_flag("NEGOTIATION_POLITE").unwrap_or(false);
        config.debug = env_flag("NEGOTIATION_DEBUG").unwrap_or(false);
        config.explicit_rollback = env_flag("NEGOTIATION_EXPLICIT_ROLLBACK").unwrap_or(true);
        if let Ok(urls) = env::var("NEGOTIATION_ICE_SERVERS") {
            let username = env::var("NEGOTIATION_TURN_USERNAME").ok();
            let credential = env::var("NEGOTIATION_TURN_CREDENTIAL").ok();
            config.ice_servers = parse_ice_servers(&urls, username, credential);
        }
        config
    }

    /// Copy of this config with a different label and role, used when one
    /// template spawns many sessions.
    pub fn derive(&self, label: impl Into<String>, polite: bool) -> Self {
        Self {
            label: label.into(),
            polite,
            ..self.clone()
        }
    }
}

pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn polite(mut self, polite: bool) -> Self {
        self.config.polite = polite;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.config.ice_servers = servers;
        self
    }

    pub fn add_ice_server(mut self, server: IceServer) -> Self {
        self.config.ice_servers.push(server);
        self
    }

    /// No STUN/TURN servers; only host candidates are gathered.
    pub fn localhost_only(mut self) -> Self {
        self.config.ice_servers.clear();
        self
    }

    pub fn explicit_rollback(mut self, explicit: bool) -> Self {
        self.config.explicit_rollback = explicit;
        self
    }

    pub fn ice_timeouts(mut self, timeouts: IceTimeouts) -> Self {
        self.config.ice_timeouts = timeouts;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

fn parse_ice_servers(
    urls: &str,
    username: Option<String>,
    credential: Option<String>,
) -> Vec<IceServer> {
    urls.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| {
            let mut server = IceServer::new(url);
            if url.starts_with("turn:") || url.starts_with("turns:") {
                server.username = username.clone();
                server.credential = credential.clone();
            }
            server
        })
        .collect()
}

/// Options for explicitly created data channels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Both sides create the channel with an agreed id instead of announcing
    /// it in-band.
    pub pre_negotiated: bool,
    /// Shared id for pre-negotiated channels. Assigned from the session's
    /// counter when absent.
    pub id: Option<u16>,
    pub ordered: Option<bool>,
    pub max_retransmits: Option<u16>,
    pub max_packet_life_time: Option<u16>,
    pub protocol: Option<String>,
}

impl ChannelOptions {
    pub fn pre_negotiated(id: Option<u16>) -> Self {
        Self {
            pre_negotiated: true,
            id,
            ..Default::default()
        }
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = Some(ordered);
        self
    }

    pub fn max_retransmits(mut self, max_retransmits: u16) -> Self {
        self.max_retransmits = Some(max_retransmits);
        self
    }

    pub fn max_packet_life_time(mut self, millis: u16) -> Self {
        self.max_packet_life_time = Some(millis);
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_credentials_only_apply_to_turn_urls() {
        let servers = parse_ice_servers(
            "stun:a.example:3478, turn:b.example:3478,,",
            Some("user".into()),
            Some("secret".into()),
        );
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].username, None);
        assert_eq!(servers[1].urls, vec!["turn:b.example:3478".to_string()]);
        assert_eq!(servers[1].username.as_deref(), Some("user"));
        assert_eq!(servers[1].credential.as_deref(), Some("secret"));
    }

    #[test]
    fn empty_server_list_means_localhost_only() {
        assert!(parse_ice_servers("", None, None).is_empty());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = SessionConfig::builder("peer")
            .polite(true)
            .debug(true)
            .localhost_only()
            .explicit_rollback(false)
            .build();
        assert_eq!(config.label, "peer");
        assert!(config.polite);
        assert!(config.debug);
        assert!(config.ice_servers.is_empty());
        assert!(!config.explicit_rollback);

        let derived = config.derive("other", false);
        assert_eq!(derived.label, "other");
        assert!(!derived.polite);
        assert!(derived.debug);
    }
}
