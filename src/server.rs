//! The routing table mapping requested hostnames to configured servers,
//! plus the status-override and message-template machinery applied per
//! server.

use crate::config::{ServerConfig, StatusOverride};
use crate::protocol::status::{PlayerSampleJson, ResponseJson};
use arc_swap::ArcSwap;
use std::sync::Arc;

pub const DEFAULT_OFFLINE_KICK: &str = "Server is offline.";

/// An immutable snapshot of the configured servers, swapped atomically on
/// reload. Routing walks the servers in configuration order; the first
/// matching domain wins.
#[derive(Debug, Default)]
pub struct ServerTable {
    servers: Vec<Arc<ServerConfig>>,
}

/// Shared handle to the active table. Each dispatch loads one snapshot and
/// keeps it for the connection's lifetime.
pub type SharedServerTable = Arc<ArcSwap<ServerTable>>;

/// A routing decision: the server that won and the pattern that matched.
#[derive(Debug, Clone)]
pub struct Matched {
    pub server: Arc<ServerConfig>,
    pub pattern: String,
}

impl ServerTable {
    pub fn new(servers: impl IntoIterator<Item = ServerConfig>) -> Self {
        Self {
            servers: servers.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn route(&self, host: &str) -> Option<Matched> {
        for server in &self.servers {
            for pattern in &server.domains {
                if wildcard_match(pattern, host) {
                    return Some(Matched {
                        server: Arc::clone(server),
                        pattern: pattern.clone(),
                    });
                }
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Matches `text` against `pattern`, where `*` stands for any run of
/// characters (possibly empty). No other metacharacters.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();

    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pi < pattern.len() && pattern[pi] == b'*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < pattern.len() && pattern[pi] == text[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star_pi, star_ti)) = backtrack {
            // Let the last star swallow one more character.
            pi = star_pi + 1;
            ti = star_ti + 1;
            backtrack = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == b'*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// Values substituted into MOTD and kick-message templates. Unknown tokens
/// pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub username: String,
    pub remote_addr: String,
    pub local_addr: String,
    pub matched_address: String,
    pub gateway_id: String,
}

impl MessageContext {
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{{username}}", &self.username)
            .replace("{{remoteAddress}}", &self.remote_addr)
            .replace("{{localAddress}}", &self.local_addr)
            .replace("{{matchedAddress}}", &self.matched_address)
            .replace("{{gatewayId}}", &self.gateway_id)
    }
}

/// Builds a status response locally from an override, without a backend.
/// Unset fields fall back to a neutral skeleton that advertises the
/// client's own protocol version.
pub fn synthesize_status(
    over: &StatusOverride,
    protocol_version: i32,
    ctx: &MessageContext,
) -> ResponseJson {
    let mut response = offline_status(protocol_version);
    response.description.text.clear();
    apply_status_override(over, &mut response, ctx);
    response
}

/// Replaces the set override fields in `response`.
pub fn apply_status_override(over: &StatusOverride, response: &mut ResponseJson, ctx: &MessageContext) {
    if let Some(name) = &over.version_name {
        response.version.name = name.clone();
    }
    if let Some(protocol) = over.protocol_number {
        response.version.protocol = protocol;
    }
    if let Some(max) = over.max_player_count {
        response.players.max = max;
    }
    if let Some(online) = over.player_count {
        response.players.online = online;
    }
    if !over.player_samples.is_empty() {
        response.players.sample = over
            .player_samples
            .iter()
            .map(|sample| PlayerSampleJson {
                name: sample.name.clone(),
                id: sample.uuid.clone(),
            })
            .collect();
    }
    if let Some(motd) = &over.motd {
        response.description.text = ctx.expand(motd);
    }
    if let Some(icon) = &over.icon {
        response.favicon = icon.clone();
    }
}

/// The synthetic response sent when no backend answers: no match on a
/// status request, or a failed status dial.
pub fn offline_status(protocol_version: i32) -> ResponseJson {
    let mut response = ResponseJson::default();
    response.version.name = "Infrared".to_owned();
    response.version.protocol = protocol_version;
    response.description.text = "Offline".to_owned();
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(domains: &[&str], address: &str) -> ServerConfig {
        ServerConfig {
            domains: domains.iter().map(|s| s.to_string()).collect(),
            address: address.to_owned(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn wildcard_semantics() {
        assert!(wildcard_match("*.example.com", "a.example.com"));
        assert!(wildcard_match("*.example.com", "a.b.example.com"));
        assert!(!wildcard_match("*.example.com", "example.com"));
        assert!(wildcard_match("*", "anything.at.all"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("", ""));
        assert!(!wildcard_match("", "x"));
        assert!(wildcard_match("mc.*.net", "mc.example.net"));
        assert!(!wildcard_match("mc.*.net", "mc.example.org"));
    }

    #[test]
    fn first_configured_server_wins() {
        let table = ServerTable::new([
            server(&["*.example.com"], "10.0.0.1:25565"),
            server(&["a.example.com"], "10.0.0.2:25565"),
        ]);
        let matched = table.route("a.example.com").unwrap();
        assert_eq!(matched.server.address, "10.0.0.1:25565");
        assert_eq!(matched.pattern, "*.example.com");
    }

    #[test]
    fn no_match_is_none() {
        let table = ServerTable::new([server(&["example.com"], "10.0.0.1:25565")]);
        assert!(table.route("unknown").is_none());
    }

    #[test]
    fn empty_host_routes_to_empty_or_star_domain() {
        let table = ServerTable::new([
            server(&["example.com"], "10.0.0.1:25565"),
            server(&[""], "10.0.0.2:25565"),
        ]);
        assert_eq!(table.route("").unwrap().server.address, "10.0.0.2:25565");

        let table = ServerTable::new([server(&["*"], "10.0.0.3:25565")]);
        assert_eq!(table.route("").unwrap().server.address, "10.0.0.3:25565");
    }

    #[test]
    fn override_merges_set_fields_only() {
        let over = StatusOverride {
            player_count: Some(3),
            motd: Some("hi".to_owned()),
            ..StatusOverride::default()
        };
        let mut response = offline_status(762);
        response.players.max = 100;
        apply_status_override(&over, &mut response, &MessageContext::default());
        assert_eq!(response.players.online, 3);
        assert_eq!(response.players.max, 100);
        assert_eq!(response.description.text, "hi");
        assert_eq!(response.version.protocol, 762);
    }

    #[test]
    fn synthesized_status_expands_motd_templates() {
        let over = StatusOverride {
            motd: Some("Hello {{username}} from {{gatewayId}}".to_owned()),
            ..StatusOverride::default()
        };
        let ctx = MessageContext {
            username: "Steve".to_owned(),
            gateway_id: "edge-1".to_owned(),
            ..MessageContext::default()
        };
        let response = synthesize_status(&over, 762, &ctx);
        assert_eq!(response.description.text, "Hello Steve from edge-1");
    }

    #[test]
    fn unknown_template_tokens_pass_through() {
        let ctx = MessageContext::default();
        assert_eq!(ctx.expand("{{color}} stays"), "{{color}} stays");
    }
}
