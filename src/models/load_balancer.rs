//! Reverse-proxy (Caddy) configuration tree and the route settings derived
//! from it.
//!
//! Only the fields the merger reads or writes are typed. Everything else the
//! proxy returns is captured in `extra` and written back untouched, so a
//! round trip through these types never drops configuration owned by someone
//! else.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Handler name of a nested route list.
pub const SUBROUTE_HANDLER: &str = "subroute";

/// Handler name of the weighted upstream proxy.
pub const REVERSE_PROXY_HANDLER: &str = "reverse_proxy";

/// `apps.http.servers` of the proxy, keyed by server name.
pub type ServerMap = BTreeMap<String, ServerConfig>;

/// One HTTP server block.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ServerConfig {
    /// Listener addresses, e.g. `:443` or `0.0.0.0:443`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listen: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerConfig {
    /// Whether any listener of this server binds `port`.
    pub fn listens_on(&self, port: &str) -> bool {
        let suffix = format!(":{}", port);
        self.listen.iter().any(|addr| addr.ends_with(&suffix))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RouteConfig {
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<MatchConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handle: Vec<HandleConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RouteConfig {
    /// Whether any matcher set of this route names `host`.
    pub fn matches_host(&self, host: &str) -> bool {
        self.matchers
            .iter()
            .any(|m| m.host.iter().any(|h| h == host))
    }

    /// A terminal route matching `host` that delegates to `routes`.
    pub fn host_subroute(host: &str, routes: Vec<RouteConfig>) -> Self {
        Self {
            matchers: vec![MatchConfig {
                host: vec![host.to_string()],
                ..Default::default()
            }],
            handle: vec![HandleConfig::subroute(routes)],
            terminal: Some(true),
            extra: Map::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MatchConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct HandleConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub handler: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<LoadBalancingConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HandleConfig {
    pub fn subroute(routes: Vec<RouteConfig>) -> Self {
        Self {
            handler: SUBROUTE_HANDLER.to_string(),
            routes,
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LoadBalancingConfig {
    #[serde(default, skip_serializing_if = "SelectionPolicyConfig::is_empty")]
    pub selection_policy: SelectionPolicyConfig,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SelectionPolicyConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SelectionPolicyConfig {
    fn is_empty(&self) -> bool {
        self.policy.is_empty() && self.extra.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct UpstreamConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dial: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Routing decision for one bucket, as persisted under `lb_routes` and
/// supplied by administrators under `lb_route_overrides`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RouteSettings {
    #[serde(default)]
    pub bucket_name: String,

    /// Upstream selection policy (`random`, `round_robin`, ...).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy: String,

    /// Ordered, de-duplicated upstream addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<String>,
}

impl RouteSettings {
    /// Render the proxy route: match `match_header == bucket_name`, dispatch
    /// to a weighted reverse proxy over the non-empty upstreams.
    pub fn to_route(&self, match_header: &str) -> RouteConfig {
        let mut header = BTreeMap::new();
        header.insert(match_header.to_string(), vec![self.bucket_name.clone()]);

        let upstreams = self
            .upstreams
            .iter()
            .filter(|u| !u.is_empty())
            .map(|u| UpstreamConfig {
                dial: u.clone(),
                extra: Map::new(),
            })
            .collect();

        RouteConfig {
            matchers: vec![MatchConfig {
                header,
                ..Default::default()
            }],
            handle: vec![HandleConfig {
                handler: REVERSE_PROXY_HANDLER.to_string(),
                load_balancing: Some(LoadBalancingConfig {
                    selection_policy: SelectionPolicyConfig {
                        policy: self.policy.clone(),
                        extra: Map::new(),
                    },
                    extra: Map::new(),
                }),
                upstreams,
                ..Default::default()
            }],
            terminal: None,
            extra: Map::new(),
        }
    }
}
