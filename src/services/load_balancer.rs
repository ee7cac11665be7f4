//! Reverse-proxy configuration: merging generated routes into the live
//! server map, pushing it back, and the administrative load-balancer
//! operations.
//!
//! The server map belongs to the proxy, not to us. `merge_routes` only ever
//! replaces the route list it owns (a whole server in port mode, a single
//! host subroute in host mode) and leaves every other entry as fetched.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::load_balancer::{
        HandleConfig, RouteConfig, RouteSettings, SUBROUTE_HANDLER, ServerConfig, ServerMap,
    },
    services::{
        orchestrator::Orchestrator,
        policy_store::{self, LB_ROUTE_OVERRIDES, LB_ROUTES, RouteMap, RoutingPolicy},
        routing,
    },
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Wait before pushing, so the triggering transaction can commit and the
/// proxy can finish applying any previous change.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Name of the server block created when none listens on our port.
const SERVER_NAME: &str = "fado_lb";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy admin request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait ProxyAdmin: Send + Sync {
    /// Fetch the proxy's HTTP server map.
    async fn get_servers(&self) -> Result<ServerMap, ProxyError>;

    /// Replace the proxy's HTTP server map.
    async fn replace_servers(&self, servers: &ServerMap) -> Result<(), ProxyError>;
}

/// Caddy admin API client.
pub struct CaddyAdmin {
    client: reqwest::Client,
    servers_url: String,
}

impl CaddyAdmin {
    pub fn new(admin_url: &str) -> Result<Self, ProxyError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            servers_url: format!(
                "{}/config/apps/http/servers/",
                admin_url.trim_end_matches('/')
            ),
        })
    }
}

#[async_trait]
impl ProxyAdmin for CaddyAdmin {
    async fn get_servers(&self) -> Result<ServerMap, ProxyError> {
        let response = self
            .client
            .get(&self.servers_url)
            .send()
            .await?
            .error_for_status()?;
        // An unconfigured HTTP app answers `null`.
        let servers: Option<ServerMap> = response.json().await?;
        Ok(servers.unwrap_or_default())
    }

    async fn replace_servers(&self, servers: &ServerMap) -> Result<(), ProxyError> {
        self.client
            .post(&self.servers_url)
            .json(servers)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

enum Job {
    Push(ServerMap),
    Flush(oneshot::Sender<()>),
}

/// Single-worker queue of proxy pushes.
///
/// Callers enqueue and return immediately. The worker sleeps the settle
/// delay, keeps only the newest topology queued in the meantime, and pushes
/// it once. Failed pushes are logged and dropped; the next reconfiguration
/// sends a complete topology again.
#[derive(Clone)]
pub struct PushQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl PushQueue {
    pub fn spawn(admin: Arc<dyn ProxyAdmin>, settle: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(admin, rx, settle));
        Self { tx }
    }

    pub fn push(&self, servers: ServerMap) {
        if self.tx.send(Job::Push(servers)).is_err() {
            warn!("load balancer push worker is gone; dropping update");
        }
    }

    /// Wait until every push enqueued so far has been attempted.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Job::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    async fn run(
        admin: Arc<dyn ProxyAdmin>,
        mut rx: mpsc::UnboundedReceiver<Job>,
        settle: Duration,
    ) {
        while let Some(job) = rx.recv().await {
            let mut latest = match job {
                Job::Push(servers) => servers,
                Job::Flush(ack) => {
                    let _ = ack.send(());
                    continue;
                }
            };

            tokio::time::sleep(settle).await;

            let mut acks = Vec::new();
            while let Ok(next) = rx.try_recv() {
                match next {
                    Job::Push(servers) => latest = servers,
                    Job::Flush(ack) => acks.push(ack),
                }
            }

            match admin.replace_servers(&latest).await {
                Ok(()) => debug!(servers = latest.len(), "pushed load balancer config"),
                Err(err) => warn!(error = %err, "load balancer push failed"),
            }
            for ack in acks {
                let _ = ack.send(());
            }
        }
    }
}

/// Where generated routes go in the proxy, and how they get there.
#[derive(Clone)]
pub struct LoadBalancer {
    admin: Arc<dyn ProxyAdmin>,
    queue: PushQueue,
    port: String,
    host: Option<String>,
}

impl LoadBalancer {
    pub fn new(admin: Arc<dyn ProxyAdmin>, port: impl Into<String>, host: Option<String>) -> Self {
        Self::with_settle_delay(admin, port, host, SETTLE_DELAY)
    }

    pub fn with_settle_delay(
        admin: Arc<dyn ProxyAdmin>,
        port: impl Into<String>,
        host: Option<String>,
        settle: Duration,
    ) -> Self {
        Self {
            queue: PushQueue::spawn(admin.clone(), settle),
            admin,
            port: port.into(),
            host: host.filter(|h| !h.is_empty()),
        }
    }

    /// Fetch the live servers, splice `routes` in and enqueue the push.
    pub async fn apply(&self, routes: Vec<RouteConfig>) -> ServiceResult<()> {
        let mut servers = self.admin.get_servers().await?;
        merge_routes(&mut servers, &self.port, self.host.as_deref(), routes)?;
        self.queue.push(servers);
        Ok(())
    }

    pub async fn flush(&self) {
        self.queue.flush().await
    }
}

/// Splice `routes` into `servers`.
///
/// Without a host, the server listening on `port` gets its route list
/// replaced outright. With a host, only the subroute matching that host is
/// touched; it is appended if missing. In both modes a server is created
/// when nothing listens on `port`.
pub fn merge_routes(
    servers: &mut ServerMap,
    port: &str,
    host: Option<&str>,
    routes: Vec<RouteConfig>,
) -> ServiceResult<()> {
    if port.is_empty() {
        return Err(ServiceError::validation("load balancer port is not configured"));
    }

    let Some(server) = servers.values_mut().find(|s| s.listens_on(port)) else {
        let routes = match host {
            Some(host) => vec![RouteConfig::host_subroute(host, routes)],
            None => routes,
        };
        let name = if servers.contains_key(SERVER_NAME) {
            format!("{}_{}", SERVER_NAME, port)
        } else {
            SERVER_NAME.to_string()
        };
        servers.insert(
            name,
            ServerConfig {
                listen: vec![format!(":{}", port)],
                routes,
                ..Default::default()
            },
        );
        return Ok(());
    };

    let Some(host) = host else {
        server.routes = routes;
        return Ok(());
    };

    match server.routes.iter_mut().find(|r| r.matches_host(host)) {
        Some(route) => match route
            .handle
            .iter_mut()
            .find(|h| h.handler == SUBROUTE_HANDLER)
        {
            Some(handle) => handle.routes = routes,
            None => route.handle = vec![HandleConfig::subroute(routes)],
        },
        None => server
            .routes
            .push(RouteConfig::host_subroute(host, routes)),
    }
    Ok(())
}

/// Administrative view of the load-balancer state.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadBalancerView {
    pub policy: String,
    pub match_header: String,
    pub routes: RouteMap,
    pub route_overrides: RouteMap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancerSettings {
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub match_header: String,
}

impl Orchestrator {
    /// Regenerate the routing table and hand it to the proxy.
    ///
    /// Store and decode failures while generating propagate. Proxy failures
    /// also propagate here; see `refresh_load_balancer` for the best-effort
    /// variant reconciliation uses.
    pub async fn configure_load_balancer(&self, conn: &mut SqliteConnection) -> ServiceResult<()> {
        let table = routing::generate_routes(conn).await?;
        info!(routes = table.routes.len(), "configuring load balancer");
        self.balancer.apply(table.to_routes()).await
    }

    /// `configure_load_balancer`, with proxy-side failures downgraded to a
    /// warning.
    pub async fn refresh_load_balancer(&self, conn: &mut SqliteConnection) -> ServiceResult<()> {
        match self.configure_load_balancer(conn).await {
            Err(ServiceError::Proxy(err)) => {
                warn!(error = %err, "load balancer reconfiguration failed");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn set_load_balancer_settings(
        &self,
        conn: &mut SqliteConnection,
        settings: &LoadBalancerSettings,
    ) -> ServiceResult<()> {
        if settings.policy.trim().is_empty() || settings.match_header.trim().is_empty() {
            return Err(ServiceError::validation(
                "both policy and match_header are required",
            ));
        }
        RoutingPolicy {
            policy: settings.policy.trim().to_string(),
            match_header: settings.match_header.trim().to_string(),
        }
        .store(conn)
        .await?;
        self.configure_load_balancer(conn).await
    }

    /// Replace the administrator-supplied route overrides, keyed by bucket
    /// name.
    pub async fn set_route_overrides(
        &self,
        conn: &mut SqliteConnection,
        overrides: RouteMap,
    ) -> ServiceResult<()> {
        let mut normalized = RouteMap::new();
        for (bucket_name, settings) in overrides {
            if bucket_name.is_empty() {
                return Err(ServiceError::validation("route override without bucket name"));
            }
            normalized.insert(
                bucket_name.clone(),
                RouteSettings {
                    bucket_name,
                    ..settings
                },
            );
        }
        policy_store::set_global(conn, LB_ROUTE_OVERRIDES, &normalized).await?;
        self.configure_load_balancer(conn).await
    }

    pub async fn get_load_balancer(
        &self,
        conn: &mut SqliteConnection,
    ) -> ServiceResult<LoadBalancerView> {
        let routing = RoutingPolicy::load(conn).await?;
        Ok(LoadBalancerView {
            policy: routing.policy,
            match_header: routing.match_header,
            routes: policy_store::get_global(conn, LB_ROUTES).await?,
            route_overrides: policy_store::get_global(conn, LB_ROUTE_OVERRIDES).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::load_balancer::MatchConfig;
    use serde_json::json;

    fn generated() -> Vec<RouteConfig> {
        vec![
            RouteSettings {
                bucket_name: "photos".into(),
                policy: "random".into(),
                upstreams: vec!["f1:8080".into()],
            }
            .to_route("X-Fado-Bucket"),
        ]
    }

    fn servers(raw: serde_json::Value) -> ServerMap {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn host_mode_leaves_other_hosts_on_the_listener_alone() {
        let mut map = servers(json!({
            "srv0": {
                "listen": [":443"],
                "routes": [
                    {
                        "match": [{"host": ["other.example"]}],
                        "handle": [{"handler": "subroute", "routes": [{"handle": [{"handler": "static_response"}]}]}],
                        "terminal": true
                    },
                    {
                        "match": [{"host": ["lb.example"]}],
                        "handle": [{"handler": "subroute", "routes": []}],
                        "terminal": true
                    }
                ]
            }
        }));
        let other_before = map["srv0"].routes[0].clone();

        merge_routes(&mut map, "443", Some("lb.example"), generated()).unwrap();

        let server = &map["srv0"];
        assert_eq!(server.routes.len(), 2);
        assert_eq!(server.routes[0], other_before);
        let ours = &server.routes[1];
        assert_eq!(ours.terminal, Some(true));
        assert!(ours.matches_host("lb.example"));
        assert_eq!(ours.handle[0].routes, generated());
    }

    #[test]
    fn host_mode_appends_a_subroute_when_the_host_is_unknown() {
        let mut map = servers(json!({
            "srv0": {
                "listen": [":443"],
                "routes": [{"match": [{"host": ["other.example"]}], "terminal": true}]
            }
        }));

        merge_routes(&mut map, "443", Some("lb.example"), generated()).unwrap();

        let routes = &map["srv0"].routes;
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[1], RouteConfig::host_subroute("lb.example", generated()));
    }

    #[test]
    fn host_route_without_subroute_gets_one() {
        let mut map = servers(json!({
            "srv0": {
                "listen": [":443"],
                "routes": [{
                    "match": [{"host": ["lb.example"]}],
                    "handle": [{"handler": "static_response", "body": "soon"}]
                }]
            }
        }));

        merge_routes(&mut map, "443", Some("lb.example"), generated()).unwrap();

        let route = &map["srv0"].routes[0];
        assert_eq!(route.handle, vec![HandleConfig::subroute(generated())]);
        assert_eq!(
            route.matchers,
            vec![MatchConfig {
                host: vec!["lb.example".into()],
                ..Default::default()
            }]
        );
    }

    #[test]
    fn port_mode_replaces_routes_of_the_listening_server_only() {
        let mut map = servers(json!({
            "admin": {"listen": [":8443"], "routes": [{"terminal": true}]},
            "public": {"listen": ["0.0.0.0:443"], "routes": [{"terminal": true}], "automatic_https": {"disable": true}}
        }));

        merge_routes(&mut map, "443", None, generated()).unwrap();

        assert_eq!(map["public"].routes, generated());
        assert_eq!(map["public"].extra["automatic_https"], json!({"disable": true}));
        assert_eq!(map["admin"].routes.len(), 1);
        assert_eq!(map["admin"].routes[0].terminal, Some(true));
    }

    #[test]
    fn missing_server_is_created_on_the_port() {
        let mut map = ServerMap::new();
        merge_routes(&mut map, "443", None, generated()).unwrap();
        assert_eq!(map[SERVER_NAME].listen, vec![":443".to_string()]);
        assert_eq!(map[SERVER_NAME].routes, generated());

        let mut map = ServerMap::new();
        merge_routes(&mut map, "443", Some("lb.example"), generated()).unwrap();
        assert_eq!(
            map[SERVER_NAME].routes,
            vec![RouteConfig::host_subroute("lb.example", generated())]
        );
    }

    #[test]
    fn empty_port_is_rejected() {
        let mut map = ServerMap::new();
        let err = merge_routes(&mut map, "", None, generated()).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn queued_pushes_coalesce_to_the_latest_topology() {
        let proxy = Arc::new(crate::services::testing::FakeProxy::default());
        let queue = PushQueue::spawn(proxy.clone(), Duration::from_millis(20));

        for port in ["1", "2", "3"] {
            let mut map = ServerMap::new();
            merge_routes(&mut map, port, None, Vec::new()).unwrap();
            queue.push(map);
        }
        queue.flush().await;

        let pushes = proxy.pushes();
        assert_eq!(pushes.len(), 1);
        assert!(pushes[0][SERVER_NAME].listens_on("3"));
    }

    #[tokio::test]
    async fn refresh_propagates_a_misconfigured_port() {
        let mut h = crate::services::testing::harness().await;
        h.orchestrator.balancer =
            LoadBalancer::with_settle_delay(h.proxy.clone(), "", None, Duration::ZERO);
        let mut conn = h.pool.acquire().await.unwrap();

        let err = h
            .orchestrator
            .refresh_load_balancer(&mut conn)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}
