//! Reverse-proxy route registration for vanity domains
//!
//! When domain tunneling is on, every proxy gets `sub.base` routed to its
//! port by an external reverse proxy. The trait lets the server run against
//! Caddy in production and a mock in tests.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

/// Errors from route registration
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("API error: {0}")]
    Api(String),
}

impl From<reqwest::Error> for RouteError {
    fn from(e: reqwest::Error) -> Self {
        RouteError::Request(e.to_string())
    }
}

/// Registers `domain -> port` routes with a reverse proxy
#[async_trait]
pub trait RouteRegistrar: Send + Sync {
    /// Route `domain` to the local `port`
    ///
    /// # Returns
    /// The route ID for later removal
    async fn add_route(&self, domain: &str, port: u16) -> Result<String, RouteError>;

    /// Remove a route by its ID
    async fn remove_route(&self, route_id: &str) -> Result<(), RouteError>;
}

/// Route ID used for a domain/port pair
pub fn route_id(domain: &str, port: u16) -> String {
    format!("{}.{}", domain, port)
}

/// Used when domain tunneling is off
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRoutes;

#[async_trait]
impl RouteRegistrar for NoopRoutes {
    async fn add_route(&self, domain: &str, port: u16) -> Result<String, RouteError> {
        Ok(route_id(domain, port))
    }

    async fn remove_route(&self, _route_id: &str) -> Result<(), RouteError> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CaddyRoute<'a> {
    #[serde(rename = "@id")]
    id: &'a str,
    #[serde(rename = "match")]
    matchers: [CaddyMatch<'a>; 1],
    handle: [CaddyHandler; 1],
}

#[derive(Debug, Serialize)]
struct CaddyMatch<'a> {
    host: [&'a str; 1],
}

#[derive(Debug, Serialize)]
struct CaddyHandler {
    handler: &'static str,
    upstreams: [CaddyUpstream; 1],
}

#[derive(Debug, Serialize)]
struct CaddyUpstream {
    dial: String,
}

/// Caddy admin API client
pub struct CaddyRoutes {
    client: Client,
    admin_url: String,
    server_group: String,
}

impl CaddyRoutes {
    pub fn new(admin_url: &str, server_group: &str) -> Self {
        Self {
            client: Client::new(),
            admin_url: admin_url.trim_end_matches('/').to_string(),
            server_group: server_group.to_string(),
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<(), RouteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(RouteError::Api(format!("{} returned {}: {}", what, status, body)))
    }
}

#[async_trait]
impl RouteRegistrar for CaddyRoutes {
    async fn add_route(&self, domain: &str, port: u16) -> Result<String, RouteError> {
        let id = route_id(domain, port);
        let dial = format!(":{}", port);

        tracing::info!("Adding Caddy route {} -> {}", domain, dial);

        let route = CaddyRoute {
            id: &id,
            matchers: [CaddyMatch { host: [domain] }],
            handle: [CaddyHandler {
                handler: "reverse_proxy",
                upstreams: [CaddyUpstream { dial }],
            }],
        };

        let response = self
            .client
            .post(format!(
                "{}/config/apps/http/servers/{}/routes",
                self.admin_url, self.server_group
            ))
            .json(&route)
            .send()
            .await?;
        Self::check(response, "Adding route").await?;

        let response = self
            .client
            .post(format!(
                "{}/config/apps/tls/automation/policies/0/subjects",
                self.admin_url
            ))
            .json(&domain)
            .send()
            .await?;
        if let Err(e) = Self::check(response, "Adding TLS subject").await {
            // Don't leave a half-registered route behind
            let _ = self.remove_route(&id).await;
            return Err(e);
        }

        tracing::info!("Created Caddy route with ID {}", id);
        Ok(id)
    }

    async fn remove_route(&self, route_id: &str) -> Result<(), RouteError> {
        tracing::info!("Removing Caddy route {}", route_id);

        let response = self
            .client
            .delete(format!("{}/id/{}", self.admin_url, route_id))
            .send()
            .await?;
        Self::check(response, "Removing route").await
    }
}
