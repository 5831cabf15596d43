//! Mock route registrar for E2E tests
//!
//! Tracks routes in memory instead of calling a Caddy admin API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use undertow_server::{route_id, RouteError, RouteRegistrar};

/// Route registrar that records operations without a reverse proxy
#[derive(Default)]
pub struct MockRouteRegistrar {
    /// route_id -> (domain, port)
    routes: DashMap<String, (String, u16)>,
    fail_add: AtomicBool,
}

impl MockRouteRegistrar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Port a domain is routed to, if any
    pub fn port_for(&self, domain: &str) -> Option<u16> {
        self.routes
            .iter()
            .find(|r| r.value().0 == domain)
            .map(|r| r.value().1)
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.port_for(domain).is_some()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Make every following add fail until reset
    pub fn set_fail_add(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RouteRegistrar for MockRouteRegistrar {
    async fn add_route(&self, domain: &str, port: u16) -> Result<String, RouteError> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(RouteError::Api("Simulated add failure".into()));
        }

        let id = route_id(domain, port);
        self.routes
            .insert(id.clone(), (domain.to_string(), port));
        tracing::debug!("MockRouteRegistrar: added {} -> {}", domain, port);
        Ok(id)
    }

    async fn remove_route(&self, route_id: &str) -> Result<(), RouteError> {
        self.routes.remove(route_id);
        tracing::debug!("MockRouteRegistrar: removed {}", route_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_remove_route() {
        let routes = MockRouteRegistrar::new();

        let id = routes.add_route("app.test.local", 9000).await.unwrap();
        assert_eq!(id, "app.test.local.9000");
        assert_eq!(routes.port_for("app.test.local"), Some(9000));

        routes.remove_route(&id).await.unwrap();
        assert!(!routes.has_domain("app.test.local"));
        assert_eq!(routes.route_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_simulation() {
        let routes = MockRouteRegistrar::new();
        routes.set_fail_add(true);
        assert!(routes.add_route("app.test.local", 9000).await.is_err());
        routes.set_fail_add(false);
        assert!(routes.add_route("app.test.local", 9000).await.is_ok());
    }
}
