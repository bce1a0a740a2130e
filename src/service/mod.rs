// # Service
//
// Top-level container: owns one agent server and the set of upstreams
// built from configuration. Start binds the listener; stop tears the
// server down first and then releases every upstream's channel pairs.
// The lifecycle is `INIT -> RUNNING -> STOPPED`; stop is idempotent
// and a second call is a logged no-op.

use crate::balance::BalancerRegistry;
use crate::config::ServiceConfig;
use crate::error::{AgentError, Result};
use crate::extension::Extension;
use crate::server::AgServer;
use crate::upstream::{Upstream, UpstreamShared};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Weak};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Init,
    Running,
    Stopped,
}

pub struct Service {
    conf: ServiceConfig,
    extension: Arc<dyn Extension>,
    balancers: Arc<BalancerRegistry>,
    upstreams: DashMap<String, Arc<dyn Upstream>>,
    server: parking_lot::RwLock<Option<Arc<AgServer>>>,
    state: parking_lot::Mutex<ServiceState>,
    self_ref: OnceCell<Weak<Service>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}

impl Service {
    /// Build a service with the stock balancer registry.
    pub fn new(conf: ServiceConfig, extension: Arc<dyn Extension>) -> Result<Arc<Self>> {
        Self::with_balancers(conf, extension, Arc::new(BalancerRegistry::with_defaults()))
    }

    /// Build a service with a caller-supplied balancer registry, for
    /// embedders registering their own policies.
    pub fn with_balancers(
        conf: ServiceConfig,
        extension: Arc<dyn Extension>,
        balancers: Arc<BalancerRegistry>,
    ) -> Result<Arc<Self>> {
        conf.validate()?;
        let service = Arc::new(Self {
            conf,
            extension,
            balancers,
            upstreams: DashMap::new(),
            server: parking_lot::RwLock::new(None),
            state: parking_lot::Mutex::new(ServiceState::Init),
            self_ref: OnceCell::new(),
        });
        let _ = service.self_ref.set(Arc::downgrade(&service));

        let shared = UpstreamShared {
            balancers: service.balancers.clone(),
            channel: service.conf.channel.clone(),
            read_pool: service.conf.read_pool.clone(),
        };
        for (id, ups_conf) in &service.conf.upstreams {
            let upstream = service.extension.create_upstream(
                service.extension.clone(),
                ups_conf.clone(),
                shared.clone(),
            )?;
            service.upstreams.insert(id.clone(), upstream);
        }
        info!(
            service = %service.conf.id,
            upstreams = service.upstreams.len(),
            "service built"
        );
        Ok(service)
    }

    pub fn conf(&self) -> &ServiceConfig {
        &self.conf
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn upstream(&self, id: &str) -> Option<Arc<dyn Upstream>> {
        self.upstreams.get(id).map(|e| e.value().clone())
    }

    /// The agent server, once the service is running.
    pub fn server(&self) -> Option<Arc<AgServer>> {
        self.server.read().clone()
    }

    /// Live channel pairs across all upstreams.
    pub fn peer_total(&self) -> usize {
        self.upstreams.iter().map(|e| e.value().peer_count()).sum()
    }

    /// Bind the listener and enter RUNNING. Fails when the service
    /// already ran.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock();
            if *state != ServiceState::Init {
                return Err(AgentError::Internal(format!(
                    "service already started, id:{}",
                    self.conf.id
                )));
            }
        }
        info!(service = %self.conf.id, "starting service");
        let server = AgServer::new(
            Arc::downgrade(self),
            self.conf.ag_server.clone(),
            self.conf.channel.clone(),
            &self.conf.read_pool,
            self.extension.clone(),
        );
        server.listen().await?;
        *self.server.write() = Some(server);
        *self.state.lock() = ServiceState::Running;
        info!(service = %self.conf.id, "service running");
        Ok(())
    }

    /// Stop the server, then release every upstream's pairs. Safe to
    /// call repeatedly.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != ServiceState::Running {
                info!(service = %self.conf.id, "service not running, stop is a no-op");
                return;
            }
            *state = ServiceState::Stopped;
        }
        info!(service = %self.conf.id, "stopping service");
        if let Some(server) = self.server.write().take() {
            server.stop();
        }
        let upstreams: Vec<Arc<dyn Upstream>> =
            self.upstreams.iter().map(|e| e.value().clone()).collect();
        for upstream in upstreams {
            upstream.release_channel_peers();
        }
        info!(service = %self.conf.id, "service stopped");
    }
}
