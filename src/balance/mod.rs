// # Load Balancing
//
// Maps `(upstream, agent channel)` to one dst client configuration.
// Policies are registered by kind in an explicit registry owned by the
// service stack, so tests and embedders can swap them without touching
// process-global state. Policies must be pure functions of their
// context and must not retain references from it.

use crate::channel::Channel;
use crate::config::DstClientConfig;
use crate::error::{AgentError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub mod strategies;

pub use strategies::TimeSliceBalancer;

/// Configured balancing policy kind. `Weight`, `IpHash` and
/// `IpHashWeight` are declared but reserved; their registered stubs
/// fall back to the default policy with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadBalanceKind {
    Default,
    Weight,
    IpHash,
    IpHashWeight,
}

impl LoadBalanceKind {
    /// Parse the configuration spelling of a kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "default" => Some(LoadBalanceKind::Default),
            "weight" => Some(LoadBalanceKind::Weight),
            "iphash" => Some(LoadBalanceKind::IpHash),
            "iphash_weight" | "iphashweight" => Some(LoadBalanceKind::IpHashWeight),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceKind::Default => "default",
            LoadBalanceKind::Weight => "weight",
            LoadBalanceKind::IpHash => "iphash",
            LoadBalanceKind::IpHashWeight => "iphash_weight",
        }
    }
}

/// Everything a policy may look at when picking a backend.
pub struct BalanceContext<'a> {
    pub upstream_id: &'a str,
    pub agent_channel: &'a Arc<dyn Channel>,
    pub backends: &'a [DstClientConfig],
}

/// A backend pick policy. Total over a non-empty backend list.
pub trait BalancePolicy: Send + Sync {
    fn pick(&self, ctx: &BalanceContext<'_>) -> Result<DstClientConfig>;

    fn name(&self) -> &'static str;
}

/// Policy table keyed by kind. Registration is open: embedders may
/// override or add policies before the service starts.
pub struct BalancerRegistry {
    policies: RwLock<HashMap<LoadBalanceKind, Arc<dyn BalancePolicy>>>,
}

impl BalancerRegistry {
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the four declared kinds.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(LoadBalanceKind::Default, Arc::new(TimeSliceBalancer));
        registry.register(
            LoadBalanceKind::Weight,
            Arc::new(strategies::ReservedBalancer::new("weight")),
        );
        registry.register(
            LoadBalanceKind::IpHash,
            Arc::new(strategies::ReservedBalancer::new("iphash")),
        );
        registry.register(
            LoadBalanceKind::IpHashWeight,
            Arc::new(strategies::ReservedBalancer::new("iphash_weight")),
        );
        registry
    }

    pub fn register(&self, kind: LoadBalanceKind, policy: Arc<dyn BalancePolicy>) {
        self.policies.write().insert(kind, policy);
    }

    /// Pick a backend with the policy registered for `kind`.
    pub fn pick(&self, kind: LoadBalanceKind, ctx: &BalanceContext<'_>) -> Result<DstClientConfig> {
        let policy = self
            .policies
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| AgentError::Config("unknown load balance type".into()))?;
        policy.pick(ctx)
    }
}

impl Default for BalancerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryChannel;
    use crate::channel::Network;

    fn backends(n: usize) -> Vec<DstClientConfig> {
        (0..n)
            .map(|i| DstClientConfig::new("127.0.0.1", 9100 + i as u16, Network::Ws))
            .collect()
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(LoadBalanceKind::parse("default"), Some(LoadBalanceKind::Default));
        assert_eq!(LoadBalanceKind::parse("IPHASH"), Some(LoadBalanceKind::IpHash));
        assert_eq!(LoadBalanceKind::parse("bogus"), None);
    }

    #[test]
    fn test_registry_picks_registered_policy() {
        let registry = BalancerRegistry::with_defaults();
        let agent = MemoryChannel::new(Network::Ws);
        let agent: Arc<dyn Channel> = agent;
        let backends = backends(3);
        let ctx = BalanceContext {
            upstream_id: "u1",
            agent_channel: &agent,
            backends: &backends,
        };
        let picked = registry.pick(LoadBalanceKind::Default, &ctx).unwrap();
        assert!(backends.iter().any(|b| b.port == picked.port));
        // Reserved kinds resolve through the stub to the same pick rule.
        let reserved = registry.pick(LoadBalanceKind::Weight, &ctx).unwrap();
        assert!(backends.iter().any(|b| b.port == reserved.port));
    }

    #[test]
    fn test_unregistered_kind_is_config_error() {
        let registry = BalancerRegistry::new();
        let agent: Arc<dyn Channel> = MemoryChannel::new(Network::Ws);
        let backends = backends(1);
        let ctx = BalanceContext {
            upstream_id: "u1",
            agent_channel: &agent,
            backends: &backends,
        };
        let err = registry.pick(LoadBalanceKind::Default, &ctx).unwrap_err();
        assert_eq!(err.to_string(), "config error: unknown load balance type");
    }

    #[test]
    fn test_registration_is_open() {
        struct FirstBalancer;
        impl BalancePolicy for FirstBalancer {
            fn pick(&self, ctx: &BalanceContext<'_>) -> crate::error::Result<DstClientConfig> {
                Ok(ctx.backends[0].clone())
            }
            fn name(&self) -> &'static str {
                "first"
            }
        }

        let registry = BalancerRegistry::with_defaults();
        registry.register(LoadBalanceKind::Weight, Arc::new(FirstBalancer));
        let agent: Arc<dyn Channel> = MemoryChannel::new(Network::Ws);
        let backends = backends(3);
        let ctx = BalanceContext {
            upstream_id: "u1",
            agent_channel: &agent,
            backends: &backends,
        };
        let picked = registry.pick(LoadBalanceKind::Weight, &ctx).unwrap();
        assert_eq!(picked.port, 9100);
    }
}
