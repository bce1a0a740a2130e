//! Bundled balancing policies.
//!
//! The default policy slices wallclock time: the backend index is the
//! current epoch second modulo the pool size, so consecutive sessions
//! rotate through the pool once per second without any shared state.
//! The weighted and ip-hash policies are reserved; until they are
//! specified their stubs delegate to the default rule and warn.

use super::{BalanceContext, BalancePolicy};
use crate::config::DstClientConfig;
use crate::error::{AgentError, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Index for a pick made at `now_secs` against a pool of `n`.
fn time_slice_index(now_secs: u64, n: usize) -> usize {
    (now_secs % n as u64) as usize
}

fn pick_by_time(ctx: &BalanceContext<'_>) -> Result<DstClientConfig> {
    if ctx.backends.is_empty() {
        return Err(AgentError::Config(format!(
            "upstream {} has no dstclient configured",
            ctx.upstream_id
        )));
    }
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Ok(ctx.backends[time_slice_index(now_secs, ctx.backends.len())].clone())
}

/// Default policy: wallclock-second round robin.
pub struct TimeSliceBalancer;

impl BalancePolicy for TimeSliceBalancer {
    fn pick(&self, ctx: &BalanceContext<'_>) -> Result<DstClientConfig> {
        pick_by_time(ctx)
    }

    fn name(&self) -> &'static str {
        "default"
    }
}

/// Placeholder for the declared-but-unspecified policies. Warns on
/// every pick and applies the default rule.
pub struct ReservedBalancer {
    name: &'static str,
}

impl ReservedBalancer {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl BalancePolicy for ReservedBalancer {
    fn pick(&self, ctx: &BalanceContext<'_>) -> Result<DstClientConfig> {
        warn!(
            policy = self.name,
            upstream = ctx.upstream_id,
            "load balance policy not implemented, falling back to default"
        );
        pick_by_time(ctx)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_time_slice_rotates() {
        assert_eq!(time_slice_index(0, 3), 0);
        assert_eq!(time_slice_index(1, 3), 1);
        assert_eq!(time_slice_index(2, 3), 2);
        assert_eq!(time_slice_index(3, 3), 0);
    }

    #[test]
    fn test_time_slice_coverage_over_a_minute() {
        // Over any 60 consecutive seconds each backend must be picked
        // at least floor(60/n) - 1 times.
        for n in [1usize, 2, 3, 4, 7] {
            let mut counts: HashMap<usize, usize> = HashMap::new();
            for second in 1000..1060u64 {
                *counts.entry(time_slice_index(second, n)).or_default() += 1;
            }
            let floor = 60 / n;
            for index in 0..n {
                let count = counts.get(&index).copied().unwrap_or(0);
                assert!(
                    count + 1 >= floor,
                    "backend {} of {} picked {} times",
                    index,
                    n,
                    count
                );
            }
        }
    }
}
