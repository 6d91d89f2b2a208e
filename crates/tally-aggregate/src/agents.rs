use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lru::LruCache;
use tally_core::timefmt::is_sentinel;
use tally_core::{AgentInvocation, Result, StatsError};

use crate::merge::Aggregate;
use crate::snapshot::{ratio, AgentSnapshot};
use crate::tdigest::{TDigest, DEFAULT_MAX_CENTROIDS};
use crate::welford::Welford;

pub const DEFAULT_MAX_AGENTS: usize = 1000;

#[derive(Debug, Clone)]
struct AgentData {
    invocations: u64,
    success: u64,
    failure: u64,
    total_duration_ms: i64,
    welford: Welford,
    digest: TDigest,
}

impl AgentData {
    fn new(max_centroids: usize) -> Self {
        Self {
            invocations: 0,
            success: 0,
            failure: 0,
            total_duration_ms: 0,
            welford: Welford::new(),
            digest: TDigest::new(max_centroids),
        }
    }

    fn snapshot(&self, agent: &str) -> AgentSnapshot {
        AgentSnapshot {
            agent: agent.to_string(),
            invocations: self.invocations,
            success_count: self.success,
            failure_count: self.failure,
            success_rate: ratio(self.success, self.invocations),
            total_duration_ms: self.total_duration_ms,
            avg_duration_ms: self.welford.mean(),
            std_dev_ms: self.welford.std_dev(),
            min_duration_ms: self.welford.min(),
            max_duration_ms: self.welford.max(),
            p50_duration_ms: self.digest.quantile(0.5),
            p95_duration_ms: self.digest.quantile(0.95),
            p99_duration_ms: self.digest.quantile(0.99),
        }
    }
}

/// Per-agent statistics, bounded to the most recently accessed agents.
///
/// Updates and single-agent lookups both count as access. When the cap is
/// reached the least recently accessed agent is evicted and its history is lost.
pub struct AgentAggregator {
    max_centroids: usize,
    agents: RwLock<LruCache<String, AgentData>>,
}

impl Default for AgentAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGENTS, DEFAULT_MAX_CENTROIDS)
    }
}

impl AgentAggregator {
    pub fn new(max_agents: usize, max_centroids: usize) -> Self {
        let cap = NonZeroUsize::new(max_agents).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_centroids,
            agents: RwLock::new(LruCache::new(cap)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LruCache<String, AgentData>> {
        self.agents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LruCache<String, AgentData>> {
        self.agents.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn process_agent_invocation(&self, inv: &AgentInvocation) -> Result<()> {
        validate(inv)?;
        let mut agents = self.write();
        evict_if_full(&mut agents, &inv.agent);
        let max_centroids = self.max_centroids;
        let data = agents.get_or_insert_mut(inv.agent.clone(), || AgentData::new(max_centroids));
        data.invocations += 1;
        if inv.success {
            data.success += 1;
        } else {
            data.failure += 1;
        }
        data.total_duration_ms += inv.duration_ms;
        data.welford.update(inv.duration_ms as f64);
        data.digest.add(inv.duration_ms as f64);
        Ok(())
    }

    pub fn agent_stats(&self, agent: &str) -> Result<AgentSnapshot> {
        self.write()
            .get(agent)
            .map(|data| data.snapshot(agent))
            .ok_or_else(|| StatsError::not_found("agent", agent))
    }

    /// All tracked agents, busiest first.
    pub fn all_agent_stats(&self) -> Vec<AgentSnapshot> {
        let mut all: Vec<AgentSnapshot> = self
            .read()
            .iter()
            .map(|(name, data)| data.snapshot(name))
            .collect();
        all.sort_by(|a, b| b.invocations.cmp(&a.invocations).then(a.agent.cmp(&b.agent)));
        all
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.read().cap().get()
    }
}

impl Aggregate for AgentAggregator {
    fn kind(&self) -> &'static str {
        "agent-aggregator"
    }

    fn reset(&self) {
        self.write().clear();
    }

    fn merge_from(&self, other: &dyn Aggregate) -> Result<()> {
        let other = crate::merge::downcast::<Self>(self, other)?;
        // Oldest first so recency survives the copy.
        let incoming: Vec<(String, AgentData)> = other
            .read()
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut agents = self.write();
        for (name, theirs) in incoming {
            match agents.get_mut(&name) {
                Some(ours) => {
                    ours.invocations += theirs.invocations;
                    ours.success += theirs.success;
                    ours.failure += theirs.failure;
                    ours.total_duration_ms += theirs.total_duration_ms;
                }
                None => {
                    evict_if_full(&mut agents, &name);
                    agents.put(name, theirs);
                }
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn validate(inv: &AgentInvocation) -> Result<()> {
    if inv.agent.trim().is_empty() {
        return Err(StatsError::invalid_invocation("empty agent name"));
    }
    if inv.session.is_empty() {
        return Err(StatsError::invalid_invocation("empty session"));
    }
    if is_sentinel(inv.ts) {
        return Err(StatsError::invalid_invocation("missing timestamp"));
    }
    if !inv.confidence.is_finite() || !(0.0..=1.0).contains(&inv.confidence) {
        return Err(StatsError::invalid_invocation(format!(
            "confidence {} outside [0, 1]",
            inv.confidence
        )));
    }
    Ok(())
}

fn evict_if_full(agents: &mut LruCache<String, AgentData>, incoming: &str) {
    if agents.len() < agents.cap().get() || agents.contains(incoming) {
        return;
    }
    if let Some((evicted, _)) = agents.pop_lru() {
        tracing::debug!(agent = %evicted, "agent statistics evicted");
    }
}
