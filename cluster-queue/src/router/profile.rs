use dashmap::DashMap;
use uuid::Uuid;

use crate::discovery::{EntityId, TenantId};

/// Where an entity's profile sends its rule-engine traffic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleEngineProfile {
    pub queue_name: Option<String>,
    pub rule_chain_id: Option<Uuid>,
}

/// Lookup of device/asset profiles consulted before pushing to the rule engine.
#[cfg_attr(test, mockall::automock)]
pub trait ProfileCache: Send + Sync {
    fn rule_engine_profile(
        &self,
        tenant_id: TenantId,
        entity_id: &EntityId,
    ) -> anyhow::Result<Option<RuleEngineProfile>>;
}

#[derive(Default)]
pub struct InMemoryProfileCache {
    profiles: DashMap<(TenantId, EntityId), RuleEngineProfile>,
}

impl InMemoryProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: TenantId, entity_id: EntityId, profile: RuleEngineProfile) {
        self.profiles.insert((tenant_id, entity_id), profile);
    }

    pub fn evict(&self, tenant_id: TenantId, entity_id: &EntityId) {
        self.profiles.remove(&(tenant_id, *entity_id));
    }
}

impl ProfileCache for InMemoryProfileCache {
    fn rule_engine_profile(
        &self,
        tenant_id: TenantId,
        entity_id: &EntityId,
    ) -> anyhow::Result<Option<RuleEngineProfile>> {
        Ok(self
            .profiles
            .get(&(tenant_id, *entity_id))
            .map(|p| p.value().clone()))
    }
}
