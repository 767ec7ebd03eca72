use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant identifier. The nil uuid is the system tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub const SYS: TenantId = TenantId(Uuid::nil());

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_sys(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::SYS
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Tenant,
    Device,
    Asset,
    Customer,
    Edge,
    RuleChain,
    RuleNode,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub entity_type: EntityType,
    pub id: Uuid,
}

impl EntityId {
    pub fn new(entity_type: EntityType, id: Uuid) -> Self {
        Self { entity_type, id }
    }

    pub fn device(id: Uuid) -> Self {
        Self::new(EntityType::Device, id)
    }

    pub fn tenant(tenant_id: TenantId) -> Self {
        Self::new(EntityType::Tenant, tenant_id.0)
    }

    /// Stable 64-bit fingerprint used for partition resolution.
    pub fn partition_hash(&self) -> u64 {
        let (hi, lo) = self.id.as_u64_pair();
        hi ^ lo
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]", self.entity_type, self.id)
    }
}

/// Role a cluster node can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Core,
    RuleEngine,
    Transport,
    Edge,
    CalculatedFields,
}

impl ServiceType {
    pub const ALL: [ServiceType; 5] = [
        ServiceType::Core,
        ServiceType::RuleEngine,
        ServiceType::Transport,
        ServiceType::Edge,
        ServiceType::CalculatedFields,
    ];

    /// Base name of the role's topics, before any prefix is applied.
    pub fn topic_base(&self) -> &'static str {
        match self {
            ServiceType::Core => "tb_core",
            ServiceType::RuleEngine => "tb_rule_engine",
            ServiceType::Transport => "tb_transport",
            ServiceType::Edge => "tb_edge",
            ServiceType::CalculatedFields => "tb_cf",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServiceType::Core => "core",
            ServiceType::RuleEngine => "rule_engine",
            ServiceType::Transport => "transport",
            ServiceType::Edge => "edge",
            ServiceType::CalculatedFields => "calculated_fields",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub type ServiceId = String;
