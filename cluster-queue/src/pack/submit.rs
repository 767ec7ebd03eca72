use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use uuid::Uuid;

use crate::discovery::{SubmitStrategyConfig, SubmitStrategyType};
use crate::msg::{QueueMsg, QueuePayload};

/// Messages handed to the handler together.
pub type Wave<T> = Vec<(Uuid, Arc<QueueMsg<T>>)>;

/// Waves of one lane are submitted one after another, each once the
/// previous wave fully resolved. Lanes progress independently.
pub type Lane<T> = Vec<Wave<T>>;

/// Splits a pack into lanes and waves according to the queue's submit
/// strategy. Poll order is kept inside every lane.
#[derive(Debug, Clone)]
pub struct SubmitStrategy {
    strategy_type: SubmitStrategyType,
    batch_size: usize,
}

impl SubmitStrategy {
    pub fn new(config: &SubmitStrategyConfig) -> Self {
        Self {
            strategy_type: config.strategy_type,
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn strategy_type(&self) -> SubmitStrategyType {
        self.strategy_type
    }

    pub fn plan<T: QueuePayload>(&self, msgs: &[(Uuid, Arc<QueueMsg<T>>)]) -> Vec<Lane<T>> {
        if msgs.is_empty() {
            return Vec::new();
        }
        match self.strategy_type {
            SubmitStrategyType::Burst => vec![vec![msgs.to_vec()]],
            SubmitStrategyType::Batch => vec![msgs
                .chunks(self.batch_size)
                .map(<[_]>::to_vec)
                .collect()],
            SubmitStrategyType::Sequential => vec![one_by_one(msgs.iter())],
            SubmitStrategyType::SequentialByOriginator => {
                group_by(msgs, |msg| msg.value.originator())
            }
            SubmitStrategyType::SequentialByTenant => group_by(msgs, |msg| msg.value.tenant_id()),
        }
    }
}

fn one_by_one<'a, T: 'a>(msgs: impl Iterator<Item = &'a (Uuid, Arc<QueueMsg<T>>)>) -> Lane<T> {
    msgs.map(|(id, msg)| vec![(*id, Arc::clone(msg))]).collect()
}

/// One sequential lane per key, lanes ordered by first appearance.
fn group_by<T, K, F>(msgs: &[(Uuid, Arc<QueueMsg<T>>)], key: F) -> Vec<Lane<T>>
where
    K: Eq + Hash,
    F: Fn(&QueueMsg<T>) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<Vec<&(Uuid, Arc<QueueMsg<T>>)>> = Vec::new();
    for entry in msgs {
        let slot = *index.entry(key(entry.1.as_ref())).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(entry);
    }
    groups
        .into_iter()
        .map(|group| one_by_one(group.into_iter()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{EntityId, TenantId};
    use crate::msg::{TbMsg, ToRuleEngineMsg};
    use test_case::test_case;

    /// Originators a, b, a, c, b; tenants 1, 1, 2, 2, 1.
    fn pack() -> Vec<(Uuid, Arc<QueueMsg<ToRuleEngineMsg>>)> {
        let tenant = |n| TenantId::new(Uuid::from_u128(n));
        let device = |n| EntityId::device(Uuid::from_u128(n));
        [(1, 10), (1, 11), (2, 10), (2, 12), (1, 11)]
            .into_iter()
            .map(|(t, d)| {
                let tb_msg = TbMsg::new(tenant(t), "POST_TELEMETRY", device(d));
                (
                    Uuid::new_v4(),
                    Arc::new(QueueMsg::new(Uuid::new_v4(), ToRuleEngineMsg::new(tb_msg))),
                )
            })
            .collect()
    }

    fn positions(
        msgs: &[(Uuid, Arc<QueueMsg<ToRuleEngineMsg>>)],
        lanes: &[Lane<ToRuleEngineMsg>],
    ) -> Vec<Vec<Vec<usize>>> {
        let position = |id: &Uuid| msgs.iter().position(|(m, _)| m == id).unwrap();
        lanes
            .iter()
            .map(|lane| {
                lane.iter()
                    .map(|wave| wave.iter().map(|(id, _)| position(id)).collect())
                    .collect()
            })
            .collect()
    }

    #[test_case(SubmitStrategyType::Burst, 2, vec![vec![vec![0, 1, 2, 3, 4]]] ; "burst")]
    #[test_case(SubmitStrategyType::Batch, 2, vec![vec![vec![0, 1], vec![2, 3], vec![4]]] ; "batch")]
    #[test_case(SubmitStrategyType::Sequential, 2, vec![vec![vec![0], vec![1], vec![2], vec![3], vec![4]]] ; "sequential")]
    #[test_case(SubmitStrategyType::SequentialByOriginator, 2, vec![vec![vec![0], vec![2]], vec![vec![1], vec![4]], vec![vec![3]]] ; "sequential by originator")]
    #[test_case(SubmitStrategyType::SequentialByTenant, 2, vec![vec![vec![0], vec![1], vec![4]], vec![vec![2], vec![3]]] ; "sequential by tenant")]
    fn test_plan_keeps_poll_order(
        strategy_type: SubmitStrategyType,
        batch_size: usize,
        expected: Vec<Vec<Vec<usize>>>,
    ) {
        let msgs = pack();
        let strategy = SubmitStrategy::new(&SubmitStrategyConfig {
            strategy_type,
            batch_size,
        });
        assert_eq!(positions(&msgs, &strategy.plan(&msgs)), expected);
    }

    #[test]
    fn test_zero_batch_size_submits_one_at_a_time() {
        let msgs = pack();
        let strategy = SubmitStrategy::new(&SubmitStrategyConfig {
            strategy_type: SubmitStrategyType::Batch,
            batch_size: 0,
        });
        assert_eq!(strategy.plan(&msgs)[0].len(), 5);
    }

    #[test]
    fn test_empty_pack_has_no_lanes() {
        let strategy = SubmitStrategy::new(&SubmitStrategyConfig::default());
        assert!(strategy.plan::<ToRuleEngineMsg>(&[]).is_empty());
    }
}
