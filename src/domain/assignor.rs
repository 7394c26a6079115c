//! パーティション割り当て戦略。
//!
//! - `RangeAssignor`: トピックごとに連続したパーティション範囲を割り当てる
//! - `RoundRobinAssignor`: 全トピックのパーティションを順番に配る
//! - `StickyAssignor`: 前回の割り当てをできる限り維持しつつ均等化する
//!
//! Kafka 本体ではブローカー側（librdkafka）が割り当てを行うため、
//! このモジュールはインメモリブローカーと設定検証で使用される。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::domain::entity::TopicPartition;

/// GroupMember は割り当て計算に必要なグループメンバー情報。
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub member_id: String,
    pub subscriptions: Vec<String>,
    /// 直前の世代で所有していたパーティション（sticky 用）
    pub owned: Vec<TopicPartition>,
}

impl GroupMember {
    pub fn new(member_id: impl Into<String>, subscriptions: Vec<String>) -> Self {
        Self {
            member_id: member_id.into(),
            subscriptions,
            owned: Vec::new(),
        }
    }

    fn subscribes(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|t| t == topic)
    }
}

/// 割り当て結果。メンバー ID ごとのパーティション一覧（昇順）。
pub type Assignment = BTreeMap<String, Vec<TopicPartition>>;

/// PartitionAssignor はパーティション割り当て戦略のインターフェース。
pub trait PartitionAssignor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `topic_partitions` はトピック名からパーティション数への写像。
    fn assign(&self, members: &[GroupMember], topic_partitions: &BTreeMap<String, i32>)
        -> Assignment;
}

fn empty_assignment(members: &[GroupMember]) -> Assignment {
    members
        .iter()
        .map(|m| (m.member_id.clone(), Vec::new()))
        .collect()
}

fn sorted_members(members: &[GroupMember]) -> Vec<&GroupMember> {
    let mut sorted: Vec<&GroupMember> = members.iter().collect();
    sorted.sort_by(|a, b| a.member_id.cmp(&b.member_id));
    sorted
}

fn all_partitions(topic_partitions: &BTreeMap<String, i32>) -> Vec<TopicPartition> {
    topic_partitions
        .iter()
        .flat_map(|(topic, &count)| (0..count).map(move |p| TopicPartition::new(topic.clone(), p)))
        .collect()
}

/// トピックごとにパーティションを連続した範囲で割り当てる。
pub struct RangeAssignor;

impl PartitionAssignor for RangeAssignor {
    fn name(&self) -> &'static str {
        "range"
    }

    fn assign(
        &self,
        members: &[GroupMember],
        topic_partitions: &BTreeMap<String, i32>,
    ) -> Assignment {
        let mut assignment = empty_assignment(members);
        let members = sorted_members(members);

        for (topic, &count) in topic_partitions {
            let subscribed: Vec<&GroupMember> =
                members.iter().copied().filter(|m| m.subscribes(topic)).collect();
            if subscribed.is_empty() || count <= 0 {
                continue;
            }

            let n = i32::try_from(subscribed.len()).unwrap_or(i32::MAX);
            let per_member = count / n;
            let extra = count % n;

            let mut partition = 0;
            for (i, member) in subscribed.iter().enumerate() {
                let i = i32::try_from(i).unwrap_or(i32::MAX);
                let take = per_member + i32::from(i < extra);
                if let Some(owned) = assignment.get_mut(&member.member_id) {
                    for _ in 0..take {
                        owned.push(TopicPartition::new(topic.clone(), partition));
                        partition += 1;
                    }
                }
            }
        }

        assignment
    }
}

/// 全トピックのパーティションを購読メンバーへ順番に配る。
pub struct RoundRobinAssignor;

impl PartitionAssignor for RoundRobinAssignor {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn assign(
        &self,
        members: &[GroupMember],
        topic_partitions: &BTreeMap<String, i32>,
    ) -> Assignment {
        let mut assignment = empty_assignment(members);
        let members = sorted_members(members);
        if members.is_empty() {
            return assignment;
        }

        let mut cursor = 0usize;
        for tp in all_partitions(topic_partitions) {
            // 購読していないメンバーは飛ばす
            for step in 0..members.len() {
                let member = members[(cursor + step) % members.len()];
                if member.subscribes(&tp.topic) {
                    if let Some(owned) = assignment.get_mut(&member.member_id) {
                        owned.push(tp);
                    }
                    cursor = (cursor + step + 1) % members.len();
                    break;
                }
            }
        }

        assignment
    }
}

/// 前回の所有を維持しながら均等に割り当てる。
///
/// 1. 各メンバーが前世代で所有していたパーティションを基本割当数まで維持する
/// 2. 余りの枠がある間、さらに 1 つずつ維持する
/// 3. 残りのパーティションを割当数の少ない購読メンバーへ配る
#[derive(Debug, Default)]
pub struct StickyAssignor;

impl PartitionAssignor for StickyAssignor {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn assign(
        &self,
        members: &[GroupMember],
        topic_partitions: &BTreeMap<String, i32>,
    ) -> Assignment {
        let mut assignment = empty_assignment(members);
        let members = sorted_members(members);
        if members.is_empty() {
            return assignment;
        }

        let partitions: BTreeSet<TopicPartition> =
            all_partitions(topic_partitions).into_iter().collect();
        let base = partitions.len() / members.len();
        let mut extra_slots = partitions.len() % members.len();
        let mut taken: HashSet<TopicPartition> = HashSet::new();

        let still_owned = |member: &GroupMember| -> Vec<TopicPartition> {
            let mut owned: Vec<TopicPartition> = member
                .owned
                .iter()
                .filter(|tp| partitions.contains(*tp) && member.subscribes(&tp.topic))
                .cloned()
                .collect();
            owned.sort();
            owned.dedup();
            owned
        };

        for member in &members {
            let kept = assignment.entry(member.member_id.clone()).or_default();
            for tp in still_owned(member) {
                if kept.len() >= base {
                    break;
                }
                if taken.insert(tp.clone()) {
                    kept.push(tp);
                }
            }
        }

        for member in &members {
            if extra_slots == 0 {
                break;
            }
            let kept = assignment.entry(member.member_id.clone()).or_default();
            if kept.len() != base {
                continue;
            }
            if let Some(tp) = still_owned(member).into_iter().find(|tp| !taken.contains(tp)) {
                taken.insert(tp.clone());
                kept.push(tp);
                extra_slots -= 1;
            }
        }

        for tp in &partitions {
            if taken.contains(tp) {
                continue;
            }
            let target = members
                .iter()
                .filter(|m| m.subscribes(&tp.topic))
                .min_by_key(|m| {
                    let load = assignment.get(&m.member_id).map_or(0, Vec::len);
                    (load, m.member_id.clone())
                });
            if let Some(member) = target {
                if let Some(owned) = assignment.get_mut(&member.member_id) {
                    owned.push(tp.clone());
                    taken.insert(tp.clone());
                }
            }
        }

        for owned in assignment.values_mut() {
            owned.sort();
        }
        assignment
    }
}

/// AssignorStrategy は設定で選択可能な割り当て戦略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignorStrategy {
    Sticky,
    RoundRobin,
    Range,
}

impl AssignorStrategy {
    pub fn assignor(self) -> Box<dyn PartitionAssignor> {
        match self {
            AssignorStrategy::Sticky => Box::new(StickyAssignor),
            AssignorStrategy::RoundRobin => Box::new(RoundRobinAssignor),
            AssignorStrategy::Range => Box::new(RangeAssignor),
        }
    }
}

impl FromStr for AssignorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sticky" => Ok(AssignorStrategy::Sticky),
            "roundrobin" | "round-robin" => Ok(AssignorStrategy::RoundRobin),
            "range" => Ok(AssignorStrategy::Range),
            other => Err(format!(
                "unrecognized consumer group partition assignor: {other}"
            )),
        }
    }
}

impl fmt::Display for AssignorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssignorStrategy::Sticky => "sticky",
            AssignorStrategy::RoundRobin => "roundrobin",
            AssignorStrategy::Range => "range",
        };
        f.write_str(name)
    }
}
