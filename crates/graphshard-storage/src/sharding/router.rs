//! Record routing.
//!
//! Decides which shard receives each node and relationship. A node goes to
//! the shard of its vid. A relationship always goes to the shard of its
//! source node: as a direct edge when the target shares that shard, otherwise
//! as a proxy edge plus a cross-shard side-table entry.

use super::assignment::ShardAssignment;
use super::ledger::CrossShardEdge;
use crate::store::{EdgeWrite, NodeWrite};
use graphshard_core::{Attributes, EntityType, RelationType, ShardId, Vid};
use std::collections::BTreeMap;

/// A node record with its vid resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub vid: Vid,
    pub attributes: Attributes,
}

/// A relationship record with both endpoint vids resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    pub from: Vid,
    pub to: Vid,
    pub attributes: Attributes,
}

/// Where a relationship goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRoute {
    /// Both endpoints live on `shard`.
    Local { shard: ShardId },
    /// The source lives on `shard`, the target on `target_sid`.
    Proxy { shard: ShardId, target_sid: ShardId },
    /// At least one endpoint has no shard. Holds each endpoint that lacks
    /// one.
    Unroutable { from: Option<Vid>, to: Option<Vid> },
}

/// Per-shard node batches of one entity type.
#[derive(Debug, Clone)]
pub struct NodePlan {
    pub entity: EntityType,
    pub batches: BTreeMap<ShardId, Vec<NodeWrite>>,
    /// Vids without a shard, never written anywhere
    pub unroutable: Vec<Vid>,
}

impl NodePlan {
    pub fn routed(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }
}

/// Per-shard edge batches of one relationship type.
#[derive(Debug, Clone)]
pub struct EdgePlan {
    pub relation: RelationType,
    /// Direct and proxy edges, keyed by the source shard
    pub batches: BTreeMap<ShardId, Vec<EdgeWrite>>,
    /// Side-table entries for every proxied edge
    pub cross: Vec<CrossShardEdge>,
    pub direct: usize,
    pub proxied: usize,
    /// Relationships dropped because an endpoint has no shard
    pub skipped: usize,
    /// Endpoint vids without a shard, with their entity type
    pub unroutable: Vec<(Vid, EntityType)>,
}

/// Routes records using a resolved shard assignment.
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter<'a> {
    assignment: &'a ShardAssignment,
}

impl<'a> ShardRouter<'a> {
    pub fn new(assignment: &'a ShardAssignment) -> Self {
        Self { assignment }
    }

    /// Shard of a node, `None` if the vid was never assigned.
    #[inline]
    pub fn route_node(&self, vid: Vid) -> Option<ShardId> {
        self.assignment.get(vid)
    }

    /// Classifies a relationship between two vids.
    pub fn route_edge(&self, from: Vid, to: Vid) -> EdgeRoute {
        match (self.assignment.get(from), self.assignment.get(to)) {
            (Some(shard), Some(target_sid)) if target_sid == shard => EdgeRoute::Local { shard },
            (Some(shard), Some(target_sid)) => EdgeRoute::Proxy { shard, target_sid },
            (shard, target_sid) => EdgeRoute::Unroutable {
                from: shard.is_none().then_some(from),
                to: target_sid.is_none().then_some(to),
            },
        }
    }

    /// Groups node records by shard.
    pub fn plan_nodes(
        &self,
        entity: EntityType,
        records: impl IntoIterator<Item = NodeRecord>,
    ) -> NodePlan {
        let mut plan = NodePlan {
            entity,
            batches: BTreeMap::new(),
            unroutable: Vec::new(),
        };
        for record in records {
            match self.route_node(record.vid) {
                Some(shard) => plan
                    .batches
                    .entry(shard)
                    .or_default()
                    .push(NodeWrite::new(record.vid, record.attributes)),
                None => plan.unroutable.push(record.vid),
            }
        }
        plan
    }

    /// Groups relationship records by source shard, turning cross-shard
    /// relationships into proxy edges.
    pub fn plan_relationships(
        &self,
        relation: RelationType,
        records: impl IntoIterator<Item = EdgeRecord>,
    ) -> EdgePlan {
        let mut plan = EdgePlan {
            relation,
            batches: BTreeMap::new(),
            cross: Vec::new(),
            direct: 0,
            proxied: 0,
            skipped: 0,
            unroutable: Vec::new(),
        };
        for record in records {
            match self.route_edge(record.from, record.to) {
                EdgeRoute::Local { shard } => {
                    plan.direct += 1;
                    plan.batches
                        .entry(shard)
                        .or_default()
                        .push(EdgeWrite::direct(record.from, record.to, record.attributes));
                }
                EdgeRoute::Proxy { shard, target_sid } => {
                    plan.proxied += 1;
                    let edge = EdgeWrite::proxied(record.from, record.to, target_sid, record.attributes);
                    plan.cross.push(CrossShardEdge {
                        from_vid: record.from,
                        to_vid: record.to,
                        to_sid: target_sid,
                        attributes: edge.attributes.clone(),
                    });
                    plan.batches.entry(shard).or_default().push(edge);
                }
                EdgeRoute::Unroutable { from, to } => {
                    plan.skipped += 1;
                    if let Some(vid) = from {
                        plan.unroutable.push((vid, relation.from_type()));
                    }
                    // a self-loop on an unassigned vid is reported once
                    if let Some(vid) = to.filter(|vid| from != Some(*vid)) {
                        plan.unroutable.push((vid, relation.to_type()));
                    }
                }
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EdgeTarget, TARGET_SID};
    use graphshard_core::PropertyValue;

    fn assignment() -> ShardAssignment {
        let mut assignment = ShardAssignment::new();
        assignment.insert(Vid(1), 0);
        assignment.insert(Vid(2), 0);
        assignment.insert(Vid(3), 1);
        assignment
    }

    fn edge(from: u64, to: u64) -> EdgeRecord {
        EdgeRecord {
            from: Vid(from),
            to: Vid(to),
            attributes: Attributes::new(),
        }
    }

    #[test]
    fn test_route_edge() {
        let assignment = assignment();
        let router = ShardRouter::new(&assignment);

        assert_eq!(router.route_edge(Vid(1), Vid(2)), EdgeRoute::Local { shard: 0 });
        assert_eq!(
            router.route_edge(Vid(2), Vid(3)),
            EdgeRoute::Proxy { shard: 0, target_sid: 1 }
        );
        assert_eq!(
            router.route_edge(Vid(3), Vid(2)),
            EdgeRoute::Proxy { shard: 1, target_sid: 0 }
        );
        assert_eq!(
            router.route_edge(Vid(9), Vid(2)),
            EdgeRoute::Unroutable { from: Some(Vid(9)), to: None }
        );
        assert_eq!(
            router.route_edge(Vid(9), Vid(8)),
            EdgeRoute::Unroutable { from: Some(Vid(9)), to: Some(Vid(8)) }
        );
    }

    #[test]
    fn test_plan_nodes_skips_unassigned() {
        let assignment = assignment();
        let router = ShardRouter::new(&assignment);
        let records = [1, 3, 7].map(|v| NodeRecord {
            vid: Vid(v),
            attributes: Attributes::new(),
        });

        let plan = router.plan_nodes(EntityType::Person, records);

        assert_eq!(plan.routed(), 2);
        assert_eq!(plan.batches[&0][0].vid, Vid(1));
        assert_eq!(plan.batches[&1][0].vid, Vid(3));
        assert_eq!(plan.unroutable, vec![Vid(7)]);
    }

    #[test]
    fn test_plan_relationships_writes_only_source_shard() {
        let assignment = assignment();
        let router = ShardRouter::new(&assignment);

        let plan = router.plan_relationships(
            RelationType::PersonKnowsPerson,
            [edge(1, 2), edge(2, 3), edge(3, 8)],
        );

        assert_eq!(plan.direct, 1);
        assert_eq!(plan.proxied, 1);
        assert_eq!(plan.skipped, 1);
        assert_eq!(plan.unroutable, vec![(Vid(8), EntityType::Person)]);
        assert!(!plan.batches.contains_key(&1));

        let shard0 = &plan.batches[&0];
        assert_eq!(shard0[0].target, EdgeTarget::Node(Vid(2)));
        assert_eq!(
            shard0[1].target,
            EdgeTarget::Proxy { target_vid: Vid(3), target_sid: 1 }
        );
        assert_eq!(shard0[1].attributes.get(TARGET_SID), Some(&PropertyValue::Int(1)));

        assert_eq!(plan.cross.len(), 1);
        assert_eq!((plan.cross[0].from_vid, plan.cross[0].to_vid), (Vid(2), Vid(3)));
        assert_eq!(plan.cross[0].to_sid, 1);
    }

    #[test]
    fn test_unassigned_endpoints_are_all_reported() {
        let assignment = assignment();
        let router = ShardRouter::new(&assignment);

        let plan = router.plan_relationships(RelationType::PersonStudyAtOrganisation, [edge(7, 8)]);
        assert_eq!(plan.skipped, 1);
        assert!(plan.batches.is_empty());
        assert_eq!(
            plan.unroutable,
            vec![(Vid(7), EntityType::Person), (Vid(8), EntityType::Organisation)]
        );

        let plan = router.plan_relationships(RelationType::PersonKnowsPerson, [edge(9, 9)]);
        assert_eq!(plan.skipped, 1);
        assert_eq!(plan.unroutable, vec![(Vid(9), EntityType::Person)]);
    }
}
