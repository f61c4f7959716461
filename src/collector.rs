//! State collector: fold an event stream into latest entity and
//! relationship states.
//!
//! The fold is pure and deterministic: a slot is overwritten only when
//! the incoming event's `(ts, seq)` exceeds the slot's, so any two
//! replays of the same event multiset produce identical tables
//! regardless of arrival order.

use crate::core::event::{ChangeEvent, EventOp};
use crate::core::state::{EntityState, RelationshipState};
use crate::core::target::TargetRef;
use ahash::AHashMap;

/// In-memory fold of events into current state, keyed by target.
#[derive(Default)]
pub struct StateCollector {
    entities: AHashMap<String, EntityState>,
    relationships: AHashMap<String, RelationshipState>,
    events_processed: u64,
}

impl StateCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the collector with rows from an earlier snapshot.
    ///
    /// Seeded rows participate in last-writer-wins like any event, so
    /// replaying the post-snapshot tail over them reproduces the full
    /// fold.
    pub fn from_snapshot(
        entities: Vec<EntityState>,
        relationships: Vec<RelationshipState>,
    ) -> Self {
        let mut collector = Self::new();
        for row in entities {
            collector.entities.insert(row.target.clone(), row);
        }
        for row in relationships {
            collector.relationships.insert(row.target.clone(), row);
        }
        collector
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Apply one event to the matching table slot.
    pub fn process(&mut self, event: &ChangeEvent) {
        self.events_processed += 1;
        let deleted = event.op == EventOp::Delete;
        let payload = if deleted { None } else { event.after.clone() };

        match TargetRef::parse(&event.target) {
            TargetRef::Relationship {
                from_ns,
                from_id,
                predicate,
                to_ns,
                to_id,
            } => {
                let incoming = RelationshipState {
                    target: event.target.clone(),
                    from: format!("{from_ns}:{from_id}"),
                    predicate,
                    to: format!("{to_ns}:{to_id}"),
                    data: payload,
                    exists: !deleted,
                    last_event_ts: event.ts,
                    last_event_seq: event.seq,
                };
                self.relationships
                    .entry(event.target.clone())
                    .and_modify(|current| {
                        if incoming.order_key() > current.order_key() {
                            *current = incoming.clone();
                        }
                    })
                    .or_insert(incoming);
            }
            TargetRef::Entity { ns, id } => {
                let incoming = EntityState {
                    target: event.target.clone(),
                    ns,
                    id,
                    state: payload,
                    exists: !deleted,
                    last_event_ts: event.ts,
                    last_event_seq: event.seq,
                };
                self.entities
                    .entry(event.target.clone())
                    .and_modify(|current| {
                        if incoming.order_key() > current.order_key() {
                            *current = incoming.clone();
                        }
                    })
                    .or_insert(incoming);
            }
        }
    }

    /// All entity slots, tombstones included, ordered by target.
    pub fn entities(&self) -> Vec<EntityState> {
        let mut rows: Vec<EntityState> = self.entities.values().cloned().collect();
        rows.sort_by(|a, b| a.target.cmp(&b.target));
        rows
    }

    /// All relationship slots, tombstones included, ordered by target.
    pub fn relationships(&self) -> Vec<RelationshipState> {
        let mut rows: Vec<RelationshipState> = self.relationships.values().cloned().collect();
        rows.sort_by(|a, b| a.target.cmp(&b.target));
        rows
    }

    /// Entity slots with `exists = true`.
    pub fn existing_entities(&self) -> Vec<EntityState> {
        self.entities().into_iter().filter(|e| e.exists).collect()
    }

    /// Relationship slots with `exists = true`.
    pub fn existing_relationships(&self) -> Vec<RelationshipState> {
        self.relationships()
            .into_iter()
            .filter(|r| r.exists)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::FieldMap;
    use crate::core::temporal::Timestamp;
    use serde_json::{json, Value};

    fn map(v: Value) -> FieldMap {
        v.as_object().cloned().unwrap()
    }

    fn event(op: EventOp, target: &str, ts: i64, seq: u64, after: Option<Value>) -> ChangeEvent {
        let mut ev = ChangeEvent::new(op, target, Timestamp::from_millis(ts));
        ev.seq = seq;
        ev.after = after.map(map);
        ev
    }

    #[test]
    fn test_create_update_delete_entity() {
        let mut collector = StateCollector::new();
        collector.process(&event(
            EventOp::Create,
            "user:1",
            1000,
            1,
            Some(json!({"name": "A"})),
        ));
        collector.process(&event(
            EventOp::Update,
            "user:1",
            2000,
            2,
            Some(json!({"name": "A2"})),
        ));

        let rows = collector.entities();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].exists);
        assert_eq!(rows[0].ns, "user");
        assert_eq!(rows[0].id, "1");
        assert_eq!(rows[0].state, Some(map(json!({"name": "A2"}))));
        assert_eq!(rows[0].last_event_seq, 2);

        collector.process(&event(EventOp::Delete, "user:1", 3000, 3, None));
        let rows = collector.entities();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].exists);
        assert_eq!(rows[0].state, None);
        assert!(collector.existing_entities().is_empty());
    }

    #[test]
    fn test_out_of_order_update_does_not_resurrect() {
        let mut collector = StateCollector::new();
        collector.process(&event(
            EventOp::Create,
            "user:1",
            1000,
            1,
            Some(json!({"name": "A"})),
        ));
        collector.process(&event(EventOp::Delete, "user:1", 3000, 2, None));
        // A late-arriving UPDATE with an older timestamp loses.
        collector.process(&event(
            EventOp::Update,
            "user:1",
            2000,
            3,
            Some(json!({"name": "A2"})),
        ));

        let rows = collector.entities();
        assert!(!rows[0].exists);
        assert_eq!(rows[0].state, None);
        assert_eq!(rows[0].last_event_ts, Timestamp::from_millis(3000));
    }

    #[test]
    fn test_delete_of_unknown_target_leaves_tombstone() {
        let mut collector = StateCollector::new();
        collector.process(&event(EventOp::Delete, "ghost:9", 500, 1, None));
        let rows = collector.entities();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].exists);
        assert_eq!(rows[0].target, "ghost:9");
    }

    #[test]
    fn test_relationship_fold() {
        let mut collector = StateCollector::new();
        collector.process(&event(
            EventOp::Create,
            "user:1:follows:user:2",
            1000,
            1,
            Some(json!({"weight": 1})),
        ));

        let rels = collector.relationships();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].from, "user:1");
        assert_eq!(rels[0].predicate, "follows");
        assert_eq!(rels[0].to, "user:2");
        assert!(rels[0].exists);
        assert!(collector.entities().is_empty());

        collector.process(&event(EventOp::Delete, "user:1:follows:user:2", 2000, 2, None));
        assert!(collector.existing_relationships().is_empty());
        assert_eq!(collector.relationships().len(), 1);
    }

    #[test]
    fn test_ties_broken_by_seq() {
        let mut collector = StateCollector::new();
        collector.process(&event(
            EventOp::Update,
            "user:1",
            1000,
            2,
            Some(json!({"v": "late"})),
        ));
        collector.process(&event(
            EventOp::Update,
            "user:1",
            1000,
            1,
            Some(json!({"v": "early"})),
        ));

        let rows = collector.entities();
        assert_eq!(rows[0].state, Some(map(json!({"v": "late"}))));
        assert_eq!(rows[0].last_event_seq, 2);
    }

    #[test]
    fn test_order_independence() {
        let events = vec![
            event(EventOp::Create, "user:1", 1000, 1, Some(json!({"n": 1}))),
            event(EventOp::Update, "user:1", 1000, 2, Some(json!({"n": 2}))),
            event(EventOp::Create, "user:2", 1500, 3, Some(json!({"n": 3}))),
            event(EventOp::Delete, "user:2", 2000, 4, None),
            event(
                EventOp::Create,
                "user:1:likes:post:7",
                1700,
                5,
                Some(json!({"w": 1})),
            ),
        ];

        let mut forward = StateCollector::new();
        for ev in &events {
            forward.process(ev);
        }

        let mut reverse = StateCollector::new();
        for ev in events.iter().rev() {
            reverse.process(ev);
        }

        assert_eq!(forward.entities(), reverse.entities());
        assert_eq!(forward.relationships(), reverse.relationships());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arbitrary_events() -> impl Strategy<Value = Vec<ChangeEvent>> {
            // Small target and ts domains force plenty of collisions.
            proptest::collection::vec(
                (0i64..20, 0u8..5, 0u8..3, proptest::option::of(0i64..100)),
                1..60,
            )
            .prop_map(|specs| {
                specs
                    .into_iter()
                    .enumerate()
                    .map(|(i, (ts, target, op, payload))| {
                        let op = match op {
                            0 => EventOp::Create,
                            1 => EventOp::Update,
                            _ => EventOp::Delete,
                        };
                        let after = if op == EventOp::Delete {
                            None
                        } else {
                            payload.map(|p| map(json!({"p": p})))
                        };
                        let mut ev = event(op, &format!("t:{target}"), ts, i as u64 + 1, None);
                        ev.after = after;
                        ev
                    })
                    .collect()
            })
        }

        proptest! {
            // The fold is order independent: (ts, seq) breaks all ties.
            #[test]
            fn prop_fold_is_permutation_independent(
                events in arbitrary_events().prop_shuffle(),
            ) {
                let mut shuffled = StateCollector::new();
                for ev in &events {
                    shuffled.process(ev);
                }

                let mut ordered_events = events.clone();
                ordered_events.sort_by_key(|e| e.order_key());
                let mut ordered = StateCollector::new();
                for ev in &ordered_events {
                    ordered.process(ev);
                }

                prop_assert_eq!(shuffled.entities(), ordered.entities());
                prop_assert_eq!(shuffled.relationships(), ordered.relationships());
            }

            // A delete always leaves a tombstone slot, never a gap.
            #[test]
            fn prop_every_target_keeps_a_slot(events in arbitrary_events()) {
                let mut collector = StateCollector::new();
                for ev in &events {
                    collector.process(ev);
                }
                let targets: std::collections::BTreeSet<&str> =
                    events.iter().map(|e| e.target.as_str()).collect();
                prop_assert_eq!(collector.entities().len(), targets.len());
            }
        }
    }

    #[test]
    fn test_snapshot_seed_respects_lww() {
        let seeded = EntityState {
            target: "user:1".into(),
            ns: "user".into(),
            id: "1".into(),
            state: Some(map(json!({"name": "snap"}))),
            exists: true,
            last_event_ts: Timestamp::from_millis(2000),
            last_event_seq: 5,
        };
        let mut collector = StateCollector::from_snapshot(vec![seeded], vec![]);

        // Older than the snapshot row: ignored.
        collector.process(&event(
            EventOp::Update,
            "user:1",
            1500,
            2,
            Some(json!({"name": "older"})),
        ));
        assert_eq!(
            collector.entities()[0].state,
            Some(map(json!({"name": "snap"})))
        );

        // Newer: wins.
        collector.process(&event(
            EventOp::Update,
            "user:1",
            2500,
            6,
            Some(json!({"name": "newer"})),
        ));
        assert_eq!(
            collector.entities()[0].state,
            Some(map(json!({"name": "newer"})))
        );
    }
}
