//! Property tests for the store.
//!
//! Random sequences of entity operations are checked against a plain
//! `HashMap` model after every merge; the remaining properties cover id
//! stability, fetch matching, and slot repair after removals.

use std::collections::{BTreeMap, HashSet};

use proptest::prelude::*;
use tessera_ecs::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pos(i32);

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vel(i32);

#[derive(Debug, Clone, Copy, PartialEq)]
struct Tag(i32);

#[derive(Debug, Clone, PartialEq)]
struct Gravity(i32);

fn setup_store() -> Store {
    let mut builder = StoreBuilder::new();
    builder.register_component::<Pos>().unwrap();
    builder.register_component::<Vel>().unwrap();
    builder.register_component::<Tag>().unwrap();
    builder.register_resource(Gravity(1)).unwrap();
    builder.seal()
}

/// What the store should contain for one entity.
#[derive(Debug, Clone, Default, PartialEq)]
struct ModelEntity {
    pos: Option<i32>,
    vel: Option<i32>,
    tag: Option<i32>,
}

/// Operations issued between merges.
#[derive(Debug, Clone)]
enum StoreOp {
    Spawn(Option<i32>, Option<i32>, Option<i32>),
    RemoveEntity(usize),
    RemoveVel(usize),
    InsertVel(usize, i32),
    Tick,
}

fn store_op_strategy() -> impl Strategy<Value = StoreOp> {
    let value = || prop::option::of(-1000i32..1000);
    prop_oneof![
        3 => (value(), value(), value()).prop_map(|(p, v, t)| StoreOp::Spawn(p, v, t)),
        1 => (0..64usize).prop_map(StoreOp::RemoveEntity),
        1 => (0..64usize).prop_map(StoreOp::RemoveVel),
        1 => (0..64usize, -1000i32..1000).prop_map(|(i, v)| StoreOp::InsertVel(i, v)),
        2 => Just(StoreOp::Tick),
    ]
}

/// Fetch every type once, which retires every flagged entity completely,
/// then merge.
fn tick(store: &mut Store) -> MergeReport {
    store.fetch::<(Read<Pos>,)>(|_| {}).unwrap();
    store.fetch::<(Read<Vel>, Read<Gravity>)>(|_| {}).unwrap();
    store.fetch::<(Read<Tag>,)>(|_| {}).unwrap();
    store.fetch::<(Read<EntityRecord>,)>(|_| {}).unwrap();
    store.merge().unwrap()
}

fn assert_matches_model(store: &Store, model: &BTreeMap<EntityId, ModelEntity>) {
    assert_eq!(store.entity_count(), model.len());
    for (slot, record) in store.records().enumerate() {
        assert_eq!(record.get_component(EntityRecord::RECORD_TYPE), Some(slot));
        for (record_type, s) in record.slots() {
            assert!(s < store.column(record_type).len());
        }
    }
    for (id, expected) in model {
        assert_eq!(store.get::<Pos>(*id).map(|p| p.0), expected.pos);
        assert_eq!(store.get::<Vel>(*id).map(|v| v.0), expected.vel);
        assert_eq!(store.get::<Tag>(*id).map(|t| t.0), expected.tag);
    }
    let owners = |f: fn(&ModelEntity) -> bool| model.values().filter(|e| f(e)).count();
    assert_eq!(store.column_of::<Pos>().unwrap().len(), owners(|e| e.pos.is_some()));
    assert_eq!(store.column_of::<Vel>().unwrap().len(), owners(|e| e.vel.is_some()));
    assert_eq!(store.column_of::<Tag>().unwrap().len(), owners(|e| e.tag.is_some()));
    assert_eq!(store.column_of::<Gravity>().unwrap().len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn random_ops_match_model(ops in prop::collection::vec(store_op_strategy(), 1..60)) {
        let mut store = setup_store();
        let mut model: BTreeMap<EntityId, ModelEntity> = BTreeMap::new();
        let mut known: Vec<EntityId> = Vec::new();
        let mut flagged: HashSet<EntityId> = HashSet::new();
        let mut pending_removals: HashSet<EntityId> = HashSet::new();
        let mut pending_inserts: Vec<(EntityId, i32)> = Vec::new();

        for op in ops {
            match op {
                StoreOp::Spawn(pos, vel, tag) => {
                    let mut builder = store.build_entity();
                    if let Some(p) = pos { builder = builder.with(Pos(p)); }
                    if let Some(v) = vel { builder = builder.with(Vel(v)); }
                    if let Some(t) = tag { builder = builder.with(Tag(t)); }
                    let id = builder.finish().unwrap();
                    model.insert(id, ModelEntity { pos, vel, tag });
                    known.push(id);
                }
                StoreOp::RemoveEntity(i) => {
                    if known.is_empty() { continue; }
                    let id = known[i % known.len()];
                    if let Some(record) = store.find_record(id) {
                        let first = store.handle().request_remove_entity(record);
                        prop_assert_eq!(first, flagged.insert(id));
                    }
                }
                StoreOp::RemoveVel(i) => {
                    if known.is_empty() { continue; }
                    let id = known[i % known.len()];
                    let Some(record) = store.find_record(id) else { continue };
                    let result = store.handle().request_remove_component::<Vel>(record);
                    let owns = model.get(&id).is_some_and(|e| e.vel.is_some());
                    prop_assert_eq!(result.is_ok(), owns);
                    if owns {
                        pending_removals.insert(id);
                    }
                }
                StoreOp::InsertVel(i, v) => {
                    if known.is_empty() { continue; }
                    let id = known[i % known.len()];
                    store.handle().request_insert_component(id, Vel(v)).unwrap();
                    pending_inserts.push((id, v));
                }
                StoreOp::Tick => {
                    let report = tick(&mut store);
                    let erased = flagged.len();
                    for id in flagged.drain() {
                        model.remove(&id);
                    }
                    for id in pending_removals.drain() {
                        if let Some(e) = model.get_mut(&id) {
                            e.vel = None;
                        }
                    }
                    let mut skipped = 0;
                    for (id, v) in pending_inserts.drain(..) {
                        match model.get_mut(&id) {
                            Some(e) => e.vel = Some(v),
                            None => skipped += 1,
                        }
                    }
                    prop_assert_eq!(report.erased_entities, erased);
                    prop_assert_eq!(report.skipped, skipped);
                    assert_matches_model(&store, &model);
                }
            }
        }

        tick(&mut store);
        for id in flagged.drain() {
            model.remove(&id);
        }
        for id in pending_removals.drain() {
            if let Some(e) = model.get_mut(&id) {
                e.vel = None;
            }
        }
        for (id, v) in pending_inserts.drain(..) {
            if let Some(e) = model.get_mut(&id) {
                e.vel = Some(v);
            }
        }
        assert_matches_model(&store, &model);
    }

    #[test]
    fn registration_ids_are_distinct_and_stable(order in Just(vec![0u8, 1, 2, 3]).prop_shuffle()) {
        let mut builder = StoreBuilder::new();
        let mut assigned = Vec::new();
        for kind in &order {
            let id = match kind {
                0 => builder.register_component::<Pos>().unwrap(),
                1 => builder.register_component::<Vel>().unwrap(),
                2 => builder.register_component::<Tag>().unwrap(),
                _ => builder.register_resource(Gravity(0)).unwrap(),
            };
            assigned.push(id);
        }
        let distinct: HashSet<RecordTypeId> = assigned.iter().copied().collect();
        prop_assert_eq!(distinct.len(), 4);
        prop_assert!(!distinct.contains(&EntityRecord::RECORD_TYPE));

        let mut store = builder.seal();
        store.build_entity().with(Pos(1)).finish().unwrap();
        tick(&mut store);
        for (kind, id) in order.iter().zip(&assigned) {
            let now = match kind {
                0 => store.type_id_of::<Pos>().unwrap(),
                1 => store.type_id_of::<Vel>().unwrap(),
                2 => store.type_id_of::<Tag>().unwrap(),
                _ => store.type_id_of::<Gravity>().unwrap(),
            };
            prop_assert_eq!(now, *id);
        }
    }

    #[test]
    fn fetch_yields_owners_that_are_not_flagged(
        entities in prop::collection::vec((any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()), 0..40)
    ) {
        let mut store = setup_store();
        let mut expected_pos_vel = Vec::new();
        let mut expected_vel = Vec::new();
        for (i, &(has_pos, has_vel, has_tag, flag)) in entities.iter().enumerate() {
            let mut builder = store.build_entity();
            if has_pos { builder = builder.with(Pos(i as i32)); }
            if has_vel { builder = builder.with(Vel(i as i32)); }
            if has_tag { builder = builder.with(Tag(i as i32)); }
            let id = builder.finish().unwrap();
            if flag {
                store.handle().request_remove_entity(store.find_record(id).unwrap());
            } else {
                if has_pos && has_vel { expected_pos_vel.push(id); }
                if has_vel { expected_vel.push(id); }
            }
        }

        let mut seen = Vec::new();
        store
            .fetch::<(Read<EntityRecord>, Read<Pos>, Read<Vel>)>(|(rec, p, v)| {
                assert_eq!(p.0, v.0);
                seen.push(rec.id());
            })
            .unwrap();
        prop_assert_eq!(seen, expected_pos_vel);

        // Resources never narrow the match set.
        let mut seen = Vec::new();
        store
            .fetch::<(Read<EntityRecord>, Read<Vel>, Read<Gravity>)>(|(rec, _, g)| {
                assert_eq!(g.0, 1);
                seen.push(rec.id());
            })
            .unwrap();
        prop_assert_eq!(seen, expected_vel);
    }

    #[test]
    fn removal_repairs_slots(n in 1usize..60, picks in prop::collection::vec(any::<prop::sample::Index>(), 0..30)) {
        let mut store = setup_store();
        let ids: Vec<EntityId> = (0..n)
            .map(|i| store.build_entity().with(Pos(i as i32)).finish().unwrap())
            .collect();
        let pos_type = store.type_id_of::<Pos>().unwrap();

        let removed: HashSet<usize> = picks.iter().map(|p| p.index(n)).collect();
        let before: Vec<usize> = ids
            .iter()
            .map(|id| store.find_record(*id).unwrap().get_component(pos_type).unwrap())
            .collect();
        let erased_slots: Vec<usize> = removed.iter().map(|&i| before[i]).collect();
        {
            let handle = store.handle();
            for &i in &removed {
                handle
                    .request_remove_component::<Pos>(store.find_record(ids[i]).unwrap())
                    .unwrap();
            }
        }
        let report = store.merge().unwrap();
        prop_assert_eq!(report.erased_components, removed.len());

        for (i, id) in ids.iter().enumerate() {
            let record = store.find_record(*id).unwrap();
            if removed.contains(&i) {
                prop_assert_eq!(record.get_component(pos_type), None);
                continue;
            }
            let below = erased_slots.iter().filter(|&&s| s < before[i]).count();
            prop_assert_eq!(record.get_component(pos_type), Some(before[i] - below));
            prop_assert_eq!(store.get::<Pos>(*id), Some(&Pos(i as i32)));
        }
    }
}
