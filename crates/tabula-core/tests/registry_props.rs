use std::collections::HashMap;

use proptest::prelude::*;
use tabula_core::{Registry, ResourceHandle, ResourceId, ResourceKind, TabulaError};

const ID_SPACE: u32 = 16;

#[derive(Debug, Clone)]
enum Op {
    Insert(u32),
    InsertNew,
    Remove(u32),
    Get(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..ID_SPACE).prop_map(Op::Insert),
        2 => Just(Op::InsertNew),
        2 => (0..ID_SPACE).prop_map(Op::Remove),
        3 => (0..ID_SPACE).prop_map(Op::Get),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn registry_matches_model_map(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let registry = Registry::new();
        let mut model: HashMap<ResourceId, ResourceHandle> = HashMap::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Insert(raw) => {
                    let id = ResourceId::new(raw);
                    let handle = ResourceHandle::new(ResourceKind::Buffer, step);
                    registry.insert(id, handle.clone());
                    model.insert(id, handle);
                }
                Op::InsertNew => {
                    let handle = ResourceHandle::new(ResourceKind::Buffer, step);
                    let id = registry.insert_new(handle.clone());
                    prop_assert!(!model.contains_key(&id), "allocated live id {}", id);
                    model.insert(id, handle);
                }
                Op::Remove(raw) => {
                    let id = ResourceId::new(raw);
                    let removed = registry.remove(id);
                    match (removed, model.remove(&id)) {
                        (Some(found), Some(expected)) => prop_assert!(found.ptr_eq(&expected)),
                        (None, None) => {}
                        (found, expected) => prop_assert!(
                            false,
                            "remove {} returned {:?}, model had {:?}",
                            id,
                            found,
                            expected
                        ),
                    }
                }
                Op::Get(raw) => {
                    let id = ResourceId::new(raw);
                    match (registry.get(id), model.get(&id)) {
                        (Ok(found), Some(expected)) => prop_assert!(found.ptr_eq(expected)),
                        (Err(TabulaError::NotFound { id: missing }), None) => {
                            prop_assert_eq!(missing, id)
                        }
                        (found, expected) => prop_assert!(
                            false,
                            "get {} returned {:?}, model had {:?}",
                            id,
                            found,
                            expected
                        ),
                    }
                }
            }
            prop_assert_eq!(registry.len(), model.len());
        }

        for (id, expected) in &model {
            prop_assert!(registry.get(*id).unwrap().ptr_eq(expected));
        }
    }
}
