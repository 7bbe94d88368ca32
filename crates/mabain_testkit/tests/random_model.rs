//! Model check: a random operation sequence applied to the store must
//! behave exactly like a hash map.

use mabain_core::MbError;
use mabain_testkit::generators::{clustered_key_strategy, value_strategy};
use mabain_testkit::TestDb;
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    Add(Vec<u8>, Vec<u8>, bool),
    Remove(Vec<u8>),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (clustered_key_strategy(), value_strategy(), any::<bool>())
            .prop_map(|(k, v, ow)| Op::Add(k, v, ow)),
        clustered_key_strategy().prop_map(Op::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn store_matches_hash_map_model(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let db = TestDb::writer();
        let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

        for op in &ops {
            match op {
                Op::Add(key, value, overwrite) => {
                    let result = db.add_with(key, value, *overwrite);
                    match (model.contains_key(key), overwrite) {
                        (true, false) => {
                            prop_assert!(matches!(result, Err(MbError::InDict)));
                        }
                        _ => {
                            prop_assert!(result.is_ok());
                            model.insert(key.clone(), value.clone());
                        }
                    }
                }
                Op::Remove(key) => {
                    let result = db.remove(key);
                    if model.remove(key).is_some() {
                        prop_assert!(result.is_ok());
                    } else {
                        prop_assert!(matches!(result, Err(MbError::NotExist)));
                    }
                }
            }
        }

        prop_assert_eq!(db.count().unwrap(), model.len() as u64);
        for (key, value) in &model {
            prop_assert_eq!(&db.find(key).unwrap(), value);
        }
        // Spot-check absent keys across the clustered alphabet.
        for absent in [b"aaaa".to_vec(), b"abab".to_vec(), b"cccc".to_vec()] {
            if !model.contains_key(&absent) {
                prop_assert!(matches!(db.find(&absent), Err(MbError::NotExist)));
            }
        }
    }
}
