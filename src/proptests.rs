use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::BTreeMap;

/// Narrow keys so inserts collide with earlier ones and removes hit.
fn narrow_key() -> impl Strategy<Value = i64> {
    -400i64..400
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 6)]
    Insert(#[proptest(strategy = "narrow_key()")] i64, i64),
    #[proptest(weight = 3)]
    Remove(#[proptest(strategy = "narrow_key()")] i64),
    #[proptest(weight = 2)]
    Get(#[proptest(strategy = "narrow_key()")] i64),
    RangeSum(
        #[proptest(strategy = "narrow_key()")] i64,
        #[proptest(strategy = "narrow_key()")] i64,
    ),
}

fn small_config() -> PmaConfig {
    PmaConfig::new()
        .segment_bytes(256)
        .chunk_bytes(1024)
        .fanout(3, 3)
        .densities(0.9, 0.4, 6)
}

fn validate_pma(pma: &Pma) {
    pma.check_invariants().unwrap();

    let capacity = pma.config.capacity();
    let ceiling = pma.schedule.at(0) * capacity as f64;
    for id in pma.segment_ids() {
        let seg = pma.segment(id).expect("chained segment must be live");
        assert!(
            seg.cardinality() as f64 <= ceiling,
            "segment {id:?} above top density after a completed insert"
        );
    }
    assert_eq!(
        pma.alloc.free_buffers() + pma.segment_count(),
        pma.alloc.chunks() * pma.config.segments_per_chunk(),
        "every buffer must be live or pooled"
    );
}

fn model_sum(m: &BTreeMap<i64, i64>, start: i64, end: i64) -> RangeSum {
    if start > end {
        return RangeSum::default();
    }
    m.range(start..=end).fold(RangeSum::default(), |acc, (&k, &v)| RangeSum {
        keys: acc.keys.wrapping_add(k),
        values: acc.values.wrapping_add(v),
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 20_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence_with_btreemap(ops in prop::collection::vec(any::<Op>(), 0..=1500)) {
        let mut pma = Pma::with_config(small_config()).unwrap();
        let mut m: BTreeMap<i64, i64> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Insert(key, value) => {
                    let fresh = !m.contains_key(&key);
                    prop_assert_eq!(pma.insert(key, value).unwrap(), fresh);
                    m.entry(key).or_insert(value);
                }
                Op::Remove(key) => {
                    prop_assert_eq!(pma.remove(key), m.remove(&key).is_some());
                    prop_assert!(!pma.lookup(key));
                }
                Op::Get(key) => {
                    prop_assert_eq!(pma.get(key), m.get(&key).copied());
                }
                Op::RangeSum(start, end) => {
                    prop_assert_eq!(pma.range_sum(start, end), model_sum(&m, start, end));
                }
            }
            prop_assert_eq!(pma.len(), m.len());
        }
        validate_pma(&pma);
        let got: Vec<(i64, i64)> = pma.iter().collect();
        let expected: Vec<(i64, i64)> = m.iter().map(|(&k, &v)| (k, v)).collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_wide_keys_stay_sorted(keys in prop::collection::vec(any::<i64>(), 0..=800)) {
        let mut pma = Pma::with_config(small_config()).unwrap();
        let mut m = BTreeMap::new();
        for &k in &keys {
            prop_assert_eq!(pma.insert(k, k.wrapping_mul(10)).unwrap(), m.insert(k, k.wrapping_mul(10)).is_none());
        }
        validate_pma(&pma);
        prop_assert!(pma.iter().eq(m.iter().map(|(&k, &v)| (k, v))));
        if let (Some(&lo), Some(&hi)) = (keys.iter().min(), keys.iter().max()) {
            let mid = lo / 2 + hi / 2;
            prop_assert_eq!(pma.range_sum(lo, mid), model_sum(&m, lo, mid));
        }
    }

    #[test]
    fn prop_insert_then_drain(mut keys in prop::collection::vec(-2000i64..2000, 0..=600)) {
        let mut pma = Pma::with_config(small_config()).unwrap();
        for &k in &keys {
            pma.insert(k, !k).unwrap();
        }
        keys.sort_unstable();
        keys.dedup();
        prop_assert_eq!(pma.len(), keys.len());
        for (i, &k) in keys.iter().enumerate() {
            prop_assert!(pma.remove(k));
            if i % 64 == 0 {
                validate_pma(&pma);
            }
        }
        prop_assert!(pma.is_empty());
        prop_assert_eq!(pma.iter().next(), None);
        validate_pma(&pma);
    }
}

#[test]
fn ascending_and_descending_runs() {
    for keys in [
        (0..3000).collect::<Vec<i64>>(),
        (0..3000).rev().collect(),
        (0..3000).map(|k| if k % 2 == 0 { k } else { 6000 - k }).collect(),
    ] {
        let mut pma = Pma::with_config(small_config()).unwrap();
        for &k in &keys {
            assert!(pma.insert(k, k * 10).unwrap());
        }
        validate_pma(&pma);
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert!(pma.iter().map(|(k, _)| k).eq(sorted.iter().copied()));
    }
}
