use std::cmp::Ordering;

use crate::record::{FieldDesc, FieldKind, Record, Scheme, SortOrder, flags};

fn build(scheme: &Scheme, values: &[&[u8]]) -> Record {
    Record::build(scheme, values, flags::NONE, 0).unwrap()
}

#[test]
fn test_string_key_ordering() {
    let scheme = Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap();

    let a = build(&scheme, &[b"alpha", b"1"]);
    let b = build(&scheme, &[b"beta", b"2"]);
    assert_eq!(scheme.compare(&a, &b), Ordering::Less);
    assert_eq!(scheme.compare(&b, &a), Ordering::Greater);
    assert_eq!(scheme.compare(&a, &a), Ordering::Equal);
}

#[test]
fn test_numeric_keys_compare_by_value_not_bytes() {
    let scheme = Scheme::new(vec![
        FieldDesc::key("n", FieldKind::U32, 0),
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap();

    // 0x0100 = 256 vs 0x00FF = 255: little-endian byte order would invert this.
    let a = build(&scheme, &[&255u32.to_le_bytes(), b""]);
    let b = build(&scheme, &[&256u32.to_le_bytes(), b""]);
    assert_eq!(scheme.compare(&a, &b), Ordering::Less);
}

#[test]
fn test_signed_key_ordering() {
    let scheme = Scheme::new(vec![
        FieldDesc::key("n", FieldKind::I64, 0),
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap();

    let neg = build(&scheme, &[&(-5i64).to_le_bytes(), b""]);
    let pos = build(&scheme, &[&3i64.to_le_bytes(), b""]);
    assert_eq!(scheme.compare(&neg, &pos), Ordering::Less);
}

#[test]
fn test_descending_field_reverses() {
    let scheme = Scheme::new(vec![
        FieldDesc {
            name: "n".into(),
            kind: FieldKind::U64,
            order: SortOrder::Desc,
            key: Some(0),
            timestamp: false,
        },
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap();

    let small = build(&scheme, &[&1u64.to_le_bytes(), b""]);
    let large = build(&scheme, &[&9u64.to_le_bytes(), b""]);
    assert_eq!(scheme.compare(&large, &small), Ordering::Less);
}

#[test]
fn test_composite_key_ordinal_order() {
    // Declaration order differs from key-ordinal order on purpose.
    let scheme = Scheme::new(vec![
        FieldDesc::key("minor", FieldKind::String, 1),
        FieldDesc::key("major", FieldKind::U32, 0),
    ])
    .unwrap();

    let a = build(&scheme, &[b"zzz", &1u32.to_le_bytes()]);
    let b = build(&scheme, &[b"aaa", &2u32.to_le_bytes()]);
    // major (ordinal 0) decides before minor.
    assert_eq!(scheme.compare(&a, &b), Ordering::Less);
}

#[test]
fn test_comparable_form_contract() {
    let scheme = Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
        FieldDesc::value("w", FieldKind::U64),
    ])
    .unwrap();

    let rec = Record::build(
        &scheme,
        &[b"key", b"a-long-value-payload", &7u64.to_le_bytes()],
        flags::NONE,
        33,
    )
    .unwrap();

    let cmp = scheme.comparable(&rec);
    assert_eq!(scheme.compare(&rec, &cmp), Ordering::Equal);
    assert!(cmp.size() < rec.size());
    assert_eq!(cmp.lsn(), 33);
    assert_eq!(cmp.field(&scheme, 1).unwrap(), b"");
}

#[test]
fn test_index_key_agrees_with_compare() {
    let scheme = Scheme::new(vec![
        FieldDesc::key("s", FieldKind::String, 0),
        FieldDesc {
            name: "n".into(),
            kind: FieldKind::I64,
            order: SortOrder::Desc,
            key: Some(1),
            timestamp: false,
        },
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap();

    let samples: Vec<Record> = [
        (&b""[..], -10i64),
        (b"a", 0),
        (b"a", 5),
        (b"a\x00b", 1),
        (b"ab", -1),
        (b"b", i64::MIN),
        (b"b", i64::MAX),
    ]
    .iter()
    .map(|&(s, n)| build(&scheme, &[s, &n.to_le_bytes(), b"pay"]))
    .collect();

    for a in &samples {
        for b in &samples {
            let by_compare = scheme.compare(a, b);
            let by_key = scheme.index_key(a).cmp(&scheme.index_key(b));
            assert_eq!(
                by_compare, by_key,
                "index_key must preserve compare() order"
            );
        }
    }
}

#[test]
fn test_key_record_probe() {
    let scheme = Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
        FieldDesc::value("n", FieldKind::U32),
    ])
    .unwrap();

    let full = build(&scheme, &[b"target", b"some-value", &4u32.to_le_bytes()]);
    let probe = scheme.key_record(&[b"target"]).unwrap();
    assert_eq!(scheme.compare(&full, &probe), Ordering::Equal);
}
