use crate::page::{Page, PageBuilder, PageError};
use crate::record::{FieldDesc, FieldKind, Record, Scheme, flags};

fn scheme() -> Scheme {
    Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap()
}

fn fixed_scheme() -> Scheme {
    Scheme::new(vec![
        FieldDesc::key("k", FieldKind::U64, 0),
        FieldDesc::value("v", FieldKind::U32),
    ])
    .unwrap()
}

fn rec(scheme: &Scheme, key: &[u8], value: &[u8], lsn: u64) -> Record {
    Record::build(scheme, &[key, value], flags::NONE, lsn).unwrap()
}

#[test]
fn test_build_and_parse_round_trip() {
    let scheme = scheme();
    let mut b = PageBuilder::new(&scheme);
    b.add(&rec(&scheme, b"a", b"1", 3), false);
    b.add(&rec(&scheme, b"b", b"2", 2), false);
    b.add(&rec(&scheme, b"c", b"3", 1), false);
    let built = b.finish();

    let page = Page::parse(&scheme, &built.bytes).unwrap();
    assert_eq!(page.count(), 3);
    assert_eq!(page.header().lsn_min, 1);
    assert_eq!(page.header().lsn_max, 3);
    assert_eq!(page.header().count_dup, 0);

    let r1 = page.rec(&scheme, 1).unwrap();
    assert_eq!(r1.field(&scheme, 0).unwrap(), b"b");
    assert_eq!(r1.field(&scheme, 1).unwrap(), b"2");
    assert_eq!(r1.lsn(), 2);
}

#[test]
fn test_fixed_scheme_packs_without_offset_table() {
    let scheme = fixed_scheme();
    let mut b = PageBuilder::new(&scheme);
    for i in 0u64..4 {
        let r = Record::build(
            &scheme,
            &[&i.to_le_bytes(), &(i as u32).to_le_bytes()],
            flags::NONE,
            i + 1,
        )
        .unwrap();
        b.add(&r, false);
    }
    let built = b.finish();

    let page = Page::parse(&scheme, &built.bytes).unwrap();
    assert_eq!(page.count(), 4);
    // Body is exactly count × fixed record size — no table in front.
    assert_eq!(
        page.header().size as usize,
        4 * scheme.fixed_record_size()
    );
    let r = page.rec(&scheme, 2).unwrap();
    assert_eq!(r.field(&scheme, 0).unwrap(), &2u64.to_le_bytes());
}

#[test]
fn test_dup_stamping_and_key_order_invariant() {
    let scheme = scheme();
    let mut b = PageBuilder::new(&scheme);
    // Two versions of "a" (lsn 5 head, lsn 2 dup), then "b".
    b.add(&rec(&scheme, b"a", b"new", 5), false);
    b.add(&rec(&scheme, b"a", b"old", 2), true);
    b.add(&rec(&scheme, b"b", b"x", 4), false);
    let built = b.finish();

    let page = Page::parse(&scheme, &built.bytes).unwrap();
    assert_eq!(page.header().count_dup, 1);
    assert_eq!(page.header().lsn_mindup, 2);

    let head = page.rec(&scheme, 0).unwrap();
    let dup = page.rec(&scheme, 1).unwrap();
    assert!(!head.has_flag(flags::DUP));
    assert!(dup.has_flag(flags::DUP));

    // Adjacent records: key non-decreasing, LSN descending within a key.
    for i in 0..page.count() - 1 {
        let r1 = page.rec(&scheme, i).unwrap();
        let r2 = page.rec(&scheme, i + 1).unwrap();
        let ord = scheme.compare(&r1, &r2);
        assert_ne!(ord, std::cmp::Ordering::Greater);
        if ord == std::cmp::Ordering::Equal {
            assert!(r1.lsn() > r2.lsn());
        }
    }
}

#[test]
fn test_min_max_keys_are_comparable_form() {
    let scheme = scheme();
    let mut b = PageBuilder::new(&scheme);
    let first = rec(&scheme, b"aa", b"long-payload-1", 1);
    let last = rec(&scheme, b"zz", b"long-payload-2", 2);
    b.add(&first, false);
    b.add(&last, false);
    let built = b.finish();

    let min = Record::from_bytes(&scheme, built.min_key.clone()).unwrap();
    let max = Record::from_bytes(&scheme, built.max_key.clone()).unwrap();
    assert_eq!(scheme.compare(&min, &first), std::cmp::Ordering::Equal);
    assert_eq!(scheme.compare(&max, &last), std::cmp::Ordering::Equal);
    // Comparable form drops non-key payloads.
    assert!(built.min_key.len() < first.size());
}

#[test]
fn test_bounds_search() {
    let scheme = scheme();
    let mut b = PageBuilder::new(&scheme);
    b.add(&rec(&scheme, b"b", b"1", 9), false);
    b.add(&rec(&scheme, b"b", b"0", 4), true);
    b.add(&rec(&scheme, b"d", b"2", 7), false);
    let built = b.finish();
    let page = Page::parse(&scheme, &built.bytes).unwrap();

    let probe = |k: &[u8]| scheme.key_record(&[k]).unwrap();
    assert_eq!(page.lower_bound(&scheme, &probe(b"a")).unwrap(), 0);
    assert_eq!(page.lower_bound(&scheme, &probe(b"b")).unwrap(), 0);
    assert_eq!(page.lower_bound(&scheme, &probe(b"c")).unwrap(), 2);
    assert_eq!(page.lower_bound(&scheme, &probe(b"e")).unwrap(), 3);
    assert_eq!(page.upper_bound(&scheme, &probe(b"b")).unwrap(), 2);
}

#[test]
fn test_corruption_detected() {
    let scheme = scheme();
    let mut b = PageBuilder::new(&scheme);
    b.add(&rec(&scheme, b"a", b"1", 1), false);
    let mut built = b.finish();

    // Flip one body byte: data CRC must fail.
    let last = built.bytes.len() - 1;
    built.bytes[last] ^= 0xFF;
    assert!(matches!(
        Page::parse(&scheme, &built.bytes),
        Err(PageError::ChecksumMismatch(_))
    ));

    // Flip one header byte: header CRC must fail.
    let mut b = PageBuilder::new(&scheme);
    b.add(&rec(&scheme, b"a", b"1", 1), false);
    let mut built = b.finish();
    built.bytes[8] ^= 0xFF;
    assert!(matches!(
        Page::parse(&scheme, &built.bytes),
        Err(PageError::ChecksumMismatch(_))
    ));
}
