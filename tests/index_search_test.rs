//! End-to-end index + search scenarios over in-memory segments.

use std::sync::Arc;

use silt::analysis::Tokens;
use silt::codec::default_codec;
use silt::index::meta::write_document_mask;
use silt::index::{Features, SegmentMeta, SegmentReader, SegmentWriter, UpdateContext};
use silt::search::{Filter, IndexSnapshot, TermBound};
use silt::store::{DataInput, DataOutput, Directory, IoAdvice, MemoryDirectory, SliceInput};

fn fruit_segment(dir: &Arc<dyn Directory>) -> SegmentMeta {
    fruit_segment_named(dir, "seg_1", &[])
}

/// Three docs: 1 = {"apple"}, 2 = {"apricot"}, 3 = {"banana"}.
fn fruit_segment_named(dir: &Arc<dyn Directory>, name: &str, removed: &[u32]) -> SegmentMeta {
    let mut writer = SegmentWriter::new(Arc::clone(dir), default_codec());
    writer.reset(name);
    for (doc, term) in [(1u32, "apple"), (2, "apricot"), (3, "banana")] {
        let mut tokens = Tokens::of_terms([term]);
        writer
            .index_field(doc, "f", &mut tokens, Features::FREQ, 1.0)
            .unwrap();
        writer.finish(doc, UpdateContext::default()).unwrap();
    }
    for &doc in removed {
        writer.remove(doc).unwrap();
    }
    let (_, meta) = writer.flush().unwrap();
    meta
}

fn snapshot_of(dir: &Arc<dyn Directory>, meta: &SegmentMeta) -> (SegmentReader, IndexSnapshot) {
    let reader = SegmentReader::open(Arc::clone(dir), meta).expect("segment opens");
    let index = IndexSnapshot::from_readers([&reader]);
    (reader, index)
}

#[test]
fn test_term_prefix_range_filters() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let meta = fruit_segment(&dir);
    let (_reader, index) = snapshot_of(&dir, &meta);

    let docs = Filter::term("f", b"apricot".to_vec()).matching_docs(&index);
    assert_eq!(docs[0], vec![2]);

    let docs = Filter::prefix("f", b"ap".to_vec()).matching_docs(&index);
    assert_eq!(docs[0], vec![1, 2]);

    let docs = Filter::range(
        "f",
        TermBound::Included(b"a".to_vec()),
        TermBound::Excluded(b"b".to_vec()),
    )
    .matching_docs(&index);
    assert_eq!(docs[0], vec![1, 2]);

    // unknown terms and fields match nothing
    let docs = Filter::term("f", b"cherry".to_vec()).matching_docs(&index);
    assert!(docs[0].is_empty());
    let docs = Filter::term("missing", b"apple".to_vec()).matching_docs(&index);
    assert!(docs[0].is_empty());
}

#[test]
fn test_edit_distance_filter() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let meta = fruit_segment(&dir);
    let (_reader, index) = snapshot_of(&dir, &meta);

    // "aple" is one edit from "apple"
    let docs = Filter::by_edit_distance("f", b"aple".to_vec(), 1, false, 0).matching_docs(&index);
    assert_eq!(docs[0], vec![1]);

    // "apricot" stays out of reach even at distance two
    let docs = Filter::by_edit_distance("f", b"aple".to_vec(), 2, false, 0).matching_docs(&index);
    assert_eq!(docs[0], vec![1]);

    // distance zero is an exact term query
    let docs = Filter::by_edit_distance("f", b"banana".to_vec(), 0, false, 0).matching_docs(&index);
    assert_eq!(docs[0], vec![3]);

    // unsupported distance prepares to the empty filter
    let docs = Filter::by_edit_distance("f", b"apple".to_vec(), 9, false, 0).matching_docs(&index);
    assert!(docs[0].is_empty());
}

#[test]
fn test_mask_after_remove() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let meta = fruit_segment_named(&dir, "seg_1", &[2]);
    let (reader, index) = snapshot_of(&dir, &meta);

    assert_eq!(reader.docs_count(), 3);
    assert_eq!(reader.live_docs_count(), 2);

    let snapshot = reader.snapshot();
    let mut docs_iterator = snapshot.docs_iterator();
    let mut live = Vec::new();
    while docs_iterator.next() {
        live.push(docs_iterator.value());
    }
    assert_eq!(live, vec![1, 3]);

    let docs = Filter::prefix("f", b"ap".to_vec()).matching_docs(&index);
    assert_eq!(docs[0], vec![1]);
}

#[test]
fn test_boolean_filters() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let meta = fruit_segment(&dir);
    let (_reader, index) = snapshot_of(&dir, &meta);

    let docs = Filter::and(vec![
        Filter::term("f", b"apple".to_vec()),
        Filter::not(Filter::term("f", b"banana".to_vec())),
    ])
    .matching_docs(&index);
    assert_eq!(docs[0], vec![1]);

    let docs = Filter::or(vec![
        Filter::term("f", b"apple".to_vec()),
        Filter::term("f", b"banana".to_vec()),
    ])
    .matching_docs(&index);
    assert_eq!(docs[0], vec![1, 3]);

    // min_match = 2 requires both children on the same doc
    let docs = Filter::or_min_match(
        2,
        vec![
            Filter::prefix("f", b"ap".to_vec()),
            Filter::term("f", b"apple".to_vec()),
        ],
    )
    .matching_docs(&index);
    assert_eq!(docs[0], vec![1]);

    // standalone not runs against all live docs
    let docs = Filter::not(Filter::term("f", b"apple".to_vec())).matching_docs(&index);
    assert_eq!(docs[0], vec![2, 3]);

    // and with no includes is empty
    let docs = Filter::and(vec![Filter::not(Filter::term("f", b"apple".to_vec()))])
        .matching_docs(&index);
    assert!(docs[0].is_empty());
}

#[test]
fn test_top_terms_limit_and_ties() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let mut writer = SegmentWriter::new(Arc::clone(&dir), default_codec());
    writer.reset("seg_1");
    for (doc, term) in [(1u32, "aple"), (2, "apple"), (3, "maple"), (4, "banana")] {
        let mut tokens = Tokens::of_terms([term]);
        writer
            .index_field(doc, "f", &mut tokens, Features::FREQ, 1.0)
            .unwrap();
        writer.finish(doc, UpdateContext::default()).unwrap();
    }
    let (_, meta) = writer.flush().unwrap();
    let (_reader, index) = snapshot_of(&dir, &meta);

    // query "aple", distance 1: aple (d=0, sim 1.0), apple and maple
    // (d=1, sim 0.75 each). With limit 2 the tie breaks to the
    // lexicographically smaller "apple".
    let docs =
        Filter::by_edit_distance("f", b"aple".to_vec(), 1, false, 2).matching_docs(&index);
    assert_eq!(docs[0], vec![1, 2]);

    // unlimited keeps all three
    let docs =
        Filter::by_edit_distance("f", b"aple".to_vec(), 1, false, 0).matching_docs(&index);
    assert_eq!(docs[0], vec![1, 2, 3]);
}

#[test]
fn test_multi_segment_search() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let meta_a = fruit_segment_named(&dir, "seg_1", &[]);

    let mut writer = SegmentWriter::new(Arc::clone(&dir), default_codec());
    writer.reset("seg_2");
    let mut tokens = Tokens::of_terms(["apple", "cherry"]);
    writer
        .index_field(1, "f", &mut tokens, Features::FREQ, 1.0)
        .unwrap();
    writer.finish(1, UpdateContext::default()).unwrap();
    let (_, meta_b) = writer.flush().unwrap();

    let reader_a = SegmentReader::open(Arc::clone(&dir), &meta_a).unwrap();
    let reader_b = SegmentReader::open(Arc::clone(&dir), &meta_b).unwrap();
    let index = IndexSnapshot::from_readers([&reader_a, &reader_b]);

    let docs = Filter::term("f", b"apple".to_vec()).matching_docs(&index);
    assert_eq!(docs, vec![vec![1], vec![1]]);

    let docs = Filter::term("f", b"cherry".to_vec()).matching_docs(&index);
    assert_eq!(docs, vec![vec![], vec![1]]);
}

#[test]
fn test_random_terms_round_trip() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(0x5117);
    let alphabet: Vec<char> = "abcdefghijklmnopqrstuvwxyzäöüß日本語".chars().collect();
    let mut terms: Vec<Vec<u8>> = std::collections::BTreeSet::from_iter((0..10_000).map(|_| {
        let len = rng.gen_range(1..12);
        let s: String = (0..len)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
            .collect();
        s.into_bytes()
    }))
    .into_iter()
    .collect();
    terms.sort();

    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let mut writer = SegmentWriter::new(Arc::clone(&dir), default_codec());
    writer.reset("seg_1");
    let tokens: Vec<silt::analysis::Token> = terms
        .iter()
        .map(|t| silt::analysis::Token::new(t.clone()))
        .collect();
    let mut stream = Tokens::new(tokens);
    writer
        .index_field(1, "f", &mut stream, Features::FREQ, 1.0)
        .unwrap();
    writer.finish(1, UpdateContext::default()).unwrap();
    let (_, meta) = writer.flush().unwrap();

    // checksum verification happens on open
    let reader = SegmentReader::open(Arc::clone(&dir), &meta).expect("segment opens");
    let snapshot = reader.snapshot();
    let field = snapshot.field("f").unwrap();
    assert_eq!(field.terms_count(), terms.len() as u64);
    assert_eq!(field.min_term(), terms.first().unwrap().as_slice());
    assert_eq!(field.max_term(), terms.last().unwrap().as_slice());

    // full iteration visits every term in order
    let mut iterator = field.iterator().unwrap();
    let mut count = 0usize;
    while iterator.next().unwrap() {
        assert_eq!(iterator.term(), terms[count].as_slice(), "at {count}");
        count += 1;
    }
    assert_eq!(count, terms.len());

    // every term can be sought exactly
    let mut iterator = field.iterator().unwrap();
    for term in terms.iter().step_by(17) {
        assert!(iterator.seek(term).unwrap());
        assert_eq!(iterator.term(), term.as_slice());
    }
}

#[test]
fn test_corrupt_terms_file_fails_open() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let meta = fruit_segment(&dir);

    // flip one byte in the middle of the terms file
    let mut input = dir.open("seg_1.tm", IoAdvice::Normal).unwrap();
    let mut bytes = vec![0u8; input.len() as usize];
    input.read_exact(&mut bytes).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    let mut out = dir.create("seg_1.tm").unwrap();
    out.write_bytes(&bytes).unwrap();
    out.close().unwrap();

    assert!(SegmentReader::open(Arc::clone(&dir), &meta).is_none());
    // a failed open leaves nothing behind in the reference tracker
    for file in &meta.files {
        assert!(!dir.file_refs().is_referenced(file), "{file} leaked a ref");
    }
}

#[test]
fn test_reopen_versions() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let meta = fruit_segment(&dir);
    let reader = SegmentReader::open(Arc::clone(&dir), &meta).unwrap();
    assert_eq!(reader.live_docs_count(), 3);

    // same version: the same state is reused
    let same = reader.reopen(&meta).unwrap();
    assert_eq!(same.live_docs_count(), 3);

    // publish a mask update under a bumped version
    let mut mask = roaring::RoaringBitmap::new();
    mask.insert(2);
    write_document_mask(dir.as_ref(), "seg_1", &mask).unwrap();
    let mut meta_v2 = meta.clone();
    meta_v2.version += 1;

    let updated = reader.reopen(&meta_v2).unwrap();
    assert_eq!(updated.live_docs_count(), 2);
    // the original reader still observes its snapshot
    assert_eq!(reader.live_docs_count(), 3);
}

#[test]
fn test_stored_fields_and_attributes() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let mut writer = SegmentWriter::new(Arc::clone(&dir), default_codec());
    writer.reset("seg_1");

    let mut tokens = Tokens::of_terms(["apple"]);
    writer
        .index_field(1, "body", &mut tokens, Features::FREQ, 1.0)
        .unwrap();
    writer
        .store_field(1, "body", |out| out.write_bytes(b"raw apple text"))
        .unwrap();
    writer
        .store_attribute(1, "price", |out| out.write_vu32(42))
        .unwrap();
    writer.finish(1, UpdateContext::default()).unwrap();

    let mut tokens = Tokens::of_terms(["banana"]);
    writer
        .index_field(2, "body", &mut tokens, Features::FREQ, 1.0)
        .unwrap();
    writer.finish(2, UpdateContext::default()).unwrap();

    let (_, meta) = writer.flush().unwrap();
    let reader = SegmentReader::open(Arc::clone(&dir), &meta).unwrap();
    let snapshot = reader.snapshot();

    // stored field addressed through the field id
    let field_id = snapshot.field_meta("body").unwrap().id;
    let values = snapshot.values(field_id);
    let mut out = Vec::new();
    assert!(values.get(1, &mut out));
    assert_eq!(out, b"raw apple text");
    assert!(!values.get(2, &mut out));

    // named attribute column
    assert!(snapshot.column("price").is_some());
    let values = snapshot.values_by_name("price");
    assert!(values.get(1, &mut out));
    let mut input = SliceInput::new(&out);
    assert_eq!(input.read_vu32().unwrap(), 42);

    // columns come back sorted by name
    let names: Vec<&str> = snapshot.columns().iter().map(|c| c.name.as_str()).collect();
    assert!(names.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_norms() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let mut writer = SegmentWriter::new(Arc::clone(&dir), default_codec());
    writer.reset("seg_1");

    // doc 1: four tokens -> norm 1/2; doc 2: one token -> default, not stored
    let mut tokens = Tokens::of_terms(["a", "b", "c", "d"]);
    writer
        .index_field(1, "body", &mut tokens, Features::FREQ | Features::NORM, 1.0)
        .unwrap();
    writer.finish(1, UpdateContext::default()).unwrap();

    let mut tokens = Tokens::of_terms(["e"]);
    writer
        .index_field(2, "body", &mut tokens, Features::FREQ | Features::NORM, 1.0)
        .unwrap();
    writer.finish(2, UpdateContext::default()).unwrap();

    let (_, meta) = writer.flush().unwrap();
    let reader = SegmentReader::open(Arc::clone(&dir), &meta).unwrap();
    let snapshot = reader.snapshot();

    let norms = snapshot.norms("body").expect("norm column present");
    let mut out = Vec::new();
    assert!(norms.get(1, &mut out));
    let mut input = SliceInput::new(&out);
    let norm = input.read_zvfloat().unwrap();
    assert!((norm - 0.5).abs() < 1e-6);

    assert!(!norms.get(2, &mut out));
}

#[test]
fn test_cleaner_keeps_published_segment() {
    let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let meta = fruit_segment(&dir);

    silt::index::meta::write_index_meta(
        dir.as_ref(),
        &silt::index::IndexMeta {
            generation: 1,
            segments: vec![meta.clone()],
        },
    )
    .unwrap();

    // an orphan from an abandoned flush
    let mut out = dir.create("seg_9.tm").unwrap();
    out.write_bytes(b"junk").unwrap();
    out.close().unwrap();

    let acceptor = silt::index::meta::current_segments_acceptor(dir.as_ref()).unwrap();
    let removed = silt::store::clean(dir.as_ref(), acceptor).unwrap();
    assert_eq!(removed, 1);
    assert!(!dir.exists("seg_9.tm").unwrap());
    for file in &meta.files {
        assert!(dir.exists(file).unwrap(), "{file} should survive");
    }
    assert!(dir.exists("seg_1.sm").unwrap());

    // the published segment still opens
    assert!(SegmentReader::open(Arc::clone(&dir), &meta).is_some());
}
