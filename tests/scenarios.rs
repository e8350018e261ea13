//! End-to-end mapping scenarios against small hand-built corpora.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use collinear::{AnyIndex, IndexConfig, RefIndex};

fn dna_cfg() -> IndexConfig {
    IndexConfig::default().k(4).bandwidth(15).presence_fraction(0.1)
}

fn build(cfg: IndexConfig, refs: &[(&str, &[u8])]) -> AnyIndex {
    let mut index = AnyIndex::new(cfg);
    for (name, seq) in refs {
        index.add(name, seq);
    }
    index.build();
    index.init_query_buffers();
    index
}

#[test]
fn exact_self_match() {
    let index = build(dna_cfg(), &[("ref1", b"ACGTACGTACGTACGT")]);
    let hit = index.search(b"ACGTACGTACGTACGT");
    assert_eq!(hit.ref_name, Some("ref1"));
    assert!(hit.forward);
    assert_eq!(hit.position, 0);
    assert!(hit.presence >= 1.0);
}

#[test]
fn mid_sequence_match() {
    let index = build(dna_cfg(), &[("ref1", b"ACGTACGTACGTACGT")]);
    // Shortest query the length cutoff admits (9 bp with k = 4): an 8 bp
    // prefix would hit the sentinel instead, see the cutoff note in
    // DESIGN.md and the test below.
    let hit = index.search(b"ACGTACGTA");
    assert_eq!(hit.ref_name, Some("ref1"));
    assert!(hit.forward);
    assert_eq!(hit.position, 0);
    assert!(hit.presence >= 0.9);
}

#[test]
fn queries_at_the_length_cutoff_are_unmapped() {
    let index = build(dna_cfg(), &[("ref1", b"ACGTACGTACGTACGT")]);
    // Length exactly 2k never reaches the lookup, even for a verbatim
    // reference prefix; the cutoff note in DESIGN.md records why.
    let hit = index.search(b"ACGTACGT");
    assert_eq!(hit.ref_name, None);
    assert!(hit.forward);
    assert_eq!(hit.position, 0);
    assert_eq!(hit.presence, 0.0);
}

#[test]
fn palindromic_query_maps_forward() {
    // The reverse complement of this query equals the query itself, so
    // both passes agree and the tie keeps the forward strand.
    let index = build(dna_cfg(), &[("ref1", b"ACGTACGTACGTACGT")]);
    let hit = index.search(b"ACGTACGTACGT");
    assert_eq!(hit.ref_name, Some("ref1"));
    assert!(hit.forward);
}

#[test]
fn reverse_complement_match() {
    let index = build(dna_cfg(), &[("ref1", b"ACGTACGTAAAA")]);
    let hit = index.search(b"TTTTACGTACGT");
    assert_eq!(hit.ref_name, Some("ref1"));
    assert!(!hit.forward);
    assert_eq!(hit.position, 0);
    assert!(hit.presence >= 0.9);
}

#[test]
fn unrelated_query_is_unmapped() {
    let index = build(dna_cfg(), &[("ref1", b"ACGTACGTACGTACGT")]);
    let hit = index.search(b"GGGGGGGGGGGG");
    assert_eq!(hit.ref_name, None);
    assert_eq!(hit.position, 0);
    assert_eq!(hit.presence, 0.0);
}

#[test]
fn duplicate_references_map_to_one_of_them() {
    let a = vec![b'A'; 100];
    let index = build(dna_cfg(), &[("r1", &a[..]), ("r2", &a[..])]);
    let hit = index.search(&vec![b'A'; 50]);
    let name = hit.ref_name.expect("a pile of duplicate postings still maps");
    assert!(name == "r1" || name == "r2");
    assert!(hit.presence >= 0.9);
}

fn random_dna(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect()
}

struct Snapshot {
    name: Option<String>,
    forward: bool,
    position: u64,
    presence: f32,
}

fn snapshot(index: &AnyIndex, query: &[u8]) -> Snapshot {
    let hit = index.search(query);
    Snapshot {
        name: hit.ref_name.map(str::to_string),
        forward: hit.forward,
        position: hit.position,
        presence: hit.presence,
    }
}

fn assert_round_trip(cfg: IndexConfig) {
    let mut rng = StdRng::seed_from_u64(0xc011);
    let refs: Vec<(String, Vec<u8>)> = (0..10)
        .map(|i| (format!("ref{i}"), random_dna(&mut rng, 300)))
        .collect();

    let mut index = AnyIndex::new(cfg);
    for (name, seq) in &refs {
        index.add(name, seq);
    }
    index.build();
    index.init_query_buffers();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corpus.cidx");
    index.dump_to_path(&path).unwrap();
    let loaded = AnyIndex::load_from_path(&path).unwrap();
    assert_eq!(loaded.config(), index.config());
    assert_eq!(loaded.headers(), index.headers());
    assert_eq!(loaded.max_occ(), index.max_occ());

    // 100 substring queries; both instances must agree exactly.
    let mut mapped = 0;
    for _ in 0..100 {
        let (ref_id, start, len) = (
            rng.gen_range(0..refs.len()),
            rng.gen_range(0..200),
            rng.gen_range(40..90),
        );
        let query = &refs[ref_id].1[start..start + len];
        let a = snapshot(&index, query);
        let b = snapshot(&loaded, query);
        assert_eq!(a.name, b.name);
        assert_eq!(a.forward, b.forward);
        assert_eq!(a.position, b.position);
        assert_eq!(a.presence.to_bits(), b.presence.to_bits());
        if a.name.is_some() {
            mapped += 1;
        }
    }
    assert!(mapped > 90, "verbatim substrings should map ({mapped}/100)");
}

#[test]
fn round_trip_coordinate_index() {
    assert_round_trip(IndexConfig::default().k(8).bandwidth(15));
}

#[test]
fn round_trip_both_strand_index() {
    assert_round_trip(IndexConfig::default().k(8).bandwidth(15).fwd_rev(true));
}

#[test]
fn round_trip_jaccard_index() {
    assert_round_trip(
        IndexConfig::default()
            .jaccard(true)
            .k(8)
            .frag_len(60)
            .frag_ovlp_len(40),
    );
}

#[test]
fn round_trip_compressed_jaccard_index() {
    assert_round_trip(
        IndexConfig::default()
            .jaccard(true)
            .compressed(true)
            .k(8)
            .frag_len(60)
            .frag_ovlp_len(40),
    );
}

#[test]
fn round_trip_dynamic_index() {
    assert_round_trip(IndexConfig::default().dynamic(true).k(8).n_shard_bits(4));
}

#[test]
fn verbatim_substring_lands_within_a_band() {
    let mut rng = StdRng::seed_from_u64(7);
    let genome = random_dna(&mut rng, 2000);
    let cfg = IndexConfig::default().k(8).bandwidth(15);
    let bandwidth = cfg.bandwidth as u64;
    let index = build(cfg, &[("g", &genome[..])]);

    for &start in &[0usize, 137, 500, 1500, 1900] {
        let query = &genome[start..(start + 80).min(genome.len())];
        let hit = index.search(query);
        assert_eq!(hit.ref_name, Some("g"), "query at {start}");
        assert!(hit.forward);
        let distance = (hit.position as i64 - start as i64).unsigned_abs();
        assert!(
            distance <= bandwidth,
            "reported {} for a query at {start}",
            hit.position
        );
        assert!(hit.presence >= 0.8);
    }
}

#[test]
fn empty_corpus_unmaps_everything() {
    let index = build(dna_cfg(), &[]);
    assert_eq!(index.search(b"ACGTACGTACGTACGT").ref_name, None);
}
