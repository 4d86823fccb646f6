use std::path::PathBuf;

use assert_matches::assert_matches;
use serde_json::json;

use genodex::aggregate::{EntityAccumulator, EntityContribution, Phase};
use genodex::datasets::operon::{
    MISSING_GENES, import_operons, operon_contribution, operon_schema,
};
use genodex::error::GenodexError;
use genodex::index::{IndexSettings, IndexWriter, MemoryIndex};
use genodex::ingest::IngestOptions;
use genodex::source::Row;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn contribution(key: &str, genes: &[&str], inferred: Option<&str>) -> EntityContribution {
    EntityContribution {
        explicit_key: Some(key.to_string()),
        participants: genes.iter().map(|gene| gene.to_string()).collect(),
        inferred_category: inferred.map(str::to_string),
        ..EntityContribution::default()
    }
}

#[test]
fn operon_rows_fold_into_entities() {
    let index = MemoryIndex::new();
    let options = IngestOptions::new("operons");
    let (summary, accumulator) =
        import_operons(&index, &[fixture("operons.csv")], None, &options).unwrap();

    assert_eq!(summary.rows_read, 5);
    assert_eq!(summary.rows_skipped, 1);
    assert_eq!(summary.skipped_by_reason.get(MISSING_GENES), Some(&1));
    assert_eq!(accumulator.phase(), Phase::Flushed);
    assert_eq!(accumulator.len(), 2);
    assert_eq!(index.len("operons"), 2);

    let op1 = index.document("operons", "OP1").unwrap();
    assert_eq!(op1["genes"], json!(["BU_0001", "BU_0002", "BU_0003"]));
    assert_eq!(op1["gene_count"], json!(3));
    assert_eq!(op1["taxonomy"], json!("BU"));
    assert_eq!(op1["validated"], json!(true));
    assert_eq!(op1["conserved"], json!(true));
    assert_eq!(op1["isolates"], json!(["ISO1"]));
    assert_eq!(op1["sources"], json!(["operon-mapper"]));
    assert_eq!(op1["first_gene"]["id"], json!("BU_0001"));
    assert_eq!(op1["second_gene"]["id"], json!("BU_0002"));
    assert_eq!(op1["row_count"], json!(2));

    let derived = index.document("operons", "BU_0010__BU_0011").unwrap();
    assert_eq!(derived["gene_count"], json!(2));
    assert_eq!(derived["validated"], json!(false));
    assert_eq!(derived["row_count"], json!(2));
}

#[test]
fn operon_import_restores_settings() {
    let tuned = IndexSettings {
        refresh_interval: Some("30s".to_string()),
        number_of_replicas: Some(2),
    };
    let index = MemoryIndex::new().with_settings("operons", tuned.clone());
    let (summary, _) = import_operons(
        &index,
        &[fixture("operons.csv")],
        None,
        &IngestOptions::new("operons"),
    )
    .unwrap();

    assert!(summary.settings_restored);
    assert_eq!(index.settings("operons").unwrap(), tuned);
    assert_eq!(index.settings_history().first(), Some(&IndexSettings::bulk_load()));
}

#[test]
fn operon_reimport_overwrites() {
    let index = MemoryIndex::new();
    let options = IngestOptions::new("operons");
    import_operons(&index, &[fixture("operons.csv")], None, &options).unwrap();
    let first = index.documents("operons");
    import_operons(&index, &[fixture("operons.csv")], None, &options).unwrap();
    assert_eq!(index.documents("operons"), first);
}

#[test]
fn explicit_operon_id_groups_all_pairs() {
    let mut accumulator = EntityAccumulator::new(operon_schema());
    for (a, b) in [("G1", "G2"), ("G2", "G3"), ("G1", "G3")] {
        let row = Row::from_pairs([("operon_id", "O1"), ("gene_a", a), ("gene_b", b)]);
        let contribution = operon_contribution(&row, None).unwrap();
        assert!(accumulator.accumulate(contribution).unwrap());
    }
    accumulator.finalize().unwrap();

    assert_eq!(accumulator.len(), 1);
    let document = accumulator.documents().next().unwrap();
    assert_eq!(document["id"], json!("O1"));
    assert_eq!(document["genes"], json!(["G1", "G2", "G3"]));
    assert_eq!(document["gene_count"], json!(3));
}

#[test]
fn inferred_category_takes_majority() {
    let mut accumulator = EntityAccumulator::new(operon_schema());
    for inferred in ["BU", "BU", "BU", "XX"] {
        accumulator
            .accumulate(contribution("E1", &["G1"], Some(inferred)))
            .unwrap();
    }
    accumulator.finalize().unwrap();
    assert_eq!(accumulator.get("E1").unwrap().category.as_deref(), Some("BU"));
}

#[test]
fn explicit_category_wins_over_inferred() {
    let mut accumulator = EntityAccumulator::new(operon_schema());
    accumulator
        .accumulate(contribution("E1", &["G1"], Some("BU")))
        .unwrap();
    accumulator
        .accumulate(EntityContribution {
            explicit_category: Some("Buchnera aphidicola".to_string()),
            ..contribution("E1", &["G2"], Some("BU"))
        })
        .unwrap();
    accumulator.finalize().unwrap();

    let entity = accumulator.get("E1").unwrap();
    assert_eq!(entity.category.as_deref(), Some("Buchnera aphidicola"));
    assert_eq!(entity.participants, vec!["G1", "G2"]);
    assert_eq!(entity.participant_count, 2);
}

#[test]
fn flags_only_turn_on() {
    let mut accumulator = EntityAccumulator::new(operon_schema());
    for flag in [false, true, false] {
        accumulator
            .accumulate(EntityContribution {
                flags: vec![("validated".to_string(), flag)],
                ..contribution("E1", &["G1"], None)
            })
            .unwrap();
    }
    accumulator.finalize().unwrap();
    assert_eq!(accumulator.get("E1").unwrap().flags.get("validated"), Some(&true));
}

#[test]
fn rows_without_a_key_are_dropped() {
    let mut accumulator = EntityAccumulator::new(operon_schema());
    let kept = accumulator
        .accumulate(EntityContribution {
            participants: vec!["G1".to_string()],
            ..EntityContribution::default()
        })
        .unwrap();
    assert!(!kept);
    assert_eq!(accumulator.skipped(), 1);
    assert!(accumulator.is_empty());
}

#[test]
fn phases_are_enforced() {
    let index = MemoryIndex::new();
    let options = IngestOptions::new("operons");
    let mut accumulator = EntityAccumulator::new(operon_schema());
    assert_eq!(accumulator.phase(), Phase::Empty);

    accumulator
        .accumulate(contribution("E1", &["G1"], None))
        .unwrap();
    assert_matches!(
        accumulator.flush(&index, &options, false),
        Err(GenodexError::InvalidPhase { action: "flush", .. })
    );

    accumulator.finalize().unwrap();
    assert_matches!(
        accumulator.accumulate(contribution("E2", &["G2"], None)),
        Err(GenodexError::InvalidPhase { current: "finalized", .. })
    );

    let stats = accumulator.flush(&index, &options, true).unwrap();
    assert_eq!(stats.indexed, 1);
    assert!(accumulator.is_empty());
    assert_matches!(
        accumulator.flush(&index, &options, false),
        Err(GenodexError::InvalidPhase { current: "flushed", .. })
    );
}
