//! Operon rows: many gene-pair rows fold into one operon document.

use std::path::PathBuf;

use serde_json::json;
use tracing::{debug, info};

use super::{enrich, row_group};
use crate::aggregate::{EntityAccumulator, EntityContribution, EntitySchema, ParticipantDetail};
use crate::annotation::Annotations;
use crate::domain::GroupId;
use crate::error::GenodexError;
use crate::index::IndexWriter;
use crate::ingest::{IngestOptions, IngestSummary};
use crate::source::{DelimitedReader, Row, collect_inputs};

pub const GENE_A: &[&str] = &["gene_a", "gene1", "locus_a", "first_gene"];
pub const GENE_B: &[&str] = &["gene_b", "gene2", "locus_b", "second_gene"];
pub const OPERON_ID: &[&str] = &["operon_id", "operon", "entity_id"];
pub const TAXONOMY: &[&str] = &["taxonomy", "species", "taxon"];
pub const VALIDATED: &[&str] = &["validated", "known", "experimentally_validated"];
pub const CONSERVED: &[&str] = &["conserved", "is_conserved"];

pub const MISSING_GENES: &str = "missing gene column";
pub const NO_ENTITY_KEY: &str = "no entity key";

pub fn operon_schema() -> EntitySchema {
    EntitySchema {
        participants_field: "genes".to_string(),
        count_field: "gene_count".to_string(),
        category_field: "taxonomy".to_string(),
        first_field: "first_gene".to_string(),
        second_field: "second_gene".to_string(),
    }
}

/// Taxon code carried by a locus tag, e.g. `BU` for `BU_00123`.
pub fn infer_taxon(locus_tag: &str) -> Option<String> {
    let (prefix, rest) = locus_tag.split_once('_')?;
    let valid = !prefix.is_empty()
        && !rest.is_empty()
        && prefix.chars().all(|ch| ch.is_ascii_alphanumeric());
    valid.then(|| prefix.to_string())
}

fn participant(
    annotations: Option<&dyn Annotations>,
    group: Option<&GroupId>,
    id: &str,
) -> ParticipantDetail {
    let record = enrich(annotations, group, id);
    ParticipantDetail {
        id: id.to_string(),
        alt_id: record.as_ref().and_then(|r| r.alt_id.clone()),
        name: record.as_ref().and_then(|r| r.name.clone()),
        product: record.as_ref().and_then(|r| r.product.clone()),
        seqid: record.as_ref().map(|r| r.seqid.clone()),
        start: record.as_ref().map(|r| r.start),
        end: record.as_ref().map(|r| r.end),
        strand: record.as_ref().and_then(|r| r.strand),
    }
}

pub fn operon_contribution(
    row: &Row,
    annotations: Option<&dyn Annotations>,
) -> Result<EntityContribution, &'static str> {
    let (Some(a), Some(b)) = (row.first_of(GENE_A), row.first_of(GENE_B)) else {
        return Err(MISSING_GENES);
    };
    let group = row_group(row);

    let mut details = Vec::new();
    if let Some(name) = row.first_of(&["operon_name"]) {
        details.push(("operon_name".to_string(), json!(name)));
    }
    if let Some(strand) = row.first_of(&["strand"]) {
        details.push(("strand".to_string(), json!(strand)));
    }

    let mut lists = Vec::new();
    if let Some(group) = group.as_ref() {
        lists.push(("isolates".to_string(), group.to_string()));
    }
    if let Some(source) = row.first_of(&["source", "method"]) {
        lists.push(("sources".to_string(), source.to_string()));
    }

    let mut flags = Vec::new();
    if let Some(validated) = row.flag(VALIDATED) {
        flags.push(("validated".to_string(), validated));
    }
    if let Some(conserved) = row.flag(CONSERVED) {
        flags.push(("conserved".to_string(), conserved));
    }

    Ok(EntityContribution {
        explicit_key: row.first_of(OPERON_ID).map(str::to_string),
        boundary: Some((a.to_string(), b.to_string())),
        participants: vec![a.to_string(), b.to_string()],
        first: Some(participant(annotations, group.as_ref(), a)),
        second: Some(participant(annotations, group.as_ref(), b)),
        details,
        lists,
        flags,
        explicit_category: row.first_of(TAXONOMY).map(str::to_string),
        inferred_category: infer_taxon(a).or_else(|| infer_taxon(b)),
    })
}

/// Reads every input, aggregates operons, then flushes them in one pass.
pub fn import_operons<W: IndexWriter>(
    writer: &W,
    inputs: &[PathBuf],
    annotations: Option<&dyn Annotations>,
    options: &IngestOptions,
) -> Result<(IngestSummary, EntityAccumulator), GenodexError> {
    let files = collect_inputs(inputs)?;
    let mut summary = IngestSummary {
        index: options.index.clone(),
        started_at: chrono::Utc::now().to_rfc3339(),
        ..IngestSummary::default()
    };
    let mut accumulator = EntityAccumulator::new(operon_schema());

    for path in &files {
        let mut reader = DelimitedReader::open(path)?;
        summary.files += 1;
        info!(path = %path.display(), "reading operon input");
        loop {
            let chunk = reader.next_chunk(options.chunk_size)?;
            if chunk.is_empty() {
                break;
            }
            for row in &chunk {
                summary.rows_read += 1;
                let contribution = match row.defect() {
                    Some(reason) => Err(reason),
                    None => operon_contribution(row, annotations),
                };
                match contribution {
                    Ok(contribution) => {
                        if !accumulator.accumulate(contribution)? {
                            summary.record_skip(NO_ENTITY_KEY);
                        }
                    }
                    Err(reason) => {
                        debug!(path = %path.display(), line = row.line(), reason, "row skipped");
                        summary.record_skip(reason);
                    }
                }
            }
        }
    }

    accumulator.finalize()?;
    info!(operons = accumulator.len(), "operons aggregated");
    summary.writes = accumulator.flush(writer, options, false)?;
    summary.settings_restored = true;
    summary.finished_at = chrono::Utc::now().to_rfc3339();
    Ok((summary, accumulator))
}
