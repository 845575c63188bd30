//! CSV catalog producer
//!
//! Reads a discovered-series catalog and registers every id with the
//! entity registry. Registration establishes identity only; sync state of
//! known entities is never touched.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{CadenceClass, EntityId};
use crate::infrastructure::entity_registry::{EntityRegistry, StoreError, UpsertOutcome};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Cannot read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed catalog CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Catalog has no id column (headers: {0})")]
    MissingIdColumn(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub entity_id: EntityId,
    pub cadence_class: CadenceClass,
    pub hierarchy_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub rows: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub duplicates: usize,
    pub blank_ids: usize,
}

struct Columns {
    id: usize,
    frequency: Option<usize>,
    path: Option<usize>,
}

impl Columns {
    fn locate(headers: &StringRecord) -> Result<Self, CatalogError> {
        let names: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
        let position = |wanted: &[&str]| names.iter().position(|n| wanted.contains(&n.as_str()));

        let id = position(&["series_id"])
            .or_else(|| names.iter().position(|n| n.contains("id")))
            .ok_or_else(|| CatalogError::MissingIdColumn(names.join(",")))?;

        Ok(Self {
            id,
            frequency: position(&["frequency"]),
            path: position(&["source_category", "path", "category"]),
        })
    }
}

/// Parse catalog rows; ids are trimmed, blank ids and repeats are dropped
pub fn read_catalog<R: Read>(reader: R) -> Result<(Vec<CatalogEntry>, ImportReport), CatalogError> {
    let mut csv = ReaderBuilder::new().flexible(true).trim(csv::Trim::All).from_reader(reader);
    let columns = Columns::locate(csv.headers()?)?;

    let mut report = ImportReport::default();
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for record in csv.records() {
        let record = record?;
        report.rows += 1;

        let Some(id) = record.get(columns.id).filter(|id| !id.is_empty()) else {
            report.blank_ids += 1;
            continue;
        };
        if !seen.insert(id.to_string()) {
            report.duplicates += 1;
            continue;
        }

        let cadence_class = columns
            .frequency
            .and_then(|i| record.get(i))
            .and_then(CadenceClass::from_frequency_label)
            .unwrap_or(CadenceClass::Irregular);
        let hierarchy_path = columns
            .path
            .and_then(|i| record.get(i))
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        entries.push(CatalogEntry {
            entity_id: EntityId::new(id),
            cadence_class,
            hierarchy_path,
        });
    }

    if report.duplicates > 0 || report.blank_ids > 0 {
        warn!(
            "Catalog: {} duplicate ids and {} blank ids ignored",
            report.duplicates, report.blank_ids
        );
    }
    Ok((entries, report))
}

/// Register every catalog entry
pub async fn import_entries(
    registry: &EntityRegistry,
    entries: &[CatalogEntry],
    report: &mut ImportReport,
) -> Result<(), CatalogError> {
    for entry in entries {
        let outcome = registry
            .upsert(&entry.entity_id, entry.cadence_class, entry.hierarchy_path.as_deref())
            .await?;
        match outcome {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::Unchanged => report.unchanged += 1,
        }
    }
    Ok(())
}

pub async fn import_catalog_file(registry: &EntityRegistry, path: &Path) -> Result<ImportReport, CatalogError> {
    let file = std::fs::File::open(path).map_err(|source| CatalogError::Io {
        path: path.display().to_string(),
        source,
    })?;
    debug!("Reading catalog {:?}", path);

    let (entries, mut report) = read_catalog(file)?;
    import_entries(registry, &entries, &mut report).await?;

    info!(
        "📥 Catalog import: {} rows, {} new, {} updated, {} unchanged",
        report.rows, report.inserted, report.updated, report.unchanged
    );
    Ok(report)
}
