//! Observations and the raw payload they are parsed from

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::entity::EntityId;

/// A stored observation, unique per `(entity_id, observation_date)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub entity_id: EntityId,
    pub observation_date: NaiveDate,
    /// `None` when the upstream reports the observation as missing
    pub value: Option<f64>,
    pub revision: Option<String>,
}

/// A dated row parsed from a payload, not yet bound to an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    pub date: NaiveDate,
    pub value: Option<f64>,
    pub revision: Option<String>,
}

impl ObservationRow {
    pub fn into_data_point(self, entity_id: &EntityId) -> DataPoint {
        DataPoint {
            entity_id: entity_id.clone(),
            observation_date: self.date,
            value: self.value,
            revision: self.revision,
        }
    }
}

/// Opaque body returned by the fetch capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub body: String,
    pub content_type: Option<String>,
}

impl RawPayload {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Content fingerprint recorded as provenance of a reconciliation
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.body.as_bytes()).to_hex().to_string()
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = RawPayload::new("DATE,GDP\n2024-01-01,1.0\n");
        let b = RawPayload::new("DATE,GDP\n2024-01-01,1.0\n");
        let c = RawPayload::new("DATE,GDP\n2024-01-01,1.1\n");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
