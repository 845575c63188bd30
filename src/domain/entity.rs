//! Tracked time series and their scheduling state
//!
//! An [`Entity`] is owned exclusively by the entity registry; every other
//! component reads it or mutates it through registry/store operations.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Stable external identifier of a tracked series
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Expected update frequency of a series
///
/// Declaration order is scheduling priority: shorter cadences are serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CadenceClass {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Irregular,
}

impl CadenceClass {
    pub const ALL: [Self; 5] = [
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
        Self::Quarterly,
        Self::Irregular,
    ];

    /// Nominal refresh interval before jitter is applied
    pub const fn interval(self) -> Duration {
        const DAY: u64 = 24 * 60 * 60;
        match self {
            Self::Daily => Duration::from_secs(DAY),
            Self::Weekly => Duration::from_secs(7 * DAY),
            Self::Monthly => Duration::from_secs(30 * DAY),
            Self::Quarterly => Duration::from_secs(90 * DAY),
            Self::Irregular => Duration::from_secs(180 * DAY),
        }
    }

    pub const fn priority_rank(self) -> u8 {
        match self {
            Self::Daily => 0,
            Self::Weekly => 1,
            Self::Monthly => 2,
            Self::Quarterly => 3,
            Self::Irregular => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Quarterly => "QUARTERLY",
            Self::Irregular => "IRREGULAR",
        }
    }

    /// Map an upstream frequency label ("Daily, 7-Day", "Monthly", "Biweekly") to a cadence.
    ///
    /// Returns `None` for labels that name no known cadence (e.g. "Annual").
    pub fn from_frequency_label(label: &str) -> Option<Self> {
        let lower = label.to_lowercase();
        if lower.contains("daily") {
            Some(Self::Daily)
        } else if lower.contains("weekly") {
            // "Biweekly" is still serviced on the weekly schedule
            Some(Self::Weekly)
        } else if lower.contains("monthly") {
            Some(Self::Monthly)
        } else if lower.contains("quarterly") {
            Some(Self::Quarterly)
        } else {
            None
        }
    }
}

impl fmt::Display for CadenceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CadenceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            "QUARTERLY" => Ok(Self::Quarterly),
            "IRREGULAR" => Ok(Self::Irregular),
            other => Err(format!("unknown cadence class: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    Active,
    /// Excluded from normal scheduling until re-admitted by a retry pass
    Suspended,
}

impl EntityStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "SUSPENDED" => Ok(Self::Suspended),
            other => Err(format!("unknown entity status: {other}")),
        }
    }
}

/// One tracked time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub cadence_class: CadenceClass,
    pub hierarchy_path: Option<String>,
    /// Date of the newest stored data point
    pub last_observed_date: Option<NaiveDate>,
    /// Last successful reconciliation
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Last fetch attempt, successful or not
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub status: EntityStatus,
    pub metadata: Option<EntityMetadata>,
}

impl Entity {
    /// A freshly discovered entity with no sync history
    pub fn new(id: impl Into<EntityId>, cadence_class: CadenceClass) -> Self {
        Self {
            id: id.into(),
            cadence_class,
            hierarchy_path: None,
            last_observed_date: None,
            last_sync_at: None,
            last_attempt_at: None,
            consecutive_failures: 0,
            status: EntityStatus::Active,
            metadata: None,
        }
    }

    pub fn with_hierarchy_path(mut self, path: impl Into<String>) -> Self {
        self.hierarchy_path = Some(path.into());
        self
    }

    pub fn with_last_sync(mut self, at: DateTime<Utc>) -> Self {
        self.last_sync_at = Some(at);
        self.last_attempt_at = Some(at);
        self
    }

    pub fn with_failures(mut self, failures: u32, last_attempt_at: DateTime<Utc>) -> Self {
        self.consecutive_failures = failures;
        self.last_attempt_at = Some(last_attempt_at);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == EntityStatus::Active
    }
}

/// Descriptive metadata reported by the upstream alongside a payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub title: Option<String>,
    pub frequency: Option<String>,
    pub units: Option<String>,
    pub seasonal_adjustment: Option<String>,
    pub upstream_updated: Option<String>,
}

impl EntityMetadata {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Daily", Some(CadenceClass::Daily))]
    #[case("Daily, 7-Day", Some(CadenceClass::Daily))]
    #[case("Weekly, Ending Friday", Some(CadenceClass::Weekly))]
    #[case("Biweekly", Some(CadenceClass::Weekly))]
    #[case("Monthly", Some(CadenceClass::Monthly))]
    #[case("Quarterly", Some(CadenceClass::Quarterly))]
    #[case("Annual", None)]
    #[case("", None)]
    fn frequency_labels_map_to_cadence(#[case] label: &str, #[case] expected: Option<CadenceClass>) {
        assert_eq!(CadenceClass::from_frequency_label(label), expected);
    }

    #[test]
    fn cadence_order_is_scheduling_priority() {
        let mut shuffled = vec![
            CadenceClass::Irregular,
            CadenceClass::Monthly,
            CadenceClass::Daily,
            CadenceClass::Quarterly,
            CadenceClass::Weekly,
        ];
        shuffled.sort();
        assert_eq!(shuffled, CadenceClass::ALL.to_vec());
        assert!(CadenceClass::Daily.interval() < CadenceClass::Weekly.interval());
    }

    #[test]
    fn cadence_and_status_round_trip_through_text() {
        for cadence in CadenceClass::ALL {
            assert_eq!(cadence.as_str().parse::<CadenceClass>(), Ok(cadence));
        }
        assert_eq!("suspended".parse::<EntityStatus>(), Ok(EntityStatus::Suspended));
        assert!("paused".parse::<EntityStatus>().is_err());
    }

    #[test]
    fn entity_id_is_trimmed() {
        assert_eq!(EntityId::new("  GDP \n").as_str(), "GDP");
    }
}
