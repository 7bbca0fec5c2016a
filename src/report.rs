use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{UnixTimeMs, MAX_DESCRIPTION_LEN, MAX_LOCATION_LEN, MAX_VULNERABLE_TAGS};

// --- Validation errors ---

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReportValidationError {
    #[error("description must not be empty")]
    EmptyDescription,
    #[error("value too long ({len} > {max})")]
    TooLong { len: usize, max: usize },
    #[error("invalid coordinate: lat={0}, lng={1}")]
    InvalidCoordinate(f64, f64),
    #[error("too many vulnerable-group tags ({0} > {MAX_VULNERABLE_TAGS})")]
    TooManyTags(usize),
}

// --- Bounded text ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct BoundedText<const MAX: usize>(String);

impl<const MAX: usize> BoundedText<MAX> {
    pub fn new(s: impl Into<String>) -> Result<Self, ReportValidationError> {
        let s = s.into();
        if s.len() > MAX {
            return Err(ReportValidationError::TooLong {
                len: s.len(),
                max: MAX,
            });
        }
        Ok(Self(s))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<const MAX: usize> fmt::Display for BoundedText<MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Description = BoundedText<MAX_DESCRIPTION_LEN>;
pub type LocationText = BoundedText<MAX_LOCATION_LEN>;

// --- Coordinates: validated, NaN-safe ---

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct GeoPoint {
    lat: f64,
    lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Result<Self, ReportValidationError> {
        if !lat.is_finite()
            || !lng.is_finite()
            || !(-90.0..=90.0).contains(&lat)
            || !(-180.0..=180.0).contains(&lng)
        {
            return Err(ReportValidationError::InvalidCoordinate(lat, lng));
        }
        Ok(Self { lat, lng })
    }

    #[must_use]
    pub fn lat(&self) -> f64 {
        self.lat
    }

    #[must_use]
    pub fn lng(&self) -> f64 {
        self.lng
    }
}

impl PartialEq for GeoPoint {
    fn eq(&self, other: &Self) -> bool {
        self.lat.to_bits() == other.lat.to_bits() && self.lng.to_bits() == other.lng.to_bits()
    }
}

impl Eq for GeoPoint {}

// --- Domain enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NeedType {
    Water,
    Medical,
    Shelter,
    Food,
    // Catch-all for tags this build does not know yet.
    #[serde(other)]
    Other,
}

impl NeedType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Water => "water",
            Self::Medical => "medical",
            Self::Shelter => "shelter",
            Self::Food => "food",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for NeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    #[default]
    Submitted,
    Queued,
    InProgress,
    Resolved,
    Closed,
    Duplicate,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

// --- Case identifier ---

/// Client-generated human-readable case reference, e.g. `CASE-2026-1755700000000-042`.
///
/// Generated once when the draft is created, so every replay of the same
/// queued submission carries an identical identifier.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CaseId(pub String);

impl CaseId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn generate(now: UnixTimeMs) -> Self {
        use chrono::Datelike;

        let year = chrono::DateTime::from_timestamp_millis(i64::try_from(now.0).unwrap_or(0))
            .map_or(1970, |dt| dt.year());
        let suffix = (uuid::Uuid::new_v4().as_u128() % 1000) as u16;
        Self(format!("CASE-{year}-{}-{suffix:03}", now.0))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Draft: a validated submission before it becomes a remote write ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReportDraft {
    pub case_id: CaseId,
    pub need_type: NeedType,
    pub description: Description,
    pub location: LocationText,
    pub coordinates: Option<GeoPoint>,
    pub dependents: u32,
    pub vulnerable_tags: Vec<String>,
    pub share_with_responders: bool,
    pub share_precise_coords: bool,
    pub priority: ReportPriority,
}

impl ReportDraft {
    pub fn new(
        need_type: NeedType,
        description: impl Into<String>,
        location: impl Into<String>,
        now: UnixTimeMs,
    ) -> Result<Self, ReportValidationError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(ReportValidationError::EmptyDescription);
        }

        Ok(Self {
            case_id: CaseId::generate(now),
            need_type,
            description: Description::new(description)?,
            location: LocationText::new(location)?,
            coordinates: None,
            dependents: 0,
            vulnerable_tags: Vec::new(),
            share_with_responders: true,
            share_precise_coords: false,
            priority: ReportPriority::default(),
        })
    }

    #[must_use]
    pub fn with_coordinates(mut self, point: GeoPoint) -> Self {
        self.coordinates = Some(point);
        self
    }

    #[must_use]
    pub fn with_dependents(mut self, count: u32) -> Self {
        self.dependents = count;
        self
    }

    pub fn with_vulnerable_tags(
        mut self,
        tags: Vec<String>,
    ) -> Result<Self, ReportValidationError> {
        if tags.len() > MAX_VULNERABLE_TAGS {
            return Err(ReportValidationError::TooManyTags(tags.len()));
        }
        self.vulnerable_tags = tags;
        Ok(self)
    }

    #[must_use]
    pub fn with_priority(mut self, priority: ReportPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_privacy(mut self, share_with_responders: bool, share_precise_coords: bool) -> Self {
        self.share_with_responders = share_with_responders;
        self.share_precise_coords = share_precise_coords;
        self
    }

    /// The JSON record the remote insert expects. This is also the queued
    /// payload shape, so a queued submission replays byte-identically.
    ///
    /// Precise coordinates leave the device only when `share_precise_coords`
    /// is set.
    #[must_use]
    pub fn to_payload(&self) -> serde_json::Value {
        let coords = if self.share_precise_coords {
            self.coordinates
        } else {
            None
        };

        serde_json::json!({
            "case_id": self.case_id.as_str(),
            "need_type": self.need_type,
            "description": self.description.as_str(),
            "location": self.location.as_str(),
            "latitude": coords.map(|c| c.lat()),
            "longitude": coords.map(|c| c.lng()),
            "dependents": self.dependents,
            "vulnerable_tags": self.vulnerable_tags,
            "share_with_responders": self.share_with_responders,
            "share_precise_coords": self.share_precise_coords,
            "priority": self.priority,
            "status": ReportStatus::Submitted,
        })
    }
}

// --- Remote rows ---

/// One `emergency_reports` row as the backend returns it. Decoding is
/// deliberately tolerant: absent or novel fields must not fail a whole
/// list response.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RemoteReportRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub need_type: Option<NeedType>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub dependents: Option<u32>,
    #[serde(default)]
    pub priority: Option<ReportPriority>,
    #[serde(default)]
    pub status: Option<ReportStatus>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl RemoteReportRow {
    /// Epoch ms parsed from the server's RFC 3339 `created_at`, when present.
    #[must_use]
    pub fn created_at_ms(&self) -> Option<UnixTimeMs> {
        let raw = self.created_at.as_deref()?;
        let parsed = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
        u64::try_from(parsed.timestamp_millis()).ok().map(UnixTimeMs)
    }
}

/// Server-side listing parameters for the reports feed, expressed as
/// PostgREST query pairs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReportQuery {
    pub need_type: Option<NeedType>,
    pub status: Option<ReportStatus>,
    pub limit: u32,
}

impl Default for ReportQuery {
    fn default() -> Self {
        Self {
            need_type: None,
            status: None,
            limit: crate::DEFAULT_LIST_LIMIT,
        }
    }
}

impl ReportQuery {
    /// Most recent first, then by priority, matching the volunteer feed.
    #[must_use]
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("select".to_string(), "*".to_string()),
            (
                "order".to_string(),
                "created_at.desc,priority.desc".to_string(),
            ),
        ];
        if let Some(need) = self.need_type {
            pairs.push(("need_type".to_string(), format!("eq.{need}")));
        }
        if let Some(status) = self.status {
            if let Ok(tag) = serde_json::to_value(status) {
                if let Some(tag) = tag.as_str() {
                    pairs.push(("status".to_string(), format!("eq.{tag}")));
                }
            }
        }
        pairs.push(("limit".to_string(), self.limit.to_string()));
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_draft() -> ReportDraft {
        ReportDraft::new(
            NeedType::Water,
            "Water supply disrupted, community of 50+ families",
            "Koramangala, Bangalore",
            UnixTimeMs(1_755_700_000_000),
        )
        .unwrap()
    }

    #[test]
    fn draft_rejects_empty_description() {
        let result = ReportDraft::new(NeedType::Food, "   ", "somewhere", UnixTimeMs(0));
        assert_eq!(result, Err(ReportValidationError::EmptyDescription));
    }

    #[test]
    fn draft_rejects_oversized_description() {
        let long = "x".repeat(MAX_DESCRIPTION_LEN + 1);
        let result = ReportDraft::new(NeedType::Food, long, "somewhere", UnixTimeMs(0));
        assert!(matches!(
            result,
            Err(ReportValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn geo_point_rejects_nan_and_out_of_range() {
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
        assert!(GeoPoint::new(0.0, f64::INFINITY).is_err());
        assert!(GeoPoint::new(91.0, 0.0).is_err());
        assert!(GeoPoint::new(0.0, -181.0).is_err());
        assert!(GeoPoint::new(12.97, 77.59).is_ok());
    }

    #[test]
    fn case_id_uses_source_format() {
        let id = CaseId::generate(UnixTimeMs(1_755_700_000_000));
        let parts: Vec<&str> = id.as_str().split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "CASE");
        assert_eq!(parts[1], "2025");
        assert_eq!(parts[2], "1755700000000");
        assert_eq!(parts[3].len(), 3);
        assert!(parts[3].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn payload_uses_remote_column_names() {
        let draft = sample_draft();
        let payload = draft.to_payload();
        assert_eq!(payload["need_type"], "water");
        assert_eq!(payload["status"], "submitted");
        assert_eq!(
            payload["description"],
            "Water supply disrupted, community of 50+ families"
        );
        assert_eq!(payload["case_id"], draft.case_id.as_str());
        assert_eq!(payload["priority"], "medium");
    }

    #[test]
    fn payload_withholds_coordinates_unless_shared() {
        let point = GeoPoint::new(12.9716, 77.5946).unwrap();

        let private = sample_draft().with_coordinates(point);
        let payload = private.to_payload();
        assert!(payload["latitude"].is_null());
        assert!(payload["longitude"].is_null());

        let shared = sample_draft()
            .with_coordinates(point)
            .with_privacy(true, true);
        let payload = shared.to_payload();
        assert_eq!(payload["latitude"], 12.9716);
        assert_eq!(payload["longitude"], 77.5946);
    }

    #[test]
    fn payload_is_stable_across_calls() {
        let draft = sample_draft();
        let a = serde_json::to_string(&draft.to_payload()).unwrap();
        let b = serde_json::to_string(&draft.to_payload()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn need_type_decodes_unknown_as_other() {
        let parsed: NeedType = serde_json::from_str("\"sanitation\"").unwrap();
        assert_eq!(parsed, NeedType::Other);
        let parsed: NeedType = serde_json::from_str("\"medical\"").unwrap();
        assert_eq!(parsed, NeedType::Medical);
    }

    #[test]
    fn report_status_decodes_unknown_tag() {
        let parsed: ReportStatus = serde_json::from_str("\"triaged\"").unwrap();
        assert_eq!(parsed, ReportStatus::Unknown);
    }

    #[test]
    fn remote_row_tolerates_missing_fields() {
        let row: RemoteReportRow = serde_json::from_str("{}").unwrap();
        assert_eq!(row.case_id, None);
        assert_eq!(row.status, None);

        let row: RemoteReportRow = serde_json::from_str(
            r#"{"case_id":"CASE-2026-1-001","need_type":"water","status":"submitted",
                "created_at":"2026-08-21T10:15:00+00:00","extra_column":42}"#,
        )
        .unwrap();
        assert_eq!(row.need_type, Some(NeedType::Water));
        assert!(row.created_at_ms().is_some());
    }

    #[test]
    fn created_at_parse_rejects_garbage() {
        let row = RemoteReportRow {
            created_at: Some("not-a-date".into()),
            ..serde_json::from_str("{}").unwrap()
        };
        assert_eq!(row.created_at_ms(), None);
    }

    #[test]
    fn query_pairs_cover_filters_and_order() {
        let query = ReportQuery {
            need_type: Some(NeedType::Medical),
            status: Some(ReportStatus::Submitted),
            limit: 25,
        };
        let pairs = query.to_query_pairs();
        assert!(pairs.contains(&("order".into(), "created_at.desc,priority.desc".into())));
        assert!(pairs.contains(&("need_type".into(), "eq.medical".into())));
        assert!(pairs.contains(&("status".into(), "eq.submitted".into())));
        assert!(pairs.contains(&("limit".into(), "25".into())));
    }

    #[test]
    fn priority_orders_by_urgency() {
        assert!(ReportPriority::Urgent > ReportPriority::High);
        assert!(ReportPriority::High > ReportPriority::Medium);
        assert!(ReportPriority::Medium > ReportPriority::Low);
    }
}
