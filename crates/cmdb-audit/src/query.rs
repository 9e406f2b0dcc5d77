//! Filtering, ordering, pagination and statistics over audit entries.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cmdb_core::types::SortOrder;
use cmdb_core::{Page, PageRequest, UserId};

use crate::{AuditAction, AuditLogEntry, EntityType};

/// Default number of audit entries per page.
pub const DEFAULT_AUDIT_PAGE_SIZE: u32 = 50;

/// Entries shown in `recent_activity`.
pub const RECENT_ACTIVITY: usize = 10;

/// Window covered by `daily_activity`.
pub const DAILY_ACTIVITY_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditSortField {
    #[default]
    Timestamp,
    EntityType,
    Action,
    PerformedBy,
    IpAddress,
}

/// Query parameters for listing audit entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub entity_id: Option<Uuid>,
    #[serde(default)]
    pub action: Option<AuditAction>,
    #[serde(default)]
    pub performed_by: Option<UserId>,
    /// Only include entries at or after this time.
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    /// Only include entries at or before this time.
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Case-insensitive substring over entity type, action and details.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sort: AuditSortField,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl AuditFilter {
    /// Check whether an entry matches every filter that is set.
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        if let Some(t) = &self.entity_type {
            if &entry.entity_type != t {
                return false;
            }
        }
        if let Some(id) = &self.entity_id {
            if entry.entity_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(a) = &self.action {
            if &entry.action != a {
                return false;
            }
        }
        if let Some(who) = &self.performed_by {
            if &entry.performed_by != who {
                return false;
            }
        }
        if let Some(from) = &self.start_date {
            if &entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = &self.end_date {
            if &entry.timestamp > to {
                return false;
            }
        }
        if let Some(term) = self.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let term = term.to_lowercase();
            let haystack = format!(
                "{} {} {}",
                entry.entity_type.as_str(),
                entry.action.as_str(),
                entry.details
            )
            .to_lowercase();
            if !haystack.contains(&term) {
                return false;
            }
        }
        true
    }

    pub fn page_request(&self) -> PageRequest {
        PageRequest::from_query(self.page, self.limit, DEFAULT_AUDIT_PAGE_SIZE)
    }
}

/// Matching entries in the filter's order.
pub fn select(entries: Vec<AuditLogEntry>, filter: &AuditFilter) -> Vec<AuditLogEntry> {
    let mut selected: Vec<AuditLogEntry> = entries.into_iter().filter(|e| filter.matches(e)).collect();
    selected.sort_by(|a, b| {
        let ord = compare(a, b, filter.sort).then_with(|| a.sequence.cmp(&b.sequence));
        match filter.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
    selected
}

fn compare(a: &AuditLogEntry, b: &AuditLogEntry, field: AuditSortField) -> Ordering {
    match field {
        AuditSortField::Timestamp => a.timestamp.cmp(&b.timestamp),
        AuditSortField::EntityType => a.entity_type.as_str().cmp(b.entity_type.as_str()),
        AuditSortField::Action => a.action.as_str().cmp(b.action.as_str()),
        AuditSortField::PerformedBy => a.performed_by.cmp(&b.performed_by),
        AuditSortField::IpAddress => a.ip_address.cmp(&b.ip_address),
    }
}

/// One page of matching entries.
pub fn list(entries: Vec<AuditLogEntry>, filter: &AuditFilter) -> Page<AuditLogEntry> {
    filter.page_request().apply(select(entries, filter))
}

// ── Statistics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuditStats {
    pub total_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub events_by_action: BTreeMap<String, u64>,
    pub events_by_user: BTreeMap<String, u64>,
    /// Newest entries first.
    pub recent_activity: Vec<AuditLogEntry>,
    /// `YYYY-MM-DD` to count, for the last 30 days.
    pub daily_activity: BTreeMap<String, u64>,
}

/// Aggregate the entries matching `filter`. Sort and page settings are ignored.
pub fn stats(entries: Vec<AuditLogEntry>, filter: &AuditFilter, now: DateTime<Utc>) -> AuditStats {
    let mut matching: Vec<AuditLogEntry> =
        entries.into_iter().filter(|e| filter.matches(e)).collect();
    matching.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.sequence.cmp(&a.sequence))
    });

    let window_start = now - Duration::days(DAILY_ACTIVITY_DAYS);
    let mut out = AuditStats {
        total_events: matching.len() as u64,
        ..Default::default()
    };

    for e in &matching {
        *out.events_by_type.entry(e.entity_type.to_string()).or_default() += 1;
        *out.events_by_action.entry(e.action.to_string()).or_default() += 1;
        *out.events_by_user.entry(e.performed_by.to_string()).or_default() += 1;
        if e.timestamp >= window_start {
            let day = e.timestamp.format("%Y-%m-%d").to_string();
            *out.daily_activity.entry(day).or_default() += 1;
        }
    }

    matching.truncate(RECENT_ACTIVITY);
    out.recent_activity = matching;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChainHead;
    use crate::tests::entry;

    fn sealed(action: AuditAction, entity_type: EntityType, age_days: i64, seq: u64) -> AuditLogEntry {
        let mut e = entry(action, entity_type);
        e.timestamp = Utc::now() - Duration::days(age_days);
        e.seal(&ChainHead {
            sequence: seq - 1,
            hash: None,
        })
    }

    fn sample() -> Vec<AuditLogEntry> {
        vec![
            sealed(AuditAction::Create, EntityType::Ci, 40, 1),
            sealed(AuditAction::Update, EntityType::Ci, 5, 2),
            sealed(AuditAction::Create, EntityType::Relationship, 2, 3),
            sealed(AuditAction::Delete, EntityType::Ci, 0, 4),
        ]
    }

    #[test]
    fn filters_by_type_and_action() {
        let f = AuditFilter {
            entity_type: Some(EntityType::Ci),
            action: Some(AuditAction::Create),
            ..Default::default()
        };
        let got = select(sample(), &f);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sequence, 1);
    }

    #[test]
    fn default_order_is_newest_first() {
        let got = select(sample(), &AuditFilter::default());
        let seqs: Vec<u64> = got.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![4, 3, 2, 1]);

        let asc = AuditFilter {
            order: SortOrder::Asc,
            ..Default::default()
        };
        assert_eq!(select(sample(), &asc)[0].sequence, 1);
    }

    #[test]
    fn date_range_and_search() {
        let f = AuditFilter {
            start_date: Some(Utc::now() - Duration::days(10)),
            end_date: Some(Utc::now() - Duration::days(1)),
            ..Default::default()
        };
        let seqs: Vec<u64> = select(sample(), &f).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 2]);

        let search = AuditFilter {
            search: Some("RELATIONSHIP".into()),
            ..Default::default()
        };
        assert_eq!(select(sample(), &search).len(), 1);

        let details = AuditFilter {
            search: Some("web-1".into()),
            ..Default::default()
        };
        assert_eq!(select(sample(), &details).len(), 4);
    }

    #[test]
    fn list_paginates_with_audit_default() {
        let page = list(sample(), &AuditFilter::default());
        assert_eq!(page.pagination.limit, DEFAULT_AUDIT_PAGE_SIZE);
        assert_eq!(page.pagination.total, 4);

        let f = AuditFilter {
            page: Some(2),
            limit: Some(3),
            ..Default::default()
        };
        let page = list(sample(), &f);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.pagination.total_pages, 2);

        let capped = AuditFilter {
            limit: Some(1000),
            ..Default::default()
        };
        assert_eq!(capped.page_request().limit, 100);
    }

    #[test]
    fn stats_aggregate_and_window() {
        let s = stats(sample(), &AuditFilter::default(), Utc::now());
        assert_eq!(s.total_events, 4);
        assert_eq!(s.events_by_type.get("ci"), Some(&3));
        assert_eq!(s.events_by_type.get("relationship"), Some(&1));
        assert_eq!(s.events_by_action.get("create"), Some(&2));
        assert_eq!(s.events_by_user.len(), 4);
        assert_eq!(s.recent_activity.len(), 4);
        assert_eq!(s.recent_activity[0].sequence, 4);
        // The 40-day-old entry falls outside the daily window.
        assert_eq!(s.daily_activity.values().sum::<u64>(), 3);
    }
}
