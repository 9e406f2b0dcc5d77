//! CSV export of audit entries.

use std::fmt::Write as _;

use chrono::SecondsFormat;

use cmdb_core::types::SortOrder;

use crate::query::{self, AuditFilter, AuditSortField};
use crate::AuditLogEntry;

pub const CSV_HEADER: &str =
    "ID,Entity Type,Entity ID,Action,Performed By,Timestamp,IP Address,User Agent";

/// Render the entries matching `filter` as CSV, newest first, at most `limit` rows.
///
/// The filter's sort and page settings are ignored.
pub fn to_csv(entries: Vec<AuditLogEntry>, filter: &AuditFilter, limit: usize) -> String {
    let ordered = AuditFilter {
        sort: AuditSortField::Timestamp,
        order: SortOrder::Desc,
        ..filter.clone()
    };
    let mut rows = query::select(entries, &ordered);
    rows.truncate(limit);

    let mut out = String::with_capacity(CSV_HEADER.len() + rows.len() * 160);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for e in &rows {
        let entity_id = e.entity_id.map(|id| id.to_string()).unwrap_or_default();
        let fields = [
            e.id.to_string(),
            e.entity_type.to_string(),
            entity_id,
            e.action.to_string(),
            e.performed_by.to_string(),
            e.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            e.ip_address.clone(),
            e.user_agent.clone(),
        ];
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "\"{}\"", field.replace('"', "\"\""));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChainHead;
    use crate::tests::entry;
    use crate::{AuditAction, EntityType};

    #[test]
    fn header_and_quoting() {
        let mut e = entry(AuditAction::Create, EntityType::Ci);
        e.user_agent = "curl \"7.0\"".into();
        e.entity_id = None;
        let e = e.seal(&ChainHead::default());

        let csv = to_csv(vec![e.clone()], &AuditFilter::default(), 100);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let row = lines.next().unwrap();
        assert!(row.starts_with(&format!("\"{}\",\"ci\",\"\",\"create\"", e.id)));
        assert!(row.ends_with("\"10.1.1.1\",\"curl \"\"7.0\"\"\""));
        assert!(lines.next().is_none());
    }

    #[test]
    fn newest_first_and_limited() {
        let mut head = ChainHead::default();
        let mut entries = Vec::new();
        for age in [3, 1, 2] {
            let mut e = entry(AuditAction::Update, EntityType::Ci);
            e.timestamp = chrono::Utc::now() - chrono::Duration::hours(age);
            let e = e.seal(&head);
            head = ChainHead::after(&e);
            entries.push(e);
        }
        let newest = entries[1].id;
        let asc = AuditFilter {
            order: SortOrder::Asc,
            ..Default::default()
        };

        let csv = to_csv(entries, &asc, 2);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with(&format!("\"{newest}\"")));
    }
}
