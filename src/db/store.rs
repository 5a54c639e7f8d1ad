//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    /// A conditional update matched no row.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

/// Expected or desired ownership of an alert row.
#[derive(Debug, Clone, Copy)]
pub struct Ownership<'a> {
    pub status: RunningStatus,
    pub executor_id: &'a str,
}

impl<'a> Ownership<'a> {
    pub fn new(status: RunningStatus, executor_id: &'a str) -> Self {
        Self { status, executor_id }
    }

    pub fn unassigned(status: RunningStatus) -> Self {
        Self { status, executor_id: "" }
    }
}

const ALERT_COLUMNS: &str = "alert_id, alert_name, disabled, running_status, alert_status, \
     executor_id, policy_id, rs_filter_id, create_time, update_time";

const HISTORY_COLUMNS: &str = "history_id, history_name, event, content, notification_id, \
     create_time, alert_id, rule_id, resource_name";

/// Open a connection with the pragmas every process sharing the file needs,
/// and bring the schema up to date.
pub(crate) fn open_connection<P: AsRef<Path>>(path: P) -> Result<Connection, DbError> {
    let mut conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;

    embedded::migrations::runner()
        .run(&mut conn)
        .map_err(|e| DbError::Migration(e.to_string()))?;

    Ok(conn)
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = open_connection(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Alert ownership ---

    /// Get an alert by ID.
    pub fn get_alert(&self, alert_id: &str) -> Result<Alert, DbError> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM alert WHERE alert_id = ?1", ALERT_COLUMNS),
            params![alert_id],
            row_to_alert,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Move an alert from `expect` to `next` ownership in one transaction.
    ///
    /// Fails with `PreconditionFailed` when the row is not in the expected
    /// state, leaving it untouched.
    pub fn transition_alert(
        &self,
        alert_id: &str,
        expect: Ownership<'_>,
        next: Ownership<'_>,
    ) -> Result<(), DbError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let rows = tx.execute(
            "UPDATE alert SET executor_id = ?1, running_status = ?2, update_time = ?3
             WHERE alert_id = ?4 AND running_status = ?5 AND executor_id = ?6",
            params![
                next.executor_id,
                next.status.as_str(),
                format_db_time(Utc::now()),
                alert_id,
                expect.status.as_str(),
                expect.executor_id,
            ],
        )?;

        if rows == 0 {
            return Err(DbError::PreconditionFailed(format!(
                "alert {} is not {} on '{}'",
                alert_id, expect.status, expect.executor_id
            )));
        }

        tx.commit()?;
        Ok(())
    }

    /// Set the running status unconditionally, keeping the owner.
    pub fn set_running_status(&self, alert_id: &str, status: RunningStatus) -> Result<(), DbError> {
        let conn = self.lock();
        let rows = conn.execute(
            "UPDATE alert SET running_status = ?1, update_time = ?2 WHERE alert_id = ?3",
            params![status.as_str(), format_db_time(Utc::now()), alert_id],
        )?;
        if rows == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Alerts owned by `executor_id` in the given state.
    pub fn query_alerts(&self, executor_id: &str, status: RunningStatus) -> Result<Vec<Alert>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alert WHERE executor_id = ?1 AND running_status = ?2",
            ALERT_COLUMNS
        ))?;
        let alerts = stmt
            .query_map(params![executor_id, status.as_str()], row_to_alert)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(alerts)
    }

    /// Write back runner snapshots in one transaction. Rows no longer
    /// running on `executor_id` are skipped.
    pub fn update_alert_status(&self, runners: &[RunnerInfo], executor_id: &str) -> Result<usize, DbError> {
        if runners.is_empty() {
            return Ok(0);
        }

        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let mut updated = 0;

        {
            let mut stmt = tx.prepare(
                "UPDATE alert SET alert_status = ?1, update_time = ?2
                 WHERE alert_id = ?3 AND executor_id = ?4 AND running_status = 'running'",
            )?;

            for r in runners {
                updated += stmt.execute(params![
                    r.alert_status,
                    format_db_time(r.update_time),
                    r.alert_id,
                    executor_id,
                ])?;
            }
        }

        tx.commit()?;
        Ok(updated)
    }

    /// Hand every running alert of a departed executor back to the pool.
    ///
    /// Returns the ids that were moved to `migrating`.
    pub fn migrate_executor_alerts(&self, executor_id: &str) -> Result<Vec<String>, DbError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT alert_id FROM alert WHERE executor_id = ?1 AND running_status = 'running'",
            )?;
            let ids = stmt
                .query_map(params![executor_id], |row| row.get::<_, String>(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            ids
        };

        tx.execute(
            "UPDATE alert SET executor_id = '', running_status = 'migrating', update_time = ?1
             WHERE executor_id = ?2 AND running_status = 'running'",
            params![format_db_time(Utc::now()), executor_id],
        )?;

        tx.commit()?;
        Ok(ids)
    }

    /// Alerts whose state has not been refreshed since `cutoff`.
    pub fn get_timeout_alerts(&self, status: RunningStatus, cutoff: DateTime<Utc>) -> Result<Vec<Alert>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alert WHERE running_status = ?1 AND update_time < ?2",
            ALERT_COLUMNS
        ))?;
        let alerts = stmt
            .query_map(params![status.as_str(), format_db_time(cutoff)], row_to_alert)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(alerts)
    }

    /// Unassign an alert and move it from `from` to `to`, refreshing its
    /// update time. With `stale_before`, only rows not touched since then match.
    ///
    /// Returns the number of rows changed (0 or 1).
    pub fn reset_alert(
        &self,
        alert_id: &str,
        from: RunningStatus,
        to: RunningStatus,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<usize, DbError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let now = format_db_time(Utc::now());

        let rows = match stale_before {
            Some(cutoff) => tx.execute(
                "UPDATE alert SET executor_id = '', running_status = ?1, update_time = ?2
                 WHERE alert_id = ?3 AND running_status = ?4 AND update_time < ?5",
                params![to.as_str(), now, alert_id, from.as_str(), format_db_time(cutoff)],
            )?,
            None => tx.execute(
                "UPDATE alert SET executor_id = '', running_status = ?1, update_time = ?2
                 WHERE alert_id = ?3 AND running_status = ?4",
                params![to.as_str(), now, alert_id, from.as_str()],
            )?,
        };

        tx.commit()?;
        Ok(rows)
    }

    /// Delete alerts in `status` together with their filter, rules, actions
    /// and policy. With `executor_id`, only alerts owned by it are deleted.
    ///
    /// The whole cascade is one transaction; any failure leaves every row in
    /// place. Returns the number of alerts deleted.
    pub fn delete_alerts(
        &self,
        alert_ids: &[String],
        status: RunningStatus,
        executor_id: Option<&str>,
    ) -> Result<usize, DbError> {
        if alert_ids.is_empty() {
            return Ok(0);
        }

        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;

        let matched = {
            let mut sql = format!(
                "SELECT alert_id FROM alert WHERE alert_id IN ({}) AND running_status = ?",
                placeholders(alert_ids.len())
            );
            let mut args: Vec<String> = alert_ids.to_vec();
            args.push(status.as_str().to_string());
            if let Some(executor_id) = executor_id {
                sql.push_str(" AND executor_id = ?");
                args.push(executor_id.to_string());
            }

            let mut stmt = tx.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            ids
        };

        if matched.is_empty() {
            return Ok(0);
        }

        let ids = placeholders(matched.len());
        let cascade = [
            format!("DELETE FROM resource_filter WHERE rs_filter_id IN (SELECT rs_filter_id FROM alert WHERE alert_id IN ({}))", ids),
            format!("DELETE FROM rule WHERE policy_id IN (SELECT policy_id FROM alert WHERE alert_id IN ({}))", ids),
            format!("DELETE FROM action WHERE policy_id IN (SELECT policy_id FROM alert WHERE alert_id IN ({}))", ids),
            format!("DELETE FROM policy WHERE policy_id IN (SELECT policy_id FROM alert WHERE alert_id IN ({}))", ids),
            format!("DELETE FROM alert WHERE alert_id IN ({})", ids),
        ];
        for sql in &cascade {
            tx.execute(sql, params_from_iter(matched.iter()))?;
        }

        tx.commit()?;
        Ok(matched.len())
    }

    // --- Runner configuration ---

    /// Assemble the alert detail (filter, type, policy, action) in one query.
    pub fn query_alert_detail(&self, alert_id: &str) -> Result<AlertDetail, DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT t1.alert_id, t1.alert_name, t1.disabled, t1.alert_status,
                    COALESCE(t3.rs_type_name, ''), COALESCE(t3.rs_type_param, ''),
                    COALESCE(t2.rs_filter_name, ''), COALESCE(t2.rs_filter_param, ''),
                    COALESCE(t4.policy_config, ''), COALESCE(t4.available_start_time, ''),
                    COALESCE(t4.available_end_time, ''), COALESCE(t5.nf_address_list_id, '')
             FROM alert t1
             LEFT JOIN resource_filter t2 ON t2.rs_filter_id = t1.rs_filter_id
             LEFT JOIN resource_type t3 ON t3.rs_type_id = t2.rs_type_id
             LEFT JOIN policy t4 ON t4.policy_id = t1.policy_id
             LEFT JOIN action t5 ON t5.policy_id = t1.policy_id
             WHERE t1.alert_id = ?1
             LIMIT 1",
            params![alert_id],
            |row| {
                Ok(AlertDetail {
                    alert_id: row.get(0)?,
                    alert_name: row.get(1)?,
                    disabled: row.get(2)?,
                    alert_status: row.get(3)?,
                    rs_type_name: row.get(4)?,
                    rs_type_param: row.get(5)?,
                    rs_filter_name: row.get(6)?,
                    rs_filter_param: row.get(7)?,
                    policy_config: row.get(8)?,
                    available_start_time: row.get(9)?,
                    available_end_time: row.get(10)?,
                    nf_address_list_id: row.get(11)?,
                })
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Rules of the alert's policy, joined with their metric.
    pub fn query_rule_details(&self, alert_id: &str) -> Result<Vec<RuleDetail>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT t1.rule_id, t1.rule_name, t1.disabled, t1.monitor_periods, t1.severity,
                    t1.metrics_type, t1.condition_type, t1.thresholds, t1.unit,
                    t1.consecutive_count, t1.inhibit,
                    COALESCE(t2.metric_name, ''), COALESCE(t2.metric_param, '')
             FROM rule t1
             LEFT JOIN metric t2 ON t2.metric_id = t1.metric_id
             WHERE t1.policy_id IN (SELECT policy_id FROM alert WHERE alert_id = ?1)
             ORDER BY t1.rule_id",
        )?;

        let rules = stmt
            .query_map(params![alert_id], |row| {
                Ok(RuleDetail {
                    rule_id: row.get(0)?,
                    rule_name: row.get(1)?,
                    disabled: row.get(2)?,
                    monitor_periods: row.get(3)?,
                    severity: row.get(4)?,
                    metrics_type: row.get(5)?,
                    condition_type: row.get(6)?,
                    thresholds: row.get(7)?,
                    unit: row.get(8)?,
                    consecutive_count: row.get(9)?,
                    inhibit: row.get(10)?,
                    metric_name: row.get(11)?,
                    metric_param: row.get(12)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rules)
    }

    // --- History ---

    /// Append a history row.
    pub fn create_history(&self, history: &History) -> Result<(), DbError> {
        let conn = self.lock();
        let created = format_db_time(history.create_time);
        conn.execute(
            "INSERT INTO history (history_id, history_name, event, content, notification_id,
                                  create_time, update_time, alert_id, rule_id, resource_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8, ?9)",
            params![
                history.history_id,
                history.history_name,
                history.event.as_str(),
                history.content,
                history.notification_id,
                created,
                history.alert_id,
                history.rule_id,
                history.resource_name,
            ],
        )?;
        Ok(())
    }

    /// Get a history row by ID.
    pub fn get_history(&self, history_id: &str) -> Result<History, DbError> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM history WHERE history_id = ?1", HISTORY_COLUMNS),
            params![history_id],
            row_to_history,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// All history rows of an alert, oldest first.
    pub fn list_histories(&self, alert_id: &str) -> Result<Vec<History>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM history WHERE alert_id = ?1 ORDER BY create_time ASC, rowid ASC",
            HISTORY_COLUMNS
        ))?;
        let histories = stmt
            .query_map(params![alert_id], row_to_history)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(histories)
    }

    // --- Comments ---

    pub fn create_comment(&self, comment: &Comment) -> Result<(), DbError> {
        let conn = self.lock();
        let created = format_db_time(comment.create_time);
        conn.execute(
            "INSERT INTO comment (comment_id, addresser, content, history_id, create_time, update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                comment.comment_id,
                comment.addresser,
                comment.content,
                comment.history_id,
                created,
            ],
        )?;
        Ok(())
    }

    /// Comments on a history row, oldest first.
    pub fn list_comments(&self, history_id: &str) -> Result<Vec<Comment>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT comment_id, addresser, content, history_id, create_time FROM comment
             WHERE history_id = ?1 ORDER BY create_time ASC, rowid ASC",
        )?;
        let comments = stmt
            .query_map(params![history_id], |row| {
                let create_time: String = row.get(4)?;
                Ok(Comment {
                    comment_id: row.get(0)?,
                    addresser: row.get(1)?,
                    content: row.get(2)?,
                    history_id: row.get(3)?,
                    create_time: parse_db_time(&create_time).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(comments)
    }

    // --- Registration ---

    /// Register an alert and all rows it depends on, in state `adding`.
    ///
    /// Returns the new alert id.
    pub fn register_alert(&self, def: &AlertDefinition) -> Result<String, DbError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let now = format_db_time(Utc::now());

        let rs_type_id = new_id("rst-");
        tx.execute(
            "INSERT INTO resource_type (rs_type_id, rs_type_name, rs_type_param) VALUES (?1, ?2, ?3)",
            params![rs_type_id, def.resource.rs_type_name, def.resource.rs_type_param],
        )?;

        let rs_filter_id = new_id("rf-");
        tx.execute(
            "INSERT INTO resource_filter (rs_filter_id, rs_filter_name, rs_filter_param, rs_type_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                rs_filter_id,
                def.resource.rs_filter_name,
                def.resource.rs_filter_param,
                rs_type_id,
            ],
        )?;

        let policy_id = new_id("pl-");
        tx.execute(
            "INSERT INTO policy (policy_id, policy_name, policy_config, available_start_time, available_end_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                policy_id,
                def.policy.policy_name,
                def.policy.policy_config,
                def.policy.available_start_time,
                def.policy.available_end_time,
            ],
        )?;

        tx.execute(
            "INSERT INTO action (action_id, policy_id, nf_address_list_id) VALUES (?1, ?2, ?3)",
            params![new_id("ac-"), policy_id, def.nf_address_list_id],
        )?;

        for rule in &def.rules {
            let metric_id = new_id("mt-");
            tx.execute(
                "INSERT INTO metric (metric_id, metric_name, metric_param, rs_type_id) VALUES (?1, ?2, ?3, ?4)",
                params![metric_id, rule.metric_name, rule.metric_param, rs_type_id],
            )?;
            tx.execute(
                "INSERT INTO rule (rule_id, rule_name, disabled, monitor_periods, severity, metrics_type,
                                   condition_type, thresholds, unit, consecutive_count, inhibit,
                                   policy_id, metric_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    new_id("rl-"),
                    rule.rule_name,
                    rule.disabled,
                    rule.monitor_periods,
                    rule.severity,
                    rule.metrics_type,
                    rule.condition_type,
                    rule.thresholds,
                    rule.unit,
                    rule.consecutive_count,
                    rule.inhibit,
                    policy_id,
                    metric_id,
                ],
            )?;
        }

        let alert_id = new_id("al-");
        tx.execute(
            "INSERT INTO alert (alert_id, alert_name, disabled, running_status, alert_status,
                                executor_id, policy_id, rs_filter_id, create_time, update_time)
             VALUES (?1, ?2, ?3, 'adding', '', '', ?4, ?5, ?6, ?6)",
            params![alert_id, def.alert_name, def.disabled, policy_id, rs_filter_id, now],
        )?;

        tx.commit()?;
        Ok(alert_id)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn row_to_alert(row: &Row<'_>) -> SqlResult<Alert> {
    let status: String = row.get(3)?;
    let create_time: String = row.get(8)?;
    let update_time: String = row.get(9)?;
    Ok(Alert {
        alert_id: row.get(0)?,
        alert_name: row.get(1)?,
        disabled: row.get(2)?,
        running_status: status.parse().map_err(|e| conversion_error(3, e))?,
        alert_status: row.get(4)?,
        executor_id: row.get(5)?,
        policy_id: row.get(6)?,
        rs_filter_id: row.get(7)?,
        create_time: parse_db_time(&create_time).unwrap_or_else(Utc::now),
        update_time: parse_db_time(&update_time).unwrap_or_else(Utc::now),
    })
}

fn row_to_history(row: &Row<'_>) -> SqlResult<History> {
    let event: String = row.get(2)?;
    let create_time: String = row.get(5)?;
    Ok(History {
        history_id: row.get(0)?,
        history_name: row.get(1)?,
        event: event.parse().map_err(|e| conversion_error(2, e))?,
        content: row.get(3)?,
        notification_id: row.get(4)?,
        create_time: parse_db_time(&create_time).unwrap_or_else(Utc::now),
        alert_id: row.get(6)?,
        rule_id: row.get(7)?,
        resource_name: row.get(8)?,
    })
}

/// Fixed-width UTC text, so lexical order is chronological.
pub fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    pub(crate) fn temp_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    /// Overwrite the thresholds of every rule of an alert.
    pub(crate) fn set_rule_thresholds(store: &Store, alert_id: &str, thresholds: &str) {
        store
            .lock()
            .execute(
                "UPDATE rule SET thresholds = ?2
                 WHERE policy_id IN (SELECT policy_id FROM alert WHERE alert_id = ?1)",
                params![alert_id, thresholds],
            )
            .unwrap();
    }

    /// Move an alert row to another id, making lookups by the old one fail.
    pub(crate) fn rename_alert(store: &Store, from: &str, to: &str) {
        store
            .lock()
            .execute("UPDATE alert SET alert_id = ?2 WHERE alert_id = ?1", params![from, to])
            .unwrap();
    }

    pub(crate) fn sample_definition() -> AlertDefinition {
        AlertDefinition {
            alert_name: "node-cpu".to_string(),
            disabled: false,
            resource: ResourceDefinition {
                rs_type_name: "node".to_string(),
                rs_type_param: "{}".to_string(),
                rs_filter_name: "all-nodes".to_string(),
                rs_filter_param: "node-1|node-2".to_string(),
            },
            policy: PolicyDefinition {
                policy_name: "default".to_string(),
                policy_config: r#"{"major":{"repeat_type":"exp-minutes","repeat_interval_initvalue":2,"max_send_count":3}}"#.to_string(),
                available_start_time: String::new(),
                available_end_time: String::new(),
            },
            rules: vec![RuleDefinition {
                rule_name: "cpu high".to_string(),
                disabled: false,
                monitor_periods: 1,
                severity: "major".to_string(),
                metrics_type: String::new(),
                condition_type: ">".to_string(),
                thresholds: "90".to_string(),
                unit: "%".to_string(),
                consecutive_count: 2,
                inhibit: false,
                metric_name: "node_cpu_utilisation".to_string(),
                metric_param: "1".to_string(),
            }],
            nf_address_list_id: "adl-ops".to_string(),
        }
    }

    #[test]
    fn test_register_and_load_detail() {
        let (_tmp, store) = temp_store();
        let alert_id = store.register_alert(&sample_definition()).unwrap();

        let alert = store.get_alert(&alert_id).unwrap();
        assert_eq!(alert.running_status, RunningStatus::Adding);
        assert_eq!(alert.executor_id, "");

        let detail = store.query_alert_detail(&alert_id).unwrap();
        assert_eq!(detail.rs_type_name, "node");
        assert_eq!(detail.rs_filter_param, "node-1|node-2");
        assert_eq!(detail.nf_address_list_id, "adl-ops");

        let rules = store.query_rule_details(&alert_id).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].metric_name, "node_cpu_utilisation");
        assert_eq!(rules[0].consecutive_count, 2);

        assert!(matches!(store.get_alert("al-missing"), Err(DbError::NotFound)));
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let (_tmp, store) = temp_store();
        let alert_id = store.register_alert(&sample_definition()).unwrap();

        store
            .transition_alert(
                &alert_id,
                Ownership::unassigned(RunningStatus::Adding),
                Ownership::new(RunningStatus::Running, "e1"),
            )
            .unwrap();

        // A second claim from another executor must not succeed.
        let second = store.transition_alert(
            &alert_id,
            Ownership::unassigned(RunningStatus::Adding),
            Ownership::new(RunningStatus::Running, "e2"),
        );
        assert!(matches!(second, Err(DbError::PreconditionFailed(_))));

        let alert = store.get_alert(&alert_id).unwrap();
        assert_eq!(alert.executor_id, "e1");
        assert_eq!(alert.running_status, RunningStatus::Running);
    }

    #[test]
    fn test_delete_cascades_and_respects_owner() {
        let (_tmp, store) = temp_store();
        let alert_id = store.register_alert(&sample_definition()).unwrap();
        store
            .transition_alert(
                &alert_id,
                Ownership::unassigned(RunningStatus::Adding),
                Ownership::new(RunningStatus::Running, "e1"),
            )
            .unwrap();
        store.set_running_status(&alert_id, RunningStatus::Deleting).unwrap();

        let ids = vec![alert_id.clone()];
        assert_eq!(store.delete_alerts(&ids, RunningStatus::Deleting, Some("e2")).unwrap(), 0);
        assert!(store.get_alert(&alert_id).is_ok());

        assert_eq!(store.delete_alerts(&ids, RunningStatus::Deleting, Some("e1")).unwrap(), 1);
        assert!(matches!(store.get_alert(&alert_id), Err(DbError::NotFound)));
        assert!(store.query_rule_details(&alert_id).unwrap().is_empty());

        let conn = store.lock();
        let policies: i64 = conn.query_row("SELECT COUNT(*) FROM policy", [], |r| r.get(0)).unwrap();
        let filters: i64 = conn.query_row("SELECT COUNT(*) FROM resource_filter", [], |r| r.get(0)).unwrap();
        assert_eq!(policies, 0);
        assert_eq!(filters, 0);
    }

    #[test]
    fn test_status_write_back_only_touches_owned_running_rows() {
        let (_tmp, store) = temp_store();
        let mine = store.register_alert(&sample_definition()).unwrap();
        let other = store.register_alert(&sample_definition()).unwrap();
        for (id, exec) in [(&mine, "e1"), (&other, "e2")] {
            store
                .transition_alert(
                    id,
                    Ownership::unassigned(RunningStatus::Adding),
                    Ownership::new(RunningStatus::Running, exec),
                )
                .unwrap();
        }

        let runners = vec![
            RunnerInfo { alert_id: mine.clone(), alert_status: "{\"a\":1}".to_string(), update_time: Utc::now() },
            RunnerInfo { alert_id: other.clone(), alert_status: "{\"b\":2}".to_string(), update_time: Utc::now() },
        ];
        assert_eq!(store.update_alert_status(&runners, "e1").unwrap(), 1);
        assert_eq!(store.get_alert(&mine).unwrap().alert_status, "{\"a\":1}");
        assert_eq!(store.get_alert(&other).unwrap().alert_status, "");
    }

    #[test]
    fn test_migrate_and_timeouts() {
        let (_tmp, store) = temp_store();
        let a1 = store.register_alert(&sample_definition()).unwrap();
        let a2 = store.register_alert(&sample_definition()).unwrap();
        for id in [&a1, &a2] {
            store
                .transition_alert(
                    id,
                    Ownership::unassigned(RunningStatus::Adding),
                    Ownership::new(RunningStatus::Running, "e1"),
                )
                .unwrap();
        }

        let mut migrated = store.migrate_executor_alerts("e1").unwrap();
        migrated.sort();
        let mut expected = vec![a1.clone(), a2.clone()];
        expected.sort();
        assert_eq!(migrated, expected);
        assert!(store.query_alerts("e1", RunningStatus::Running).unwrap().is_empty());
        assert_eq!(store.get_alert(&a1).unwrap().running_status, RunningStatus::Migrating);
        assert_eq!(store.get_alert(&a1).unwrap().executor_id, "");

        let future = Utc::now() + ChronoDuration::seconds(5);
        assert_eq!(store.get_timeout_alerts(RunningStatus::Migrating, future).unwrap().len(), 2);
        let past = Utc::now() - ChronoDuration::seconds(60);
        assert!(store.get_timeout_alerts(RunningStatus::Migrating, past).unwrap().is_empty());

        // Stale guard: a row refreshed after the cutoff does not match.
        assert_eq!(store.reset_alert(&a1, RunningStatus::Migrating, RunningStatus::Adding, Some(past)).unwrap(), 0);
        assert_eq!(store.reset_alert(&a1, RunningStatus::Migrating, RunningStatus::Adding, None).unwrap(), 1);
        assert_eq!(store.get_alert(&a1).unwrap().running_status, RunningStatus::Adding);
    }

    #[test]
    fn test_history_round_trip() {
        let (_tmp, store) = temp_store();
        let history = History::new("al-1", HistoryEvent::Triggered, "cpu 95".to_string(), "", "rl-1", "node-1");
        store.create_history(&history).unwrap();

        let fetched = store.get_history(&history.history_id).unwrap();
        assert_eq!(fetched.event, HistoryEvent::Triggered);
        assert_eq!(fetched.resource_name, "node-1");
        assert_eq!(store.list_histories("al-1").unwrap().len(), 1);
    }

    #[test]
    fn test_comments_listed_per_history() {
        let (_tmp, store) = temp_store();
        let first = Comment::new("ops", "looking into it", "hs-1");
        let second = Comment::new("dba", "disk replaced", "hs-1");
        store.create_comment(&first).unwrap();
        store.create_comment(&second).unwrap();
        store.create_comment(&Comment::new("ops", "unrelated", "hs-2")).unwrap();

        let listed = store.list_comments("hs-1").unwrap();
        let contents: Vec<&str> = listed.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["looking into it", "disk replaced"]);
        assert_eq!(listed[0].comment_id, first.comment_id);
        assert!(store.list_comments("hs-missing").unwrap().is_empty());
    }

    #[test]
    fn test_db_time_format_is_sortable() {
        let early = Utc::now();
        let late = early + ChronoDuration::milliseconds(1);
        assert!(format_db_time(early) < format_db_time(late));
        assert_eq!(parse_db_time(&format_db_time(early)), Some(early));
    }
}
