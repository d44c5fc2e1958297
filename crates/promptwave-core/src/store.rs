//! SQLite-backed scheduling store.
//!
//! Provides persistent storage for:
//! - Notification trigger records and their lifecycle timestamps
//! - Scheduled OS alarms, one row per `(receiver, identifier)` key
//! - Key-value store for scheduling state (countdowns, study start)
//!
//! Timestamps are stored as epoch milliseconds; enums as their canonical
//! text form.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::StoreError;
use crate::trigger::{
    NotificationTrigger, ScheduledAlarm, TriggerModality, TriggerPriority, TriggerSource,
    TriggerStatus,
};

fn status_text(status: TriggerStatus) -> &'static str {
    match status {
        TriggerStatus::Planned => "planned",
        TriggerStatus::Pushed => "pushed",
        TriggerStatus::Displayed => "displayed",
        TriggerStatus::Answered => "answered",
    }
}

fn parse_status(text: &str) -> TriggerStatus {
    match text {
        "pushed" => TriggerStatus::Pushed,
        "displayed" => TriggerStatus::Displayed,
        "answered" => TriggerStatus::Answered,
        _ => TriggerStatus::Planned,
    }
}

fn priority_text(priority: TriggerPriority) -> &'static str {
    match priority {
        TriggerPriority::Default => "default",
        TriggerPriority::WaveBreaking => "wave_breaking",
    }
}

fn parse_priority(text: &str) -> TriggerPriority {
    match text {
        "wave_breaking" => TriggerPriority::WaveBreaking,
        _ => TriggerPriority::Default,
    }
}

fn modality_text(modality: TriggerModality) -> &'static str {
    match modality {
        TriggerModality::EventContingent => "event_contingent",
        TriggerModality::Push => "push",
    }
}

fn parse_modality(text: &str) -> TriggerModality {
    match text {
        "event_contingent" => TriggerModality::EventContingent,
        _ => TriggerModality::Push,
    }
}

fn source_text(source: TriggerSource) -> &'static str {
    match source {
        TriggerSource::Scheduled => "scheduled",
        TriggerSource::RuleBased => "rule_based",
    }
}

fn parse_source(text: &str) -> TriggerSource {
    match text {
        "rule_based" => TriggerSource::RuleBased,
        _ => TriggerSource::Scheduled,
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// SQLite database holding triggers, alarms and scheduling state.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open the store at `path`, creating the schema if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(|source| StoreError::OpenFailed {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory store (for tests).
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS notification_triggers (
                    id              TEXT PRIMARY KEY,
                    added_at        INTEGER NOT NULL,
                    name            TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    valid_from      INTEGER NOT NULL,
                    priority        TEXT NOT NULL,
                    time_bucket     TEXT NOT NULL,
                    modality        TEXT NOT NULL,
                    source          TEXT NOT NULL,
                    questionnaire_id INTEGER NOT NULL,
                    trigger_id      INTEGER NOT NULL,
                    escalated_from  TEXT,
                    planned_at      INTEGER,
                    pushed_at       INTEGER,
                    displayed_at    INTEGER,
                    answered_at     INTEGER,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS scheduled_alarms (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    added_at     INTEGER NOT NULL,
                    receiver     TEXT NOT NULL,
                    identifier   TEXT NOT NULL,
                    timestamp    INTEGER NOT NULL,
                    request_code INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS kv (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                -- Indexes for the common query patterns
                CREATE INDEX IF NOT EXISTS idx_triggers_valid_from
                    ON notification_triggers(valid_from);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_alarms_receiver_identifier
                    ON scheduled_alarms(receiver, identifier);",
            )
            .map_err(|err| StoreError::MigrationFailed(err.to_string()))
    }

    // --- notification triggers ---

    pub fn insert_trigger(&self, trigger: &NotificationTrigger) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO notification_triggers (
                id, added_at, name, status, valid_from, priority, time_bucket,
                modality, source, questionnaire_id, trigger_id, escalated_from,
                planned_at, pushed_at, displayed_at, answered_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                trigger.id.to_string(),
                millis(trigger.added_at),
                trigger.name,
                status_text(trigger.status),
                millis(trigger.valid_from),
                priority_text(trigger.priority),
                trigger.time_bucket,
                modality_text(trigger.modality),
                source_text(trigger.source),
                trigger.questionnaire_id,
                trigger.trigger_id,
                trigger.escalated_from.map(|id| id.to_string()),
                trigger.planned_at.map(millis),
                trigger.pushed_at.map(millis),
                trigger.displayed_at.map(millis),
                trigger.answered_at.map(millis),
                millis(trigger.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Rewrite every mutable column of an existing record.
    pub fn update_trigger(&self, trigger: &NotificationTrigger) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE notification_triggers SET
                name = ?2, status = ?3, valid_from = ?4, priority = ?5,
                time_bucket = ?6, modality = ?7, source = ?8,
                questionnaire_id = ?9, trigger_id = ?10, escalated_from = ?11,
                planned_at = ?12, pushed_at = ?13, displayed_at = ?14,
                answered_at = ?15, updated_at = ?16
             WHERE id = ?1",
            params![
                trigger.id.to_string(),
                trigger.name,
                status_text(trigger.status),
                millis(trigger.valid_from),
                priority_text(trigger.priority),
                trigger.time_bucket,
                modality_text(trigger.modality),
                source_text(trigger.source),
                trigger.questionnaire_id,
                trigger.trigger_id,
                trigger.escalated_from.map(|id| id.to_string()),
                trigger.planned_at.map(millis),
                trigger.pushed_at.map(millis),
                trigger.displayed_at.map(millis),
                trigger.answered_at.map(millis),
                millis(trigger.updated_at),
            ],
        )?;
        Ok(())
    }

    fn trigger_from_row(row: &rusqlite::Row<'_>) -> Result<NotificationTrigger, rusqlite::Error> {
        let id: String = row.get(0)?;
        let status: String = row.get(3)?;
        let priority: String = row.get(5)?;
        let modality: String = row.get(7)?;
        let source: String = row.get(8)?;
        let escalated_from: Option<String> = row.get(11)?;
        Ok(NotificationTrigger {
            id: Uuid::parse_str(&id).unwrap_or(Uuid::nil()),
            added_at: from_millis(row.get(1)?),
            name: row.get(2)?,
            status: parse_status(&status),
            valid_from: from_millis(row.get(4)?),
            priority: parse_priority(&priority),
            time_bucket: row.get(6)?,
            modality: parse_modality(&modality),
            source: parse_source(&source),
            questionnaire_id: row.get(9)?,
            trigger_id: row.get(10)?,
            escalated_from: escalated_from.and_then(|id| Uuid::parse_str(&id).ok()),
            planned_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
            pushed_at: row.get::<_, Option<i64>>(13)?.map(from_millis),
            displayed_at: row.get::<_, Option<i64>>(14)?.map(from_millis),
            answered_at: row.get::<_, Option<i64>>(15)?.map(from_millis),
            updated_at: from_millis(row.get(16)?),
        })
    }

    const TRIGGER_COLUMNS: &'static str = "id, added_at, name, status, valid_from, priority, \
         time_bucket, modality, source, questionnaire_id, trigger_id, escalated_from, \
         planned_at, pushed_at, displayed_at, answered_at, updated_at";

    pub fn trigger_by_id(&self, id: Uuid) -> Result<Option<NotificationTrigger>, StoreError> {
        let sql = format!(
            "SELECT {} FROM notification_triggers WHERE id = ?1",
            Self::TRIGGER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        match stmt.query_row(params![id.to_string()], Self::trigger_from_row) {
            Ok(trigger) => Ok(Some(trigger)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Records with `valid_from` inside `[from, to]`, ascending.
    pub fn triggers_in_interval(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<NotificationTrigger>, StoreError> {
        let sql = format!(
            "SELECT {} FROM notification_triggers
             WHERE valid_from >= ?1 AND valid_from <= ?2
             ORDER BY valid_from ASC",
            Self::TRIGGER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![millis(from), millis(to)], Self::trigger_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Still-planned records of the given modality strictly after `after`,
    /// ascending by `valid_from`.
    pub fn next_triggers_for_modality(
        &self,
        modality: TriggerModality,
        after: DateTime<Utc>,
    ) -> Result<Vec<NotificationTrigger>, StoreError> {
        let sql = format!(
            "SELECT {} FROM notification_triggers
             WHERE modality = ?1 AND status = 'planned' AND valid_from > ?2
             ORDER BY valid_from ASC",
            Self::TRIGGER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![modality_text(modality), millis(after)],
            Self::trigger_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Whether any primary record of `trigger_id` has `valid_from` at or
    /// after `after`. Escalation rows carry the timeout trigger's id and
    /// are not counted.
    pub fn has_slots_after(
        &self,
        trigger_id: i64,
        after: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT 1 FROM notification_triggers
             WHERE trigger_id = ?1 AND escalated_from IS NULL AND valid_from >= ?2
             LIMIT 1",
        )?;
        Ok(stmt.exists(params![trigger_id, millis(after)])?)
    }

    pub fn all_triggers(&self) -> Result<Vec<NotificationTrigger>, StoreError> {
        let sql = format!(
            "SELECT {} FROM notification_triggers ORDER BY valid_from ASC",
            Self::TRIGGER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::trigger_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Escalation records derived from the given primary trigger.
    pub fn escalations_of(&self, id: Uuid) -> Result<Vec<NotificationTrigger>, StoreError> {
        let sql = format!(
            "SELECT {} FROM notification_triggers WHERE escalated_from = ?1",
            Self::TRIGGER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![id.to_string()], Self::trigger_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn delete_trigger(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM notification_triggers WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Drop never-delivered records planned before `horizon`. Returns the
    /// number of rows removed.
    pub fn delete_planned_before(&self, horizon: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM notification_triggers
             WHERE status = 'planned' AND valid_from < ?1",
            params![millis(horizon)],
        )?;
        Ok(removed)
    }

    pub fn delete_all_triggers(&self) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM notification_triggers", [])?;
        Ok(())
    }

    // --- scheduled alarms ---

    fn alarm_from_row(row: &rusqlite::Row<'_>) -> Result<ScheduledAlarm, rusqlite::Error> {
        Ok(ScheduledAlarm {
            id: row.get(0)?,
            added_at: from_millis(row.get(1)?),
            receiver: row.get(2)?,
            identifier: row.get(3)?,
            at: from_millis(row.get(4)?),
            request_code: row.get(5)?,
        })
    }

    /// Fetch the alarm row for `(receiver, identifier)`, inserting one at
    /// `at` when none exists. Existing rows keep their stored time, which
    /// makes boot recovery idempotent.
    pub fn get_or_create_alarm(
        &self,
        receiver: &str,
        identifier: &str,
        at: DateTime<Utc>,
    ) -> Result<ScheduledAlarm, StoreError> {
        if let Some(existing) = self.alarm_by_identifier(receiver, identifier)? {
            return Ok(existing);
        }
        self.conn.execute(
            "INSERT INTO scheduled_alarms (added_at, receiver, identifier, timestamp, request_code)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                millis(at),
                receiver,
                identifier,
                millis(at),
                ScheduledAlarm::request_code_for(receiver, identifier),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(ScheduledAlarm {
            id,
            added_at: at,
            receiver: receiver.to_string(),
            identifier: identifier.to_string(),
            at,
            request_code: ScheduledAlarm::request_code_for(receiver, identifier),
        })
    }

    pub fn alarm_by_identifier(
        &self,
        receiver: &str,
        identifier: &str,
    ) -> Result<Option<ScheduledAlarm>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, added_at, receiver, identifier, timestamp, request_code
             FROM scheduled_alarms WHERE receiver = ?1 AND identifier = ?2",
        )?;
        match stmt.query_row(params![receiver, identifier], Self::alarm_from_row) {
            Ok(alarm) => Ok(Some(alarm)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn set_alarm_time(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE scheduled_alarms SET timestamp = ?2 WHERE id = ?1",
            params![id, millis(at)],
        )?;
        Ok(())
    }

    pub fn all_alarms(&self) -> Result<Vec<ScheduledAlarm>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, added_at, receiver, identifier, timestamp, request_code
             FROM scheduled_alarms ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map([], Self::alarm_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn delete_alarm(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM scheduled_alarms WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn delete_alarm_by_identifier(
        &self,
        receiver: &str,
        identifier: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM scheduled_alarms WHERE receiver = ?1 AND identifier = ?2",
            params![receiver, identifier],
        )?;
        Ok(())
    }

    pub fn delete_all_alarms(&self) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM scheduled_alarms", [])?;
        Ok(())
    }

    // --- kv store ---

    pub fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        match stmt.query_row(params![key], |row| row.get::<_, String>(0)) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn kv_delete(&self, key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}
