use crate::common::config::AttendanceConfig;
use crate::common::error::{RecognitionError, Result};
use chrono::{DateTime, Duration, Local, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS persons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    email TEXT,
    department TEXT,
    position TEXT,
    phone TEXT,
    status TEXT DEFAULT 'active',
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id TEXT NOT NULL,
    person_name TEXT NOT NULL,
    check_in TEXT NOT NULL,
    check_out TEXT,
    date TEXT NOT NULL,
    duration_minutes INTEGER,
    source TEXT,
    confidence REAL,
    status TEXT DEFAULT 'present',
    marked_by TEXT DEFAULT 'auto',
    notes TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (person_id) REFERENCES persons(person_id)
);

CREATE TABLE IF NOT EXISTS detection_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id TEXT,
    person_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    confidence REAL,
    source TEXT,
    attendance_id INTEGER,
    metadata TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (attendance_id) REFERENCES attendance(id)
);

CREATE TABLE IF NOT EXISTS system_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    description TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key_hash TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    permissions TEXT NOT NULL,
    status TEXT DEFAULT 'active',
    created_at TEXT NOT NULL,
    last_used TEXT,
    expires_at TEXT
);

CREATE TABLE IF NOT EXISTS system_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    category TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attendance_person ON attendance(person_id, date);
CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date DESC);
CREATE INDEX IF NOT EXISTS idx_detection_timestamp ON detection_events(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_detection_person ON detection_events(person_id);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON system_logs(timestamp DESC);
"#;

pub const CONFIG_DUPLICATE_WINDOW: &str = "duplicate_window_minutes";
pub const CONFIG_AUTO_MARK: &str = "auto_mark_enabled";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Person {
    pub person_id: String,
    pub name: String,
    pub email: Option<String>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub phone: Option<String>,
    pub status: String,
    pub metadata: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPerson {
    pub person_id: String,
    pub name: String,
    pub email: Option<String>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub phone: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub phone: Option<String>,
    pub status: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkedBy {
    Auto,
    Manual,
    System,
}

impl MarkedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkedBy::Auto => "auto",
            MarkedBy::Manual => "manual",
            MarkedBy::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkRequest {
    pub person_id: String,
    /// Resolved from the persons table when absent.
    pub person_name: Option<String>,
    pub confidence: f64,
    pub source: Option<String>,
    pub marked_by: MarkedBy,
    pub notes: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    Marked(i64),
    /// A recent row for the same person already covers this sighting.
    Suppressed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttendanceRecord {
    pub id: i64,
    pub person_id: String,
    pub person_name: String,
    pub check_in: String,
    pub check_out: Option<String>,
    pub date: String,
    pub duration_minutes: Option<i64>,
    pub source: Option<String>,
    pub confidence: Option<f64>,
    pub status: String,
    pub marked_by: String,
    pub notes: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttendanceFilters {
    pub person_id: Option<String>,
    pub date: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRow {
    pub person_id: String,
    pub person_name: String,
    pub total_days: i64,
    pub present_days: i64,
    pub absent_days: i64,
    pub avg_duration_minutes: f64,
    pub total_duration_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: String,
    pub total_records: i64,
    pub unique_persons: i64,
    pub present: i64,
    pub avg_confidence: f64,
    pub avg_duration_minutes: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDetectionEvent {
    pub person_id: Option<String>,
    pub person_name: String,
    pub confidence: f64,
    pub source: Option<String>,
    pub attendance_id: Option<i64>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRow {
    pub id: i64,
    pub level: String,
    pub category: String,
    pub message: String,
    pub details: Option<Value>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    pub id: i64,
    pub name: String,
    pub permissions: Vec<String>,
    pub status: String,
    pub created_at: String,
    pub last_used: Option<String>,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = RecognitionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(RecognitionError::BadRequest(format!(
                "Unsupported export format: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct StoreSettings {
    duplicate_window_minutes: i64,
    auto_mark_enabled: bool,
}

/// Relational attendance store. Writers serialize on the connection lock;
/// the duplicate-suppression check and the insert share one transaction so
/// racing commits cannot both land.
pub struct AttendanceStore {
    conn: Mutex<Connection>,
    settings: Mutex<StoreSettings>,
}

impl AttendanceStore {
    pub fn open(path: &Path, defaults: &AttendanceConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        let mut settings = StoreSettings {
            duplicate_window_minutes: defaults.duplicate_window_minutes,
            auto_mark_enabled: defaults.auto_mark_enabled,
        };
        if let Some(value) = read_config(&conn, CONFIG_DUPLICATE_WINDOW)? {
            if let Some(minutes) = value.as_i64() {
                settings.duplicate_window_minutes = minutes;
            }
        }
        if let Some(value) = read_config(&conn, CONFIG_AUTO_MARK)? {
            if let Some(enabled) = value.as_bool() {
                settings.auto_mark_enabled = enabled;
            }
        }

        tracing::info!(db = ?path, window = settings.duplicate_window_minutes, "Attendance store ready");

        Ok(Self {
            conn: Mutex::new(conn),
            settings: Mutex::new(settings),
        })
    }

    // ------------------------------------------------------------------ //
    // Persons
    // ------------------------------------------------------------------ //

    pub fn add_person(&self, person: &NewPerson) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let metadata = person
            .metadata
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO persons (
                person_id, name, email, department, position, phone,
                status, metadata, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?8, ?8)",
            params![
                person.person_id,
                person.name,
                person.email,
                person.department,
                person.position,
                person.phone,
                metadata.to_string(),
                now,
            ],
        )?;

        if inserted == 0 {
            return Err(RecognitionError::PersonAlreadyExists(person.person_id.clone()));
        }

        write_log(
            &conn,
            "info",
            "person",
            &format!("Added person: {} ({})", person.name, person.person_id),
            None,
        )?;
        Ok(())
    }

    /// Registration path: create the Person row if new, otherwise refresh
    /// the name.
    pub fn upsert_person(&self, person_id: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO persons (person_id, name, status, metadata, created_at, updated_at)
             VALUES (?1, ?2, 'active', '{}', ?3, ?3)
             ON CONFLICT(person_id) DO UPDATE SET name = ?2, updated_at = ?3",
            params![person_id, name, now],
        )?;
        Ok(())
    }

    pub fn get_person(&self, person_id: &str) -> Result<Person> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT person_id, name, email, department, position, phone,
                    status, metadata, created_at, updated_at
             FROM persons WHERE person_id = ?1",
            params![person_id],
            row_to_person,
        )
        .optional()?
        .ok_or_else(|| RecognitionError::PersonNotFound(person_id.to_string()))
    }

    pub fn list_persons(
        &self,
        status: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Person>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT person_id, name, email, department, position, phone,
                            status, metadata, created_at, updated_at
                     FROM persons WHERE status = ?1 ORDER BY name LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![status, limit, offset], row_to_person)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT person_id, name, email, department, position, phone,
                            status, metadata, created_at, updated_at
                     FROM persons ORDER BY name LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map(params![limit, offset], row_to_person)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn update_person(&self, person_id: &str, patch: &PersonPatch) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        fn push(
            field: &str,
            value: Box<dyn rusqlite::ToSql>,
            fields: &mut Vec<String>,
            values: &mut Vec<Box<dyn rusqlite::ToSql>>,
        ) {
            fields.push(format!("{} = ?{}", field, values.len() + 1));
            values.push(value);
        }

        let mut fields = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(name) = &patch.name {
            push("name", Box::new(name.clone()), &mut fields, &mut values);
        }
        if let Some(email) = &patch.email {
            push("email", Box::new(email.clone()), &mut fields, &mut values);
        }
        if let Some(department) = &patch.department {
            push("department", Box::new(department.clone()), &mut fields, &mut values);
        }
        if let Some(position) = &patch.position {
            push("position", Box::new(position.clone()), &mut fields, &mut values);
        }
        if let Some(phone) = &patch.phone {
            push("phone", Box::new(phone.clone()), &mut fields, &mut values);
        }
        if let Some(status) = &patch.status {
            push("status", Box::new(status.clone()), &mut fields, &mut values);
        }
        if let Some(metadata) = &patch.metadata {
            push("metadata", Box::new(metadata.to_string()), &mut fields, &mut values);
        }

        if fields.is_empty() {
            return Err(RecognitionError::BadRequest("No fields to update".into()));
        }

        fields.push(format!("updated_at = ?{}", values.len() + 1));
        values.push(Box::new(Utc::now().to_rfc3339()));
        values.push(Box::new(person_id.to_string()));

        let sql = format!(
            "UPDATE persons SET {} WHERE person_id = ?{}",
            fields.join(", "),
            values.len()
        );
        let updated = conn.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        if updated == 0 {
            return Err(RecognitionError::PersonNotFound(person_id.to_string()));
        }

        write_log(&conn, "info", "person", &format!("Updated person: {}", person_id), None)?;
        Ok(())
    }

    /// Soft delete: the row stays for attendance history.
    pub fn delete_person(&self, person_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE persons SET status = 'deleted', updated_at = ?1 WHERE person_id = ?2",
            params![Utc::now().to_rfc3339(), person_id],
        )?;
        if updated == 0 {
            return Err(RecognitionError::PersonNotFound(person_id.to_string()));
        }
        write_log(&conn, "warning", "person", &format!("Deleted person: {}", person_id), None)?;
        Ok(())
    }

    // ------------------------------------------------------------------ //
    // Attendance
    // ------------------------------------------------------------------ //

    /// Insert an attendance row. Auto marks are rejected as `Suppressed`
    /// when a row for the same person landed inside the duplicate window;
    /// the check and the insert run in one transaction.
    pub fn mark(&self, req: &MarkRequest) -> Result<MarkOutcome> {
        let settings = self.settings.lock().unwrap().clone();
        let mut conn = self.conn.lock().unwrap();

        let person_name = match &req.person_name {
            Some(name) => name.clone(),
            None => conn
                .query_row(
                    "SELECT name FROM persons WHERE person_id = ?1",
                    params![req.person_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .ok_or_else(|| RecognitionError::PersonNotFound(req.person_id.clone()))?,
        };

        let now = Utc::now();
        let check_in = now.to_rfc3339();
        let today = Local::now().format("%Y-%m-%d").to_string();
        let metadata = req
            .metadata
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let tx = conn.transaction()?;

        if req.marked_by == MarkedBy::Auto && settings.auto_mark_enabled {
            let window_start =
                (now - Duration::minutes(settings.duplicate_window_minutes)).to_rfc3339();
            let duplicate: Option<i64> = tx
                .query_row(
                    "SELECT id FROM attendance
                     WHERE person_id = ?1 AND date = ?2 AND check_in >= ?3
                     LIMIT 1",
                    params![req.person_id, today, window_start],
                    |row| row.get(0),
                )
                .optional()?;
            if duplicate.is_some() {
                tx.rollback()?;
                return Ok(MarkOutcome::Suppressed);
            }
        }

        tx.execute(
            "INSERT INTO attendance (
                person_id, person_name, check_in, date, source, confidence,
                status, marked_by, notes, metadata, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'present', ?7, ?8, ?9, ?3, ?3)",
            params![
                req.person_id,
                person_name,
                check_in,
                today,
                req.source,
                req.confidence,
                req.marked_by.as_str(),
                req.notes,
                metadata.to_string(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        write_log(
            &conn,
            "info",
            "attendance",
            &format!("Marked attendance for {} ({})", person_name, req.person_id),
            None,
        )?;
        Ok(MarkOutcome::Marked(id))
    }

    pub fn checkout(&self, attendance_id: i64) -> Result<AttendanceRecord> {
        let conn = self.conn.lock().unwrap();
        let check_in: Option<String> = conn
            .query_row(
                "SELECT check_in FROM attendance WHERE id = ?1",
                params![attendance_id],
                |row| row.get(0),
            )
            .optional()?;
        let check_in = check_in.ok_or(RecognitionError::AttendanceNotFound(attendance_id))?;

        let check_in: DateTime<Utc> = check_in
            .parse()
            .map_err(|e| RecognitionError::Storage(format!("Bad check_in timestamp: {}", e)))?;
        let now = Utc::now();
        if now < check_in {
            return Err(RecognitionError::Storage(
                "check_out before check_in".into(),
            ));
        }
        let duration = (now - check_in).num_seconds() / 60;

        conn.execute(
            "UPDATE attendance SET check_out = ?1, duration_minutes = ?2, updated_at = ?1
             WHERE id = ?3",
            params![now.to_rfc3339(), duration, attendance_id],
        )?;

        drop(conn);
        self.get(attendance_id)
    }

    pub fn get(&self, attendance_id: i64) -> Result<AttendanceRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_ATTENDANCE),
            params![attendance_id],
            row_to_attendance,
        )
        .optional()?
        .ok_or(RecognitionError::AttendanceNotFound(attendance_id))
    }

    pub fn list(&self, filters: &AttendanceFilters) -> Result<Vec<AttendanceRecord>> {
        let conn = self.conn.lock().unwrap();

        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(person_id) = &filters.person_id {
            values.push(Box::new(person_id.clone()));
            clauses.push(format!("person_id = ?{}", values.len()));
        }
        if let Some(date) = &filters.date {
            values.push(Box::new(date.clone()));
            clauses.push(format!("date = ?{}", values.len()));
        }
        if let Some(start) = &filters.start_date {
            values.push(Box::new(start.clone()));
            clauses.push(format!("date >= ?{}", values.len()));
        }
        if let Some(end) = &filters.end_date {
            values.push(Box::new(end.clone()));
            clauses.push(format!("date <= ?{}", values.len()));
        }
        if let Some(status) = &filters.status {
            values.push(Box::new(status.clone()));
            clauses.push(format!("status = ?{}", values.len()));
        }

        let mut sql = SELECT_ATTENDANCE.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY date DESC, check_in DESC");
        values.push(Box::new(filters.limit.unwrap_or(100)));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));
        values.push(Box::new(filters.offset.unwrap_or(0)));
        sql.push_str(&format!(" OFFSET ?{}", values.len()));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            row_to_attendance,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn today(&self) -> Result<Vec<AttendanceRecord>> {
        self.list(&AttendanceFilters {
            date: Some(Local::now().format("%Y-%m-%d").to_string()),
            limit: Some(500),
            ..Default::default()
        })
    }

    pub fn for_person(
        &self,
        person_id: &str,
        start_date: Option<String>,
        end_date: Option<String>,
    ) -> Result<Vec<AttendanceRecord>> {
        self.list(&AttendanceFilters {
            person_id: Some(person_id.to_string()),
            start_date,
            end_date,
            limit: Some(500),
            ..Default::default()
        })
    }

    // ------------------------------------------------------------------ //
    // Reports
    // ------------------------------------------------------------------ //

    pub fn report(
        &self,
        start_date: &str,
        end_date: &str,
        person_id: Option<&str>,
    ) -> Result<Vec<ReportRow>> {
        let conn = self.conn.lock().unwrap();
        let base = "SELECT person_id, person_name,
                           COUNT(*) AS total_days,
                           SUM(CASE WHEN status = 'present' THEN 1 ELSE 0 END) AS present_days,
                           SUM(CASE WHEN status = 'absent' THEN 1 ELSE 0 END) AS absent_days,
                           AVG(duration_minutes) AS avg_duration,
                           SUM(duration_minutes) AS total_duration
                    FROM attendance
                    WHERE date >= ?1 AND date <= ?2";

        let map = |row: &Row| -> rusqlite::Result<ReportRow> {
            Ok(ReportRow {
                person_id: row.get(0)?,
                person_name: row.get(1)?,
                total_days: row.get(2)?,
                present_days: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                absent_days: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                avg_duration_minutes: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                total_duration_minutes: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
            })
        };

        let mut out = Vec::new();
        match person_id {
            Some(person_id) => {
                let sql = format!("{} AND person_id = ?3 GROUP BY person_id, person_name", base);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![start_date, end_date, person_id], map)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let sql = format!("{} GROUP BY person_id, person_name", base);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![start_date, end_date], map)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn daily_summary(&self, date: &str) -> Result<DailySummary> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*),
                    COUNT(DISTINCT person_id),
                    SUM(CASE WHEN status = 'present' THEN 1 ELSE 0 END),
                    AVG(confidence),
                    AVG(duration_minutes)
             FROM attendance WHERE date = ?1",
            params![date],
            |row| {
                Ok(DailySummary {
                    date: date.to_string(),
                    total_records: row.get(0)?,
                    unique_persons: row.get(1)?,
                    present: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    avg_confidence: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    avg_duration_minutes: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                })
            },
        )
        .map_err(Into::into)
    }

    pub fn export(
        &self,
        start_date: &str,
        end_date: &str,
        format: ExportFormat,
    ) -> Result<String> {
        let rows = self.list(&AttendanceFilters {
            start_date: Some(start_date.to_string()),
            end_date: Some(end_date.to_string()),
            limit: Some(u32::MAX),
            ..Default::default()
        })?;

        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&rows)?),
            ExportFormat::Csv => {
                let mut out = String::from(
                    "id,person_id,person_name,check_in,check_out,date,duration_minutes,\
                     source,confidence,status,marked_by,notes\n",
                );
                for row in rows {
                    out.push_str(&format!(
                        "{},{},{},{},{},{},{},{},{},{},{},{}\n",
                        row.id,
                        csv_field(&row.person_id),
                        csv_field(&row.person_name),
                        csv_field(&row.check_in),
                        csv_field(row.check_out.as_deref().unwrap_or("")),
                        csv_field(&row.date),
                        row.duration_minutes.map(|d| d.to_string()).unwrap_or_default(),
                        csv_field(row.source.as_deref().unwrap_or("")),
                        row.confidence.map(|c| c.to_string()).unwrap_or_default(),
                        csv_field(&row.status),
                        csv_field(&row.marked_by),
                        csv_field(row.notes.as_deref().unwrap_or("")),
                    ));
                }
                Ok(out)
            }
        }
    }

    // ------------------------------------------------------------------ //
    // Detection events
    // ------------------------------------------------------------------ //

    pub fn log_detection(&self, event: &NewDetectionEvent) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let metadata = event
            .metadata
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));
        conn.execute(
            "INSERT INTO detection_events (
                person_id, person_name, timestamp, confidence, source,
                attendance_id, metadata, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?3)",
            params![
                event.person_id,
                event.person_name,
                now,
                event.confidence,
                event.source,
                event.attendance_id,
                metadata.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn detection_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM detection_events", [], |row| row.get(0))
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------ //
    // Configuration
    // ------------------------------------------------------------------ //

    pub fn set_config(&self, key: &str, value: &Value, description: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO system_config (key, value, description, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, value.to_string(), description, Utc::now().to_rfc3339()],
        )?;
        drop(conn);

        let mut settings = self.settings.lock().unwrap();
        match key {
            CONFIG_DUPLICATE_WINDOW => {
                if let Some(minutes) = value.as_i64() {
                    settings.duplicate_window_minutes = minutes;
                }
            }
            CONFIG_AUTO_MARK => {
                if let Some(enabled) = value.as_bool() {
                    settings.auto_mark_enabled = enabled;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().unwrap();
        read_config(&conn, key)
    }

    pub fn list_config(&self) -> Result<Value> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value, description FROM system_config")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut out = serde_json::Map::new();
        for row in rows {
            let (key, value, description) = row?;
            let value: Value = serde_json::from_str(&value).unwrap_or(Value::Null);
            out.insert(
                key,
                serde_json::json!({ "value": value, "description": description }),
            );
        }
        Ok(Value::Object(out))
    }

    // ------------------------------------------------------------------ //
    // API keys
    // ------------------------------------------------------------------ //

    /// Generate a key, store only its hash, and return the plaintext once.
    pub fn create_api_key(
        &self,
        name: &str,
        permissions: &[String],
        expires_days: Option<i64>,
    ) -> Result<String> {
        let api_key: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(43)
            .map(char::from)
            .collect();
        let key_hash = sha256_hex(&api_key);

        let now = Utc::now();
        let expires_at = expires_days.map(|days| (now + Duration::days(days)).to_rfc3339());

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO api_keys (key_hash, name, permissions, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key_hash,
                name,
                serde_json::to_string(permissions)?,
                now.to_rfc3339(),
                expires_at,
            ],
        )?;
        write_log(&conn, "info", "auth", &format!("Created API key: {}", name), None)?;
        Ok(api_key)
    }

    /// True when the key is active, unexpired, and covers the permission.
    pub fn validate_api_key(&self, api_key: &str, required: Option<&str>) -> Result<bool> {
        let key_hash = sha256_hex(api_key);
        let conn = self.conn.lock().unwrap();

        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT permissions, expires_at FROM api_keys
                 WHERE key_hash = ?1 AND status = 'active'",
                params![key_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((permissions, expires_at)) = row else {
            return Ok(false);
        };

        if let Some(expires_at) = expires_at {
            let expires: DateTime<Utc> = expires_at
                .parse()
                .map_err(|e| RecognitionError::Storage(format!("Bad expiry timestamp: {}", e)))?;
            if expires < Utc::now() {
                return Ok(false);
            }
        }

        if let Some(required) = required {
            let granted: Vec<String> = serde_json::from_str(&permissions)?;
            if !granted.iter().any(|g| permission_covers(g, required)) {
                return Ok(false);
            }
        }

        conn.execute(
            "UPDATE api_keys SET last_used = ?1 WHERE key_hash = ?2",
            params![Utc::now().to_rfc3339(), key_hash],
        )?;
        Ok(true)
    }

    pub fn list_api_keys(&self) -> Result<Vec<ApiKeyInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, permissions, status, created_at, last_used, expires_at
             FROM api_keys ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, name, permissions, status, created_at, last_used, expires_at) = row?;
            out.push(ApiKeyInfo {
                id,
                name,
                permissions: serde_json::from_str(&permissions).unwrap_or_default(),
                status,
                created_at,
                last_used,
                expires_at,
            });
        }
        Ok(out)
    }

    pub fn has_api_keys(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM api_keys WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------ //
    // Logs
    // ------------------------------------------------------------------ //

    pub fn log(&self, level: &str, category: &str, message: &str, details: Option<&Value>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        write_log(&conn, level, category, message, details)
    }

    pub fn get_logs(
        &self,
        level: Option<&str>,
        category: Option<&str>,
        limit: u32,
    ) -> Result<Vec<LogRow>> {
        let conn = self.conn.lock().unwrap();

        let mut sql = String::from(
            "SELECT id, level, category, message, details, timestamp FROM system_logs WHERE 1=1",
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(level) = level {
            values.push(Box::new(level.to_string()));
            sql.push_str(&format!(" AND level = ?{}", values.len()));
        }
        if let Some(category) = category {
            values.push(Box::new(category.to_string()));
            sql.push_str(&format!(" AND category = ?{}", values.len()));
        }
        values.push(Box::new(limit));
        sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT ?{}", values.len()));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            |row| {
                Ok(LogRow {
                    id: row.get(0)?,
                    level: row.get(1)?,
                    category: row.get(2)?,
                    message: row.get(3)?,
                    details: row
                        .get::<_, Option<String>>(4)?
                        .and_then(|d| serde_json::from_str(&d).ok()),
                    timestamp: row.get(5)?,
                })
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    #[cfg(test)]
    fn backdate_attendance(&self, attendance_id: i64, minutes: i64) {
        let conn = self.conn.lock().unwrap();
        let earlier = (Utc::now() - Duration::minutes(minutes)).to_rfc3339();
        conn.execute(
            "UPDATE attendance SET check_in = ?1 WHERE id = ?2",
            params![earlier, attendance_id],
        )
        .unwrap();
    }
}

const SELECT_ATTENDANCE: &str =
    "SELECT id, person_id, person_name, check_in, check_out, date, duration_minutes,
            source, confidence, status, marked_by, notes, metadata
     FROM attendance";

fn row_to_attendance(row: &Row) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        person_id: row.get(1)?,
        person_name: row.get(2)?,
        check_in: row.get(3)?,
        check_out: row.get(4)?,
        date: row.get(5)?,
        duration_minutes: row.get(6)?,
        source: row.get(7)?,
        confidence: row.get(8)?,
        status: row.get(9)?,
        marked_by: row.get(10)?,
        notes: row.get(11)?,
        metadata: row
            .get::<_, Option<String>>(12)?
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or(Value::Null),
    })
}

fn row_to_person(row: &Row) -> rusqlite::Result<Person> {
    Ok(Person {
        person_id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        department: row.get(3)?,
        position: row.get(4)?,
        phone: row.get(5)?,
        status: row.get(6)?,
        metadata: row
            .get::<_, Option<String>>(7)?
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or(Value::Null),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn read_config(conn: &Connection, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM system_config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
}

fn write_log(
    conn: &Connection,
    level: &str,
    category: &str,
    message: &str,
    details: Option<&Value>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO system_logs (level, category, message, details, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            level,
            category,
            message,
            details.map(|d| d.to_string()),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut acc, byte| {
            acc.push_str(&format!("{:02x}", byte));
            acc
        })
}

/// A granted permission covers a required one exactly, by `prefix:*`
/// wildcard, or via the global grants.
fn permission_covers(granted: &str, required: &str) -> bool {
    if granted == "*" || granted == "admin" || granted == required {
        return true;
    }
    if let Some(prefix) = granted.strip_suffix(":*") {
        if let Some((scope, _)) = required.split_once(':') {
            return scope == prefix;
        }
    }
    false
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, AttendanceStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = AttendanceStore::open(
            &tmp.path().join("attendance.db"),
            &AttendanceConfig::default(),
        )
        .unwrap();
        (tmp, store)
    }

    fn alice() -> NewPerson {
        NewPerson {
            person_id: "A1".into(),
            name: "Alice".into(),
            email: Some("alice@example.com".into()),
            department: Some("Engineering".into()),
            ..Default::default()
        }
    }

    fn auto_mark(person_id: &str) -> MarkRequest {
        MarkRequest {
            person_id: person_id.into(),
            person_name: None,
            confidence: 0.9,
            source: Some("rtsp://cam".into()),
            marked_by: MarkedBy::Auto,
            notes: None,
            metadata: None,
        }
    }

    #[test]
    fn person_crud_round_trip() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();

        let person = store.get_person("A1").unwrap();
        assert_eq!(person.name, "Alice");
        assert_eq!(person.status, "active");

        match store.add_person(&alice()) {
            Err(RecognitionError::PersonAlreadyExists(id)) => assert_eq!(id, "A1"),
            other => panic!("expected PersonAlreadyExists, got {:?}", other),
        }

        store
            .update_person(
                "A1",
                &PersonPatch {
                    department: Some("Security".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.get_person("A1").unwrap().department.as_deref(), Some("Security"));

        store.delete_person("A1").unwrap();
        assert_eq!(store.get_person("A1").unwrap().status, "deleted");
        assert!(store.list_persons(Some("active"), 100, 0).unwrap().is_empty());
        assert_eq!(store.list_persons(None, 100, 0).unwrap().len(), 1);
    }

    #[test]
    fn update_with_no_fields_is_rejected() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();
        assert!(matches!(
            store.update_person("A1", &PersonPatch::default()),
            Err(RecognitionError::BadRequest(_))
        ));
    }

    #[test]
    fn missing_person_surfaces_not_found() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.get_person("nobody"),
            Err(RecognitionError::PersonNotFound(_))
        ));
        assert!(matches!(
            store.mark(&auto_mark("nobody")),
            Err(RecognitionError::PersonNotFound(_))
        ));
    }

    #[test]
    fn upsert_creates_then_renames() {
        let (_tmp, store) = store();
        store.upsert_person("A1", "Alice").unwrap();
        store.upsert_person("A1", "Alice Smith").unwrap();
        let person = store.get_person("A1").unwrap();
        assert_eq!(person.name, "Alice Smith");
        assert_eq!(store.list_persons(None, 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn second_auto_mark_in_window_is_suppressed() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();

        let first = store.mark(&auto_mark("A1")).unwrap();
        assert!(matches!(first, MarkOutcome::Marked(_)));

        let second = store.mark(&auto_mark("A1")).unwrap();
        assert_eq!(second, MarkOutcome::Suppressed);

        assert_eq!(store.today().unwrap().len(), 1);
    }

    #[test]
    fn auto_mark_outside_window_is_accepted() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();

        let MarkOutcome::Marked(id) = store.mark(&auto_mark("A1")).unwrap() else {
            panic!("first mark should land");
        };
        // Push the first check-in beyond the 5 minute window.
        store.backdate_attendance(id, 6);

        assert!(matches!(store.mark(&auto_mark("A1")).unwrap(), MarkOutcome::Marked(_)));
    }

    #[test]
    fn mark_just_inside_window_is_suppressed() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();

        let MarkOutcome::Marked(id) = store.mark(&auto_mark("A1")).unwrap() else {
            panic!("first mark should land");
        };
        // Four minutes ago is still inside the five-minute window.
        store.backdate_attendance(id, 4);

        assert_eq!(store.mark(&auto_mark("A1")).unwrap(), MarkOutcome::Suppressed);
    }

    #[test]
    fn manual_marks_bypass_suppression() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();
        store.mark(&auto_mark("A1")).unwrap();

        let manual = MarkRequest {
            marked_by: MarkedBy::Manual,
            ..auto_mark("A1")
        };
        assert!(matches!(store.mark(&manual).unwrap(), MarkOutcome::Marked(_)));
        assert_eq!(store.today().unwrap().len(), 2);
    }

    #[test]
    fn checkout_computes_duration_in_whole_minutes() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();
        let MarkOutcome::Marked(id) = store.mark(&auto_mark("A1")).unwrap() else {
            panic!("mark should land");
        };
        store.backdate_attendance(id, 90);

        let record = store.checkout(id).unwrap();
        assert_eq!(record.duration_minutes, Some(90));
        assert!(record.check_out.is_some());
        assert!(record.check_out.as_ref().unwrap() >= &record.check_in);
    }

    #[test]
    fn checkout_of_missing_record_fails() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.checkout(42),
            Err(RecognitionError::AttendanceNotFound(42))
        ));
    }

    #[test]
    fn list_filters_by_person_and_date() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();
        store
            .add_person(&NewPerson {
                person_id: "B2".into(),
                name: "Bob".into(),
                ..Default::default()
            })
            .unwrap();
        store.mark(&auto_mark("A1")).unwrap();
        store.mark(&auto_mark("B2")).unwrap();

        let only_alice = store
            .list(&AttendanceFilters {
                person_id: Some("A1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(only_alice.len(), 1);
        assert_eq!(only_alice[0].person_name, "Alice");

        let today = Local::now().format("%Y-%m-%d").to_string();
        assert_eq!(
            store
                .list(&AttendanceFilters {
                    date: Some(today),
                    ..Default::default()
                })
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn report_aggregates_per_person() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();
        let MarkOutcome::Marked(id) = store.mark(&auto_mark("A1")).unwrap() else {
            panic!("mark should land");
        };
        store.backdate_attendance(id, 60);
        store.checkout(id).unwrap();

        let today = Local::now().format("%Y-%m-%d").to_string();
        let report = store.report(&today, &today, None).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].person_id, "A1");
        assert_eq!(report[0].total_days, 1);
        assert_eq!(report[0].present_days, 1);
        assert_eq!(report[0].total_duration_minutes, 60);

        let summary = store.daily_summary(&today).unwrap();
        assert_eq!(summary.total_records, 1);
        assert_eq!(summary.unique_persons, 1);
        assert!(summary.avg_confidence > 0.0);
    }

    #[test]
    fn export_round_trips_every_field_through_json() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();
        store.mark(&auto_mark("A1")).unwrap();

        let today = Local::now().format("%Y-%m-%d").to_string();
        let json = store.export(&today, &today, ExportFormat::Json).unwrap();
        let parsed: Vec<AttendanceRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, store.today().unwrap());
    }

    #[test]
    fn csv_export_has_header_and_escaping() {
        let (_tmp, store) = store();
        store
            .add_person(&NewPerson {
                person_id: "C3".into(),
                name: "Last, First".into(),
                ..Default::default()
            })
            .unwrap();
        store.mark(&auto_mark("C3")).unwrap();

        let today = Local::now().format("%Y-%m-%d").to_string();
        let csv = store.export(&today, &today, ExportFormat::Csv).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,person_id,person_name"));
        let row = lines.next().unwrap();
        assert!(row.contains("\"Last, First\""));
    }

    #[test]
    fn detection_events_append() {
        let (_tmp, store) = store();
        let id = store
            .log_detection(&NewDetectionEvent {
                person_id: Some("A1".into()),
                person_name: "Alice".into(),
                confidence: 0.8,
                source: Some("0".into()),
                attendance_id: None,
                metadata: None,
            })
            .unwrap();
        assert!(id > 0);
        assert_eq!(store.detection_count().unwrap(), 1);
    }

    #[test]
    fn config_round_trips_and_tightens_the_window() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();

        store
            .set_config(CONFIG_DUPLICATE_WINDOW, &serde_json::json!(0), None)
            .unwrap();
        assert_eq!(
            store.get_config(CONFIG_DUPLICATE_WINDOW).unwrap(),
            Some(serde_json::json!(0))
        );

        // Window of zero minutes: nothing is "recent", both marks land.
        store.mark(&auto_mark("A1")).unwrap();
        assert!(matches!(store.mark(&auto_mark("A1")).unwrap(), MarkOutcome::Marked(_)));
    }

    #[test]
    fn config_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.db");
        {
            let store = AttendanceStore::open(&path, &AttendanceConfig::default()).unwrap();
            store
                .set_config(CONFIG_DUPLICATE_WINDOW, &serde_json::json!(30), None)
                .unwrap();
        }
        let store = AttendanceStore::open(&path, &AttendanceConfig::default()).unwrap();
        assert_eq!(store.settings.lock().unwrap().duplicate_window_minutes, 30);
    }

    #[test]
    fn api_keys_gate_permissions() {
        let (_tmp, store) = store();
        let key = store
            .create_api_key("readers", &["attendance:read".into()], None)
            .unwrap();

        assert!(store.validate_api_key(&key, None).unwrap());
        assert!(store.validate_api_key(&key, Some("attendance:read")).unwrap());
        assert!(!store.validate_api_key(&key, Some("attendance:write")).unwrap());
        assert!(!store.validate_api_key("bogus", None).unwrap());

        let admin = store.create_api_key("root", &["*".into()], None).unwrap();
        assert!(store.validate_api_key(&admin, Some("config:write")).unwrap());

        let scoped = store
            .create_api_key("people", &["person:*".into()], None)
            .unwrap();
        assert!(store.validate_api_key(&scoped, Some("person:write")).unwrap());
        assert!(!store.validate_api_key(&scoped, Some("logs:read")).unwrap());

        let infos = store.list_api_keys().unwrap();
        assert_eq!(infos.len(), 3);
        assert!(store.has_api_keys().unwrap());
    }

    #[test]
    fn expired_keys_are_rejected() {
        let (_tmp, store) = store();
        let key = store
            .create_api_key("ephemeral", &["*".into()], Some(-1))
            .unwrap();
        assert!(!store.validate_api_key(&key, None).unwrap());
    }

    #[test]
    fn operations_leave_an_audit_trail() {
        let (_tmp, store) = store();
        store.add_person(&alice()).unwrap();
        store.mark(&auto_mark("A1")).unwrap();

        let logs = store.get_logs(None, None, 50).unwrap();
        assert!(logs.len() >= 2);

        let person_logs = store.get_logs(None, Some("person"), 50).unwrap();
        assert!(person_logs.iter().all(|l| l.category == "person"));

        let warnings = store.get_logs(Some("warning"), None, 50).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn permission_wildcards() {
        assert!(permission_covers("*", "anything"));
        assert!(permission_covers("admin", "config:write"));
        assert!(permission_covers("person:*", "person:read"));
        assert!(!permission_covers("person:*", "attendance:read"));
        assert!(permission_covers("logs:read", "logs:read"));
        assert!(!permission_covers("logs:read", "logs:write"));
    }
}
