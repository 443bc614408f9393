use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params, params_from_iter};

use super::filter::{Fields, Filter, order_sql, query_page};
use super::schema::SCHEMA;
use super::{CatalogChange, LeaseOutcome, NewRepoEvent, Store, VersionTransition};
use crate::error::{Error, Result};
use crate::types::*;
use crate::workflow::next_status;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory database, mainly for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

/// Fixed-width UTC timestamps so lexical order equals time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn get_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(parse_datetime(&row.get::<_, String>(idx)?))
}

fn get_opt_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .map(|s| parse_datetime(&s)))
}

fn get_parsed<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn get_package_ref(row: &Row<'_>, idx: usize) -> rusqlite::Result<PackageRef> {
    let raw: String = row.get(idx)?;
    PackageRef::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid package reference '{raw}'").into(),
        )
    })
}

/// Maps unique-index violations to `AlreadyExists`.
fn map_unique(e: rusqlite::Error, what: impl FnOnce() -> String) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && (err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY) =>
        {
            Error::AlreadyExists(what())
        }
        other => Error::from(other),
    }
}

/// Turns a zero-row compare-and-swap into `NotFound` or `Conflict`.
fn check_cas(conn: &Connection, table: &str, entity: &str, id: &str, rows: usize) -> Result<()> {
    if rows > 0 {
        return Ok(());
    }
    let exists: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
        params![id],
        |row| row.get(0),
    )?;
    if exists {
        Err(Error::Conflict(format!(
            "{entity} {id} was modified concurrently; re-read and retry"
        )))
    } else {
        Err(Error::NotFound(format!("{entity} {id}")))
    }
}

/// The next timestamp after `last`, never going backwards.
fn next_timestamp(now: DateTime<Utc>, last: Option<&str>) -> DateTime<Utc> {
    match last.map(parse_datetime) {
        Some(last) if last >= now => last + Duration::microseconds(1),
        _ => now,
    }
}

const REPO_COLS: &str = "id, name, description, url, credential_ref, scope, workspace, \
     sync_period_secs, status, last_indexed_at, created_at, updated_at, stamp";

const TEMPLATE_COLS: &str = "id, repository_id, workspace, name, description, owner, \
     category_id, status, suspended_by, created_at, updated_at, stamp";

const VERSION_COLS: &str = "id, app_template_id, version, description, package_ref, owner, \
     status, created_at, updated_at, stamp";

const AUDIT_COLS: &str = "version_id, seq, from_status, to_status, action, actor, message, timestamp";

const EVENT_COLS: &str = "repository_id, seq, job_id, kind, timestamp, detail";

const APP_COLS: &str = "id, name, description, app_template_id, app_version_id, \
     pending_version_id, workspace, cluster, namespace, status, conclusion_ref, conf, \
     created_at, updated_at, stamp";

const CATEGORY_COLS: &str = "id, name, description, created_at, updated_at, stamp";

const ATTACHMENT_COLS: &str = "id, name, content_type, size, digest, created_at";

const LEASE_COLS: &str = "repository_id, job_id, holder, acquired_at, expires_at";

fn row_to_repository(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        url: row.get(3)?,
        credential_ref: row.get(4)?,
        scope: get_parsed(row, 5)?,
        workspace: row.get(6)?,
        sync_period_secs: row.get(7)?,
        status: get_parsed(row, 8)?,
        last_indexed_at: get_opt_datetime(row, 9)?,
        created_at: get_datetime(row, 10)?,
        updated_at: get_datetime(row, 11)?,
        stamp: row.get(12)?,
    })
}

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<AppTemplate> {
    Ok(AppTemplate {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        workspace: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        owner: row.get(5)?,
        category_id: row.get(6)?,
        status: get_parsed(row, 7)?,
        suspended_by: row.get(8)?,
        created_at: get_datetime(row, 9)?,
        updated_at: get_datetime(row, 10)?,
        stamp: row.get(11)?,
    })
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<AppVersion> {
    Ok(AppVersion {
        id: row.get(0)?,
        app_template_id: row.get(1)?,
        version: row.get(2)?,
        description: row.get(3)?,
        package_ref: get_package_ref(row, 4)?,
        owner: row.get(5)?,
        status: get_parsed(row, 6)?,
        created_at: get_datetime(row, 7)?,
        updated_at: get_datetime(row, 8)?,
        stamp: row.get(9)?,
    })
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    Ok(AuditRecord {
        version_id: row.get(0)?,
        seq: row.get(1)?,
        from_status: get_parsed(row, 2)?,
        to_status: get_parsed(row, 3)?,
        action: get_parsed(row, 4)?,
        actor: row.get(5)?,
        message: row.get(6)?,
        timestamp: get_datetime(row, 7)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<RepoEvent> {
    Ok(RepoEvent {
        repository_id: row.get(0)?,
        seq: row.get(1)?,
        job_id: row.get(2)?,
        kind: get_parsed(row, 3)?,
        timestamp: get_datetime(row, 4)?,
        detail: row.get(5)?,
    })
}

fn row_to_application(row: &Row<'_>) -> rusqlite::Result<Application> {
    Ok(Application {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        app_template_id: row.get(3)?,
        app_version_id: row.get(4)?,
        pending_version_id: row.get(5)?,
        workspace: row.get(6)?,
        cluster: row.get(7)?,
        namespace: row.get(8)?,
        status: get_parsed(row, 9)?,
        conclusion_ref: row.get(10)?,
        conf: row.get(11)?,
        created_at: get_datetime(row, 12)?,
        updated_at: get_datetime(row, 13)?,
        stamp: row.get(14)?,
    })
}

fn row_to_category(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: get_datetime(row, 3)?,
        updated_at: get_datetime(row, 4)?,
        stamp: row.get(5)?,
    })
}

fn row_to_attachment(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get(0)?,
        name: row.get(1)?,
        content_type: row.get(2)?,
        size: row.get(3)?,
        digest: row.get(4)?,
        created_at: get_datetime(row, 5)?,
    })
}

fn row_to_lease(row: &Row<'_>) -> rusqlite::Result<IndexLease> {
    Ok(IndexLease {
        repository_id: row.get(0)?,
        job_id: row.get(1)?,
        holder: row.get(2)?,
        acquired_at: get_datetime(row, 3)?,
        expires_at: get_datetime(row, 4)?,
    })
}

const REPO_FIELDS: Fields = Fields {
    filters: &[
        ("name", "name"),
        ("description", "description"),
        ("url", "url"),
        ("scope", "scope"),
        ("workspace", "workspace"),
        ("status", "status"),
    ],
    orders: &[
        ("name", "name"),
        ("created_at", "created_at"),
        ("updated_at", "updated_at"),
    ],
    default_order: "created_at",
    tiebreak: "id",
    status_column: Some("status"),
};

const TEMPLATE_FIELDS: Fields = Fields {
    filters: &[
        ("name", "name"),
        ("description", "description"),
        ("repository_id", "repository_id"),
        ("workspace", "workspace"),
        ("owner", "owner"),
        ("category_id", "category_id"),
        ("status", "status"),
    ],
    orders: &[
        ("name", "name"),
        ("created_at", "created_at"),
        ("updated_at", "updated_at"),
    ],
    default_order: "created_at",
    tiebreak: "id",
    status_column: Some("status"),
};

const VERSION_FIELDS: Fields = Fields {
    filters: &[
        ("app_template_id", "app_template_id"),
        ("version", "version"),
        ("description", "description"),
        ("owner", "owner"),
        ("status", "status"),
    ],
    orders: &[
        ("version", "version"),
        ("status", "status"),
        ("created_at", "created_at"),
        ("updated_at", "updated_at"),
    ],
    default_order: "created_at",
    tiebreak: "id",
    status_column: Some("status"),
};

const APP_FIELDS: Fields = Fields {
    filters: &[
        ("name", "name"),
        ("description", "description"),
        ("workspace", "workspace"),
        ("cluster", "cluster"),
        ("namespace", "namespace"),
        ("status", "status"),
        ("app_template_id", "app_template_id"),
        ("app_version_id", "app_version_id"),
    ],
    orders: &[
        ("name", "name"),
        ("status", "status"),
        ("created_at", "created_at"),
        ("updated_at", "updated_at"),
    ],
    default_order: "created_at",
    tiebreak: "id",
    status_column: Some("status"),
};

const CATEGORY_FIELDS: Fields = Fields {
    filters: &[("name", "name"), ("description", "description")],
    orders: &[
        ("name", "name"),
        ("created_at", "created_at"),
        ("updated_at", "updated_at"),
    ],
    default_order: "name",
    tiebreak: "id",
    status_column: None,
};

const EVENT_FIELDS: Fields = Fields {
    filters: &[("kind", "kind"), ("job_id", "job_id")],
    orders: &[("seq", "seq"), ("timestamp", "timestamp")],
    default_order: "seq",
    tiebreak: "seq",
    status_column: None,
};

const REVIEW_FIELDS: Fields = Fields {
    filters: &[
        ("status", "a.to_status"),
        ("actor", "a.actor"),
        ("version_id", "a.version_id"),
        ("app_template_id", "v.app_template_id"),
        ("app_name", "t.name"),
    ],
    orders: &[("timestamp", "a.timestamp"), ("app_name", "t.name")],
    default_order: "a.timestamp",
    tiebreak: "a.seq",
    status_column: None,
};

fn fetch_repository(conn: &Connection, id: &str) -> Result<Option<Repository>> {
    conn.query_row(
        &format!("SELECT {REPO_COLS} FROM repositories WHERE id = ?1"),
        params![id],
        row_to_repository,
    )
    .optional()
    .map_err(Error::from)
}

fn fetch_template(conn: &Connection, id: &str) -> Result<Option<AppTemplate>> {
    conn.query_row(
        &format!("SELECT {TEMPLATE_COLS} FROM app_templates WHERE id = ?1"),
        params![id],
        row_to_template,
    )
    .optional()
    .map_err(Error::from)
}

fn fetch_version(conn: &Connection, id: &str) -> Result<Option<AppVersion>> {
    conn.query_row(
        &format!("SELECT {VERSION_COLS} FROM app_versions WHERE id = ?1"),
        params![id],
        row_to_version,
    )
    .optional()
    .map_err(Error::from)
}

fn fetch_template_versions(conn: &Connection, template_id: &str) -> Result<Vec<AppVersion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VERSION_COLS} FROM app_versions WHERE app_template_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map(params![template_id], row_to_version)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

fn fetch_application(conn: &Connection, id: &str) -> Result<Option<Application>> {
    conn.query_row(
        &format!("SELECT {APP_COLS} FROM applications WHERE id = ?1"),
        params![id],
        row_to_application,
    )
    .optional()
    .map_err(Error::from)
}

fn fetch_category(conn: &Connection, id: &str) -> Result<Option<Category>> {
    conn.query_row(
        &format!("SELECT {CATEGORY_COLS} FROM categories WHERE id = ?1"),
        params![id],
        row_to_category,
    )
    .optional()
    .map_err(Error::from)
}

fn insert_template(conn: &Connection, t: &AppTemplate) -> Result<()> {
    conn.execute(
        "INSERT INTO app_templates (id, repository_id, workspace, name, description, owner,
             category_id, status, suspended_by, created_at, updated_at, stamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            t.id,
            t.repository_id,
            t.workspace,
            t.name,
            t.description,
            t.owner,
            t.category_id,
            t.status.as_str(),
            t.suspended_by,
            format_datetime(&t.created_at),
            format_datetime(&t.updated_at),
            t.stamp,
        ],
    )
    .map_err(|e| map_unique(e, || format!("app template '{}'", t.name)))?;
    Ok(())
}

fn insert_version(conn: &Connection, v: &AppVersion) -> Result<()> {
    conn.execute(
        "INSERT INTO app_versions (id, app_template_id, version, description, package_ref,
             owner, status, created_at, updated_at, stamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            v.id,
            v.app_template_id,
            v.version,
            v.description,
            v.package_ref.to_string(),
            v.owner,
            v.status.as_str(),
            format_datetime(&v.created_at),
            format_datetime(&v.updated_at),
            v.stamp,
        ],
    )
    .map_err(|e| map_unique(e, || format!("app version '{}'", v.version)))?;
    Ok(())
}

fn count_blocking_applications(conn: &Connection, version_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM applications
         WHERE status NOT IN ('deleting', 'deleted')
           AND (app_version_id = ?1 OR pending_version_id = ?1)",
        params![version_id],
        |row| row.get(0),
    )
    .map_err(Error::from)
}

fn append_audit(
    conn: &Connection,
    version_id: &str,
    t: &VersionTransition,
    now: DateTime<Utc>,
) -> Result<AuditRecord> {
    let (last_seq, last_ts): (i64, Option<String>) = conn.query_row(
        "SELECT IFNULL(MAX(seq), 0), MAX(timestamp) FROM audit_records WHERE version_id = ?1",
        params![version_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let record = AuditRecord {
        seq: last_seq + 1,
        version_id: version_id.to_string(),
        from_status: t.from,
        to_status: t.to,
        action: t.action,
        actor: t.actor.clone(),
        message: t.message.clone(),
        timestamp: next_timestamp(now, last_ts.as_deref()),
    };

    conn.execute(
        "INSERT INTO audit_records (version_id, seq, from_status, to_status, action, actor,
             message, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.version_id,
            record.seq,
            record.from_status.as_str(),
            record.to_status.as_str(),
            record.action.as_str(),
            record.actor,
            record.message,
            format_datetime(&record.timestamp),
        ],
    )?;

    Ok(record)
}

/// CAS a version along one workflow edge and append its audit record.
/// Callers must run this inside a transaction.
fn transition_in(
    conn: &Connection,
    version_id: &str,
    expected_stamp: i64,
    t: &VersionTransition,
) -> Result<AuditRecord> {
    if next_status(t.from, t.action) != Some(t.to) {
        return Err(Error::InvalidState(format!(
            "cannot {} a version in status {}",
            t.action, t.from
        )));
    }

    if t.to == VersionStatus::Deleted {
        let blocking = count_blocking_applications(conn, version_id)?;
        if blocking > 0 {
            return Err(Error::Conflict(format!(
                "version {version_id} is used by {blocking} application(s)"
            )));
        }
    }

    let now = timestamp_now();
    let rows = conn.execute(
        "UPDATE app_versions SET status = ?1, updated_at = ?2, stamp = stamp + 1
         WHERE id = ?3 AND stamp = ?4 AND status = ?5",
        params![
            t.to.as_str(),
            format_datetime(&now),
            version_id,
            expected_stamp,
            t.from.as_str(),
        ],
    )?;
    check_cas(conn, "app_versions", "app version", version_id, rows)?;

    append_audit(conn, version_id, t, now)
}

/// Deletes every version of a template that still has a delete edge.
fn delete_versions_in(conn: &Connection, template_id: &str, actor: &str, reason: &str) -> Result<()> {
    for version in fetch_template_versions(conn, template_id)? {
        if next_status(version.status, VersionAction::Delete).is_none() {
            continue;
        }
        let transition = VersionTransition {
            from: version.status,
            to: VersionStatus::Deleted,
            action: VersionAction::Delete,
            actor: actor.to_string(),
            message: Some(reason.to_string()),
        };
        transition_in(conn, &version.id, version.stamp, &transition)?;
    }
    Ok(())
}

fn append_event_in(conn: &Connection, event: &NewRepoEvent<'_>) -> Result<RepoEvent> {
    let last: Option<(i64, String)> = conn
        .query_row(
            "SELECT seq, timestamp FROM repo_events WHERE repository_id = ?1
             ORDER BY seq DESC LIMIT 1",
            params![event.repository_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (seq, timestamp) = match &last {
        Some((seq, ts)) => (seq + 1, next_timestamp(timestamp_now(), Some(ts))),
        None => (1, timestamp_now()),
    };

    let record = RepoEvent {
        seq,
        repository_id: event.repository_id.to_string(),
        job_id: event.job_id.to_string(),
        kind: event.kind,
        timestamp,
        detail: event.detail.map(str::to_string),
    };

    conn.execute(
        "INSERT INTO repo_events (repository_id, seq, job_id, kind, timestamp, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.repository_id,
            record.seq,
            record.job_id,
            record.kind.as_str(),
            format_datetime(&record.timestamp),
            record.detail,
        ],
    )?;

    Ok(record)
}

fn update_application_in(conn: &Connection, app: &Application, expected_stamp: i64) -> Result<()> {
    let rows = conn
        .execute(
            "UPDATE applications SET name = ?1, description = ?2, app_version_id = ?3,
                 pending_version_id = ?4, status = ?5, conclusion_ref = ?6, conf = ?7,
                 updated_at = ?8, stamp = stamp + 1
             WHERE id = ?9 AND stamp = ?10",
            params![
                app.name,
                app.description,
                app.app_version_id,
                app.pending_version_id,
                app.status.as_str(),
                app.conclusion_ref,
                app.conf,
                format_datetime(&timestamp_now()),
                app.id,
                expected_stamp,
            ],
        )
        .map_err(|e| map_unique(e, || format!("application '{}'", app.name)))?;
    check_cas(conn, "applications", "application", &app.id, rows)
}

/// Re-checks deployability under the write lock so a concurrent delete or
/// suspend cannot slip in between the caller's read and its write.
fn ensure_deployable(conn: &Connection, version_id: &str, check_template: bool) -> Result<()> {
    let statuses: Option<(String, String)> = conn
        .query_row(
            "SELECT v.status, t.status FROM app_versions v
             JOIN app_templates t ON t.id = v.app_template_id
             WHERE v.id = ?1",
            params![version_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((version_status, template_status)) = statuses else {
        return Err(Error::not_found(format!("app version {version_id}")));
    };
    if version_status != VersionStatus::Active.as_str() {
        return Err(Error::NotDeployable(format!(
            "app version {version_id} is {version_status}"
        )));
    }
    if check_template && template_status != TemplateStatus::Active.as_str() {
        return Err(Error::NotDeployable(format!(
            "app template of version {version_id} is {template_status}"
        )));
    }
    Ok(())
}

fn append_binding(conn: &Connection, application_id: &str, version_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO application_bindings (application_id, seq, app_version_id, bound_at)
         VALUES (?1,
                 (SELECT IFNULL(MAX(seq), 0) + 1 FROM application_bindings WHERE application_id = ?1),
                 ?2, ?3)",
        params![application_id, version_id, format_datetime(&timestamp_now())],
    )?;
    Ok(())
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // Repository operations

    fn create_repository(&self, repo: &Repository) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO repositories (id, name, description, url, credential_ref, scope,
                     workspace, sync_period_secs, status, last_indexed_at, created_at,
                     updated_at, stamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    repo.id,
                    repo.name,
                    repo.description,
                    repo.url,
                    repo.credential_ref,
                    repo.scope.as_str(),
                    repo.workspace,
                    repo.sync_period_secs,
                    repo.status.as_str(),
                    repo.last_indexed_at.as_ref().map(format_datetime),
                    format_datetime(&repo.created_at),
                    format_datetime(&repo.updated_at),
                    repo.stamp,
                ],
            )
            .map_err(|e| map_unique(e, || format!("repository '{}'", repo.name)))?;
        Ok(())
    }

    fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        fetch_repository(&self.conn(), id)
    }

    fn list_repositories(&self, query: &ListQuery) -> Result<Page<Repository>> {
        let mut filter = Filter::new();
        filter.apply(query, &REPO_FIELDS)?;
        let order = order_sql(query, &REPO_FIELDS)?;
        query_page(
            &self.conn(),
            REPO_COLS,
            "repositories",
            &filter,
            &order,
            query,
            row_to_repository,
        )
    }

    fn update_repository(&self, repo: &Repository, expected_stamp: i64) -> Result<Repository> {
        let conn = self.conn();
        let rows = conn
            .execute(
                "UPDATE repositories SET name = ?1, description = ?2, url = ?3,
                     credential_ref = ?4, sync_period_secs = ?5, updated_at = ?6,
                     stamp = stamp + 1
                 WHERE id = ?7 AND stamp = ?8 AND status != 'deleted'",
                params![
                    repo.name,
                    repo.description,
                    repo.url,
                    repo.credential_ref,
                    repo.sync_period_secs,
                    format_datetime(&timestamp_now()),
                    repo.id,
                    expected_stamp,
                ],
            )
            .map_err(|e| map_unique(e, || format!("repository '{}'", repo.name)))?;
        check_cas(&conn, "repositories", "repository", &repo.id, rows)?;
        fetch_repository(&conn, &repo.id)?.ok_or_else(|| Error::not_found(&repo.id))
    }

    fn delete_repository(&self, id: &str, expected_stamp: i64, actor: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let live: i64 = tx.query_row(
            "SELECT COUNT(*) FROM applications
             WHERE status != 'deleted'
               AND app_template_id IN (SELECT id FROM app_templates WHERE repository_id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if live > 0 {
            return Err(Error::Conflict(format!(
                "repository {id} still backs {live} application(s)"
            )));
        }

        let rows = tx.execute(
            "UPDATE repositories SET status = 'deleted', updated_at = ?1, stamp = stamp + 1
             WHERE id = ?2 AND stamp = ?3 AND status != 'deleted'",
            params![format_datetime(&timestamp_now()), id, expected_stamp],
        )?;
        check_cas(&tx, "repositories", "repository", id, rows)?;

        let template_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM app_templates WHERE repository_id = ?1 AND status != 'deleted'",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        for template_id in &template_ids {
            delete_versions_in(&tx, template_id, actor, "repository deleted")?;
        }

        tx.execute(
            "UPDATE app_templates SET status = 'deleted', updated_at = ?1, stamp = stamp + 1
             WHERE repository_id = ?2 AND status != 'deleted'",
            params![format_datetime(&timestamp_now()), id],
        )?;
        tx.execute(
            "DELETE FROM index_leases WHERE repository_id = ?1",
            params![id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn count_repository_applications(&self, id: &str) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM applications
                 WHERE status != 'deleted'
                   AND app_template_id IN (SELECT id FROM app_templates WHERE repository_id = ?1)",
                params![id],
                |row| row.get(0),
            )
            .map_err(Error::from)
    }

    fn record_index_outcome(
        &self,
        id: &str,
        status: RepoStatus,
        indexed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE repositories SET status = ?1,
                 last_indexed_at = COALESCE(?2, last_indexed_at)
             WHERE id = ?3 AND status != 'deleted'",
            params![status.as_str(), indexed_at.as_ref().map(format_datetime), id],
        )?;
        Ok(())
    }

    fn list_repositories_due_for_sync(&self, now: DateTime<Utc>) -> Result<Vec<Repository>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPO_COLS} FROM repositories
             WHERE status != 'deleted' AND sync_period_secs IS NOT NULL AND sync_period_secs > 0
             ORDER BY id"
        ))?;
        let repos = stmt
            .query_map([], row_to_repository)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos
            .into_iter()
            .filter(|repo| match (repo.last_indexed_at, repo.sync_period_secs) {
                (None, _) => true,
                (Some(last), Some(period)) => last + Duration::seconds(period) <= now,
                (Some(_), None) => false,
            })
            .collect())
    }

    // Template operations

    fn create_template(
        &self,
        template: &AppTemplate,
        first_version: Option<&AppVersion>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        insert_template(&tx, template)?;
        if let Some(version) = first_version {
            insert_version(&tx, version)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_template(&self, id: &str) -> Result<Option<AppTemplate>> {
        fetch_template(&self.conn(), id)
    }

    fn list_templates(&self, query: &ListQuery) -> Result<Page<AppTemplate>> {
        let mut filter = Filter::new();
        filter.apply(query, &TEMPLATE_FIELDS)?;
        let order = order_sql(query, &TEMPLATE_FIELDS)?;
        query_page(
            &self.conn(),
            TEMPLATE_COLS,
            "app_templates",
            &filter,
            &order,
            query,
            row_to_template,
        )
    }

    fn list_repository_templates(&self, repository_id: &str) -> Result<Vec<AppTemplate>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TEMPLATE_COLS} FROM app_templates WHERE repository_id = ?1 ORDER BY name, id"
        ))?;
        let rows = stmt.query_map(params![repository_id], row_to_template)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_template(&self, template: &AppTemplate, expected_stamp: i64) -> Result<AppTemplate> {
        let conn = self.conn();
        let rows = conn
            .execute(
                "UPDATE app_templates SET name = ?1, description = ?2, category_id = ?3,
                     status = ?4, suspended_by = ?5, updated_at = ?6, stamp = stamp + 1
                 WHERE id = ?7 AND stamp = ?8",
                params![
                    template.name,
                    template.description,
                    template.category_id,
                    template.status.as_str(),
                    template.suspended_by,
                    format_datetime(&timestamp_now()),
                    template.id,
                    expected_stamp,
                ],
            )
            .map_err(|e| map_unique(e, || format!("app template '{}'", template.name)))?;
        check_cas(&conn, "app_templates", "app template", &template.id, rows)?;
        fetch_template(&conn, &template.id)?.ok_or_else(|| Error::not_found(&template.id))
    }

    fn delete_template(&self, id: &str, expected_stamp: i64, actor: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let live: i64 = tx.query_row(
            "SELECT COUNT(*) FROM applications
             WHERE app_template_id = ?1 AND status NOT IN ('deleting', 'deleted')",
            params![id],
            |row| row.get(0),
        )?;
        if live > 0 {
            return Err(Error::Conflict(format!(
                "app template {id} is used by {live} application(s)"
            )));
        }

        let rows = tx.execute(
            "UPDATE app_templates SET status = 'deleted', updated_at = ?1, stamp = stamp + 1
             WHERE id = ?2 AND stamp = ?3 AND status != 'deleted'",
            params![format_datetime(&timestamp_now()), id, expected_stamp],
        )?;
        check_cas(&tx, "app_templates", "app template", id, rows)?;

        delete_versions_in(&tx, id, actor, "app template deleted")?;

        tx.commit()?;
        Ok(())
    }

    // Version operations

    fn create_version(&self, version: &AppVersion) -> Result<()> {
        insert_version(&self.conn(), version)
    }

    fn get_version(&self, id: &str) -> Result<Option<AppVersion>> {
        fetch_version(&self.conn(), id)
    }

    fn list_versions(&self, query: &ListQuery) -> Result<Page<AppVersion>> {
        let mut filter = Filter::new();
        filter.apply(query, &VERSION_FIELDS)?;
        let order = order_sql(query, &VERSION_FIELDS)?;
        query_page(
            &self.conn(),
            VERSION_COLS,
            "app_versions",
            &filter,
            &order,
            query,
            row_to_version,
        )
    }

    fn list_template_versions(&self, template_id: &str) -> Result<Vec<AppVersion>> {
        fetch_template_versions(&self.conn(), template_id)
    }

    fn update_version(&self, version: &AppVersion, expected_stamp: i64) -> Result<AppVersion> {
        let conn = self.conn();
        let rows = conn.execute(
            "UPDATE app_versions SET description = ?1, package_ref = ?2, updated_at = ?3,
                 stamp = stamp + 1
             WHERE id = ?4 AND stamp = ?5",
            params![
                version.description,
                version.package_ref.to_string(),
                format_datetime(&timestamp_now()),
                version.id,
                expected_stamp,
            ],
        )?;
        check_cas(&conn, "app_versions", "app version", &version.id, rows)?;
        fetch_version(&conn, &version.id)?.ok_or_else(|| Error::not_found(&version.id))
    }

    fn transition_version(
        &self,
        id: &str,
        expected_stamp: i64,
        transition: &VersionTransition,
    ) -> Result<(AppVersion, AuditRecord)> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let record = transition_in(&tx, id, expected_stamp, transition)?;
        tx.commit()?;

        let version = fetch_version(&conn, id)?.ok_or_else(|| Error::not_found(id))?;
        Ok((version, record))
    }

    fn count_version_applications(&self, version_id: &str) -> Result<i64> {
        count_blocking_applications(&self.conn(), version_id)
    }

    // Batched catalog writes

    fn apply_catalog_changes(
        &self,
        changes: &[CatalogChange],
        event: Option<&NewRepoEvent<'_>>,
    ) -> Result<Option<RepoEvent>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        for change in changes {
            match change {
                CatalogChange::InsertTemplate(template) => insert_template(&tx, template)?,
                CatalogChange::InsertVersion(version) => insert_version(&tx, version)?,
                CatalogChange::UpdateVersionContent {
                    version,
                    expected_stamp,
                } => {
                    let rows = tx.execute(
                        "UPDATE app_versions SET description = ?1, package_ref = ?2,
                             updated_at = ?3, stamp = stamp + 1
                         WHERE id = ?4 AND stamp = ?5",
                        params![
                            version.description,
                            version.package_ref.to_string(),
                            format_datetime(&timestamp_now()),
                            version.id,
                            expected_stamp,
                        ],
                    )?;
                    check_cas(&tx, "app_versions", "app version", &version.id, rows)?;
                }
                CatalogChange::SetTemplateStatus {
                    template_id,
                    expected_stamp,
                    status,
                    actor,
                } => {
                    let suspended_by = (*status == TemplateStatus::Suspended).then_some(actor);
                    let rows = tx.execute(
                        "UPDATE app_templates SET status = ?1, suspended_by = ?2, updated_at = ?3,
                             stamp = stamp + 1
                         WHERE id = ?4 AND stamp = ?5",
                        params![
                            status.as_str(),
                            suspended_by,
                            format_datetime(&timestamp_now()),
                            template_id,
                            expected_stamp,
                        ],
                    )?;
                    check_cas(&tx, "app_templates", "app template", template_id, rows)?;
                }
                CatalogChange::TransitionVersion {
                    version_id,
                    expected_stamp,
                    transition,
                } => {
                    transition_in(&tx, version_id, *expected_stamp, transition)?;
                }
            }
        }

        let recorded = match event {
            Some(event) => Some(append_event_in(&tx, event)?),
            None => None,
        };

        tx.commit()?;
        Ok(recorded)
    }

    // Audit log

    fn list_audits(&self, version_id: &str) -> Result<Vec<AuditRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLS} FROM audit_records WHERE version_id = ?1 ORDER BY seq"
        ))?;
        let rows = stmt.query_map(params![version_id], row_to_audit)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_template_audits(&self, template_id: &str) -> Result<Vec<AuditRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT a.version_id, a.seq, a.from_status, a.to_status, a.action, a.actor,
                    a.message, a.timestamp
             FROM audit_records a JOIN app_versions v ON v.id = a.version_id
             WHERE v.app_template_id = ?1
             ORDER BY a.timestamp, a.version_id, a.seq",
        )?;
        let rows = stmt.query_map(params![template_id], row_to_audit)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_reviews(&self, query: &ListQuery) -> Result<Page<Review>> {
        let mut filter = Filter::new();
        filter.push("a.to_status IN ('submitted', 'passed', 'rejected')", []);
        filter.apply(query, &REVIEW_FIELDS)?;
        let order = order_sql(query, &REVIEW_FIELDS)?;
        query_page(
            &self.conn(),
            "a.version_id, v.app_template_id, t.name, v.version, a.to_status, a.actor, \
             a.message, a.timestamp",
            "audit_records a JOIN app_versions v ON v.id = a.version_id \
             JOIN app_templates t ON t.id = v.app_template_id",
            &filter,
            &order,
            query,
            |row| {
                Ok(Review {
                    version_id: row.get(0)?,
                    app_template_id: row.get(1)?,
                    app_name: row.get(2)?,
                    version: row.get(3)?,
                    status: get_parsed(row, 4)?,
                    actor: row.get(5)?,
                    message: row.get(6)?,
                    timestamp: get_datetime(row, 7)?,
                })
            },
        )
    }

    // Repository event log

    fn append_repo_event(&self, event: &NewRepoEvent<'_>) -> Result<RepoEvent> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let recorded = append_event_in(&tx, event)?;
        tx.commit()?;
        Ok(recorded)
    }

    fn list_repo_events(&self, repository_id: &str, query: &ListQuery) -> Result<Page<RepoEvent>> {
        let mut filter = Filter::new();
        filter.push(
            "repository_id = ?",
            [Value::Text(repository_id.to_string())],
        );
        filter.apply(query, &EVENT_FIELDS)?;
        let order = order_sql(query, &EVENT_FIELDS)?;
        query_page(
            &self.conn(),
            EVENT_COLS,
            "repo_events",
            &filter,
            &order,
            query,
            row_to_event,
        )
    }

    fn last_repo_event(&self, repository_id: &str) -> Result<Option<RepoEvent>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {EVENT_COLS} FROM repo_events WHERE repository_id = ?1
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![repository_id],
                row_to_event,
            )
            .optional()
            .map_err(Error::from)
    }

    // Index leases

    fn acquire_index_lease(&self, lease: &IndexLease) -> Result<LeaseOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!("SELECT {LEASE_COLS} FROM index_leases WHERE repository_id = ?1"),
                params![lease.repository_id],
                row_to_lease,
            )
            .optional()?;

        if let Some(current) = existing {
            if current.job_id != lease.job_id && current.expires_at > Utc::now() {
                return Ok(LeaseOutcome::HeldBy(current));
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO index_leases (repository_id, job_id, holder, acquired_at,
                 expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                lease.repository_id,
                lease.job_id,
                lease.holder,
                format_datetime(&lease.acquired_at),
                format_datetime(&lease.expires_at),
            ],
        )?;
        tx.commit()?;
        Ok(LeaseOutcome::Acquired)
    }

    fn renew_index_lease(
        &self,
        repository_id: &str,
        job_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE index_leases SET expires_at = ?1 WHERE repository_id = ?2 AND job_id = ?3",
            params![format_datetime(&expires_at), repository_id, job_id],
        )?;
        Ok(rows > 0)
    }

    fn release_index_lease(&self, repository_id: &str, job_id: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM index_leases WHERE repository_id = ?1 AND job_id = ?2",
            params![repository_id, job_id],
        )?;
        Ok(rows > 0)
    }

    fn get_index_lease(&self, repository_id: &str) -> Result<Option<IndexLease>> {
        self.conn()
            .query_row(
                &format!("SELECT {LEASE_COLS} FROM index_leases WHERE repository_id = ?1"),
                params![repository_id],
                row_to_lease,
            )
            .optional()
            .map_err(Error::from)
    }

    // Application operations

    fn create_application(&self, app: &Application) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_deployable(&tx, &app.app_version_id, true)?;

        tx.execute(
            "INSERT INTO applications (id, name, description, app_template_id, app_version_id,
                 pending_version_id, workspace, cluster, namespace, status, conclusion_ref, conf,
                 created_at, updated_at, stamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                app.id,
                app.name,
                app.description,
                app.app_template_id,
                app.app_version_id,
                app.pending_version_id,
                app.workspace,
                app.cluster,
                app.namespace,
                app.status.as_str(),
                app.conclusion_ref,
                app.conf,
                format_datetime(&app.created_at),
                format_datetime(&app.updated_at),
                app.stamp,
            ],
        )
        .map_err(|e| map_unique(e, || format!("application '{}'", app.name)))?;
        append_binding(&tx, &app.id, &app.app_version_id)?;

        tx.commit()?;
        Ok(())
    }

    fn get_application(&self, id: &str) -> Result<Option<Application>> {
        fetch_application(&self.conn(), id)
    }

    fn list_applications(&self, query: &ListQuery) -> Result<Page<Application>> {
        let mut filter = Filter::new();
        filter.apply(query, &APP_FIELDS)?;
        let order = order_sql(query, &APP_FIELDS)?;
        query_page(
            &self.conn(),
            APP_COLS,
            "applications",
            &filter,
            &order,
            query,
            row_to_application,
        )
    }

    fn list_applications_in_status(
        &self,
        statuses: &[ApplicationStatus],
    ) -> Result<Vec<Application>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {APP_COLS} FROM applications WHERE status IN ({placeholders}) ORDER BY updated_at, id"
        ))?;
        let rows = stmt.query_map(
            params_from_iter(statuses.iter().map(|s| s.as_str())),
            row_to_application,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_application(&self, app: &Application, expected_stamp: i64) -> Result<Application> {
        let conn = self.conn();
        update_application_in(&conn, app, expected_stamp)?;
        fetch_application(&conn, &app.id)?.ok_or_else(|| Error::not_found(&app.id))
    }

    fn begin_upgrade(&self, app: &Application, expected_stamp: i64) -> Result<Application> {
        let pending = app
            .pending_version_id
            .as_deref()
            .ok_or_else(|| Error::validation(format!("application {} has no pending version", app.id)))?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_deployable(&tx, pending, false)?;
        update_application_in(&tx, app, expected_stamp)?;
        tx.commit()?;
        fetch_application(&conn, &app.id)?.ok_or_else(|| Error::not_found(&app.id))
    }

    fn rebind_application(&self, app: &Application, expected_stamp: i64) -> Result<Application> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        update_application_in(&tx, app, expected_stamp)?;
        append_binding(&tx, &app.id, &app.app_version_id)?;
        tx.commit()?;
        fetch_application(&conn, &app.id)?.ok_or_else(|| Error::not_found(&app.id))
    }

    fn list_application_bindings(&self, id: &str) -> Result<Vec<ApplicationBinding>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT application_id, seq, app_version_id, bound_at FROM application_bindings
             WHERE application_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(ApplicationBinding {
                application_id: row.get(0)?,
                seq: row.get(1)?,
                app_version_id: row.get(2)?,
                bound_at: get_datetime(row, 3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Category operations

    fn create_category(&self, category: &Category) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO categories (id, name, description, created_at, updated_at, stamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    category.id,
                    category.name,
                    category.description,
                    format_datetime(&category.created_at),
                    format_datetime(&category.updated_at),
                    category.stamp,
                ],
            )
            .map_err(|e| map_unique(e, || format!("category '{}'", category.name)))?;
        Ok(())
    }

    fn get_category(&self, id: &str) -> Result<Option<Category>> {
        fetch_category(&self.conn(), id)
    }

    fn list_categories(&self, query: &ListQuery) -> Result<Page<Category>> {
        let mut filter = Filter::new();
        filter.apply(query, &CATEGORY_FIELDS)?;
        let order = order_sql(query, &CATEGORY_FIELDS)?;
        query_page(
            &self.conn(),
            CATEGORY_COLS,
            "categories",
            &filter,
            &order,
            query,
            row_to_category,
        )
    }

    fn update_category(&self, category: &Category, expected_stamp: i64) -> Result<Category> {
        let conn = self.conn();
        let rows = conn
            .execute(
                "UPDATE categories SET name = ?1, description = ?2, updated_at = ?3,
                     stamp = stamp + 1
                 WHERE id = ?4 AND stamp = ?5",
                params![
                    category.name,
                    category.description,
                    format_datetime(&timestamp_now()),
                    category.id,
                    expected_stamp,
                ],
            )
            .map_err(|e| map_unique(e, || format!("category '{}'", category.name)))?;
        check_cas(&conn, "categories", "category", &category.id, rows)?;
        fetch_category(&conn, &category.id)?.ok_or_else(|| Error::not_found(&category.id))
    }

    fn delete_category(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let in_use: i64 = tx.query_row(
            "SELECT COUNT(*) FROM app_templates WHERE category_id = ?1 AND status != 'deleted'",
            params![id],
            |row| row.get(0),
        )?;
        if in_use > 0 {
            return Err(Error::Conflict(format!(
                "category {id} is used by {in_use} app template(s)"
            )));
        }

        tx.execute(
            "UPDATE app_templates SET category_id = NULL WHERE category_id = ?1",
            params![id],
        )?;
        let rows = tx.execute("DELETE FROM categories WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(rows > 0)
    }

    // Attachment metadata

    fn create_attachment(&self, attachment: &Attachment) -> Result<()> {
        self.conn().execute(
            "INSERT INTO attachments (id, name, content_type, size, digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                attachment.id,
                attachment.name,
                attachment.content_type,
                attachment.size,
                attachment.digest,
                format_datetime(&attachment.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_attachment(&self, id: &str) -> Result<Option<Attachment>> {
        self.conn()
            .query_row(
                &format!("SELECT {ATTACHMENT_COLS} FROM attachments WHERE id = ?1"),
                params![id],
                row_to_attachment,
            )
            .optional()
            .map_err(Error::from)
    }

    fn delete_attachment(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute(
            "DELETE FROM attachments WHERE id = ?1 AND NOT EXISTS (
                SELECT 1 FROM app_versions
                WHERE package_ref = 'attachment:' || ?1 AND status != 'deleted')",
            params![id],
        )?;
        if rows > 0 {
            return Ok(true);
        }
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM attachments WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(Error::conflict(format!(
                "attachment {id} is the package of an app version"
            )));
        }
        Ok(false)
    }

    fn count_attachments_with_digest(&self, digest: &str) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM attachments WHERE digest = ?1",
                params![digest],
                |row| row.get(0),
            )
            .map_err(Error::from)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn repository(id: &str, name: &str) -> Repository {
        let now = timestamp_now();
        Repository {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            url: "https://charts.example.com".to_string(),
            credential_ref: None,
            scope: RepoScope::Workspace,
            workspace: Some("ws1".to_string()),
            sync_period_secs: None,
            status: RepoStatus::Active,
            last_indexed_at: None,
            created_at: now,
            updated_at: now,
            stamp: 1,
        }
    }

    fn template(id: &str, repository_id: &str, name: &str) -> AppTemplate {
        let now = timestamp_now();
        AppTemplate {
            id: id.to_string(),
            repository_id: Some(repository_id.to_string()),
            workspace: None,
            name: name.to_string(),
            description: None,
            owner: "alice".to_string(),
            category_id: None,
            status: TemplateStatus::Active,
            suspended_by: None,
            created_at: now,
            updated_at: now,
            stamp: 1,
        }
    }

    fn version(id: &str, template_id: &str, v: &str, status: VersionStatus) -> AppVersion {
        let now = timestamp_now();
        AppVersion {
            id: id.to_string(),
            app_template_id: template_id.to_string(),
            version: v.to_string(),
            description: None,
            package_ref: PackageRef::Remote(format!("https://charts.example.com/{v}.tgz")),
            owner: "alice".to_string(),
            status,
            created_at: now,
            updated_at: now,
            stamp: 1,
        }
    }

    #[test]
    fn test_initialize_creates_tables() {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();

        let conn = store.conn();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "repositories",
            "categories",
            "app_templates",
            "app_versions",
            "audit_records",
            "repo_events",
            "index_leases",
            "applications",
            "application_bindings",
            "attachments",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_repository_name_unique_among_live_rows() {
        let store = store();
        store.create_repository(&repository("r1", "charts")).unwrap();

        let err = store
            .create_repository(&repository("r2", "charts"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        store.delete_repository("r1", 1, "admin").unwrap();
        store.create_repository(&repository("r2", "charts")).unwrap();
    }

    #[test]
    fn test_update_repository_is_compare_and_swap() {
        let store = store();
        store.create_repository(&repository("r1", "charts")).unwrap();

        let mut repo = store.get_repository("r1").unwrap().unwrap();
        repo.description = Some("first".into());
        let updated = store.update_repository(&repo, 1).unwrap();
        assert_eq!(updated.stamp, 2);

        repo.description = Some("stale".into());
        let err = store.update_repository(&repo, 1).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let mut ghost = repo.clone();
        ghost.id = "missing".into();
        assert!(matches!(
            store.update_repository(&ghost, 1).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_transition_appends_audit_atomically() {
        let store = store();
        store.create_repository(&repository("r1", "charts")).unwrap();
        let t = template("t1", "r1", "nginx");
        let v = version("v1", "t1", "1.0.0", VersionStatus::Draft);
        store.create_template(&t, Some(&v)).unwrap();

        let submit = VersionTransition {
            from: VersionStatus::Draft,
            to: VersionStatus::Submitted,
            action: VersionAction::Submit,
            actor: "alice".into(),
            message: None,
        };
        let (updated, record) = store.transition_version("v1", 1, &submit).unwrap();
        assert_eq!(updated.status, VersionStatus::Submitted);
        assert_eq!(updated.stamp, 2);
        assert_eq!(record.seq, 1);

        // Stale stamp: nothing is written, not even the audit row.
        let err = store.transition_version("v1", 1, &submit).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.list_audits("v1").unwrap().len(), 1);
    }

    fn application(id: &str, template_id: &str, version_id: &str) -> Application {
        let now = timestamp_now();
        Application {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            app_template_id: template_id.to_string(),
            app_version_id: version_id.to_string(),
            pending_version_id: None,
            workspace: "ws1".to_string(),
            cluster: "east".to_string(),
            namespace: "shop".to_string(),
            status: ApplicationStatus::Creating,
            conclusion_ref: None,
            conf: None,
            created_at: now,
            updated_at: now,
            stamp: 1,
        }
    }

    #[test]
    fn test_application_writes_recheck_the_version() {
        let store = store();
        store.create_repository(&repository("r1", "charts")).unwrap();
        store
            .create_template(
                &template("t1", "r1", "nginx"),
                Some(&version("v1", "t1", "1.0.0", VersionStatus::Active)),
            )
            .unwrap();
        store
            .create_version(&version("v2", "t1", "2.0.0", VersionStatus::Active))
            .unwrap();
        store.create_application(&application("a1", "t1", "v1")).unwrap();

        // v2 is deleted after a caller has already read it as active.
        let delete = VersionTransition {
            from: VersionStatus::Active,
            to: VersionStatus::Deleted,
            action: VersionAction::Delete,
            actor: "alice".into(),
            message: None,
        };
        store.transition_version("v2", 1, &delete).unwrap();

        let err = store
            .create_application(&application("a2", "t1", "v2"))
            .unwrap_err();
        assert!(matches!(err, Error::NotDeployable(_)), "{err:?}");
        assert!(store.get_application("a2").unwrap().is_none());

        let mut upgrading = store.get_application("a1").unwrap().unwrap();
        upgrading.status = ApplicationStatus::Upgrading;
        upgrading.pending_version_id = Some("v2".into());
        let err = store.begin_upgrade(&upgrading, 1).unwrap_err();
        assert!(matches!(err, Error::NotDeployable(_)), "{err:?}");
        let unchanged = store.get_application("a1").unwrap().unwrap();
        assert_eq!(unchanged.status, ApplicationStatus::Creating);
        assert_eq!(unchanged.stamp, 1);

        // A suspended template blocks new applications.
        let mut t = store.get_template("t1").unwrap().unwrap();
        t.status = TemplateStatus::Suspended;
        store.update_template(&t, t.stamp).unwrap();
        let err = store
            .create_application(&application("a3", "t1", "v1"))
            .unwrap_err();
        assert!(matches!(err, Error::NotDeployable(_)), "{err:?}");
    }

    #[test]
    fn test_repo_events_are_strictly_ordered() {
        let store = store();
        store.create_repository(&repository("r1", "charts")).unwrap();

        let mut last: Option<RepoEvent> = None;
        for _ in 0..20 {
            let event = store
                .append_repo_event(&NewRepoEvent {
                    repository_id: "r1",
                    job_id: "j1",
                    kind: RepoEventKind::IndexProgress,
                    detail: None,
                })
                .unwrap();
            if let Some(prev) = &last {
                assert_eq!(event.seq, prev.seq + 1);
                assert!(event.timestamp > prev.timestamp);
            }
            last = Some(event);
        }

        let page = store
            .list_repo_events("r1", &ListQuery::new().with_limit(5).with_page(2))
            .unwrap();
        assert_eq!(page.total, 20);
        assert_eq!(page.items.first().map(|e| e.seq), Some(6));
    }

    #[test]
    fn test_index_lease_single_holder() {
        let store = store();
        store.create_repository(&repository("r1", "charts")).unwrap();
        let now = Utc::now();
        let lease = |job: &str| IndexLease {
            repository_id: "r1".into(),
            job_id: job.into(),
            holder: "node-a".into(),
            acquired_at: now,
            expires_at: now + Duration::minutes(5),
        };

        assert_eq!(
            store.acquire_index_lease(&lease("j1")).unwrap(),
            LeaseOutcome::Acquired
        );
        assert!(matches!(
            store.acquire_index_lease(&lease("j2")).unwrap(),
            LeaseOutcome::HeldBy(held) if held.job_id == "j1"
        ));
        assert!(store.release_index_lease("r1", "j1").unwrap());
        assert_eq!(
            store.acquire_index_lease(&lease("j2")).unwrap(),
            LeaseOutcome::Acquired
        );
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let store = store();
        store.create_repository(&repository("r1", "charts")).unwrap();
        let past = Utc::now() - Duration::minutes(10);
        let stale = IndexLease {
            repository_id: "r1".into(),
            job_id: "crashed".into(),
            holder: "node-a".into(),
            acquired_at: past,
            expires_at: past + Duration::minutes(1),
        };
        store.acquire_index_lease(&stale).unwrap();

        let fresh = IndexLease {
            job_id: "j2".into(),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(5),
            ..stale
        };
        assert_eq!(
            store.acquire_index_lease(&fresh).unwrap(),
            LeaseOutcome::Acquired
        );
    }

    #[test]
    fn test_batch_rolls_back_on_stale_stamp() {
        let store = store();
        store.create_repository(&repository("r1", "charts")).unwrap();
        store
            .create_template(&template("t1", "r1", "nginx"), None)
            .unwrap();

        let changes = vec![
            CatalogChange::InsertVersion(version("v1", "t1", "1.0.0", VersionStatus::Draft)),
            CatalogChange::SetTemplateStatus {
                template_id: "t1".into(),
                expected_stamp: 99,
                status: TemplateStatus::Suspended,
                actor: "system:indexer".into(),
            },
        ];
        let event = NewRepoEvent {
            repository_id: "r1",
            job_id: "j1",
            kind: RepoEventKind::IndexProgress,
            detail: None,
        };
        let err = store
            .apply_catalog_changes(&changes, Some(&event))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(store.get_version("v1").unwrap().is_none());
        assert!(store.last_repo_event("r1").unwrap().is_none());
    }

    #[test]
    fn test_list_filters_and_orders() {
        let store = store();
        store.create_repository(&repository("r1", "charts")).unwrap();
        for (id, name) in [("t1", "nginx"), ("t2", "redis"), ("t3", "nginx-ingress")] {
            store.create_template(&template(id, "r1", name), None).unwrap();
        }

        let query = ListQuery::new()
            .with_condition(Condition::fuzzy("name", "nginx"))
            .ordered_by("name", true);
        let page = store.list_templates(&query).unwrap();
        assert_eq!(page.total, 2);
        let names: Vec<_> = page.items.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["nginx-ingress", "nginx"]);
    }
}
