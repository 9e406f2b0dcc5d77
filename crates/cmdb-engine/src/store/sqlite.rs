//! SQLite implementation of [`PrimaryStore`].
//!
//! Each mutation runs in one transaction that also writes its outbox row and
//! performs every referential and schema check it depends on. Writers are
//! serialized through `writer`, so a check and the write it guards always
//! see the same committed state.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{FromRow, Sqlite};
use tokio::sync::Mutex;
use uuid::Uuid;

use cmdb_core::config::StoreConfig;
use cmdb_core::types::{CiFilter, CiSortField, RelationshipFilter, RelationshipSortField, SortOrder};
use cmdb_core::{
    CiId, CiTypeDefinition, CiTypeId, CmdbError, ConfigurationItem, Page, PageRequest,
    Relationship, RelationshipId, Result, UserId,
};

use super::{
    check_attributes, invalid_under, schema_changed, schema_conflict, Committed, DeleteOutcome,
    MirrorOp, OutboxEntry, OutboxId, PrimaryStore, User,
};

const CI_TYPE_COLUMNS: &str = "id, name, description, required_attributes, optional_attributes, \
     created_by, created_at, updated_at";
const CI_COLUMNS: &str =
    "id, name, ci_type, attributes, tags, created_by, created_at, updated_by, updated_at";
const RELATIONSHIP_COLUMNS: &str = "id, source_id, target_id, relationship_type, attributes, \
     created_by, created_at, updated_by, updated_at";
const OUTBOX_COLUMNS: &str = "id, op, entity_id, attempts, next_attempt_at, last_error, created_at";

/// Upper bound for stored timestamps; keeps the text encoding fixed-width.
const MAX_TIMESTAMP: &str = "9999-12-31T23:59:59.999999999Z";

// ── Encoding ────────────────────────────────────────────────────

fn ts(t: &DateTime<Utc>) -> String {
    if t.year() > 9999 {
        return MAX_TIMESTAMP.to_string();
    }
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn corrupt(what: &str, value: &str, e: impl std::fmt::Display) -> CmdbError {
    CmdbError::Internal(format!("corrupt {what} '{value}' in primary store: {e}"))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt("timestamp", s, e))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| corrupt("id", s, e))
}

fn count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

/// `%term%` with LIKE wildcards in `term` escaped by `\`.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn search_term(search: Option<&str>) -> Option<String> {
    search.map(str::trim).filter(|s| !s.is_empty()).map(like_pattern)
}

fn direction(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    }
}

/// `AND`-joined conditions with their positional text arguments.
#[derive(Debug, Default)]
struct Conditions {
    clause: String,
    args: Vec<String>,
}

impl Conditions {
    fn push(&mut self, clause: &str, args: impl IntoIterator<Item = String>) {
        self.clause.push_str(" AND ");
        self.clause.push_str(clause);
        self.args.extend(args);
    }

    fn where_sql(&self) -> String {
        format!("WHERE 1=1{}", self.clause)
    }
}

// ── Rows ────────────────────────────────────────────────────────

#[derive(FromRow)]
struct CiTypeRow {
    id: String,
    name: String,
    description: Option<String>,
    required_attributes: String,
    optional_attributes: String,
    created_by: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<CiTypeRow> for CiTypeDefinition {
    type Error = CmdbError;

    fn try_from(row: CiTypeRow) -> Result<Self> {
        Ok(CiTypeDefinition {
            id: CiTypeId(parse_uuid(&row.id)?),
            name: row.name,
            description: row.description,
            required_attributes: serde_json::from_str(&row.required_attributes)?,
            optional_attributes: serde_json::from_str(&row.optional_attributes)?,
            created_by: UserId(parse_uuid(&row.created_by)?),
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[derive(FromRow)]
struct CiRow {
    id: String,
    name: String,
    ci_type: String,
    attributes: String,
    tags: String,
    created_by: String,
    created_at: String,
    updated_by: Option<String>,
    updated_at: String,
}

impl TryFrom<CiRow> for ConfigurationItem {
    type Error = CmdbError;

    fn try_from(row: CiRow) -> Result<Self> {
        Ok(ConfigurationItem {
            id: CiId(parse_uuid(&row.id)?),
            name: row.name,
            ci_type: row.ci_type,
            attributes: serde_json::from_str(&row.attributes)?,
            tags: serde_json::from_str(&row.tags)?,
            created_by: UserId(parse_uuid(&row.created_by)?),
            created_at: parse_ts(&row.created_at)?,
            updated_by: row
                .updated_by
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(UserId),
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[derive(FromRow)]
struct RelationshipRow {
    id: String,
    source_id: String,
    target_id: String,
    relationship_type: String,
    attributes: String,
    created_by: String,
    created_at: String,
    updated_by: Option<String>,
    updated_at: Option<String>,
}

impl TryFrom<RelationshipRow> for Relationship {
    type Error = CmdbError;

    fn try_from(row: RelationshipRow) -> Result<Self> {
        Ok(Relationship {
            id: RelationshipId(parse_uuid(&row.id)?),
            source_id: CiId(parse_uuid(&row.source_id)?),
            target_id: CiId(parse_uuid(&row.target_id)?),
            relationship_type: row.relationship_type,
            attributes: serde_json::from_str(&row.attributes)?,
            created_by: UserId(parse_uuid(&row.created_by)?),
            created_at: parse_ts(&row.created_at)?,
            updated_by: row
                .updated_by
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(UserId),
            updated_at: row.updated_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[derive(FromRow)]
struct OutboxRow {
    id: String,
    op: String,
    entity_id: String,
    attempts: i64,
    next_attempt_at: String,
    last_error: Option<String>,
    created_at: String,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = CmdbError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        let op = MirrorOp::from_kind(&row.op, parse_uuid(&row.entity_id)?)
            .ok_or_else(|| corrupt("outbox op", &row.op, "unknown kind"))?;
        Ok(OutboxEntry {
            id: OutboxId(parse_uuid(&row.id)?),
            op,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            next_attempt_at: parse_ts(&row.next_attempt_at)?,
            last_error: row.last_error,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

// ── Queries shared by reads and transactions ────────────────────

async fn fetch_ci_type(conn: &mut SqliteConnection, id: CiTypeId) -> Result<Option<CiTypeDefinition>> {
    let sql = format!("SELECT {CI_TYPE_COLUMNS} FROM ci_types WHERE id = ?");
    let row: Option<CiTypeRow> = sqlx::query_as::<Sqlite, CiTypeRow>(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(CiTypeDefinition::try_from).transpose()
}

async fn fetch_ci_type_by_name(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Option<CiTypeDefinition>> {
    let sql = format!("SELECT {CI_TYPE_COLUMNS} FROM ci_types WHERE name = ?");
    let row: Option<CiTypeRow> = sqlx::query_as::<Sqlite, CiTypeRow>(&sql)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(CiTypeDefinition::try_from).transpose()
}

async fn fetch_ci(conn: &mut SqliteConnection, id: CiId) -> Result<Option<ConfigurationItem>> {
    let sql = format!("SELECT {CI_COLUMNS} FROM cis WHERE id = ?");
    let row: Option<CiRow> = sqlx::query_as::<Sqlite, CiRow>(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(ConfigurationItem::try_from).transpose()
}

async fn fetch_cis_of_type(conn: &mut SqliteConnection, ci_type: &str) -> Result<Vec<ConfigurationItem>> {
    let sql = format!("SELECT {CI_COLUMNS} FROM cis WHERE ci_type = ? ORDER BY name ASC");
    let rows: Vec<CiRow> = sqlx::query_as::<Sqlite, CiRow>(&sql)
        .bind(ci_type)
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(ConfigurationItem::try_from).collect()
}

async fn fetch_relationship(
    conn: &mut SqliteConnection,
    id: RelationshipId,
) -> Result<Option<Relationship>> {
    let sql = format!("SELECT {RELATIONSHIP_COLUMNS} FROM relationships WHERE id = ?");
    let row: Option<RelationshipRow> = sqlx::query_as::<Sqlite, RelationshipRow>(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Relationship::try_from).transpose()
}

async fn scalar(conn: &mut SqliteConnection, sql: &str, args: &[String]) -> Result<u64> {
    let mut query = sqlx::query_scalar::<Sqlite, i64>(sql);
    for arg in args {
        query = query.bind(arg);
    }
    Ok(count(query.fetch_one(&mut *conn).await?))
}

async fn enqueue(conn: &mut SqliteConnection, op: MirrorOp) -> Result<OutboxId> {
    let entry = OutboxEntry::new(op);
    sqlx::query(
        r#"
        INSERT INTO outbox (id, op, entity_id, attempts, next_attempt_at, last_error, created_at)
        VALUES (?, ?, ?, 0, ?, NULL, ?)
        "#,
    )
    .bind(entry.id.to_string())
    .bind(op.kind())
    .bind(op.entity_id().to_string())
    .bind(ts(&entry.next_attempt_at))
    .bind(ts(&entry.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(entry.id)
}

/// Reject a CI row that breaks a type, schema or naming rule.
async fn check_ci_row(conn: &mut SqliteConnection, ci: &ConfigurationItem) -> Result<()> {
    let schema = fetch_ci_type_by_name(conn, &ci.ci_type)
        .await?
        .ok_or_else(|| CmdbError::not_found("CI type", &ci.ci_type))?;
    check_attributes(&schema, ci)?;

    let duplicates = scalar(
        conn,
        "SELECT COUNT(*) FROM cis WHERE name = ? AND ci_type = ? AND id <> ?",
        &[ci.name.clone(), ci.ci_type.clone(), ci.id.to_string()],
    )
    .await?;
    if duplicates > 0 {
        return Err(CmdbError::Conflict(format!(
            "CI '{}' already exists for type '{}'",
            ci.name, ci.ci_type
        )));
    }
    Ok(())
}

async fn check_relationship_row(conn: &mut SqliteConnection, rel: &Relationship) -> Result<()> {
    if rel.source_id == rel.target_id {
        return Err(CmdbError::InvalidReference(
            "a CI cannot have a relationship with itself".into(),
        ));
    }
    for (role, id) in [("source", rel.source_id), ("target", rel.target_id)] {
        let exists = scalar(conn, "SELECT COUNT(*) FROM cis WHERE id = ?", &[id.to_string()]).await?;
        if exists == 0 {
            return Err(CmdbError::InvalidReference(format!("{role} CI {id} does not exist")));
        }
    }
    let duplicates = scalar(
        conn,
        "SELECT COUNT(*) FROM relationships \
         WHERE source_id = ? AND target_id = ? AND relationship_type = ? AND id <> ?",
        &[
            rel.source_id.to_string(),
            rel.target_id.to_string(),
            rel.relationship_type.clone(),
            rel.id.to_string(),
        ],
    )
    .await?;
    if duplicates > 0 {
        return Err(CmdbError::Conflict(format!(
            "relationship '{}' from {} to {} already exists",
            rel.relationship_type, rel.source_id, rel.target_id
        )));
    }
    Ok(())
}

// ── Store ───────────────────────────────────────────────────────

/// The durable Primary Store.
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Mutex<()>,
}

impl SqliteStore {
    /// Open the database named by `config`, creating it and its tables when absent.
    ///
    /// An in-memory URL gets a single connection that is never recycled,
    /// since every SQLite connection to `:memory:` is a separate database.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let url = config.database_url.as_str();
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };
        let pool = pool_options
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        tracing::info!(url, in_memory, "Primary store ready");
        Ok(store)
    }

    /// A private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&StoreConfig {
            database_url: "sqlite::memory:".to_string(),
            ..StoreConfig::default()
        })
        .await
    }

    /// Wrap an existing pool. Call [`migrate`](Self::migrate) before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Mutex::new(()),
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn count_rows(&self, sql: &str) -> Result<u64> {
        let n = sqlx::query_scalar::<Sqlite, i64>(sql)
            .fetch_one(&self.pool)
            .await?;
        Ok(count(n))
    }

    async fn fetch_page<R, T>(
        &self,
        columns: &str,
        table: &str,
        conditions: &Conditions,
        order_by: &str,
        page: PageRequest,
    ) -> Result<Page<T>>
    where
        R: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
        T: TryFrom<R, Error = CmdbError>,
    {
        let where_sql = conditions.where_sql();

        let count_sql = format!("SELECT COUNT(*) FROM {table} {where_sql}");
        let mut total = sqlx::query_scalar::<Sqlite, i64>(&count_sql);
        for arg in &conditions.args {
            total = total.bind(arg);
        }
        let total = count(total.fetch_one(&self.pool).await?);

        let select_sql =
            format!("SELECT {columns} FROM {table} {where_sql} ORDER BY {order_by} LIMIT ? OFFSET ?");
        let mut select = sqlx::query_as::<Sqlite, R>(&select_sql);
        for arg in &conditions.args {
            select = select.bind(arg);
        }
        let offset = i64::try_from(page.offset()).unwrap_or(i64::MAX);
        let rows = select
            .bind(i64::from(page.limit))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(T::try_from)
            .collect::<Result<Vec<T>>>()?;
        Ok(Page::new(items, total, &page))
    }
}

#[async_trait]
impl PrimaryStore for SqliteStore {
    async fn insert_ci_type(&self, def: CiTypeDefinition) -> Result<CiTypeDefinition> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        if fetch_ci_type_by_name(&mut tx, &def.name).await?.is_some() {
            return Err(CmdbError::Conflict(format!(
                "CI type '{}' already exists",
                def.name
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO ci_types (id, name, description, required_attributes, optional_attributes, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(&def.description)
        .bind(serde_json::to_string(&def.required_attributes)?)
        .bind(serde_json::to_string(&def.optional_attributes)?)
        .bind(def.created_by.to_string())
        .bind(ts(&def.created_at))
        .bind(ts(&def.updated_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(def)
    }

    async fn get_ci_type(&self, id: CiTypeId) -> Result<Option<CiTypeDefinition>> {
        let mut conn = self.pool.acquire().await?;
        fetch_ci_type(&mut conn, id).await
    }

    async fn get_ci_type_by_name(&self, name: &str) -> Result<Option<CiTypeDefinition>> {
        let mut conn = self.pool.acquire().await?;
        fetch_ci_type_by_name(&mut conn, name).await
    }

    async fn list_ci_types(
        &self,
        search: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<CiTypeDefinition>> {
        let mut conditions = Conditions::default();
        if let Some(pattern) = search_term(search) {
            conditions.push(
                r"(name LIKE ? ESCAPE '\' OR description LIKE ? ESCAPE '\')",
                [pattern.clone(), pattern],
            );
        }
        self.fetch_page::<CiTypeRow, CiTypeDefinition>(
            CI_TYPE_COLUMNS,
            "ci_types",
            &conditions,
            "name ASC, id ASC",
            page,
        )
        .await
    }

    async fn update_ci_type(&self, mut def: CiTypeDefinition) -> Result<CiTypeDefinition> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = fetch_ci_type(&mut tx, def.id)
            .await?
            .ok_or_else(|| CmdbError::not_found("CI type", def.id))?;
        def.name = current.name.clone();
        def.created_by = current.created_by;
        def.created_at = current.created_at;

        if schema_changed(&current, &def) {
            let stored = fetch_cis_of_type(&mut tx, &def.name).await?;
            let broken = invalid_under(&def, &stored);
            if !broken.is_empty() {
                return Err(schema_conflict(&broken));
            }
        }

        sqlx::query(
            r#"
            UPDATE ci_types
            SET description = ?, required_attributes = ?, optional_attributes = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&def.description)
        .bind(serde_json::to_string(&def.required_attributes)?)
        .bind(serde_json::to_string(&def.optional_attributes)?)
        .bind(ts(&def.updated_at))
        .bind(def.id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(def)
    }

    async fn delete_ci_type_if_unused(
        &self,
        id: CiTypeId,
    ) -> Result<DeleteOutcome<CiTypeDefinition>> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let Some(def) = fetch_ci_type(&mut tx, id).await? else {
            return Ok(DeleteOutcome::Missing);
        };
        let usage = scalar(
            &mut tx,
            "SELECT COUNT(*) FROM cis WHERE ci_type = ?",
            &[def.name.clone()],
        )
        .await?;
        if usage > 0 {
            return Ok(DeleteOutcome::Referenced(usage));
        }

        sqlx::query("DELETE FROM ci_types WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(DeleteOutcome::Deleted(def))
    }

    async fn count_ci_types(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM ci_types").await
    }

    async fn insert_ci(&self, ci: ConfigurationItem) -> Result<Committed<ConfigurationItem>> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        check_ci_row(&mut tx, &ci).await?;
        if fetch_ci(&mut tx, ci.id).await?.is_some() {
            return Err(CmdbError::Conflict(format!("CI {} already exists", ci.id)));
        }
        sqlx::query(
            r#"
            INSERT INTO cis (id, name, ci_type, attributes, tags, created_by, created_at, updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ci.id.to_string())
        .bind(&ci.name)
        .bind(&ci.ci_type)
        .bind(serde_json::to_string(&ci.attributes)?)
        .bind(serde_json::to_string(&ci.tags)?)
        .bind(ci.created_by.to_string())
        .bind(ts(&ci.created_at))
        .bind(ci.updated_by.map(|u| u.to_string()))
        .bind(ts(&ci.updated_at))
        .execute(&mut *tx)
        .await?;

        let op = MirrorOp::UpsertCi(ci.id);
        let outbox_id = enqueue(&mut tx, op).await?;
        tx.commit().await?;
        Ok(Committed {
            value: ci,
            outbox_id,
            op,
        })
    }

    async fn get_ci(&self, id: CiId) -> Result<Option<ConfigurationItem>> {
        let mut conn = self.pool.acquire().await?;
        fetch_ci(&mut conn, id).await
    }

    async fn list_cis(&self, filter: &CiFilter, page: PageRequest) -> Result<Page<ConfigurationItem>> {
        let mut conditions = Conditions::default();
        if let Some(ci_type) = &filter.ci_type {
            conditions.push("ci_type = ?", [ci_type.clone()]);
        }
        if let Some(who) = &filter.created_by {
            conditions.push("created_by = ?", [who.to_string()]);
        }
        if !filter.tags.is_empty() {
            conditions.push(
                "EXISTS (SELECT 1 FROM json_each(cis.tags) AS t \
                 WHERE t.value IN (SELECT value FROM json_each(?)))",
                [serde_json::to_string(&filter.tags)?],
            );
        }
        if let Some(pattern) = search_term(filter.search.as_deref()) {
            conditions.push(
                r"(name LIKE ? ESCAPE '\' OR attributes LIKE ? ESCAPE '\')",
                [pattern.clone(), pattern],
            );
        }

        let column = match filter.sort {
            CiSortField::Name => "name",
            CiSortField::CiType => "ci_type",
            CiSortField::CreatedAt => "created_at",
            CiSortField::UpdatedAt => "updated_at",
        };
        let dir = direction(filter.order);
        let order_by = format!("{column} {dir}, id {dir}");

        self.fetch_page::<CiRow, ConfigurationItem>(CI_COLUMNS, "cis", &conditions, &order_by, page)
            .await
    }

    async fn cis_of_type(&self, ci_type: &str) -> Result<Vec<ConfigurationItem>> {
        let mut conn = self.pool.acquire().await?;
        fetch_cis_of_type(&mut conn, ci_type).await
    }

    async fn update_ci(&self, ci: ConfigurationItem) -> Result<Committed<ConfigurationItem>> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        if fetch_ci(&mut tx, ci.id).await?.is_none() {
            return Err(CmdbError::not_found("CI", ci.id));
        }
        check_ci_row(&mut tx, &ci).await?;
        sqlx::query(
            r#"
            UPDATE cis
            SET name = ?, ci_type = ?, attributes = ?, tags = ?, created_by = ?, created_at = ?,
                updated_by = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&ci.name)
        .bind(&ci.ci_type)
        .bind(serde_json::to_string(&ci.attributes)?)
        .bind(serde_json::to_string(&ci.tags)?)
        .bind(ci.created_by.to_string())
        .bind(ts(&ci.created_at))
        .bind(ci.updated_by.map(|u| u.to_string()))
        .bind(ts(&ci.updated_at))
        .bind(ci.id.to_string())
        .execute(&mut *tx)
        .await?;

        let op = MirrorOp::UpsertCi(ci.id);
        let outbox_id = enqueue(&mut tx, op).await?;
        tx.commit().await?;
        Ok(Committed {
            value: ci,
            outbox_id,
            op,
        })
    }

    async fn delete_ci_if_unreferenced(
        &self,
        id: CiId,
    ) -> Result<DeleteOutcome<Committed<ConfigurationItem>>> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let Some(ci) = fetch_ci(&mut tx, id).await? else {
            return Ok(DeleteOutcome::Missing);
        };
        let refs = scalar(
            &mut tx,
            "SELECT COUNT(*) FROM relationships WHERE source_id = ? OR target_id = ?",
            &[id.to_string(), id.to_string()],
        )
        .await?;
        if refs > 0 {
            return Ok(DeleteOutcome::Referenced(refs));
        }

        sqlx::query("DELETE FROM cis WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let op = MirrorOp::DeleteCi(id);
        let outbox_id = enqueue(&mut tx, op).await?;
        tx.commit().await?;
        Ok(DeleteOutcome::Deleted(Committed {
            value: ci,
            outbox_id,
            op,
        }))
    }

    async fn count_cis(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM cis").await
    }

    async fn all_cis(&self) -> Result<Vec<ConfigurationItem>> {
        let sql = format!("SELECT {CI_COLUMNS} FROM cis ORDER BY id ASC");
        let rows: Vec<CiRow> = sqlx::query_as::<Sqlite, CiRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ConfigurationItem::try_from).collect()
    }

    async fn insert_relationship(&self, rel: Relationship) -> Result<Committed<Relationship>> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        check_relationship_row(&mut tx, &rel).await?;
        sqlx::query(
            r#"
            INSERT INTO relationships (id, source_id, target_id, relationship_type, attributes, created_by, created_at, updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(rel.id.to_string())
        .bind(rel.source_id.to_string())
        .bind(rel.target_id.to_string())
        .bind(&rel.relationship_type)
        .bind(serde_json::to_string(&rel.attributes)?)
        .bind(rel.created_by.to_string())
        .bind(ts(&rel.created_at))
        .bind(rel.updated_by.map(|u| u.to_string()))
        .bind(rel.updated_at.as_ref().map(ts))
        .execute(&mut *tx)
        .await?;

        let op = MirrorOp::UpsertRelationship(rel.id);
        let outbox_id = enqueue(&mut tx, op).await?;
        tx.commit().await?;
        Ok(Committed {
            value: rel,
            outbox_id,
            op,
        })
    }

    async fn get_relationship(&self, id: RelationshipId) -> Result<Option<Relationship>> {
        let mut conn = self.pool.acquire().await?;
        fetch_relationship(&mut conn, id).await
    }

    async fn list_relationships(
        &self,
        filter: &RelationshipFilter,
        page: PageRequest,
    ) -> Result<Page<Relationship>> {
        let mut conditions = Conditions::default();
        if let Some(id) = filter.source_id {
            conditions.push("source_id = ?", [id.to_string()]);
        }
        if let Some(id) = filter.target_id {
            conditions.push("target_id = ?", [id.to_string()]);
        }
        if let Some(kind) = &filter.relationship_type {
            conditions.push("relationship_type = ?", [kind.clone()]);
        }
        if let Some(pattern) = search_term(filter.search.as_deref()) {
            conditions.push(r"relationship_type LIKE ? ESCAPE '\'", [pattern]);
        }

        let column = match filter.sort {
            RelationshipSortField::CreatedAt => "created_at",
            RelationshipSortField::RelationshipType => "relationship_type",
        };
        let dir = direction(filter.order);
        let order_by = format!("{column} {dir}, id {dir}");

        self.fetch_page::<RelationshipRow, Relationship>(
            RELATIONSHIP_COLUMNS,
            "relationships",
            &conditions,
            &order_by,
            page,
        )
        .await
    }

    async fn update_relationship(&self, mut rel: Relationship) -> Result<Committed<Relationship>> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = fetch_relationship(&mut tx, rel.id)
            .await?
            .ok_or_else(|| CmdbError::not_found("relationship", rel.id))?;
        // Endpoints and type never change after creation.
        rel.source_id = current.source_id;
        rel.target_id = current.target_id;
        rel.relationship_type = current.relationship_type;
        rel.created_by = current.created_by;
        rel.created_at = current.created_at;

        sqlx::query(
            "UPDATE relationships SET attributes = ?, updated_by = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(&rel.attributes)?)
        .bind(rel.updated_by.map(|u| u.to_string()))
        .bind(rel.updated_at.as_ref().map(ts))
        .bind(rel.id.to_string())
        .execute(&mut *tx)
        .await?;

        let op = MirrorOp::UpsertRelationship(rel.id);
        let outbox_id = enqueue(&mut tx, op).await?;
        tx.commit().await?;
        Ok(Committed {
            value: rel,
            outbox_id,
            op,
        })
    }

    async fn delete_relationship(&self, id: RelationshipId) -> Result<Option<Committed<Relationship>>> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let Some(rel) = fetch_relationship(&mut tx, id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM relationships WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let op = MirrorOp::DeleteRelationship(id);
        let outbox_id = enqueue(&mut tx, op).await?;
        tx.commit().await?;
        Ok(Some(Committed {
            value: rel,
            outbox_id,
            op,
        }))
    }

    async fn count_relationships(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM relationships").await
    }

    async fn all_relationships(&self) -> Result<Vec<Relationship>> {
        let sql = format!("SELECT {RELATIONSHIP_COLUMNS} FROM relationships ORDER BY created_at ASC, id ASC");
        let rows: Vec<RelationshipRow> = sqlx::query_as::<Sqlite, RelationshipRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Relationship::try_from).collect()
    }

    async fn insert_user(&self, user: User) -> Result<User> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let taken = scalar(
            &mut tx,
            "SELECT COUNT(*) FROM users WHERE username = ?",
            &[user.username.clone()],
        )
        .await?;
        if taken > 0 {
            return Err(CmdbError::Conflict(format!(
                "user '{}' already exists",
                user.username
            )));
        }
        sqlx::query("INSERT INTO users (id, username, email, created_at) VALUES (?, ?, ?, ?)")
            .bind(user.id.to_string())
            .bind(&user.username)
            .bind(&user.email)
            .bind(ts(&user.created_at))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(user)
    }

    async fn count_users(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM users").await
    }

    async fn pending_outbox(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE next_attempt_at <= ? ORDER BY seq ASC LIMIT ?"
        );
        let rows: Vec<OutboxRow> = sqlx::query_as::<Sqlite, OutboxRow>(&sql)
            .bind(ts(&now))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OutboxEntry::try_from).collect()
    }

    async fn ack_outbox(&self, id: OutboxId) -> Result<()> {
        let _writer = self.writer.lock().await;
        sqlx::query("DELETE FROM outbox WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_outbox(
        &self,
        id: OutboxId,
        error: String,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<OutboxEntry>> {
        let _writer = self.writer.lock().await;
        let sql = format!(
            "UPDATE outbox SET attempts = attempts + 1, last_error = ?, next_attempt_at = ? \
             WHERE id = ? RETURNING {OUTBOX_COLUMNS}"
        );
        let row: Option<OutboxRow> = sqlx::query_as::<Sqlite, OutboxRow>(&sql)
            .bind(&error)
            .bind(ts(&next_attempt_at))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutboxEntry::try_from).transpose()
    }

    async fn outbox_len(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM outbox").await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::memory::tests::{ci, ci_type, relationship};
    use cmdb_core::types::normalize_tags;
    use cmdb_core::validate::SchemaValidator;
    use cmdb_core::{AttrValue, AttributeDefinition, AttributeType};

    async fn seeded() -> (SqliteStore, ConfigurationItem, ConfigurationItem) {
        let store = SqliteStore::in_memory().await.unwrap();
        store.insert_ci_type(ci_type("Server")).await.unwrap();
        let a = store.insert_ci(ci("web-1", "Server")).await.unwrap().value;
        let b = store.insert_ci(ci("db-1", "Server")).await.unwrap().value;
        (store, a, b)
    }

    #[test]
    fn timestamps_encode_fixed_width_and_round_trip() {
        let now = Utc::now();
        let encoded = ts(&now);
        assert_eq!(encoded.len(), MAX_TIMESTAMP.len());
        assert_eq!(parse_ts(&encoded).unwrap(), now);
        assert_eq!(ts(&DateTime::<Utc>::MAX_UTC), MAX_TIMESTAMP);
        assert!(ts(&now) < ts(&(now + chrono::Duration::nanoseconds(1))));
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(like_pattern("web"), "%web%");
        assert_eq!(like_pattern("50%_off"), r"%50\%\_off%");
        assert_eq!(search_term(Some("   ")), None);
    }

    #[tokio::test]
    async fn rows_round_trip_exactly() {
        let (store, a, b) = seeded().await;
        let mut rel = relationship(a.id, b.id, "depends_on");
        rel.attributes.insert("weight".into(), AttrValue::from(3i64));
        let rel = store.insert_relationship(rel).await.unwrap().value;

        assert_eq!(store.get_ci(a.id).await.unwrap(), Some(a.clone()));
        assert_eq!(store.get_relationship(rel.id).await.unwrap(), Some(rel));
        let server = store.get_ci_type_by_name("Server").await.unwrap().unwrap();
        assert_eq!(store.get_ci_type(server.id).await.unwrap(), Some(server));
        assert_eq!(store.all_cis().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn integrity_rules_hold() {
        let (store, a, b) = seeded().await;

        let err = store.insert_ci(ci("x", "Router")).await.unwrap_err();
        assert!(matches!(err, CmdbError::NotFound { entity: "CI type", .. }));
        let err = store.insert_ci(ci("web-1", "Server")).await.unwrap_err();
        assert!(matches!(err, CmdbError::Conflict(_)));
        let err = store.insert_ci_type(ci_type("Server")).await.unwrap_err();
        assert!(matches!(err, CmdbError::Conflict(_)));

        for bad in [
            relationship(a.id, a.id, "depends_on"),
            relationship(a.id, CiId::new(), "depends_on"),
            relationship(CiId::new(), b.id, "depends_on"),
        ] {
            let err = store.insert_relationship(bad).await.unwrap_err();
            assert!(matches!(err, CmdbError::InvalidReference(_)), "{err:?}");
        }

        store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap();
        let err = store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap_err();
        assert!(matches!(err, CmdbError::Conflict(_)));
        store
            .insert_relationship(relationship(a.id, b.id, "connects_to"))
            .await
            .unwrap();
        assert_eq!(store.count_relationships().await.unwrap(), 2);

        store.insert_user(User::new("alice")).await.unwrap();
        let err = store.insert_user(User::new("alice")).await.unwrap_err();
        assert!(matches!(err, CmdbError::Conflict(_)));
        assert_eq!(store.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejected_writes_leave_no_outbox_row() {
        let (store, a, _) = seeded().await;
        assert_eq!(store.outbox_len().await.unwrap(), 2);

        let mut invalid = ci("web-2", "Server");
        invalid.attributes.clear();
        let err = store.insert_ci(invalid).await.unwrap_err();
        assert_eq!(err.validation_errors()[0].field, "hostname");

        let mut stray = a.clone();
        stray.attributes.insert("rack".into(), AttrValue::from("r1"));
        assert!(store.update_ci(stray).await.is_err());

        assert_eq!(store.outbox_len().await.unwrap(), 2);
        assert_eq!(store.count_cis().await.unwrap(), 2);
        assert_eq!(store.get_ci(a.id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn conditional_delete_commits_with_its_outbox_row() {
        let (store, a, b) = seeded().await;
        let rel = store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap()
            .value;

        assert!(matches!(
            store.delete_ci_if_unreferenced(b.id).await.unwrap(),
            DeleteOutcome::Referenced(1)
        ));
        assert_eq!(store.outbox_len().await.unwrap(), 3);

        store.delete_relationship(rel.id).await.unwrap().unwrap();
        let deleted = match store.delete_ci_if_unreferenced(b.id).await.unwrap() {
            DeleteOutcome::Deleted(c) => c,
            other => panic!("expected delete, got {other:?}"),
        };
        assert_eq!(deleted.op, MirrorOp::DeleteCi(b.id));
        let pending = store.pending_outbox(Utc::now(), 10).await.unwrap();
        assert_eq!(pending.last().map(|e| e.id), Some(deleted.outbox_id));
        assert!(matches!(
            store.delete_ci_if_unreferenced(b.id).await.unwrap(),
            DeleteOutcome::Missing
        ));

        let server = store.get_ci_type_by_name("Server").await.unwrap().unwrap();
        assert!(matches!(
            store.delete_ci_type_if_unused(server.id).await.unwrap(),
            DeleteOutcome::Referenced(1)
        ));
    }

    #[tokio::test]
    async fn schema_change_is_checked_against_stored_cis() {
        let (store, _, _) = seeded().await;
        let server = store.get_ci_type_by_name("Server").await.unwrap().unwrap();

        let mut stricter = server.clone();
        stricter
            .required_attributes
            .push(AttributeDefinition::new("rack", AttributeType::String));
        let err = store.update_ci_type(stricter).await.unwrap_err();
        assert!(err.to_string().contains("2 existing CI(s)"), "{err}");

        let mut renamed = server.clone();
        renamed.name = "Host".into();
        renamed.description = Some("racked".into());
        let updated = store.update_ci_type(renamed).await.unwrap();
        assert_eq!(updated.name, "Server");
        assert_eq!(updated.description.as_deref(), Some("racked"));
    }

    #[tokio::test]
    async fn concurrent_schema_change_and_inserts_keep_every_ci_valid() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let server = store.insert_ci_type(ci_type("Server")).await.unwrap();
        let mut stricter = server.clone();
        stricter
            .required_attributes
            .push(AttributeDefinition::new("rack", AttributeType::String));

        let mut tasks = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let _ = store.insert_ci(ci(&format!("web-{i}"), "Server")).await;
            }));
        }
        let schema_store = store.clone();
        tasks.push(tokio::spawn(async move {
            let _ = schema_store.update_ci_type(stricter).await;
        }));
        for task in tasks {
            task.await.unwrap();
        }

        let current = store.get_ci_type(server.id).await.unwrap().unwrap();
        let validator = SchemaValidator::new(&current);
        for stored in store.all_cis().await.unwrap() {
            assert!(validator.is_valid(&stored.attributes), "{} breaks the schema", stored.name);
        }
    }

    #[tokio::test]
    async fn list_cis_filters_sorts_and_pages() {
        let (store, _, _) = seeded().await;
        let mut tagged = ci("cache-1", "Server");
        tagged.tags = normalize_tags(["staging"]);
        store.insert_ci(tagged).await.unwrap();

        let by_name = CiFilter {
            sort: CiSortField::Name,
            order: SortOrder::Asc,
            ..Default::default()
        };
        let page = store.list_cis(&by_name, PageRequest::new(1, 2)).await.unwrap();
        let names: Vec<&str> = page.items.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cache-1", "db-1"]);
        assert_eq!(page.pagination.total, 3);
        assert_eq!(page.pagination.total_pages, 2);

        let beyond = store.list_cis(&by_name, PageRequest::new(5, 2)).await.unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.pagination.total, 3);

        let staging = CiFilter {
            tags: vec!["staging".into(), "missing".into()],
            ..Default::default()
        };
        let found = store.list_cis(&staging, PageRequest::default()).await.unwrap();
        assert_eq!(found.items.len(), 1);
        assert_eq!(found.items[0].name, "cache-1");

        let search = CiFilter {
            search: Some("WEB".into()),
            ..Default::default()
        };
        let found = store.list_cis(&search, PageRequest::default()).await.unwrap();
        assert_eq!(found.items.len(), 1);
        assert_eq!(found.items[0].name, "web-1");

        let literal = CiFilter {
            search: Some("%".into()),
            ..Default::default()
        };
        assert!(store.list_cis(&literal, PageRequest::default()).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn list_types_and_relationships() {
        let (store, a, b) = seeded().await;
        store.insert_ci_type(ci_type("Application")).await.unwrap();
        let all = store.list_ci_types(None, PageRequest::default()).await.unwrap();
        let names: Vec<&str> = all.items.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Application", "Server"]);
        let hits = store
            .list_ci_types(Some("server assets"), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(hits.pagination.total, 1);

        store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap();
        store
            .insert_relationship(relationship(b.id, a.id, "backs_up"))
            .await
            .unwrap();
        let from_a = RelationshipFilter {
            source_id: Some(a.id),
            ..Default::default()
        };
        let page = store.list_relationships(&from_a, PageRequest::default()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].relationship_type, "depends_on");

        let by_type = RelationshipFilter {
            sort: RelationshipSortField::RelationshipType,
            order: SortOrder::Asc,
            ..Default::default()
        };
        let page = store.list_relationships(&by_type, PageRequest::default()).await.unwrap();
        let kinds: Vec<&str> = page.items.iter().map(|r| r.relationship_type.as_str()).collect();
        assert_eq!(kinds, vec!["backs_up", "depends_on"]);
    }

    #[tokio::test]
    async fn outbox_reschedules_and_acks() {
        let (store, a, b) = seeded().await;
        let rel = store
            .insert_relationship(relationship(a.id, b.id, "depends_on"))
            .await
            .unwrap();
        let pending = store.pending_outbox(Utc::now(), 10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[2].op, MirrorOp::UpsertRelationship(rel.value.id));

        let later = Utc::now() + chrono::Duration::seconds(60);
        let failed = store
            .fail_outbox(rel.outbox_id, "graph down".into(), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("graph down"));
        assert_eq!(failed.next_attempt_at, later);
        assert_eq!(store.pending_outbox(Utc::now(), 10).await.unwrap().len(), 2);
        assert_eq!(
            store
                .pending_outbox(DateTime::<Utc>::MAX_UTC, usize::MAX)
                .await
                .unwrap()
                .len(),
            3
        );

        store.ack_outbox(rel.outbox_id).await.unwrap();
        assert_eq!(store.outbox_len().await.unwrap(), 2);
        assert!(store
            .fail_outbox(rel.outbox_id, "late".into(), later)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn database_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            database_url: format!("sqlite://{}", dir.path().join("primary.db").display()),
            ..StoreConfig::default()
        };

        let (a, rel_id) = {
            let store = SqliteStore::connect(&config).await.unwrap();
            store.insert_ci_type(ci_type("Server")).await.unwrap();
            let a = store.insert_ci(ci("web-1", "Server")).await.unwrap().value;
            let b = store.insert_ci(ci("db-1", "Server")).await.unwrap().value;
            let rel = store
                .insert_relationship(relationship(a.id, b.id, "depends_on"))
                .await
                .unwrap()
                .value;
            store.insert_user(User::new("alice")).await.unwrap();
            store.close().await;
            (a, rel.id)
        };

        let store = SqliteStore::connect(&config).await.unwrap();
        assert_eq!(store.get_ci(a.id).await.unwrap(), Some(a));
        assert!(store.get_relationship(rel_id).await.unwrap().is_some());
        assert_eq!(store.count_users().await.unwrap(), 1);
        assert_eq!(store.outbox_len().await.unwrap(), 3);
    }
}
