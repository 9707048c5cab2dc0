//! Import conflict audit log (append-only)

use chrono::{DateTime, Utc};
use provdir_common::db::{ConflictEntity, ImportConflict};
use provdir_common::time::to_db;
use provdir_common::{Result, SourceTier};
use sqlx::sqlite::SqliteExecutor;

/// A rejected merge attempt
#[derive(Debug, Clone)]
pub struct NewConflict<'a> {
    pub entity_kind: ConflictEntity,
    pub entity_id: &'a str,
    pub field: &'a str,
    pub kept_value: Option<&'a str>,
    pub rejected_value: Option<&'a str>,
    pub current_source: SourceTier,
    pub incoming_source: SourceTier,
}

pub async fn insert_conflict<'e, E>(executor: E, conflict: &NewConflict<'_>, now: DateTime<Utc>) -> Result<i64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO import_conflicts (
            entity_kind, entity_id, field, kept_value, rejected_value,
            current_source, incoming_source, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(conflict.entity_kind.as_str())
    .bind(conflict.entity_id)
    .bind(conflict.field)
    .bind(conflict.kept_value)
    .bind(conflict.rejected_value)
    .bind(conflict.current_source.as_str())
    .bind(conflict.incoming_source.as_str())
    .bind(to_db(now))
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Conflicts recorded against one entity, oldest first
pub async fn conflicts_for<'e, E>(
    executor: E,
    entity_kind: ConflictEntity,
    entity_id: &str,
) -> Result<Vec<ImportConflict>>
where
    E: SqliteExecutor<'e>,
{
    let rows = sqlx::query(
        r#"
        SELECT id, entity_kind, entity_id, field, kept_value, rejected_value,
               current_source, incoming_source, created_at
        FROM import_conflicts
        WHERE entity_kind = ? AND entity_id = ?
        ORDER BY id
        "#,
    )
    .bind(entity_kind.as_str())
    .bind(entity_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(ImportConflict::from_row).collect()
}
