//! SQLite swap store

use crate::error::ClientResult;
use crate::storage::{QueryClause, SwapStore};
use crate::swap::{Hash32, SwapId, SwapRecord};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

/// Durable swap store on a local SQLite database
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and bring the
    /// schema up to date
    pub async fn connect(url: &str, max_connections: u32) -> ClientResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> ClientResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                version INTEGER NOT NULL,
                state INTEGER NOT NULL,
                terminal INTEGER NOT NULL,
                escrow_id TEXT NOT NULL,
                doc TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_kind ON swaps (kind)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_escrow ON swaps (escrow_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_terminal ON swaps (terminal)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Swap store migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> ClientResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn row_to_record(row: &SqliteRow) -> ClientResult<SwapRecord> {
    let id_hex: String = row.get("id");
    let escrow_hex: String = row.get("escrow_id");
    let doc_str: String = row.get("doc");

    Ok(SwapRecord {
        id: SwapId(Hash32::from_hex(&id_hex)?),
        kind: row.get("kind"),
        version: row.get::<i64, _>("version") as u32,
        state: row.get::<i64, _>("state") as i32,
        terminal: row.get::<bool, _>("terminal"),
        escrow_id: Hash32::from_hex(&escrow_hex)?,
        doc: serde_json::from_str(&doc_str)?,
    })
}

#[async_trait]
impl SwapStore for SqliteStore {
    async fn save(&self, record: &SwapRecord) -> ClientResult<()> {
        sqlx::query(
            r#"
            INSERT INTO swaps (id, kind, version, state, terminal, escrow_id, doc, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id)
            DO UPDATE SET
                kind = excluded.kind,
                version = excluded.version,
                state = excluded.state,
                terminal = excluded.terminal,
                escrow_id = excluded.escrow_id,
                doc = excluded.doc,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.kind)
        .bind(record.version as i64)
        .bind(record.state as i64)
        .bind(record.terminal)
        .bind(record.escrow_id.to_hex())
        .bind(record.doc.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_all(&self, records: &[SwapRecord]) -> ClientResult<()> {
        for record in records {
            self.save(record).await?;
        }
        Ok(())
    }

    async fn load(&self, id: &SwapId) -> ClientResult<Option<SwapRecord>> {
        let row = sqlx::query(
            "SELECT id, kind, version, state, terminal, escrow_id, doc FROM swaps WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_record(&r)).transpose()
    }

    async fn query(&self, clauses: &[QueryClause]) -> ClientResult<Vec<SwapRecord>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        for clause in clauses {
            match clause {
                QueryClause::IdIn(ids) => {
                    if ids.is_empty() {
                        conditions.push("1 = 0".into());
                        continue;
                    }
                    let marks = vec!["?"; ids.len()].join(", ");
                    conditions.push(format!("id IN ({})", marks));
                    binds.extend(ids.iter().map(|id| id.to_string()));
                }
                QueryClause::EscrowIdIn(ids) => {
                    if ids.is_empty() {
                        conditions.push("1 = 0".into());
                        continue;
                    }
                    let marks = vec!["?"; ids.len()].join(", ");
                    conditions.push(format!("escrow_id IN ({})", marks));
                    binds.extend(ids.iter().map(|id| id.to_hex()));
                }
                QueryClause::Kind(kind) => {
                    conditions.push("kind = ?".into());
                    binds.push(kind.as_str().to_string());
                }
                QueryClause::Active => conditions.push("terminal = 0".into()),
                QueryClause::Terminal => conditions.push("terminal = 1".into()),
            }
        }

        let mut sql =
            String::from("SELECT id, kind, version, state, terminal, escrow_id, doc FROM swaps");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn remove(&self, id: &SwapId) -> ClientResult<()> {
        sqlx::query("DELETE FROM swaps WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_all(&self, ids: &[SwapId]) -> ClientResult<()> {
        for id in ids {
            self.remove(id).await?;
        }
        Ok(())
    }

    async fn count(&self) -> ClientResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM swaps")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}
