// SPDX-License-Identifier: MIT OR Apache-2.0
//! insights-mirror
#![deny(unsafe_code)]
//!
//! Optional local mirror of the findings written upstream, plus a thin REST
//! read-back surface. The mirror is best-effort by contract: a failed mirror
//! write is logged by the caller and never fails a batch.

/// The axum read-back surface.
pub mod api;

use async_trait::async_trait;
use insights_core::sink::{MirrorError, MirrorWriter};
use insights_core::{Fact, FactType, Problem, ProblemSeverity};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

/// Errors from the mirror store.
#[derive(Debug, thiserror::Error)]
pub enum MirrorStoreError {
    /// Any SQLite-level failure.
    #[error("mirror database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// SQLite-backed mirror store.
#[derive(Debug, Clone)]
pub struct MirrorStore {
    pool: SqlitePool,
}

impl MirrorStore {
    /// Open (creating if missing) the database at `path` and run schema
    /// bootstrap.
    ///
    /// # Errors
    ///
    /// [`MirrorStoreError`] on connection or migration failure.
    pub async fn connect(path: &str) -> Result<Self, MirrorStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // In-memory databases are per-connection; keep the pool at one so
        // every query sees the same database.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path, "mirror store ready");
        Ok(store)
    }

    /// An in-memory store for tests.
    ///
    /// # Errors
    ///
    /// [`MirrorStoreError`] on connection failure.
    pub async fn in_memory() -> Result<Self, MirrorStoreError> {
        Self::connect(":memory:").await
    }

    async fn migrate(&self) -> Result<(), MirrorStoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS facts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                environment INTEGER NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                source TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                key_fact INTEGER NOT NULL DEFAULT 0,
                fact_type TEXT NOT NULL DEFAULT 'TEXT',
                service TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS problems (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                environment INTEGER NOT NULL,
                identifier TEXT NOT NULL,
                version TEXT NOT NULL DEFAULT '',
                fixed_version TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL,
                service TEXT NOT NULL DEFAULT '',
                data TEXT NOT NULL DEFAULT '{}',
                severity TEXT NOT NULL DEFAULT 'UNKNOWN',
                severity_score REAL NOT NULL DEFAULT 0,
                associated_package TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                links TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert facts for an environment (the REST create path).
    ///
    /// # Errors
    ///
    /// [`MirrorStoreError`] on write failure.
    pub async fn insert_facts(&self, facts: &[Fact]) -> Result<(), MirrorStoreError> {
        let mut tx = self.pool.begin().await?;
        for fact in facts {
            insert_fact(&mut tx, fact).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete-then-insert facts for `(environment, source)`.
    ///
    /// # Errors
    ///
    /// [`MirrorStoreError`] on write failure.
    pub async fn replace_facts(
        &self,
        environment: i64,
        source: &str,
        facts: &[Fact],
    ) -> Result<(), MirrorStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM facts WHERE environment = ? AND source = ?")
            .bind(environment)
            .bind(source)
            .execute(&mut *tx)
            .await?;
        for fact in facts {
            insert_fact(&mut tx, fact).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete facts for `(environment, source)`, or every source when
    /// `source` is `None`. Returns rows removed.
    ///
    /// # Errors
    ///
    /// [`MirrorStoreError`] on write failure.
    pub async fn delete_facts(
        &self,
        environment: i64,
        source: Option<&str>,
    ) -> Result<u64, MirrorStoreError> {
        let result = match source {
            Some(source) => {
                sqlx::query("DELETE FROM facts WHERE environment = ? AND source = ?")
                    .bind(environment)
                    .bind(source)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM facts WHERE environment = ?")
                    .bind(environment)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// All facts recorded for an environment.
    ///
    /// # Errors
    ///
    /// [`MirrorStoreError`] on read failure.
    pub async fn facts_by_environment(
        &self,
        environment: i64,
    ) -> Result<Vec<Fact>, MirrorStoreError> {
        let rows = sqlx::query(
            "SELECT environment, name, value, source, description, category,
                    key_fact, fact_type, service
             FROM facts WHERE environment = ? ORDER BY id",
        )
        .bind(environment)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Fact {
                environment: row.get("environment"),
                name: row.get("name"),
                value: row.get("value"),
                source: row.get("source"),
                description: row.get("description"),
                category: row.get("category"),
                key_fact: row.get("key_fact"),
                fact_type: FactType::normalize(row.get("fact_type")),
                service: row.get("service"),
            })
            .collect())
    }

    /// Delete-then-insert problems for `(environment, service, source)`.
    ///
    /// # Errors
    ///
    /// [`MirrorStoreError`] on write failure.
    pub async fn replace_problems(
        &self,
        environment: i64,
        service: &str,
        source: &str,
        problems: &[Problem],
    ) -> Result<(), MirrorStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM problems WHERE environment = ? AND service = ? AND source = ?")
            .bind(environment)
            .bind(service)
            .bind(source)
            .execute(&mut *tx)
            .await?;
        for problem in problems {
            sqlx::query(
                "INSERT INTO problems (environment, identifier, version, fixed_version,
                        source, service, data, severity, severity_score,
                        associated_package, description, links)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(problem.environment)
            .bind(&problem.identifier)
            .bind(&problem.version)
            .bind(&problem.fixed_version)
            .bind(&problem.source)
            .bind(&problem.service)
            .bind(&problem.data)
            .bind(serde_json::to_string(&problem.severity).unwrap_or_default())
            .bind(problem.severity_score)
            .bind(&problem.associated_package)
            .bind(&problem.description)
            .bind(&problem.links)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete problems for `(environment, service, source)`.
    ///
    /// # Errors
    ///
    /// [`MirrorStoreError`] on write failure.
    pub async fn delete_problems(
        &self,
        environment: i64,
        service: &str,
        source: &str,
    ) -> Result<u64, MirrorStoreError> {
        let result = sqlx::query(
            "DELETE FROM problems WHERE environment = ? AND service = ? AND source = ?",
        )
        .bind(environment)
        .bind(service)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// All problems recorded for an environment.
    ///
    /// # Errors
    ///
    /// [`MirrorStoreError`] on read failure.
    pub async fn problems_by_environment(
        &self,
        environment: i64,
    ) -> Result<Vec<Problem>, MirrorStoreError> {
        let rows = sqlx::query(
            "SELECT environment, identifier, version, fixed_version, source, service,
                    data, severity, severity_score, associated_package, description, links
             FROM problems WHERE environment = ? ORDER BY id",
        )
        .bind(environment)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Problem {
                environment: row.get("environment"),
                identifier: row.get("identifier"),
                version: row.get("version"),
                fixed_version: row.get("fixed_version"),
                source: row.get("source"),
                service: row.get("service"),
                data: row.get("data"),
                severity: ProblemSeverity::from_label(row.get("severity")),
                severity_score: row.get("severity_score"),
                associated_package: row.get("associated_package"),
                description: row.get("description"),
                links: row.get("links"),
            })
            .collect())
    }
}

async fn insert_fact(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    fact: &Fact,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO facts (environment, name, value, source, description, category,
                key_fact, fact_type, service)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(fact.environment)
    .bind(&fact.name)
    .bind(&fact.value)
    .bind(&fact.source)
    .bind(&fact.description)
    .bind(&fact.category)
    .bind(fact.key_fact)
    .bind(match fact.fact_type {
        FactType::Text => "TEXT",
        FactType::Url => "URL",
        FactType::Semver => "SEMVER",
    })
    .bind(&fact.service)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl MirrorWriter for MirrorStore {
    async fn mirror_facts(
        &self,
        environment: i64,
        source: &str,
        facts: &[Fact],
    ) -> Result<(), MirrorError> {
        self.replace_facts(environment, source, facts)
            .await
            .map_err(|e| MirrorError(e.to_string()))
    }

    async fn mirror_problems(
        &self,
        environment: i64,
        service: &str,
        source: &str,
        problems: &[Problem],
    ) -> Result<(), MirrorError> {
        self.replace_problems(environment, service, source, problems)
            .await
            .map_err(|e| MirrorError(e.to_string()))
    }

    async fn mirror_delete_facts(&self, environment: i64, source: &str) -> Result<(), MirrorError> {
        self.delete_facts(environment, Some(source))
            .await
            .map(|_| ())
            .map_err(|e| MirrorError(e.to_string()))
    }

    async fn mirror_delete_problems(
        &self,
        environment: i64,
        service: &str,
        source: &str,
    ) -> Result<(), MirrorError> {
        self.delete_problems(environment, service, source)
            .await
            .map(|_| ())
            .map_err(|e| MirrorError(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(name: &str, source: &str) -> Fact {
        Fact {
            environment: 3,
            name: name.into(),
            value: "v".into(),
            source: source.into(),
            key_fact: true,
            fact_type: FactType::Semver,
            ..Default::default()
        }
    }

    // -- 1. Facts round-trip through the store ----------------------------------

    #[tokio::test]
    async fn facts_roundtrip() {
        let store = MirrorStore::in_memory().await.unwrap();
        store
            .replace_facts(3, "s", &[fact("php", "s"), fact("node", "s")])
            .await
            .unwrap();

        let facts = store.facts_by_environment(3).await.unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].name, "php");
        assert!(facts[0].key_fact);
        assert_eq!(facts[0].fact_type, FactType::Semver);
    }

    // -- 2. Replace deletes the old batch first ----------------------------------

    #[tokio::test]
    async fn replace_deletes_previous_batch() {
        let store = MirrorStore::in_memory().await.unwrap();
        store.replace_facts(3, "s", &[fact("old", "s")]).await.unwrap();
        store.replace_facts(3, "s", &[fact("new", "s")]).await.unwrap();

        let facts = store.facts_by_environment(3).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].name, "new");
    }

    // -- 3. Replace only touches its own (environment, source) --------------------

    #[tokio::test]
    async fn replace_scopes_to_environment_and_source() {
        let store = MirrorStore::in_memory().await.unwrap();
        store.replace_facts(3, "a", &[fact("kept", "a")]).await.unwrap();
        store.replace_facts(3, "b", &[fact("other", "b")]).await.unwrap();
        store.replace_facts(3, "b", &[]).await.unwrap();

        let facts = store.facts_by_environment(3).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].name, "kept");
    }

    // -- 4. Deletion reports affected rows ------------------------------------------

    #[tokio::test]
    async fn delete_reports_rows_affected() {
        let store = MirrorStore::in_memory().await.unwrap();
        store
            .replace_facts(3, "s", &[fact("a", "s"), fact("b", "s")])
            .await
            .unwrap();

        assert_eq!(store.delete_facts(3, Some("s")).await.unwrap(), 2);
        assert_eq!(store.delete_facts(3, Some("s")).await.unwrap(), 0);
    }

    // -- 5. Problems round-trip with severity intact ----------------------------------

    #[tokio::test]
    async fn problems_roundtrip() {
        let store = MirrorStore::in_memory().await.unwrap();
        let problem = Problem {
            environment: 3,
            identifier: "CVE-2024-1".into(),
            severity: ProblemSeverity::Critical,
            severity_score: 0.98,
            service: "cli".into(),
            source: "insights-handler-trivy".into(),
            ..Default::default()
        };
        store
            .replace_problems(3, "cli", "insights-handler-trivy", &[problem])
            .await
            .unwrap();

        let problems = store.problems_by_environment(3).await.unwrap();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].severity, ProblemSeverity::Critical);
        assert_eq!(problems[0].severity_score, 0.98);
    }
}
