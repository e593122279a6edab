//! PostgreSQL repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{ActionRepository, ProjectRepository};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::model::{Action, Method, ModuleConfig, Project};

/// Initialize the PostgreSQL connection pool
pub async fn init_pool(config: &DatabaseConfig) -> Result<PgPool> {
    info!("Initializing PostgreSQL connection pool");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(config.url.expose_secret())
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    info!("PostgreSQL connection pool initialized successfully");
    Ok(pool)
}

/// Database migrations
pub mod migrations {
    use super::*;

    /// Run all migrations
    pub async fn run(pool: &PgPool) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id UUID PRIMARY KEY,
                owner_id UUID NOT NULL,
                name TEXT NOT NULL,
                subdomain TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner_id)")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS actions (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                methods TEXT[] NOT NULL,
                sort_order INTEGER NOT NULL DEFAULT 0,
                module_path TEXT NOT NULL DEFAULT '',
                config JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_actions_project ON actions(project_id, sort_order)",
        )
        .execute(pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[derive(FromRow)]
struct ActionRow {
    id: Uuid,
    project_id: Uuid,
    name: String,
    path: String,
    methods: Vec<String>,
    sort_order: i32,
    module_path: String,
    config: Json<ModuleConfig>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ActionRow> for Action {
    type Error = Error;

    fn try_from(row: ActionRow) -> Result<Self> {
        let methods = row
            .methods
            .iter()
            .map(|m| m.parse::<Method>())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::Internal(format!("action {} has invalid methods: {}", row.id, e)))?;

        Ok(Action {
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            path: row.path,
            methods,
            order: row.sort_order,
            module_path: row.module_path,
            config: row.config.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn method_names(methods: &[Method]) -> Vec<String> {
    methods.iter().map(|m| m.as_str().to_string()).collect()
}

/// Project and action store backed by PostgreSQL
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectRepository for PgRepository {
    async fn create(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, owner_id, name, subdomain, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        "#,
        )
        .bind(project.id)
        .bind(project.owner_id)
        .bind(&project.name)
        .bind(&project.subdomain)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => Error::InvalidInput(format!(
                "subdomain already taken: {}",
                project.subdomain
            )),
            _ => Error::Database(e),
        })?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Project>> {
        let project: Option<Project> = sqlx::query_as("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    async fn get_by_owner_id(&self, owner_id: Uuid) -> Result<Vec<Project>> {
        let projects: Vec<Project> = sqlx::query_as(
            "SELECT * FROM projects WHERE owner_id = $1 ORDER BY created_at ASC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(projects)
    }

    async fn get_by_subdomain(&self, subdomain: &str) -> Result<Option<Project>> {
        let project: Option<Project> =
            sqlx::query_as("SELECT * FROM projects WHERE subdomain = $1")
                .bind(subdomain)
                .fetch_optional(&self.pool)
                .await?;
        Ok(project)
    }

    async fn update_name(&self, id: Uuid, name: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET name = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<()> {
        // Action rows go with the project via ON DELETE CASCADE
        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ActionRepository for PgRepository {
    async fn create(&self, action: &Action) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actions
                (id, project_id, name, path, methods, sort_order, module_path, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
        )
        .bind(action.id)
        .bind(action.project_id)
        .bind(&action.name)
        .bind(&action.path)
        .bind(method_names(&action.methods))
        .bind(action.order)
        .bind(&action.module_path)
        .bind(Json(&action.config))
        .bind(action.created_at)
        .bind(action.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Action>> {
        let row: Option<ActionRow> = sqlx::query_as("SELECT * FROM actions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Action::try_from).transpose()
    }

    async fn get_by_project_id(&self, project_id: Uuid) -> Result<Vec<Action>> {
        let rows: Vec<ActionRow> = sqlx::query_as(
            "SELECT * FROM actions WHERE project_id = $1 ORDER BY sort_order ASC, created_at ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Action::try_from).collect()
    }

    async fn count_by_project_id(&self, project_id: Uuid) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM actions WHERE project_id = $1")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    async fn update_info(
        &self,
        id: Uuid,
        name: &str,
        path: &str,
        methods: &[Method],
        config: &ModuleConfig,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE actions
            SET name = $2, path = $3, methods = $4, config = $5, updated_at = NOW()
            WHERE id = $1
        "#,
        )
        .bind(id)
        .bind(name)
        .bind(path)
        .bind(method_names(methods))
        .bind(Json(config))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_order(&self, ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (i, id) in ids.iter().enumerate() {
            sqlx::query("UPDATE actions SET sort_order = $2 WHERE id = $1")
                .bind(id)
                .bind(i as i32)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_module_path(&self, id: Uuid, module_path: &str) -> Result<()> {
        sqlx::query("UPDATE actions SET module_path = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(module_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM actions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_conversion_rejects_unknown_method() {
        let row = ActionRow {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "a".to_string(),
            path: "/a".to_string(),
            methods: vec!["GET".to_string(), "TRACE".to_string()],
            sort_order: 0,
            module_path: String::new(),
            config: Json(ModuleConfig::default()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(Action::try_from(row).is_err());
    }

    #[test]
    fn test_method_names() {
        assert_eq!(
            method_names(&[Method::Get, Method::Delete]),
            vec!["GET".to_string(), "DELETE".to_string()]
        );
    }
}
