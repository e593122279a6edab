//! Repository traits - persistence of project and action metadata
//!
//! The invoker only reads through these traits; the management API writes.
//! Two backends are provided:
//! - `InMemoryRepository`: process-local, used for development and tests
//! - `PgRepository`: PostgreSQL via sqlx

mod memory;
mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::{init_pool, migrations, PgRepository};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Action, Method, ModuleConfig, Project};

/// Persistence of projects
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    /// Insert a new project
    async fn create(&self, project: &Project) -> Result<()>;

    /// Find a project by identifier
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Project>>;

    /// All projects of an owner
    async fn get_by_owner_id(&self, owner_id: Uuid) -> Result<Vec<Project>>;

    /// Find the project served under a subdomain label
    async fn get_by_subdomain(&self, subdomain: &str) -> Result<Option<Project>>;

    /// Rename a project; the subdomain is left untouched
    async fn update_name(&self, id: Uuid, name: &str) -> Result<()>;

    /// Delete a project together with its action records
    async fn delete_by_id(&self, id: Uuid) -> Result<()>;
}

/// Persistence of actions
#[async_trait]
pub trait ActionRepository: Send + Sync {
    /// Insert a new action
    async fn create(&self, action: &Action) -> Result<()>;

    /// Find an action by identifier
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Action>>;

    /// Actions of a project ordered by display order, oldest first on ties
    async fn get_by_project_id(&self, project_id: Uuid) -> Result<Vec<Action>>;

    /// Number of actions in a project
    async fn count_by_project_id(&self, project_id: Uuid) -> Result<i64>;

    /// Replace the user-editable fields of an action
    async fn update_info(
        &self,
        id: Uuid,
        name: &str,
        path: &str,
        methods: &[Method],
        config: &ModuleConfig,
    ) -> Result<()>;

    /// Assign display order by position in `ids`
    async fn update_order(&self, ids: &[Uuid]) -> Result<()>;

    /// Point an action at an uploaded module
    async fn update_module_path(&self, id: Uuid, module_path: &str) -> Result<()>;

    /// Delete an action
    async fn delete_by_id(&self, id: Uuid) -> Result<()>;
}
