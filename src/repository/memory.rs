//! Process-local repository backed by hash maps

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ActionRepository, ProjectRepository};
use crate::error::{Error, Result};
use crate::model::{Action, Method, ModuleConfig, Project};

/// In-memory project and action store
#[derive(Default)]
pub struct InMemoryRepository {
    projects: RwLock<HashMap<Uuid, Project>>,
    actions: RwLock<HashMap<Uuid, Action>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectRepository for InMemoryRepository {
    async fn create(&self, project: &Project) -> Result<()> {
        let mut projects = self.projects.write().await;
        if projects
            .values()
            .any(|p| p.subdomain == project.subdomain)
        {
            return Err(Error::InvalidInput(format!(
                "subdomain already taken: {}",
                project.subdomain
            )));
        }
        projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.projects.read().await.get(&id).cloned())
    }

    async fn get_by_owner_id(&self, owner_id: Uuid) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> = self
            .projects
            .read()
            .await
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect();
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    async fn get_by_subdomain(&self, subdomain: &str) -> Result<Option<Project>> {
        Ok(self
            .projects
            .read()
            .await
            .values()
            .find(|p| p.subdomain == subdomain)
            .cloned())
    }

    async fn update_name(&self, id: Uuid, name: &str) -> Result<()> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("project {}", id)))?;
        project.name = name.to_string();
        project.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<()> {
        self.projects.write().await.remove(&id);
        self.actions
            .write()
            .await
            .retain(|_, action| action.project_id != id);
        Ok(())
    }
}

#[async_trait]
impl ActionRepository for InMemoryRepository {
    async fn create(&self, action: &Action) -> Result<()> {
        self.actions.write().await.insert(action.id, action.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Action>> {
        Ok(self.actions.read().await.get(&id).cloned())
    }

    async fn get_by_project_id(&self, project_id: Uuid) -> Result<Vec<Action>> {
        let mut actions: Vec<Action> = self
            .actions
            .read()
            .await
            .values()
            .filter(|a| a.project_id == project_id)
            .cloned()
            .collect();
        actions.sort_by(|a, b| {
            a.order
                .cmp(&b.order)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(actions)
    }

    async fn count_by_project_id(&self, project_id: Uuid) -> Result<i64> {
        let count = self
            .actions
            .read()
            .await
            .values()
            .filter(|a| a.project_id == project_id)
            .count();
        Ok(count as i64)
    }

    async fn update_info(
        &self,
        id: Uuid,
        name: &str,
        path: &str,
        methods: &[Method],
        config: &ModuleConfig,
    ) -> Result<()> {
        let mut actions = self.actions.write().await;
        let action = actions
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("action {}", id)))?;
        action.name = name.to_string();
        action.path = path.to_string();
        action.methods = methods.to_vec();
        action.config = config.clone();
        action.updated_at = Utc::now();
        Ok(())
    }

    async fn update_order(&self, ids: &[Uuid]) -> Result<()> {
        let mut actions = self.actions.write().await;
        for (i, id) in ids.iter().enumerate() {
            if let Some(action) = actions.get_mut(id) {
                action.order = i as i32;
            }
        }
        Ok(())
    }

    async fn update_module_path(&self, id: Uuid, module_path: &str) -> Result<()> {
        let mut actions = self.actions.write().await;
        let action = actions
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("action {}", id)))?;
        action.module_path = module_path.to_string();
        action.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<()> {
        self.actions.write().await.remove(&id);
        Ok(())
    }
}
