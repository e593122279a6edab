//! Actions - HTTP-triggered functions owned by a project

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Error, Result};

/// HTTP methods an action may accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Map an inbound HTTP method; methods outside the supported set yield `None`
    pub fn from_http(method: &axum::http::Method) -> Option<Self> {
        method.as_str().parse().ok()
    }
}

impl std::str::FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            _ => Err(Error::InvalidInput(format!(
                "Unsupported method: {}. Valid: GET, POST, PUT, PATCH, DELETE",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-action instantiation settings handed to the sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Environment variables visible to the guest
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub envs: BTreeMap<String, String>,
    /// Program arguments visible to the guest
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Request outbound network access (still subject to the platform policy)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub network: bool,
}

/// One HTTP-triggered function in a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    /// Route pattern, e.g. `/users/:id`
    pub path: String,
    pub methods: Vec<Method>,
    /// Display order; lower values match first
    pub order: i32,
    /// Location of the module in blob storage; empty until uploaded
    pub module_path: String,
    #[serde(default)]
    pub config: ModuleConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Action {
    /// Create an action without a module
    pub fn new(
        project_id: Uuid,
        name: impl Into<String>,
        path: impl Into<String>,
        methods: Vec<Method>,
        order: i32,
    ) -> Self {
        let now = Utc::now();
        Action {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            path: path.into(),
            methods,
            order,
            module_path: String::new(),
            config: ModuleConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_module(&self) -> bool {
        !self.module_path.is_empty()
    }

    /// Blob path a module for this action is stored at
    pub fn module_path_for(owner_id: Uuid, project_id: Uuid, action_id: Uuid) -> String {
        format!("{}/{}/{}.wasm", owner_id, project_id, action_id)
    }
}

/// Reject empty or duplicated method sets
pub fn validate_methods(methods: &[Method]) -> Result<()> {
    if methods.is_empty() {
        return Err(Error::InvalidInput(
            "at least one method is required".to_string(),
        ));
    }
    for (i, method) in methods.iter().enumerate() {
        if methods[..i].contains(method) {
            return Err(Error::InvalidInput(format!("duplicate method: {}", method)));
        }
    }
    Ok(())
}
