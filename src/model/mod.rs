//! Domain model - projects (tenants) and their actions

mod action;
mod project;

pub use action::{validate_methods, Action, Method, ModuleConfig};
pub use project::{generate_subdomain, validate_name, Project};
