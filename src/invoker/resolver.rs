//! Host + path + method to project and action

use axum::http::Method as HttpMethod;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::route::RoutePattern;
use crate::model::{Action, Method, Project};
use crate::repository::{ActionRepository, ProjectRepository};

/// Outcome of resolving an inbound request
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The host is not a project subdomain; let ordinary routing handle it
    Passthrough,
    /// Unknown project, or no action matches path and method
    NotFound,
    /// An action matches but has no module yet
    NotImplemented { project: Project, action: Action },
    /// Metadata lookup failed; details are logged, not returned
    InternalError,
    Matched { project: Project, action: Action },
}

/// Leftmost label of `host` if it has exactly one label in front of the
/// last `offset` labels. Ports are ignored; IP literals never match.
pub fn extract_subdomain(host: &str, offset: usize) -> Option<String> {
    // Bracketed IPv6, with or without port
    if host.starts_with('[') {
        return None;
    }
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        Some(_) => return None,
        None => host,
    };
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.parse::<IpAddr>().is_ok() {
        return None;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() != offset + 1 {
        return None;
    }
    let label = labels[0];
    if label.is_empty() {
        return None;
    }
    Some(label.to_ascii_lowercase())
}

/// First action, in display order, whose pattern and methods accept the request
fn match_action<'a>(actions: &'a [Action], path: &str, method: Method) -> Option<&'a Action> {
    actions.iter().find(|action| {
        if !action.methods.contains(&method) {
            return false;
        }
        match RoutePattern::parse(&action.path) {
            Ok(pattern) => pattern.matches(path),
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "Skipping action with invalid route");
                false
            }
        }
    })
}

/// Resolves requests against stored projects and actions
pub struct ActionResolver {
    projects: Arc<dyn ProjectRepository>,
    actions: Arc<dyn ActionRepository>,
    subdomain_offset: usize,
}

impl ActionResolver {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        actions: Arc<dyn ActionRepository>,
        subdomain_offset: usize,
    ) -> Self {
        ActionResolver {
            projects,
            actions,
            subdomain_offset,
        }
    }

    pub async fn resolve(&self, host: &str, path: &str, method: &HttpMethod) -> Resolution {
        let Some(subdomain) = extract_subdomain(host, self.subdomain_offset) else {
            return Resolution::Passthrough;
        };

        let project = match self.projects.get_by_subdomain(&subdomain).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                debug!(subdomain = %subdomain, "No project for subdomain");
                return Resolution::NotFound;
            }
            Err(e) => {
                error!(subdomain = %subdomain, error = %e, "Failed to look up project");
                return Resolution::InternalError;
            }
        };

        let actions = match self.actions.get_by_project_id(project.id).await {
            Ok(actions) => actions,
            Err(e) => {
                error!(project_id = %project.id, error = %e, "Failed to load actions");
                return Resolution::InternalError;
            }
        };

        // Methods outside the supported set can never match
        let Some(method) = Method::from_http(method) else {
            return Resolution::NotFound;
        };

        match match_action(&actions, path, method) {
            None => {
                debug!(project_id = %project.id, path, %method, "No matching action");
                Resolution::NotFound
            }
            Some(action) if !action.has_module() => Resolution::NotImplemented {
                project,
                action: action.clone(),
            },
            Some(action) => Resolution::Matched {
                action: action.clone(),
                project,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    #[test]
    fn test_extract_subdomain() {
        assert_eq!(extract_subdomain("demo-ab12.example.com", 2).as_deref(), Some("demo-ab12"));
        assert_eq!(extract_subdomain("Demo.example.com:8080", 2).as_deref(), Some("demo"));
        assert_eq!(extract_subdomain("demo.example.com.", 2).as_deref(), Some("demo"));
        assert_eq!(extract_subdomain("demo.localhost", 1).as_deref(), Some("demo"));

        assert_eq!(extract_subdomain("example.com", 2), None);
        assert_eq!(extract_subdomain("a.b.example.com", 2), None);
        assert_eq!(extract_subdomain(".example.com", 2), None);
        assert_eq!(extract_subdomain("10.0.0.1", 2), None);
        assert_eq!(extract_subdomain("10.0.0.1:80", 3), None);
        assert_eq!(extract_subdomain("[::1]:8080", 2), None);
        assert_eq!(extract_subdomain("", 2), None);
    }

    fn action(path: &str, methods: Vec<Method>, order: i32) -> Action {
        let mut action = Action::new(uuid::Uuid::nil(), "a", path, methods, order);
        action.module_path = "m.wasm".to_string();
        action
    }

    #[test]
    fn test_first_match_wins() {
        let actions = vec![
            action("/users/:id", vec![Method::Get], 0),
            action("/users/me", vec![Method::Get], 1),
            action("/users/me", vec![Method::Post], 2),
        ];

        let hit = match_action(&actions, "/users/me", Method::Get).unwrap();
        assert_eq!(hit.order, 0);
        let hit = match_action(&actions, "/users/me", Method::Post).unwrap();
        assert_eq!(hit.order, 2);
        assert!(match_action(&actions, "/users/me", Method::Delete).is_none());
        assert!(match_action(&actions, "/posts", Method::Get).is_none());
    }

    async fn resolver_with(actions: Vec<Action>) -> (ActionResolver, Project) {
        let repo = Arc::new(InMemoryRepository::new());
        let project = Project::new(uuid::Uuid::new_v4(), "Demo");
        ProjectRepository::create(repo.as_ref(), &project).await.unwrap();
        for mut action in actions {
            action.project_id = project.id;
            ActionRepository::create(repo.as_ref(), &action).await.unwrap();
        }
        (ActionResolver::new(repo.clone(), repo, 2), project)
    }

    #[tokio::test]
    async fn test_resolve() {
        let mut pending = action("/pending", vec![Method::Get], 1);
        pending.module_path.clear();
        let (resolver, project) =
            resolver_with(vec![action("/hello", vec![Method::Get], 0), pending]).await;
        let host = format!("{}.example.com", project.subdomain);

        assert!(matches!(
            resolver.resolve(&host, "/hello", &HttpMethod::GET).await,
            Resolution::Matched { .. }
        ));
        assert!(matches!(
            resolver.resolve(&host, "/pending", &HttpMethod::GET).await,
            Resolution::NotImplemented { .. }
        ));
        assert!(matches!(
            resolver.resolve(&host, "/hello", &HttpMethod::HEAD).await,
            Resolution::NotFound
        ));
        assert!(matches!(
            resolver.resolve(&host, "/missing", &HttpMethod::GET).await,
            Resolution::NotFound
        ));
        assert!(matches!(
            resolver.resolve("nobody.example.com", "/hello", &HttpMethod::GET).await,
            Resolution::NotFound
        ));
        assert!(matches!(
            resolver.resolve("example.com", "/hello", &HttpMethod::GET).await,
            Resolution::Passthrough
        ));
    }

    #[tokio::test]
    async fn test_project_without_actions() {
        let (resolver, project) = resolver_with(Vec::new()).await;
        let host = format!("{}.example.com", project.subdomain);
        assert!(matches!(
            resolver.resolve(&host, "/", &HttpMethod::GET).await,
            Resolution::NotFound
        ));
    }
}
