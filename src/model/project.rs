//! Projects - tenant namespaces addressed by subdomain

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Alphabet of the random subdomain suffix (lowercase base32)
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
const SUFFIX_LEN: usize = 4;
const MAX_NAME_LEN: usize = 64;

/// A tenant namespace owning a set of actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    /// Unique, assigned at creation and never changed
    pub subdomain: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a new project with a freshly generated subdomain.
    ///
    /// The name must already be validated.
    pub fn new(owner_id: Uuid, name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Project {
            id: Uuid::new_v4(),
            owner_id,
            subdomain: generate_subdomain(&name),
            name,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Trim and validate a project or action name.
///
/// Names are 1 to 64 characters of letters, digits, spaces, `_` and `-`.
pub fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "name must be between 1 and {} characters",
            MAX_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-'))
    {
        return Err(Error::InvalidInput(
            "name may only contain letters, digits, spaces, '_' and '-'".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Derive a subdomain label from a project name plus a random suffix
pub fn generate_subdomain(name: &str) -> String {
    let base: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .collect();

    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();

    format!("{}-{}", base, suffix)
}
