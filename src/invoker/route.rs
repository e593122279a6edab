//! Route patterns attached to actions
//!
//! Grammar, one entry per `/`-separated segment:
//! - `users`: literal, compared case-insensitively
//! - `:id`: exactly one non-empty segment
//! - `:id?`: zero or one segment, last position only
//! - `*`: the rest of the path, last position only
//!
//! Trailing and repeated slashes are ignored and an empty path equals `/`.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    OptionalParam(String),
    Wildcard,
}

/// Parsed form of an action's route path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    segments: Vec<Segment>,
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            Error::InvalidInput(format!("invalid route pattern '{}': {}", pattern, reason))
        };

        let raw: Vec<&str> = split(pattern).collect();
        let mut segments = Vec::with_capacity(raw.len());

        for (i, part) in raw.iter().enumerate() {
            let last = i + 1 == raw.len();
            let segment = if *part == "*" {
                if !last {
                    return Err(invalid("'*' must be the last segment"));
                }
                Segment::Wildcard
            } else if let Some(name) = part.strip_prefix(':') {
                match name.strip_suffix('?') {
                    Some(name) => {
                        if !last {
                            return Err(invalid("optional parameter must be the last segment"));
                        }
                        Segment::OptionalParam(name.to_string())
                    }
                    None => Segment::Param(name.to_string()),
                }
            } else {
                Segment::Literal(part.to_string())
            };

            if let Segment::Param(ref name) | Segment::OptionalParam(ref name) = segment {
                if name.is_empty() {
                    return Err(invalid("parameter name is empty"));
                }
            }
            segments.push(segment);
        }

        Ok(RoutePattern { segments })
    }

    /// Whether `path` (without query string) matches this pattern
    pub fn matches(&self, path: &str) -> bool {
        let mut parts = split(path);

        for segment in &self.segments {
            match segment {
                Segment::Wildcard => return true,
                Segment::OptionalParam(_) => {
                    parts.next();
                    break;
                }
                Segment::Param(_) => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(literal) => match parts.next() {
                    Some(part) if part.eq_ignore_ascii_case(literal) => {}
                    _ => return false,
                },
            }
        }

        parts.next().is_none()
    }
}

impl std::str::FromStr for RoutePattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RoutePattern::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(s: &str) -> RoutePattern {
        RoutePattern::parse(s).unwrap()
    }

    #[test]
    fn test_root() {
        for p in ["", "/"] {
            let root = pattern(p);
            assert!(root.matches("/"));
            assert!(root.matches(""));
            assert!(!root.matches("/a"));
        }
    }

    #[test]
    fn test_literals() {
        let p = pattern("/users/list");
        assert!(p.matches("/users/list"));
        assert!(p.matches("/Users/LIST/"));
        assert!(!p.matches("/users"));
        assert!(!p.matches("/users/list/extra"));
        assert!(pattern("/users/").matches("/users"));
    }

    #[test]
    fn test_params() {
        let p = pattern("/users/:id");
        assert!(p.matches("/users/42"));
        assert!(!p.matches("/users"));
        assert!(!p.matches("/users/42/posts"));

        let optional = pattern("/users/:id?");
        assert!(optional.matches("/users"));
        assert!(optional.matches("/users/42"));
        assert!(!optional.matches("/users/42/posts"));
    }

    #[test]
    fn test_wildcard() {
        let p = pattern("/static/*");
        assert!(p.matches("/static"));
        assert!(p.matches("/static/css/site.css"));
        assert!(!p.matches("/other/file"));
        assert!(pattern("*").matches("/anything/at/all"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(RoutePattern::parse("/*/x").is_err());
        assert!(RoutePattern::parse("/:id?/x").is_err());
        assert!(RoutePattern::parse("/users/:").is_err());
        assert!(RoutePattern::parse("/users/:?").is_err());
    }
}
