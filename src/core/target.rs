//! Target identifier parsing

use std::fmt;

/// Parsed form of a `:`-delimited target path.
///
/// Entities use `ns:id`; relationships use `ns:id:predicate:ns:id`.
/// The core never interprets `ns` or `id` beyond this parse; any path
/// that is not exactly a five-field relationship is treated as an
/// entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    Entity {
        ns: String,
        id: String,
    },
    Relationship {
        from_ns: String,
        from_id: String,
        predicate: String,
        to_ns: String,
        to_id: String,
    },
}

impl TargetRef {
    /// Parse a canonical target string.
    pub fn parse(target: &str) -> Self {
        let parts: Vec<&str> = target.split(':').collect();
        match parts.as_slice() {
            [from_ns, from_id, predicate, to_ns, to_id] => TargetRef::Relationship {
                from_ns: (*from_ns).to_string(),
                from_id: (*from_id).to_string(),
                predicate: (*predicate).to_string(),
                to_ns: (*to_ns).to_string(),
                to_id: (*to_id).to_string(),
            },
            [ns, id] => TargetRef::Entity {
                ns: (*ns).to_string(),
                id: (*id).to_string(),
            },
            _ => {
                // Malformed paths fall back to an entity keyed by the
                // whole string so that events are never dropped.
                let (ns, id) = match target.split_once(':') {
                    Some((ns, rest)) => (ns.to_string(), rest.to_string()),
                    None => (String::new(), target.to_string()),
                };
                TargetRef::Entity { ns, id }
            }
        }
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self, TargetRef::Relationship { .. })
    }

    /// The `ns:id` string of the source side (entity itself, or `from`).
    pub fn from_key(&self) -> String {
        match self {
            TargetRef::Entity { ns, id } => format!("{ns}:{id}"),
            TargetRef::Relationship {
                from_ns, from_id, ..
            } => format!("{from_ns}:{from_id}"),
        }
    }

    /// The `ns:id` string of the destination side of a relationship.
    pub fn to_key(&self) -> Option<String> {
        match self {
            TargetRef::Entity { .. } => None,
            TargetRef::Relationship { to_ns, to_id, .. } => Some(format!("{to_ns}:{to_id}")),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRef::Entity { ns, id } => write!(f, "{ns}:{id}"),
            TargetRef::Relationship {
                from_ns,
                from_id,
                predicate,
                to_ns,
                to_id,
            } => write!(f, "{from_ns}:{from_id}:{predicate}:{to_ns}:{to_id}"),
        }
    }
}
