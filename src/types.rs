/// Common types used throughout koru-recall.
///
/// A [`MemoryRecord`] is one dialogue turn (or a summary of several) with an
/// importance weight. [`Association`]s are directed edges the maintenance
/// pipeline creates between records.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::weight::Layer;

/// Opaque record identifier.
pub type MemoryId = String;

/// Lowest weight any record may carry.
pub const MIN_WEIGHT: f64 = 0.1;

/// Highest weight any record may carry.
pub const MAX_WEIGHT: f64 = 10.0;

/// Weight given to a fresh record when the caller has no opinion.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Who produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A user turn
    User,
    /// An assistant turn
    Assistant,
    /// A summary artifact produced by maintenance
    Summary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Summary => write!(f, "summary"),
        }
    }
}

/// A stored memory: one dialogue turn or summary with its importance weight.
///
/// The layer is always derived from `weight`, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier
    pub id: MemoryId,
    /// Turn text
    pub content: String,
    /// Speaker
    pub role: Role,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last retrieved
    pub last_accessed_at: DateTime<Utc>,
    /// Importance weight, clamped to `[MIN_WEIGHT, MAX_WEIGHT]`
    pub weight: f64,
    /// Optional topic cluster
    #[serde(default)]
    pub group_id: Option<String>,
    /// Open key-value metadata
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

impl MemoryRecord {
    /// Create a record with a generated (UUIDv4) id.
    pub fn new(content: impl Into<String>, role: Role) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), content, role)
    }

    /// Create a record whose id is the BLAKE3 hash of role and content.
    ///
    /// Storing the same turn twice yields the same id.
    pub fn content_addressed(content: impl Into<String>, role: Role) -> Self {
        let content = content.into();
        let mut hasher = blake3::Hasher::new();
        hasher.update(role.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(content.as_bytes());
        let id = hasher.finalize().to_hex().to_string();
        Self::with_id(id, content, role)
    }

    /// Create a record with an explicit id.
    pub fn with_id(id: impl Into<String>, content: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            content: content.into(),
            role,
            created_at: now,
            last_accessed_at: now,
            weight: DEFAULT_WEIGHT,
            group_id: None,
            metadata: Map::new(),
        }
    }

    /// Set the weight (clamped).
    pub fn weight(mut self, weight: f64) -> Self {
        self.set_weight(weight);
        self
    }

    /// Set the creation time; the access time is moved along if it would
    /// otherwise precede creation.
    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        if self.last_accessed_at < at {
            self.last_accessed_at = at;
        }
        self
    }

    /// Set the last access time (never earlier than creation).
    pub fn accessed(mut self, at: DateTime<Utc>) -> Self {
        self.last_accessed_at = at.max(self.created_at);
        self
    }

    /// Put the record in a topic group.
    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Attach one metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Replace the weight, clamping into the global bounds.
    pub fn set_weight(&mut self, weight: f64) {
        self.weight = if weight.is_nan() {
            MIN_WEIGHT
        } else {
            weight.clamp(MIN_WEIGHT, MAX_WEIGHT)
        };
    }

    /// Record an access at `at`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_accessed_at = at.max(self.created_at).max(self.last_accessed_at);
    }

    /// The layer implied by the current weight.
    pub fn layer(&self) -> Layer {
        Layer::classify(self.weight)
    }

    /// Serialize into the JSON payload the caches hold.
    pub fn to_payload(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Rebuild a record from a cache payload.
    pub fn from_payload(value: &JsonValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Kind of edge between two records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    /// A user turn and the assistant turn answering it
    DialoguePair,
    /// A record and the summary covering it
    SummarizedBy,
    /// Topical relation found by similarity
    Related,
}

impl std::fmt::Display for AssociationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationKind::DialoguePair => write!(f, "dialogue_pair"),
            AssociationKind::SummarizedBy => write!(f, "summarized_by"),
            AssociationKind::Related => write!(f, "related"),
        }
    }
}

/// A directed, typed edge between two records.
///
/// `(from, to, kind)` identifies an edge; edges of different kinds between the
/// same pair coexist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    /// Source record
    pub from: MemoryId,
    /// Target record
    pub to: MemoryId,
    /// Edge kind
    pub kind: AssociationKind,
    /// Strength in `[0, 1]`
    pub strength: f64,
    /// When the edge was created
    pub created_at: DateTime<Utc>,
}

impl Association {
    /// Create an edge; strength is clamped to `[0, 1]`.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: AssociationKind,
        strength: f64,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
            strength: if strength.is_nan() {
                0.0
            } else {
                strength.clamp(0.0, 1.0)
            },
            created_at: Utc::now(),
        }
    }

    /// Identity of the edge.
    pub fn identity(&self) -> (&str, &str, AssociationKind) {
        (&self.from, &self.to, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_weight_is_clamped() {
        let record = MemoryRecord::new("hi", Role::User).weight(42.0);
        assert_eq!(record.weight, MAX_WEIGHT);

        let record = MemoryRecord::new("hi", Role::User).weight(-3.0);
        assert_eq!(record.weight, MIN_WEIGHT);

        let record = MemoryRecord::new("hi", Role::User).weight(f64::NAN);
        assert_eq!(record.weight, MIN_WEIGHT);
    }

    #[test]
    fn test_access_never_precedes_creation() {
        let now = Utc::now();
        let record = MemoryRecord::new("hi", Role::User)
            .created(now)
            .accessed(now - Duration::days(3));
        assert_eq!(record.last_accessed_at, record.created_at);

        let mut record = MemoryRecord::new("hi", Role::User).created(now - Duration::days(1));
        record.touch(now - Duration::days(5));
        assert!(record.last_accessed_at >= record.created_at);
    }

    #[test]
    fn test_content_addressed_ids_are_stable() {
        let a = MemoryRecord::content_addressed("the sky is blue", Role::User);
        let b = MemoryRecord::content_addressed("the sky is blue", Role::User);
        let c = MemoryRecord::content_addressed("the sky is blue", Role::Assistant);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.len(), 64);
    }

    #[test]
    fn test_payload_roundtrip() {
        let record = MemoryRecord::with_id("m1", "hello", Role::Assistant)
            .weight(5.0)
            .group("greetings")
            .meta("lang", json!("en"));
        let payload = record.to_payload();
        assert_eq!(payload["role"], "assistant");
        let back = MemoryRecord::from_payload(&payload).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.layer(), Layer::LongTerm);
    }

    #[test]
    fn test_association_strength_clamped() {
        let edge = Association::new("a", "b", AssociationKind::Related, 1.7);
        assert_eq!(edge.strength, 1.0);
        assert_eq!(edge.identity(), ("a", "b", AssociationKind::Related));
        assert_eq!(AssociationKind::SummarizedBy.to_string(), "summarized_by");
    }
}
