//! Core domain types for hangout
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Domain** | An independent data category with its own channel and collection |
//! | **Record** | One remote row, keyed by id, carried as an opaque JSON object |
//! | **ChangeEvent** | A pushed insert/update/delete for one record |
//! | **Session** | The authenticated backend session channels and fetches run under |
//!
//! Records are intentionally schemaless: the backing store owns the schema,
//! this crate only looks at `id`, `unread`, `status` and timestamp fields.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================
// Domain
// ============================================

/// An independent unit of consistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Plans,
    Friends,
    Invitations,
    Notifications,
}

impl Domain {
    /// Every domain, in a stable order
    pub const ALL: [Domain; 4] = [
        Domain::Plans,
        Domain::Friends,
        Domain::Invitations,
        Domain::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Plans => "plans",
            Domain::Friends => "friends",
            Domain::Invitations => "invitations",
            Domain::Notifications => "notifications",
        }
    }

    /// Default backend table for this domain
    pub fn default_table(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plans" => Ok(Domain::Plans),
            "friends" => Ok(Domain::Friends),
            "invitations" => Ok(Domain::Invitations),
            "notifications" => Ok(Domain::Notifications),
            _ => Err(crate::error::Error::UnknownDomain(s.to_string())),
        }
    }
}

// ============================================
// Session
// ============================================

/// Authenticated backend session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Bearer token for REST and realtime calls
    pub access_token: String,
    /// Id of the signed-in user, when known
    pub user_id: Option<String>,
}

impl Session {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

// ============================================
// Records
// ============================================

/// A single entity held in a local collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique entity id within its domain
    pub id: String,
    /// Every field of the remote row, including `id`
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, mut fields: Map<String, Value>) -> Self {
        let id = id.into();
        fields
            .entry("id".to_string())
            .or_insert_with(|| Value::String(id.clone()));
        Self { id, fields }
    }

    /// Build a record from a JSON row, taking the id from its `id` field.
    ///
    /// Returns `None` for non-objects and rows without a usable id.
    pub fn from_row(row: Value) -> Option<Self> {
        let Value::Object(fields) = row else {
            return None;
        };
        let id = fields.get("id").and_then(id_string)?;
        Some(Self { id, fields })
    }

    /// Whether this record carries an unread marker set to true
    pub fn is_unread(&self) -> bool {
        self.fields
            .get("unread")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_unread(&mut self, unread: bool) {
        self.fields.insert("unread".to_string(), Value::Bool(unread));
    }

    /// String field accessor
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Server timestamp carried by the row itself (`updated_at`, falling back to `created_at`)
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.fields
            .get("updated_at")
            .or_else(|| self.fields.get("created_at"))
            .and_then(parse_timestamp)
    }

    /// Merge the fields present in `patch` over this record
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

/// Render a JSON id (string or integer) as a string key
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a best-effort server timestamp.
///
/// Accepts RFC 3339 strings, Postgres-style `YYYY-MM-DD HH:MM:SS[.f][+TZ]`
/// strings and integer epoch milliseconds. Anything else yields `None`.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
                .ok()
                .map(|ts| ts.with_timezone(&Utc))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

// ============================================
// Change events
// ============================================

/// Kind of change carried by a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(format!("unknown operation: {}", s)),
        }
    }
}

/// A pushed change to one entity.
///
/// Consumed once by the reconciler and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub domain: Domain,
    pub entity_id: String,
    pub op: Operation,
    /// Full record (insert) or the changed fields (update); may be empty for deletes
    pub payload: Map<String, Value>,
    /// Best-effort server commit time; `None` when absent or unparseable
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn new(domain: Domain, entity_id: impl Into<String>, op: Operation) -> Self {
        Self {
            domain,
            entity_id: entity_id.into(),
            op,
            payload: Map::new(),
            timestamp: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        if let Value::Object(map) = payload {
            self.payload = map;
        }
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Timestamp from epoch milliseconds, mostly for fixtures and tests
    pub fn at_millis(self, ms: i64) -> Self {
        match Utc.timestamp_millis_opt(ms).single() {
            Some(ts) => self.at(ts),
            None => self,
        }
    }
}

/// Wire form of a change event as captured from the realtime feed.
///
/// `timestamp` is kept raw so unparseable values degrade to arrival order
/// instead of failing the whole message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireChange {
    pub domain: String,
    pub id: Value,
    pub op: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, alias = "commit_timestamp", alias = "ts")]
    pub timestamp: Option<Value>,
}

impl TryFrom<WireChange> for ChangeEvent {
    type Error = crate::error::Error;

    fn try_from(wire: WireChange) -> crate::error::Result<Self> {
        let domain: Domain = wire.domain.parse()?;
        let op: Operation = wire
            .op
            .parse()
            .map_err(|e: String| crate::error::Error::Transport {
                domain: domain.to_string(),
                message: e,
            })?;
        let entity_id = id_string(&wire.id).ok_or_else(|| crate::error::Error::Transport {
            domain: domain.to_string(),
            message: format!("change event without id: {}", wire.id),
        })?;
        let payload = match wire.payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let timestamp = wire.timestamp.as_ref().and_then(parse_timestamp);
        if wire.timestamp.is_some() && timestamp.is_none() {
            tracing::debug!(
                domain = %domain,
                entity_id = %entity_id,
                "Unparseable change timestamp, applying in arrival order"
            );
        }
        Ok(ChangeEvent {
            domain,
            entity_id,
            op,
            payload,
            timestamp,
        })
    }
}
