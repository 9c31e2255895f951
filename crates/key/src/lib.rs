//! Plenum - Key
//!
//! The universal address of one field of one entity in the datastore.
//!
//! A key has the textual form `collection/id/field`, for example
//! `chat_message/42/content`. Every other component of the autoupdate
//! pipeline (cache, fetcher, restricter, keysbuilder) speaks in keys;
//! the meaning of a field is known only to restriction rules and slide
//! renderers.
//!
//! # Grammar
//!
//! ```text
//! key        := collection "/" id "/" field
//! collection := [a-z][a-z0-9_]*
//! id         := positive integer
//! field      := [a-z][a-z0-9_]* ( "$" [a-z0-9_]* )?
//! ```
//!
//! A field ending in `$` is the *bare* form of a template field; its
//! value is a list of tokens. Appending a token (`field$token`) yields
//! the concrete form, which addresses a regular value.
//!
//! # Example
//!
//! ```
//! use plenum_key::Key;
//!
//! let key: Key = "user/5/username".parse().unwrap();
//! assert_eq!(key.collection(), "user");
//! assert_eq!(key.id(), 5);
//! assert_eq!(key.to_string(), "user/5/username");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use thiserror::Error;

/// Error for a string that does not match the key grammar.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid key `{got}`")]
pub struct InvalidKeyError {
    /// The rejected input
    pub got: String,
}

/// Address of one field of one entity: `collection/id/field`.
///
/// Two keys are equal iff collection, id and field are equal. Keys
/// carry no type information.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    collection: String,
    id: i32,
    field: String,
}

impl Key {
    /// Create a key from trusted parts.
    ///
    /// Callers pass literals or already-validated parts; input from
    /// the outside world goes through [`Key::parse`] instead. Grammar
    /// violations are caught in debug builds only.
    pub fn new(collection: impl Into<String>, id: i32, field: impl Into<String>) -> Self {
        let key = Self {
            collection: collection.into(),
            id,
            field: field.into(),
        };
        debug_assert!(
            is_collection(&key.collection) && key.id > 0 && is_field(&key.field),
            "malformed key built from trusted parts: {key}"
        );
        key
    }

    /// Parse and validate the textual form `collection/id/field`.
    pub fn parse(s: &str) -> Result<Self, InvalidKeyError> {
        let invalid = || InvalidKeyError { got: s.to_string() };

        let mut parts = s.splitn(3, '/');
        let collection = parts.next().ok_or_else(invalid)?;
        let id = parts.next().ok_or_else(invalid)?;
        let field = parts.next().ok_or_else(invalid)?;

        if !is_collection(collection) || !is_id(id) || !is_field(field) {
            return Err(invalid());
        }

        let id: i32 = id.parse().map_err(|_| invalid())?;

        Ok(Self {
            collection: collection.to_string(),
            id,
            field: field.to_string(),
        })
    }

    /// The collection part.
    #[inline]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The entity id.
    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// The field part, including any template marker.
    #[inline]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The same field on a different entity of the same collection.
    pub fn with_id(&self, id: i32) -> Self {
        Self {
            collection: self.collection.clone(),
            id,
            field: self.field.clone(),
        }
    }

    /// A different field on the same entity.
    pub fn with_field(&self, field: impl Into<String>) -> Self {
        Self::new(self.collection.clone(), self.id, field)
    }

    /// True for the bare form of a template field (`field$`).
    #[inline]
    pub fn is_template(&self) -> bool {
        self.field.ends_with('$')
    }

    /// Concrete form of a bare template key: `field$` plus `token`.
    ///
    /// Only meaningful when [`is_template`](Self::is_template) holds.
    pub fn concrete(&self, token: &str) -> Self {
        let mut field = self.field.clone();
        field.push_str(token);
        Self {
            collection: self.collection.clone(),
            id: self.id,
            field,
        }
    }

    /// The field with a concrete replacement stripped back to the
    /// bare form: `group_ids$7` yields `group_ids$`.
    ///
    /// Non-template fields are returned unchanged. Restriction modes
    /// are looked up under this form.
    pub fn bare_field(&self) -> &str {
        match self.field.find('$') {
            Some(pos) => &self.field[..=pos],
            None => &self.field,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.collection, self.id, self.field)
    }
}

impl FromStr for Key {
    type Err = InvalidKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

/// Parse a fully qualified id of the form `collection/id`.
///
/// Generic relation values and the projector's `content_object_id`
/// carry this form. Returns `None` when the input does not match.
pub fn parse_fqid(s: &str) -> Option<(&str, i32)> {
    let (collection, id) = s.split_once('/')?;
    if !is_collection(collection) || !is_id(id) {
        return None;
    }
    Some((collection, id.parse().ok()?))
}

/// Whether `s` is a valid collection name.
pub fn is_collection(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some('a'..='z'))
        && chars.all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
}

/// Whether `s` is a valid field name, template forms included.
pub fn is_field(s: &str) -> bool {
    let (name, replacement) = match s.split_once('$') {
        Some((name, replacement)) => (name, Some(replacement)),
        None => (s, None),
    };

    let mut chars = name.chars();
    let name_ok = matches!(chars.next(), Some('a'..='z'))
        && chars.all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'));

    let replacement_ok = match replacement {
        None => true,
        // Empty replacement is the bare template form.
        Some(r) => r.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_')),
    };

    name_ok && replacement_ok
}

fn is_id(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some('1'..='9')) && chars.all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let key = Key::parse("user/5/username").unwrap();
        assert_eq!(key.collection(), "user");
        assert_eq!(key.id(), 5);
        assert_eq!(key.field(), "username");
    }

    #[test]
    fn test_parse_template_forms() {
        let bare = Key::parse("user/1/group_ids$").unwrap();
        assert!(bare.is_template());

        let concrete = Key::parse("user/1/group_ids$7").unwrap();
        assert!(!concrete.is_template());
        assert_eq!(concrete.bare_field(), "group_ids$");
    }

    #[test]
    fn test_parse_invalid() {
        for input in [
            "",
            "user",
            "user/5",
            "user/5/username/extra_is_part_of_field",
            "User/5/username",
            "user/0/username",
            "user/05/username",
            "user/-1/username",
            "user/five/username",
            "user/5/UserName",
            "user/5/5name",
            "user/5/name$x/y",
            "us er/5/name",
        ] {
            // A fourth slash lands inside the field part and fails there.
            assert!(Key::parse(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn test_display_roundtrip() {
        for input in ["user/5/username", "chat_message/42/content", "user/1/g$7"] {
            assert_eq!(Key::parse(input).unwrap().to_string(), input);
        }
    }

    #[test]
    fn test_equality_on_triple() {
        assert_eq!(
            Key::new("user", 5, "username"),
            Key::parse("user/5/username").unwrap()
        );
        assert_ne!(Key::new("user", 5, "username"), Key::new("user", 6, "username"));
    }

    #[test]
    fn test_with_id_and_field() {
        let key = Key::new("user", 5, "username");
        assert_eq!(key.with_id(9).to_string(), "user/9/username");
        assert_eq!(key.with_field("is_active").to_string(), "user/5/is_active");
    }

    #[test]
    fn test_concrete() {
        let bare = Key::new("user", 1, "group_ids$");
        assert_eq!(bare.concrete("7").to_string(), "user/1/group_ids$7");
    }

    #[test]
    fn test_bare_field_on_plain_field() {
        assert_eq!(Key::new("user", 1, "username").bare_field(), "username");
    }

    #[test]
    fn test_parse_fqid() {
        assert_eq!(parse_fqid("meeting/7"), Some(("meeting", 7)));
        assert_eq!(parse_fqid("test_model/1"), Some(("test_model", 1)));
        assert_eq!(parse_fqid("meeting"), None);
        assert_eq!(parse_fqid("meeting/0"), None);
        assert_eq!(parse_fqid("Meeting/7"), None);
        assert_eq!(parse_fqid("meeting/7/name"), None);
    }

    #[test]
    fn test_serde_as_string() {
        let key = Key::new("user", 5, "username");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"user/5/username\"");

        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);

        assert!(serde_json::from_str::<Key>("\"no key\"").is_err());
    }
}
