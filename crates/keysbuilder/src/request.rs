//! Subscription request parsing
//!
//! A request is a forest of `KeyRequest` nodes in JSON:
//!
//! ```json
//! {
//!   "collection": "user",
//!   "ids": [1, 2],
//!   "fields": {
//!     "username": null,
//!     "committee_id": {
//!       "type": "relation",
//!       "collection": "committee",
//!       "fields": {"name": null}
//!     },
//!     "group_ids$": {
//!       "type": "template",
//!       "values": {
//!         "type": "relation-list",
//!         "collection": "group",
//!         "fields": {"name": null}
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! `null` marks a plain field. Relation descriptors name the target
//! collection; generic relations may constrain it. Template
//! descriptors are only valid on bare template fields (`name$`) and
//! may carry a descriptor for the concrete values.
//!
//! Parsing validates eagerly: a request that parses expands without
//! name errors.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

/// Errors for malformed subscription requests.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The body is not valid JSON of the request shape
    #[error("invalid request body: {0}")]
    Json(#[from] serde_json::Error),

    /// A request node without ids
    #[error("no ids for collection `{0}`")]
    NoIds(String),

    /// An id that is not positive
    #[error("invalid id {id} for collection `{collection}`")]
    InvalidId { collection: String, id: i32 },

    /// A name that does not match the collection grammar
    #[error("invalid collection `{0}`")]
    InvalidCollection(String),

    /// A name that does not match the field grammar
    #[error("invalid field `{0}`")]
    InvalidField(String),

    /// A descriptor with an unknown `type`
    #[error("unknown field type `{kind}` on field `{field}`")]
    UnknownType { kind: String, field: String },

    /// A template descriptor on a non-template field
    #[error("field `{0}` is no template field")]
    NotATemplate(String),

    /// A non-template descriptor on a template field
    #[error("template field `{0}` needs the type `template`")]
    TemplateNeeded(String),

    /// A template descriptor nested inside another template; the
    /// concrete values of a template field are never templates
    /// themselves
    #[error("template field `{0}` cannot hold another template")]
    NestedTemplate(String),

    /// A relation descriptor without its target collection
    #[error("field `{field}` of type `{kind}` needs a collection")]
    CollectionNeeded { kind: String, field: String },

    /// A relation descriptor without sub-fields
    #[error("field `{field}` of type `{kind}` needs fields")]
    FieldsNeeded { kind: String, field: String },
}

/// One node of a subscription request.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRequest {
    pub collection: String,
    pub ids: Vec<i32>,
    pub fields: HashMap<String, FieldDescriptor>,
}

/// How one requested field expands.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDescriptor {
    /// The field's value itself
    Plain,
    /// The value is the id of one entity of the named collection
    Relation(RelationBody),
    /// The value is a list of ids of the named collection
    RelationList(RelationBody),
    /// The value is a `collection/id` string
    GenericRelation(GenericBody),
    /// The value is a list of `collection/id` strings
    GenericRelationList(GenericBody),
    /// The value is the token list of a template field; concrete
    /// forms expand per the inner descriptor
    Template(Option<Box<FieldDescriptor>>),
}

/// Target of a relation field.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationBody {
    pub collection: String,
    pub fields: HashMap<String, FieldDescriptor>,
}

/// Target of a generic relation field; the collection comes from the
/// data, optionally constrained.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericBody {
    pub collection: Option<String>,
    pub fields: HashMap<String, FieldDescriptor>,
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    collection: String,
    #[serde(default)]
    ids: Vec<i32>,
    #[serde(default)]
    fields: HashMap<String, Option<RawDescriptor>>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(rename = "type")]
    kind: String,
    collection: Option<String>,
    fields: Option<HashMap<String, Option<RawDescriptor>>>,
    values: Option<Box<RawDescriptor>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(RawRequest),
    Many(Vec<RawRequest>),
}

/// Parse a request body holding one `KeyRequest` object or a list of
/// them.
pub fn parse_body(body: &[u8]) -> Result<Vec<KeyRequest>, RequestError> {
    let raw: OneOrMany = serde_json::from_slice(body)?;
    let raw = match raw {
        OneOrMany::One(one) => vec![one],
        OneOrMany::Many(many) => many,
    };
    raw.into_iter().map(validate_request).collect()
}

impl KeyRequest {
    /// Parse and validate a single request object.
    pub fn from_json(body: &[u8]) -> Result<Self, RequestError> {
        let raw: RawRequest = serde_json::from_slice(body)?;
        validate_request(raw)
    }
}

fn validate_request(raw: RawRequest) -> Result<KeyRequest, RequestError> {
    if !plenum_key::is_collection(&raw.collection) {
        return Err(RequestError::InvalidCollection(raw.collection));
    }
    if raw.ids.is_empty() {
        return Err(RequestError::NoIds(raw.collection));
    }
    for &id in &raw.ids {
        if id <= 0 {
            return Err(RequestError::InvalidId {
                collection: raw.collection.clone(),
                id,
            });
        }
    }
    let fields = validate_fields(raw.fields)?;
    Ok(KeyRequest {
        collection: raw.collection,
        ids: raw.ids,
        fields,
    })
}

fn validate_fields(
    raw: HashMap<String, Option<RawDescriptor>>,
) -> Result<HashMap<String, FieldDescriptor>, RequestError> {
    let mut fields = HashMap::with_capacity(raw.len());
    for (name, descriptor) in raw {
        if !plenum_key::is_field(&name) {
            return Err(RequestError::InvalidField(name));
        }
        let descriptor = validate_descriptor(&name, descriptor)?;

        let is_template_field = name.ends_with('$');
        let is_template_descriptor = matches!(descriptor, FieldDescriptor::Template(_));
        if is_template_descriptor && !is_template_field {
            return Err(RequestError::NotATemplate(name));
        }
        if is_template_field && !is_template_descriptor && descriptor != FieldDescriptor::Plain {
            return Err(RequestError::TemplateNeeded(name));
        }

        fields.insert(name, descriptor);
    }
    Ok(fields)
}

fn validate_descriptor(
    field: &str,
    raw: Option<RawDescriptor>,
) -> Result<FieldDescriptor, RequestError> {
    let Some(raw) = raw else {
        return Ok(FieldDescriptor::Plain);
    };

    let relation_body = |raw: RawDescriptor| -> Result<RelationBody, RequestError> {
        let collection = raw.collection.ok_or_else(|| RequestError::CollectionNeeded {
            kind: raw.kind.clone(),
            field: field.to_string(),
        })?;
        if !plenum_key::is_collection(&collection) {
            return Err(RequestError::InvalidCollection(collection));
        }
        let fields = raw.fields.ok_or_else(|| RequestError::FieldsNeeded {
            kind: raw.kind.clone(),
            field: field.to_string(),
        })?;
        Ok(RelationBody {
            collection,
            fields: validate_fields(fields)?,
        })
    };

    let kind = raw.kind.clone();
    match kind.as_str() {
        "relation" => Ok(FieldDescriptor::Relation(relation_body(raw)?)),
        "relation-list" => Ok(FieldDescriptor::RelationList(relation_body(raw)?)),
        "generic-relation" | "generic-relation-list" => {
            if let Some(collection) = &raw.collection
                && !plenum_key::is_collection(collection)
            {
                return Err(RequestError::InvalidCollection(collection.clone()));
            }
            let fields = raw.fields.ok_or_else(|| RequestError::FieldsNeeded {
                kind: raw.kind.clone(),
                field: field.to_string(),
            })?;
            let body = GenericBody {
                collection: raw.collection,
                fields: validate_fields(fields)?,
            };
            if kind == "generic-relation" {
                Ok(FieldDescriptor::GenericRelation(body))
            } else {
                Ok(FieldDescriptor::GenericRelationList(body))
            }
        }
        "template" => {
            let values = match raw.values {
                None => None,
                Some(inner) => {
                    if inner.kind == "template" {
                        return Err(RequestError::NestedTemplate(field.to_string()));
                    }
                    Some(Box::new(validate_descriptor(field, Some(*inner))?))
                }
            };
            Ok(FieldDescriptor::Template(values))
        }
        kind => Err(RequestError::UnknownType {
            kind: kind.to_string(),
            field: field.to_string(),
        }),
    }
}
