//! Key expansion
//!
//! Evaluates a request forest against the current data: plain fields
//! emit their keys directly, relation and template fields are read
//! through a [`ValueLoader`] and expanded into further keys. All
//! reads of one expansion wave go through a single loader call.
//!
//! Missing or `null` intermediate values yield no keys; the result is
//! the largest closed set consistent with the data the loader shows.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use plenum_datastore::{BoxError, Value};
use plenum_key::Key;
use thiserror::Error;
use tracing::debug;

use crate::request::{FieldDescriptor, GenericBody, KeyRequest};

/// Errors during expansion.
#[derive(Debug, Error)]
pub enum ExpandError {
    /// The loader could not provide values
    #[error("loading values: {0}")]
    Loader(#[source] BoxError),

    /// A relation value does not parse as the expected shape
    #[error("decoding value of {key}: {source}")]
    Decode {
        key: Key,
        #[source]
        source: serde_json::Error,
    },
}

/// Batched value access for the expansion. Implementations decide
/// what the builder is allowed to see; the autoupdate connection
/// plugs in a restricted loader so subscriptions only follow
/// relations the user may read.
#[async_trait]
pub trait ValueLoader: Send + Sync {
    /// The current values of `keys`; absent keys map to `None`.
    async fn values(&self, keys: Vec<Key>) -> Result<HashMap<Key, Value>, BoxError>;
}

/// One pending field of the current wave.
struct Job<'a> {
    collection: String,
    ids: Vec<i32>,
    field: String,
    descriptor: &'a FieldDescriptor,
}

/// Expands subscription requests into closed key sets.
#[derive(Debug, Clone)]
pub struct KeysBuilder {
    requests: Vec<KeyRequest>,
}

impl KeysBuilder {
    pub fn new(requests: Vec<KeyRequest>) -> Self {
        Self { requests }
    }

    /// The requests this builder evaluates.
    pub fn requests(&self) -> &[KeyRequest] {
        &self.requests
    }

    /// Evaluate the requests against the data `loader` shows.
    ///
    /// Idempotent: identical data yields identical key sets.
    pub async fn expand(&self, loader: &dyn ValueLoader) -> Result<HashSet<Key>, ExpandError> {
        let mut keys: HashSet<Key> = HashSet::new();

        let mut jobs: Vec<Job<'_>> = Vec::new();
        for request in &self.requests {
            for (field, descriptor) in &request.fields {
                jobs.push(Job {
                    collection: request.collection.clone(),
                    ids: request.ids.clone(),
                    field: field.clone(),
                    descriptor,
                });
            }
        }

        let mut wave = 0;
        while !jobs.is_empty() {
            wave += 1;

            // Every job's keys are part of the result; non-plain jobs
            // additionally need the values to go on.
            let mut wanted: Vec<Key> = Vec::new();
            for job in &jobs {
                for &id in &job.ids {
                    let key = Key::new(job.collection.clone(), id, job.field.clone());
                    if !matches!(job.descriptor, FieldDescriptor::Plain) {
                        wanted.push(key.clone());
                    }
                    keys.insert(key);
                }
            }

            if wanted.is_empty() {
                break;
            }
            debug!(wave, reads = wanted.len(), "expanding request wave");
            let values = loader
                .values(wanted)
                .await
                .map_err(ExpandError::Loader)?;

            let mut next: Vec<Job<'_>> = Vec::new();
            for job in &jobs {
                for &id in &job.ids {
                    let key = Key::new(job.collection.clone(), id, job.field.clone());
                    let value = values.get(&key).cloned().flatten();
                    expand_value(&key, job.descriptor, value, &mut next)?;
                }
            }
            jobs = next;
        }

        Ok(keys)
    }
}

/// Decode one relation value and schedule the follow-up jobs.
fn expand_value<'a>(
    key: &Key,
    descriptor: &'a FieldDescriptor,
    value: Value,
    next: &mut Vec<Job<'a>>,
) -> Result<(), ExpandError> {
    let Some(bytes) = value else {
        return Ok(());
    };
    let decode_err = |source| ExpandError::Decode {
        key: key.clone(),
        source,
    };

    match descriptor {
        FieldDescriptor::Plain => {}

        FieldDescriptor::Relation(body) => {
            let id: Option<i32> = serde_json::from_slice(&bytes).map_err(decode_err)?;
            if let Some(id) = id {
                push_body_jobs(next, &body.collection, vec![id], &body.fields);
            }
        }

        FieldDescriptor::RelationList(body) => {
            let ids: Option<Vec<i32>> = serde_json::from_slice(&bytes).map_err(decode_err)?;
            if let Some(ids) = ids
                && !ids.is_empty()
            {
                push_body_jobs(next, &body.collection, ids, &body.fields);
            }
        }

        FieldDescriptor::GenericRelation(body) => {
            let fqid: Option<String> = serde_json::from_slice(&bytes).map_err(decode_err)?;
            if let Some(fqid) = fqid {
                push_generic_jobs(next, body, &fqid);
            }
        }

        FieldDescriptor::GenericRelationList(body) => {
            let fqids: Option<Vec<String>> = serde_json::from_slice(&bytes).map_err(decode_err)?;
            for fqid in fqids.unwrap_or_default() {
                push_generic_jobs(next, body, &fqid);
            }
        }

        FieldDescriptor::Template(sub) => {
            static PLAIN: FieldDescriptor = FieldDescriptor::Plain;
            let tokens: Option<Vec<String>> = serde_json::from_slice(&bytes).map_err(decode_err)?;
            for token in tokens.unwrap_or_default() {
                let concrete = key.concrete(&token);
                let descriptor: &FieldDescriptor = match sub {
                    Some(inner) => inner,
                    None => &PLAIN,
                };
                next.push(Job {
                    collection: concrete.collection().to_string(),
                    ids: vec![concrete.id()],
                    field: concrete.field().to_string(),
                    descriptor,
                });
            }
        }
    }
    Ok(())
}

fn push_body_jobs<'a>(
    next: &mut Vec<Job<'a>>,
    collection: &str,
    ids: Vec<i32>,
    fields: &'a HashMap<String, FieldDescriptor>,
) {
    for (field, descriptor) in fields {
        next.push(Job {
            collection: collection.to_string(),
            ids: ids.clone(),
            field: field.clone(),
            descriptor,
        });
    }
}

fn push_generic_jobs<'a>(next: &mut Vec<Job<'a>>, body: &'a GenericBody, fqid: &str) {
    let Some((collection, id)) = plenum_key::parse_fqid(fqid) else {
        debug!(value = fqid, "ignoring malformed generic relation value");
        return;
    };
    // A declared collection constrains what the relation may point
    // at; everything else expands to nothing.
    if let Some(declared) = &body.collection
        && declared != collection
    {
        return;
    }
    push_body_jobs(next, collection, vec![id], &body.fields);
}
