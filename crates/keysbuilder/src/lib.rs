//! Plenum - Keysbuilder
//!
//! Turns a declarative subscription request into the closed set of
//! concrete datastore keys it currently covers.
//!
//! A request names entities and fields; relation fields follow ids
//! stored in the data, generic relations follow `collection/id`
//! strings, template fields fan out into one concrete key per stored
//! token. Because the data decides where relations point, the set
//! must be re-evaluated whenever a key the expansion read changes -
//! the connection loop does exactly that.
//!
//! ```ignore
//! let requests = keysbuilder::parse_body(body)?;
//! let builder = KeysBuilder::new(requests);
//! let keys = builder.expand(&loader).await?;
//! ```

mod builder;
mod request;

pub use builder::{ExpandError, KeysBuilder, ValueLoader};
pub use request::{
    FieldDescriptor, GenericBody, KeyRequest, RelationBody, RequestError, parse_body,
};

#[cfg(test)]
#[path = "keysbuilder_test.rs"]
mod tests;
