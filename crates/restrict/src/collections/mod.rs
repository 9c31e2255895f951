//! Built-in collection restricters
//!
//! The catalog the autoupdate core needs. Further collections plug in
//! through [`Restricter::register`](crate::Restricter::register).

mod chat;
mod group;
mod meeting;
mod personal_note;
mod projection;
mod user;

use std::sync::Arc;

use crate::collection::Collection;

pub use chat::{ChatGroup, ChatMessage};
pub use group::Group;
pub use meeting::Meeting;
pub use personal_note::PersonalNote;
pub use projection::Projection;
pub use user::User;

/// The built-in catalog.
pub fn defaults() -> Vec<Arc<dyn Collection>> {
    vec![
        Arc::new(Meeting),
        Arc::new(Group),
        Arc::new(User),
        Arc::new(ChatGroup),
        Arc::new(ChatMessage),
        Arc::new(PersonalNote),
        Arc::new(Projection),
    ]
}
