//! # strata-orm-macro
//!
//! Procedural macros for strata-orm.
//!
//! `#[derive(Entity)]` turns a struct holding a `strata_orm::Record` into an entity type.
//! Columns are never declared; only the table override, associations, vertical partitions
//! and serialized columns are:
//!
//! ```rust,ignore
//! #[derive(Entity)]
//! #[entity(table = "users", partition = "user_profiles", serialize = "settings")]
//! #[entity(has_many(posts, target = Post))]
//! #[entity(has_one(avatar, target = Image, foreign_key = "owner_id", strict))]
//! #[entity(has_and_belongs_to_many(groups, target = Group))]
//! pub struct User {
//!     record: Record,
//!     display_name: String,
//! }
//! ```
//!
//! Fields other than the record are filled with `Default::default()` when an entity is
//! loaded. `custom_hooks` skips the generated empty `Lifecycle` impl.

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod attrs;
mod derive_entity;

#[proc_macro_derive(Entity, attributes(entity))]
pub fn entity_derive(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    derive_entity::expand(ast).unwrap_or_else(syn::Error::into_compile_error).into()
}
