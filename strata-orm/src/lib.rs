//! # strata-orm
//!
//! A schema-introspecting, lazily evaluated ORM built on top of sqlx.
//!
//! Entity types declare only their relationships. Columns and their types come from the live
//! schema, associations resolve on first access and are memoized, query results are
//! re-configurable collections that hit the database only when iterated, and one logical
//! entity may span several physical tables (vertical partitioning).
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata_orm::{ActiveRecord, Conditions, Context, Database, Entity, Record};
//!
//! #[derive(Entity)]
//! #[entity(has_many(comments, target = Comment))]
//! pub struct Post(Record);
//!
//! #[derive(Entity)]
//! #[entity(belongs_to(post, target = Post))]
//! pub struct Comment(Record);
//!
//! let db = Database::connect("sqlite::memory:").await?;
//! let ctx = Context::new(db);
//! ctx.register::<Post>()?;
//! ctx.register::<Comment>()?;
//!
//! let mut post = Post::blank(&ctx).await?;
//! post.record_mut().set("title", "Hello");
//! post.save(&ctx).await?;
//!
//! let comments = post.comments(&ctx)?;
//! println!("{} comments", comments.count(&ctx).await?);
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod association;
pub mod codec;
pub mod collection;
pub mod context;
pub mod database;
pub mod entity;
pub mod error;
pub mod naming;
pub mod pagination;
pub mod partition;
pub mod record;
pub mod schema;
pub mod transaction;
pub mod value;

// ============================================================================
// Public Re-exports
// ============================================================================

/// Derive macro implementing [`Entity`] for a struct wrapping a [`Record`].
pub use strata_orm_macro::Entity;

pub use association::{AssociationKind, AssociationOptions, AssociationSpec};
pub use codec::{ColumnCodec, JsonCodec};
pub use collection::{Conditions, Order, RecordCollection};
pub use context::{Context, ContextBuilder, Settings};
pub use database::{Database, DatabaseBuilder, DatabaseHandle, Drivers, ExecOutcome, Row};
pub use entity::{AssociateRef, Entity, EntityDeclaration, EntityType, Lifecycle};
pub use error::Error;
pub use naming::{Inflector, Naming};
pub use pagination::{Paginated, Pagination};
pub use partition::{PartitionMap, PartitionSpec};
pub use record::{ActiveRecord, Record};
pub use schema::{ColumnSchema, SchemaIntrospector, TableSchema};
pub use transaction::{Transaction, TransactionScope};
pub use value::{LogicalType, RawValue, Value};
