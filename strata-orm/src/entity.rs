//! # Entity Module
//!
//! Entity declarations and the traits every entity type implements.
//!
//! An entity type declares its associations, vertical partitions and serialized columns once
//! through an [`EntityDeclaration`]. Registering the type on a [`crate::Context`] resolves the
//! declaration into an [`EntityType`]: table name, foreign keys and join tables are derived
//! through the context's naming utility. Column names and types are not declared at all; they
//! come from the live schema.
//!
//! The `#[derive(Entity)]` macro implements [`Entity`] (and, unless told otherwise,
//! [`Lifecycle`]) for a struct wrapping a [`Record`].
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_orm::{Entity, Record};
//!
//! #[derive(Entity)]
//! #[entity(has_many(comments, target = Comment))]
//! #[entity(belongs_to(author, target = User, foreign_key = "user_id"))]
//! pub struct Post(Record);
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    association::{AssociationKind, AssociationOptions, AssociationSpec},
    codec::{ColumnCodec, JsonCodec},
    naming::Naming,
    partition::PartitionSpec,
    record::Record,
    Error,
};

// ============================================================================
// Lifecycle Hooks
// ============================================================================

/// Hooks invoked around loading and persistence. Every hook defaults to a no-op, except
/// [`Lifecycle::after_save`] which calls [`Lifecycle::rebuild`].
pub trait Lifecycle {
    /// Called on freshly constructed blank entities.
    fn defaults(&mut self) {}

    /// Re-derives computed state. Called after an entity is loaded from a row and,
    /// through the default `after_save`, after every successful save.
    fn rebuild(&mut self) {}

    fn before_save(&mut self) {}

    fn after_save(&mut self) {
        self.rebuild();
    }

    fn before_destroy(&mut self) {}
}

// ============================================================================
// Entity Trait
// ============================================================================

/// A logical entity type backed by a [`Record`].
///
/// This trait is typically implemented via `#[derive(Entity)]`.
pub trait Entity: Lifecycle + Send + Sync + Sized + 'static {
    /// Registry key of the type, usually the struct name.
    const NAME: &'static str;

    /// Declares associations, partitions and serialized columns.
    fn declare() -> EntityDeclaration;

    fn from_record(record: Record) -> Self;

    fn record(&self) -> &Record;

    fn record_mut(&mut self) -> &mut Record;

    fn into_record(self) -> Record;
}

// ============================================================================
// Declarations
// ============================================================================

/// Metadata declared once per entity type.
#[derive(Debug, Clone)]
pub struct EntityDeclaration {
    pub(crate) name: &'static str,
    pub(crate) table: Option<String>,
    pub(crate) associations: Vec<(String, AssociationKind, AssociationOptions)>,
    pub(crate) partitions: Vec<String>,
    pub(crate) codecs: Vec<(String, Arc<dyn ColumnCodec>)>,
}

impl EntityDeclaration {
    pub fn new(name: &'static str) -> Self {
        Self { name, table: None, associations: Vec::new(), partitions: Vec::new(), codecs: Vec::new() }
    }

    /// Overrides the table name derived from the type name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn has_one(self, name: impl Into<String>, options: AssociationOptions) -> Self {
        self.associate(name, AssociationKind::HasOne, options)
    }

    pub fn belongs_to(self, name: impl Into<String>, options: AssociationOptions) -> Self {
        self.associate(name, AssociationKind::BelongsTo, options)
    }

    pub fn has_many(self, name: impl Into<String>, options: AssociationOptions) -> Self {
        self.associate(name, AssociationKind::HasMany, options)
    }

    /// The partner type must declare the symmetric association.
    pub fn has_and_belongs_to_many(self, name: impl Into<String>, options: AssociationOptions) -> Self {
        self.associate(name, AssociationKind::ManyToMany, options)
    }

    fn associate(mut self, name: impl Into<String>, kind: AssociationKind, options: AssociationOptions) -> Self {
        self.associations.push((name.into(), kind, options));
        self
    }

    /// Adds a vertical partition table holding part of this entity's columns.
    pub fn vertical_partition(mut self, table: impl Into<String>) -> Self {
        self.partitions.push(table.into());
        self
    }

    /// Stores `column` as a JSON document.
    pub fn serialize(self, column: impl Into<String>) -> Self {
        self.serialize_with(column, JsonCodec)
    }

    pub fn serialize_with(mut self, column: impl Into<String>, codec: impl ColumnCodec + 'static) -> Self {
        self.codecs.push((column.into(), Arc::new(codec)));
        self
    }
}

// ============================================================================
// Resolved Entity Types
// ============================================================================

/// A registered entity type with every name resolved.
pub struct EntityType {
    pub name: &'static str,
    /// Underscored type name, the base of default foreign keys (`blog_post` -> `blog_post_id`).
    pub model: String,
    pub table: String,
    pub associations: Vec<AssociationSpec>,
    pub partition: Option<PartitionSpec>,
    codecs: HashMap<String, Arc<dyn ColumnCodec>>,
}

impl EntityType {
    pub(crate) fn resolve(declaration: EntityDeclaration, naming: &dyn Naming) -> Result<Self, Error> {
        let EntityDeclaration { name, table, associations, partitions, codecs } = declaration;

        let model = naming.underscore(name);
        let table = table.unwrap_or_else(|| naming.tableize(name));

        let mut specs: Vec<AssociationSpec> = Vec::with_capacity(associations.len());
        for (association, kind, options) in associations {
            if specs.iter().any(|s| s.name == association) {
                return Err(Error::configuration(format!("{name} declares association `{association}` twice")));
            }
            specs.push(AssociationSpec::resolve(association, kind, options, &model, &table, naming));
        }

        let partition = if partitions.is_empty() {
            None
        } else {
            Some(PartitionSpec { foreign_key: format!("{}_id", naming.singularize(&table)), tables: partitions })
        };

        Ok(Self { name, model, table, associations: specs, partition, codecs: codecs.into_iter().collect() })
    }

    pub fn association(&self, name: &str) -> Option<&AssociationSpec> {
        self.associations.iter().find(|a| a.name == name)
    }

    pub fn codec(&self, column: &str) -> Option<&Arc<dyn ColumnCodec>> {
        self.codecs.get(column)
    }

    pub fn is_partitioned(&self) -> bool {
        self.partition.is_some()
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("associations", &self.associations)
            .field("partition", &self.partition)
            .field("codecs", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Non-owning back-reference to the entity that caused another one to be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRef {
    pub entity: &'static str,
    pub id: i64,
    /// The owner's association that produced the reference, when known.
    pub association: Option<String>,
}
