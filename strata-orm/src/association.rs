//! # Association Module
//!
//! Declared relationships between entity types and their lazy, memoized resolution.
//!
//! Each association is declared once per type and resolved on first access. The result is
//! memoized on the owning [`Record`] together with the key it was resolved for: the owner's
//! id for `has_one`/`has_many`/`has_and_belongs_to_many`, and the foreign key value for
//! `belongs_to`. When the key changes the memo is discarded and the association resolves
//! again.
//!
//! Collections returned by `has_many` and `has_and_belongs_to_many` are themselves lazy and
//! run no query until they are iterated or counted.

use std::any::Any;

use crate::{
    collection::{Conditions, RecordCollection},
    context::Context,
    entity::{AssociateRef, Entity},
    naming::Naming,
    record::{ActiveRecord, Record},
    value::Value,
    Error,
};

// ============================================================================
// Declarations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// The target holds `<model>_id` pointing at the owner.
    HasOne,
    /// The owner holds `<association>_id` pointing at the target.
    BelongsTo,
    HasMany,
    /// Linked through a join table holding both keys.
    ManyToMany,
}

impl AssociationKind {
    pub fn is_one_to_one(self) -> bool {
        matches!(self, AssociationKind::HasOne | AssociationKind::BelongsTo)
    }
}

/// Per-association overrides. Everything left unset is derived by naming convention.
#[derive(Debug, Clone, Default)]
pub struct AssociationOptions {
    pub(crate) target: Option<String>,
    pub(crate) foreign_key: Option<String>,
    pub(crate) join_table: Option<String>,
    pub(crate) partner_key: Option<String>,
    pub(crate) conditions: Conditions,
    pub(crate) strict: bool,
}

impl AssociationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered name of the target entity type.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = Some(column.into());
        self
    }

    pub fn join_table(mut self, table: impl Into<String>) -> Self {
        self.join_table = Some(table.into());
        self
    }

    /// Join table column pointing at the target (many-to-many only).
    pub fn partner_key(mut self, column: impl Into<String>) -> Self {
        self.partner_key = Some(column.into());
        self
    }

    /// Extra conditions narrowing every resolution of the association.
    pub fn conditions(mut self, conditions: impl Into<Conditions>) -> Self {
        self.conditions = conditions.into();
        self
    }

    /// Makes a `has_one` fail with [`Error::NotUnique`] when more than one row matches.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// A declared association with every name resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationSpec {
    pub name: String,
    pub kind: AssociationKind,
    pub target: String,
    pub foreign_key: String,
    pub join_table: Option<String>,
    pub partner_key: Option<String>,
    pub conditions: Conditions,
    pub strict: bool,
}

impl AssociationSpec {
    pub(crate) fn resolve(
        name: String,
        kind: AssociationKind,
        options: AssociationOptions,
        owner_model: &str,
        owner_table: &str,
        naming: &dyn Naming,
    ) -> Self {
        let target = options.target.unwrap_or_else(|| match kind {
            AssociationKind::HasOne | AssociationKind::BelongsTo => naming.camelize(&name),
            AssociationKind::HasMany => naming.camelize(&naming.singularize(&name)),
            AssociationKind::ManyToMany => naming.classify(&name),
        });

        let foreign_key = options.foreign_key.unwrap_or_else(|| match kind {
            AssociationKind::BelongsTo => format!("{name}_id"),
            _ => format!("{owner_model}_id"),
        });

        let (join_table, partner_key) = if kind == AssociationKind::ManyToMany {
            let join = options.join_table.unwrap_or_else(|| {
                let mut tables = [naming.tableize(&target), owner_table.to_string()];
                tables.sort();
                tables.join("_")
            });
            let partner = options.partner_key.unwrap_or_else(|| format!("{}_id", naming.underscore(&target)));
            (Some(join), Some(partner))
        } else {
            (None, None)
        };

        Self {
            name,
            kind,
            target,
            foreign_key,
            join_table,
            partner_key,
            conditions: options.conditions,
            strict: options.strict,
        }
    }
}

// ============================================================================
// Memoized Results
// ============================================================================

/// A memoized association result and the key it was resolved for.
pub(crate) struct Slot {
    pub(crate) key: i64,
    pub(crate) state: SlotState,
}

pub(crate) enum SlotState {
    /// A one-to-one associate hydrated from joined columns, not yet wrapped in its type.
    Preloaded(Option<Record>),
    /// A typed result: `Option<U>` for one-to-one, `RecordCollection<U>` for collections.
    Loaded(Box<dyn Any + Send + Sync>),
}

impl Slot {
    pub(crate) fn preloaded(key: i64, record: Option<Record>) -> Self {
        Self { key, state: SlotState::Preloaded(record) }
    }

    fn loaded<V: Any + Send + Sync>(key: i64, value: V) -> Self {
        Self { key, state: SlotState::Loaded(Box::new(value)) }
    }
}

// ============================================================================
// Resolution
// ============================================================================

impl Record {
    fn association_spec(&self, ctx: &Context, name: &str, target: &str) -> Result<AssociationSpec, Error> {
        let spec = self.kind().association(name).ok_or_else(|| {
            Error::configuration(format!("{} declares no association `{name}`", self.kind().name))
        })?;
        if spec.target != target {
            return Err(Error::configuration(format!(
                "association `{}.{name}` targets `{}`, not `{target}`",
                self.kind().name,
                spec.target
            )));
        }
        ctx.entity_type(&spec.target)?;
        Ok(spec.clone())
    }

    fn ensure_kind(&self, spec: &AssociationSpec, expected: AssociationKind) -> Result<(), Error> {
        if spec.kind == expected {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "association `{}.{}` is {:?}, not {expected:?}",
                self.kind().name,
                spec.name,
                spec.kind
            )))
        }
    }

    fn slot_is_current(&self, name: &str, key: i64) -> bool {
        self.slots.get(name).is_some_and(|slot| slot.key == key)
    }

    /// The back-reference an associate loaded through `association` carries.
    pub(crate) fn associate_for(&self, association: &str) -> AssociateRef {
        AssociateRef { entity: self.kind().name, id: self.id(), association: Some(association.to_string()) }
    }

    /// Drops the memoized result of `association`.
    pub fn forget(&mut self, association: &str) {
        self.slots.remove(association);
    }

    /// Typed view of a one-to-one slot. A preloaded record is wrapped on first access.
    fn one_to_one<U: Entity>(&mut self, name: &str) -> Result<Option<&mut U>, Error> {
        let Some(slot) = self.slots.get_mut(name) else {
            return Ok(None);
        };

        if let SlotState::Preloaded(record) = &mut slot.state {
            let associate = record.take().map(|record| {
                let mut associate = U::from_record(record);
                associate.rebuild();
                associate
            });
            slot.state = SlotState::Loaded(Box::new(associate));
        }

        match &mut slot.state {
            SlotState::Loaded(value) => value
                .downcast_mut::<Option<U>>()
                .map(Option::as_mut)
                .ok_or_else(|| Error::configuration(format!("association `{name}` was resolved as another type"))),
            SlotState::Preloaded(_) => Ok(None),
        }
    }

    fn collection<U: Entity>(&mut self, name: &str) -> Result<&mut RecordCollection<U>, Error> {
        match self.slots.get_mut(name).map(|slot| &mut slot.state) {
            Some(SlotState::Loaded(value)) => value
                .downcast_mut::<RecordCollection<U>>()
                .ok_or_else(|| Error::configuration(format!("association `{name}` was resolved as another type"))),
            _ => Err(Error::configuration(format!("association `{name}` holds no collection"))),
        }
    }

    /// Resolves a `has_one` association: the newest row of the target whose foreign key
    /// equals this record's id.
    pub async fn has_one<U: Entity>(&mut self, ctx: &Context, name: &str) -> Result<Option<&mut U>, Error> {
        let spec = self.association_spec(ctx, name, U::NAME)?;
        self.ensure_kind(&spec, AssociationKind::HasOne)?;

        let key = self.id();
        if key == 0 {
            self.forget(name);
            return Ok(None);
        }

        if !self.slot_is_current(name, key) {
            let mut found = U::find(ctx, Conditions::eq(spec.foreign_key.clone(), key))?;
            found.narrow(spec.conditions.clone());
            found.descending();

            if spec.strict || ctx.settings().strict_has_one {
                let count = found.count_all(ctx).await?;
                if count > 1 {
                    return Err(Error::NotUnique { association: format!("{}.{name}", self.kind().name), count });
                }
            }

            let mut associate = found.first(ctx).await?;
            if let Some(associate) = associate.as_mut() {
                associate.record_mut().set_associate_ref(Some(self.associate_for(name)));
            }
            self.slots.insert(name.to_string(), Slot::loaded(key, associate));
        }

        self.one_to_one(name)
    }

    /// Resolves a `belongs_to` association through this record's foreign key column.
    pub async fn belongs_to<U: Entity>(&mut self, ctx: &Context, name: &str) -> Result<Option<&mut U>, Error> {
        let spec = self.association_spec(ctx, name, U::NAME)?;
        self.ensure_kind(&spec, AssociationKind::BelongsTo)?;

        let key = self.get(&spec.foreign_key).and_then(Value::as_i64).unwrap_or(0);
        if key == 0 {
            self.forget(name);
            return Ok(None);
        }

        if !self.slot_is_current(name, key) {
            let mut found = U::find(ctx, Conditions::eq("id", key))?;
            found.narrow(spec.conditions.clone());
            found.descending();

            let mut associate = found.first(ctx).await?;
            if let Some(associate) = associate.as_mut() {
                associate.record_mut().set_associate_ref(Some(self.associate_for(name)));
            }
            self.slots.insert(name.to_string(), Slot::loaded(key, associate));
        }

        self.one_to_one(name)
    }

    /// Resolves a `has_many` association into a lazy collection. No query runs here.
    ///
    /// A record without an id gets a collection matching `<fk> = 0`, which is empty.
    pub fn has_many<U: Entity>(&mut self, ctx: &Context, name: &str) -> Result<&mut RecordCollection<U>, Error> {
        let spec = self.association_spec(ctx, name, U::NAME)?;
        self.ensure_kind(&spec, AssociationKind::HasMany)?;

        let key = self.id();
        if !self.slot_is_current(name, key) {
            let mut collection = U::find(ctx, Conditions::eq(spec.foreign_key.clone(), key))?;
            collection.narrow(spec.conditions.clone());
            collection.set_associate(Some(self.associate_for(name)));
            self.slots.insert(name.to_string(), Slot::loaded(key, collection));
        }

        self.collection(name)
    }

    /// Resolves a many-to-many association into a lazy collection joined through the join
    /// table. `None` while this record has no id.
    pub fn has_and_belongs_to_many<U: Entity>(
        &mut self,
        ctx: &Context,
        name: &str,
    ) -> Result<Option<&mut RecordCollection<U>>, Error> {
        let spec = self.association_spec(ctx, name, U::NAME)?;
        self.ensure_kind(&spec, AssociationKind::ManyToMany)?;

        let target = ctx.entity_type(U::NAME)?;
        let symmetric = target
            .associations
            .iter()
            .any(|a| a.kind == AssociationKind::ManyToMany && a.target == self.kind().name);
        if !symmetric {
            return Err(Error::configuration(format!(
                "{} declares no has_and_belongs_to_many association back to {}",
                U::NAME,
                self.kind().name
            )));
        }

        let key = self.id();
        if key == 0 {
            self.forget(name);
            return Ok(None);
        }

        if !self.slot_is_current(name, key) {
            let (Some(join), Some(partner)) = (spec.join_table.as_deref(), spec.partner_key.as_deref()) else {
                return Err(Error::configuration(format!("association `{name}` has no join table")));
            };

            let mut collection = U::find(ctx, Conditions::raw(format!("{join}.{} = {key}", spec.foreign_key)))?;
            collection.join(format!("INNER JOIN {join} ON {join}.{partner} = {}.id", target.table));
            collection.narrow(spec.conditions.clone());
            collection.set_associate(Some(self.associate_for(name)));
            self.slots.insert(name.to_string(), Slot::loaded(key, collection));
        }

        self.collection(name).map(Some)
    }
}
