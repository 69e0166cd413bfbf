//! # Record Module
//!
//! [`Record`] holds one entity's column values, existence state, association memos and
//! partition bookkeeping. [`ActiveRecord`] adds finders and persistence to every
//! [`Entity`].
//!
//! Column values are keyed by the live schema's column names and always carry the column's
//! logical type. The `id` column lives in the value map like any other; a record with
//! `exists() == true` always has a non-zero id.
//!
//! # Persistence
//!
//! - A new record is INSERTed; empty values are left to the database defaults and
//!   `created_at` is stamped with `CURRENT_TIMESTAMP` when the table has it.
//! - An existing record is UPDATEd only when a value changed since it was loaded or saved;
//!   `updated_at` is stamped, `created_at` is never rewritten.
//! - Statement failures on single-table entities are logged and reported as `Ok(false)`.
//!   Partitioned entities write inside a transaction and return the error.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Serialize, Serializer};

use crate::{
    association::{AssociationKind, Slot},
    collection::{Conditions, RecordCollection},
    context::Context,
    database::{DatabaseHandle, Drivers, Row},
    entity::{AssociateRef, Entity, EntityType},
    partition,
    schema::TableSchema,
    value::{LogicalType, RawValue, Value},
    Error,
};

pub(crate) const CREATED_AT: &str = "created_at";
pub(crate) const UPDATED_AT: &str = "updated_at";

// ============================================================================
// Record
// ============================================================================

/// Column values and state of one entity instance.
pub struct Record {
    kind: Arc<EntityType>,
    schema: Arc<TableSchema>,
    values: HashMap<String, Value>,
    /// Values as last read from or written to the database.
    persisted: HashMap<String, Value>,
    exists: bool,
    associate: Option<AssociateRef>,
    pub(crate) slots: HashMap<String, Slot>,
    pub(crate) loaded_partitions: HashSet<String>,
}

impl Record {
    /// A blank record: every main-table column NULL, not persisted.
    pub fn blank(kind: Arc<EntityType>, schema: Arc<TableSchema>) -> Self {
        let values = schema.column_names().map(|name| (name.to_string(), Value::Null)).collect();
        Self {
            kind,
            schema,
            values,
            persisted: HashMap::new(),
            exists: false,
            associate: None,
            slots: HashMap::new(),
            loaded_partitions: HashSet::new(),
        }
    }

    /// Hydrates a persisted record from a result row. Columns starting with one of
    /// `skip_prefixes` belong to joined associates and are left out.
    pub(crate) fn from_row(
        kind: Arc<EntityType>,
        schema: Arc<TableSchema>,
        row: &Row,
        column_types: &HashMap<String, LogicalType>,
        skip_prefixes: &[String],
    ) -> Result<Self, Error> {
        let mut record = Self::blank(kind, schema);

        for (meta, raw) in row.iter() {
            let name = meta.name.as_str();
            if skip_prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())) {
                continue;
            }
            let ty = column_types.get(name).copied().unwrap_or(LogicalType::String);
            let value = decode_column(&record.kind, name, raw, ty)?;
            record.values.insert(name.to_string(), value);
        }

        record.exists = true;
        record.persisted = record.values.clone();
        Ok(record)
    }

    /// Hydrates a joined associate from the `<prefix><column>` aliases of a row. `None` when
    /// the join found no row.
    pub(crate) fn from_prefixed(
        kind: Arc<EntityType>,
        schema: Arc<TableSchema>,
        row: &Row,
        prefix: &str,
    ) -> Result<Option<Self>, Error> {
        let mut record = Self::blank(kind, schema.clone());

        for column in &schema.columns {
            let raw = row.get(&format!("{prefix}{}", column.name)).unwrap_or(&RawValue::Null);
            let value = decode_column(&record.kind, &column.name, raw, column.logical_type)?;
            record.values.insert(column.name.clone(), value);
        }

        if record.id() == 0 {
            return Ok(None);
        }
        record.exists = true;
        record.persisted = record.values.clone();
        Ok(Some(record))
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn kind(&self) -> &Arc<EntityType> {
        &self.kind
    }

    pub fn table(&self) -> &str {
        &self.kind.table
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Main-table column names in schema order.
    pub fn columns(&self) -> Vec<&str> {
        self.schema.column_names().collect()
    }

    pub fn column_type(&self, column: &str) -> Option<LogicalType> {
        self.schema.column_type(column)
    }

    /// The record's id, 0 while unsaved.
    pub fn id(&self) -> i64 {
        self.values.get("id").and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn associate_ref(&self) -> Option<&AssociateRef> {
        self.associate.as_ref()
    }

    pub fn set_associate_ref(&mut self, associate: Option<AssociateRef>) {
        self.associate = associate;
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Value of a column already held by the record. Partition columns that were never
    /// loaded are absent; see [`Record::resolve_column`].
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Sets a column value. Values of main-table columns are reshaped into the column's
    /// logical type; serialized columns keep the value as given.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) {
        let value = value.into();
        let value = match self.schema.column_type(column) {
            Some(ty) if self.kind.codec(column).is_none() && !value.is_null() => value.conform(ty),
            _ => value,
        };
        self.values.insert(column.to_string(), value);
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    /// Whether `column` differs from its persisted value.
    pub fn is_dirty(&self, column: &str) -> bool {
        match (self.values.get(column), self.persisted.get(column)) {
            (Some(current), Some(persisted)) => current != persisted,
            (Some(current), None) => !current.is_null(),
            (None, _) => false,
        }
    }

    /// Copies every main-table column value present on `source` into this record.
    ///
    /// Returns `false` when `source` is of another entity type.
    pub fn merge(&mut self, source: &Record) -> bool {
        if source.kind.name != self.kind.name {
            return false;
        }
        for column in self.schema.column_names() {
            if let Some(value) = source.values.get(column) {
                self.values.insert(column.to_string(), value.clone());
            }
        }
        true
    }

    /// Copies the main-table columns present in a JSON object into this record.
    ///
    /// Returns `false` when `source` is not an object.
    pub fn merge_json(&mut self, source: &serde_json::Value) -> bool {
        let Some(object) = source.as_object() else {
            return false;
        };
        let columns: Vec<String> = self.schema.column_names().map(str::to_string).collect();
        for column in columns {
            if let Some(json) = object.get(&column) {
                let value = match self.kind.codec(&column) {
                    Some(_) => Value::Json(json.clone()),
                    None => Value::from_json(json),
                };
                self.set(&column, value);
            }
        }
        true
    }

    /// JSON object of every value the record holds.
    pub fn to_json(&self) -> serde_json::Value {
        let object = self.values.iter().map(|(column, value)| (column.clone(), value.to_json())).collect();
        serde_json::Value::Object(object)
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.exists = true;
        self.persisted = self.values.clone();
    }

    /// Resets the record after its rows were deleted.
    pub(crate) fn clear(&mut self) {
        for value in self.values.values_mut() {
            *value = Value::Null;
        }
        self.exists = false;
        self.persisted.clear();
        self.slots.clear();
        self.loaded_partitions.clear();
    }

    /// Restores the unsaved state after a rolled back INSERT.
    pub(crate) fn force_unsaved(&mut self, id: Value) {
        self.values.insert("id".to_string(), id);
        self.exists = false;
    }

    pub(crate) fn set_persisted_value(&mut self, column: &str, value: Value) {
        self.persisted.insert(column.to_string(), value);
    }

    pub(crate) fn insert_if_absent(&mut self, column: &str, value: Value) {
        self.values.entry(column.to_string()).or_insert(value);
    }

    /// SQL literal for a column value, encoded through the column's codec when it has one.
    pub(crate) fn literal(&self, db: &dyn DatabaseHandle, column: &str, ty: LogicalType, value: &Value) -> Result<String, Error> {
        match self.kind.codec(column) {
            Some(codec) => match codec.encode(value).map_err(|e| Error::codec(column, e))? {
                Some(text) => Ok(Value::Text(text).literal(db)),
                None => Ok("NULL".to_string()),
            },
            None if value.is_null() => Ok("NULL".to_string()),
            None => Ok(value.conform(ty).literal(db)),
        }
    }

    // ========================================================================
    // Main-table Writes
    // ========================================================================

    /// INSERTs the main-table row and assigns the generated id.
    pub(crate) async fn insert_main(&mut self, db: &dyn DatabaseHandle) -> Result<(), Error> {
        let mut fields = Vec::new();
        let mut literals = Vec::new();

        for column in &self.schema.columns {
            let name = column.name.as_str();
            if name == CREATED_AT || name == UPDATED_AT {
                continue;
            }
            let Some(value) = self.values.get(name) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            fields.push(name.to_string());
            literals.push(self.literal(db, name, column.logical_type, value)?);
        }
        if self.schema.has_column(CREATED_AT) {
            fields.push(CREATED_AT.to_string());
            literals.push("CURRENT_TIMESTAMP".to_string());
        }

        let sql = insert_statement(db.driver(), &self.kind.table, &fields, &literals);
        let id = insert_returning_id(db, &sql).await?;
        let id = if id == 0 { self.id() } else { id };
        if id == 0 {
            return Err(Error::query(sql, "no id was generated"));
        }

        self.values.insert("id".to_string(), Value::Int(id));
        self.exists = true;
        Ok(())
    }

    /// UPDATEs the main-table row when one of its columns changed. With `touch`, an
    /// unchanged row still gets its `updated_at` stamped.
    pub(crate) async fn update_main(&mut self, db: &dyn DatabaseHandle, touch: bool) -> Result<(), Error> {
        let writable: Vec<_> = self
            .schema
            .columns
            .iter()
            .filter(|c| !matches!(c.name.as_str(), "id" | CREATED_AT | UPDATED_AT))
            .collect();
        let dirty = writable.iter().any(|c| self.is_dirty(&c.name));
        let stamps = self.schema.has_column(UPDATED_AT);

        let mut assignments = Vec::new();
        if dirty {
            for column in &writable {
                if let Some(value) = self.values.get(&column.name) {
                    assignments.push(format!("{} = {}", column.name, self.literal(db, &column.name, column.logical_type, value)?));
                }
            }
        }
        if stamps && (dirty || touch) {
            assignments.push(format!("{UPDATED_AT} = CURRENT_TIMESTAMP"));
        }
        if assignments.is_empty() {
            log::debug!("{}#{} unchanged, skipping update", self.kind.name, self.id());
            return Ok(());
        }

        let sql = format!("UPDATE {} SET {} WHERE id = {}", self.kind.table, assignments.join(", "), self.id());
        db.execute(&sql).await?;
        Ok(())
    }

    /// Writes the main-table row of a single-table entity.
    pub(crate) async fn write(&mut self, ctx: &Context) -> Result<(), Error> {
        if self.exists {
            self.update_main(ctx.db(), false).await?;
        } else {
            self.insert_main(ctx.db()).await?;
        }
        self.mark_persisted();
        Ok(())
    }
}

/// Decodes a raw column value, through the entity's codec for serialized columns.
pub(crate) fn decode_column(kind: &EntityType, column: &str, raw: &RawValue, ty: LogicalType) -> Result<Value, Error> {
    match kind.codec(column) {
        Some(codec) => match raw.coerce(LogicalType::String) {
            Value::Text(text) => codec.decode(&text).map_err(|e| Error::codec(column, e)),
            _ => Ok(Value::Null),
        },
        None => Ok(raw.coerce(ty)),
    }
}

pub(crate) fn insert_statement(driver: Drivers, table: &str, fields: &[String], literals: &[String]) -> String {
    if fields.is_empty() {
        return match driver {
            Drivers::MySQL => format!("INSERT INTO {table} () VALUES ()"),
            Drivers::Postgres | Drivers::SQLite => format!("INSERT INTO {table} DEFAULT VALUES"),
        };
    }
    format!("INSERT INTO {table} ({}) VALUES ({})", fields.join(", "), literals.join(", "))
}

/// Runs an INSERT and returns the id it generated, 0 when none was reported.
pub(crate) async fn insert_returning_id(db: &dyn DatabaseHandle, sql: &str) -> Result<i64, Error> {
    if db.driver() == Drivers::Postgres {
        let returning = format!("{sql} RETURNING id");
        return Ok(db.fetch_scalar(&returning).await?.as_i64().unwrap_or(0));
    }
    let outcome = db.execute(sql).await?;
    Ok(outcome.last_insert_id.unwrap_or_else(|| db.last_insert_id()))
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("entity", &self.kind.name)
            .field("exists", &self.exists)
            .field("values", &self.values)
            .field("associate", &self.associate)
            .field("memoized", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

// ============================================================================
// ActiveRecord Trait
// ============================================================================

/// Finders and persistence, implemented for every [`Entity`].
#[async_trait]
pub trait ActiveRecord: Entity {
    /// A blank, unsaved entity with its `defaults` hook applied.
    async fn blank(ctx: &Context) -> Result<Self, Error>;

    /// A lazy collection of the entities matching `conditions`. No query runs here.
    fn find<C: Into<Conditions>>(ctx: &Context, conditions: C) -> Result<RecordCollection<Self>, Error>;

    fn all(ctx: &Context) -> Result<RecordCollection<Self>, Error> {
        Self::find(ctx, Conditions::all())
    }

    async fn find_by_id(ctx: &Context, id: i64) -> Result<Option<Self>, Error>;

    /// INSERTs or UPDATEs the entity. `Ok(false)` when the statement failed.
    async fn save(&mut self, ctx: &Context) -> Result<bool, Error>;

    /// Deletes the entity's rows. `Ok(false)` for entities that were never saved.
    async fn destroy(&mut self, ctx: &Context) -> Result<bool, Error>;

    /// Re-reads the main-table columns from the database.
    async fn refresh(&mut self, ctx: &Context) -> Result<bool, Error>;

    /// Links `other` through the association named `association`, or through the first
    /// association targeting `U` when no name is given.
    async fn associate<U: Entity>(&mut self, ctx: &Context, other: &mut U, association: Option<&str>) -> Result<bool, Error>;

    /// Undoes the link to the entity this one was loaded through.
    async fn disassociate(&mut self, ctx: &Context) -> Result<bool, Error>;
}

#[async_trait]
impl<T: Entity> ActiveRecord for T {
    async fn blank(ctx: &Context) -> Result<Self, Error> {
        let kind = ctx.entity_type(T::NAME)?;
        let schema = ctx.schema().table(ctx.db(), &kind.table).await?;
        let mut entity = T::from_record(Record::blank(kind, schema));
        entity.defaults();
        Ok(entity)
    }

    fn find<C: Into<Conditions>>(ctx: &Context, conditions: C) -> Result<RecordCollection<Self>, Error> {
        let kind = ctx.entity_type(T::NAME)?;
        let mut collection = RecordCollection::new(kind, ctx.settings().default_batch_size);
        collection.set_conditions(conditions);
        Ok(collection)
    }

    async fn find_by_id(ctx: &Context, id: i64) -> Result<Option<Self>, Error> {
        T::find(ctx, Conditions::eq("id", id))?.first(ctx).await
    }

    async fn save(&mut self, ctx: &Context) -> Result<bool, Error> {
        self.before_save();

        if self.record().kind().is_partitioned() {
            partition::save_partitioned(self.record_mut(), ctx).await?;
        } else if let Err(e) = self.record_mut().write(ctx).await {
            if !e.is_query() {
                return Err(e);
            }
            log::warn!("saving {}#{} failed: {e}", T::NAME, self.record().id());
            return Ok(false);
        }

        self.after_save();
        Ok(true)
    }

    async fn destroy(&mut self, ctx: &Context) -> Result<bool, Error> {
        if !self.record().exists() {
            return Ok(false);
        }
        self.before_destroy();

        if self.record().kind().is_partitioned() {
            partition::destroy_partitioned(self.record_mut(), ctx).await?;
            return Ok(true);
        }

        let sql = format!("DELETE FROM {} WHERE id = {}", self.record().table(), self.record().id());
        match ctx.db().execute(&sql).await {
            Ok(_) => {
                self.record_mut().clear();
                Ok(true)
            }
            Err(e) if e.is_query() => {
                log::warn!("destroying {}#{} failed: {e}", T::NAME, self.record().id());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh(&mut self, ctx: &Context) -> Result<bool, Error> {
        let id = self.record().id();
        if id == 0 {
            return Ok(false);
        }
        let Some(latest) = T::find_by_id(ctx, id).await? else {
            return Ok(false);
        };

        let latest = latest.into_record();
        let record = self.record_mut();
        record.merge(&latest);
        for column in latest.schema.column_names() {
            if let Some(value) = latest.values.get(column) {
                record.persisted.insert(column.to_string(), value.clone());
            }
        }
        record.exists = true;
        self.rebuild();
        Ok(true)
    }

    async fn associate<U: Entity>(&mut self, ctx: &Context, other: &mut U, association: Option<&str>) -> Result<bool, Error> {
        let kind = self.record().kind().clone();
        let spec = match association {
            Some(name) => {
                let spec = kind.association(name).ok_or_else(|| {
                    Error::configuration(format!("{} declares no association `{name}`", T::NAME))
                })?;
                if spec.target != U::NAME {
                    return Err(Error::configuration(format!(
                        "association `{}.{name}` targets `{}`, not `{}`",
                        T::NAME,
                        spec.target,
                        U::NAME
                    )));
                }
                spec.clone()
            }
            None => match kind.associations.iter().find(|a| a.target == U::NAME) {
                Some(spec) => spec.clone(),
                None => return Ok(false),
            },
        };

        let linked = match spec.kind {
            AssociationKind::HasOne | AssociationKind::HasMany => {
                if !self.record().exists() && !self.save(ctx).await? {
                    return Ok(false);
                }
                other.record_mut().set(&spec.foreign_key, self.record().id());
                other.save(ctx).await?
            }
            AssociationKind::BelongsTo => {
                if !other.record().exists() && !other.save(ctx).await? {
                    return Ok(false);
                }
                self.record_mut().set(&spec.foreign_key, other.record().id());
                self.save(ctx).await?
            }
            AssociationKind::ManyToMany => {
                if !self.record().exists() && !self.save(ctx).await? {
                    return Ok(false);
                }
                if !other.record().exists() && !other.save(ctx).await? {
                    return Ok(false);
                }
                let (Some(join), Some(partner)) = (spec.join_table.as_deref(), spec.partner_key.as_deref()) else {
                    return Err(Error::configuration(format!("association `{}` has no join table", spec.name)));
                };
                let sql = format!(
                    "INSERT INTO {join} ({}, {partner}) VALUES ({}, {})",
                    spec.foreign_key,
                    self.record().id(),
                    other.record().id()
                );
                match ctx.db().execute(&sql).await {
                    Ok(_) => true,
                    Err(e) if e.is_query() => {
                        log::warn!("linking {} to {} failed: {e}", T::NAME, U::NAME);
                        false
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        if linked {
            let owner = self.record().associate_for(&spec.name);
            other.record_mut().set_associate_ref(Some(owner));
            self.record_mut().forget(&spec.name);
        }
        Ok(linked)
    }

    async fn disassociate(&mut self, ctx: &Context) -> Result<bool, Error> {
        let Some(owner) = self.record().associate_ref().cloned() else {
            return Ok(false);
        };
        let owner_kind = ctx.entity_type(owner.entity)?;
        let spec = match owner.association.as_deref() {
            Some(name) => owner_kind.association(name),
            None => owner_kind.associations.iter().find(|a| a.target == T::NAME),
        };
        let Some(spec) = spec.cloned() else {
            return Ok(false);
        };

        let unlinked = match spec.kind {
            AssociationKind::HasOne | AssociationKind::HasMany => {
                self.record_mut().set(&spec.foreign_key, Value::Null);
                return self.save(ctx).await.map(|saved| {
                    if saved {
                        self.record_mut().set_associate_ref(None);
                    }
                    saved
                });
            }
            AssociationKind::BelongsTo => {
                format!("UPDATE {} SET {} = NULL WHERE id = {}", owner_kind.table, spec.foreign_key, owner.id)
            }
            AssociationKind::ManyToMany => {
                let (Some(join), Some(partner)) = (spec.join_table.as_deref(), spec.partner_key.as_deref()) else {
                    return Err(Error::configuration(format!("association `{}` has no join table", spec.name)));
                };
                format!(
                    "DELETE FROM {join} WHERE {} = {} AND {partner} = {}",
                    spec.foreign_key,
                    owner.id,
                    self.record().id()
                )
            }
        };

        match ctx.db().execute(&unlinked).await {
            Ok(_) => {
                self.record_mut().set_associate_ref(None);
                Ok(true)
            }
            Err(e) if e.is_query() => {
                log::warn!("unlinking {} from {} failed: {e}", T::NAME, owner.entity);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
