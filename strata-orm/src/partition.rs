//! # Partition Module
//!
//! Vertical partitioning: one logical entity whose columns are spread over a main table
//! and one or more partition tables linked by `<singular main table>_id`.
//!
//! Partition tables are introspected once per entity type into a [`PartitionMap`]. A
//! partition row is loaded on the first read of one of its columns
//! ([`Record::resolve_column`]); tables that are never touched are never queried. Writes of
//! partitioned entities run inside a [`TransactionScope`]:
//!
//! - INSERT writes the main row, then one row per partition table with the new id
//! - UPDATE writes the main row, then only the partition tables with changed columns,
//!   inserting a partition row that turns out to be missing
//! - DESTROY deletes the main row and every partition row
//!
//! A partition column whose name also exists on the main table (or is the link column
//! itself) always resolves to the main table.

use std::{collections::HashMap, sync::Arc};

use crate::{
    context::Context,
    database::DatabaseHandle,
    entity::EntityType,
    record::{decode_column, insert_statement, Record, CREATED_AT, UPDATED_AT},
    schema::TableSchema,
    transaction::TransactionScope,
    value::{LogicalType, RawValue, Value},
    Error,
};

/// Declared partition tables of an entity type and the column linking them to the main table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub tables: Vec<String>,
    pub foreign_key: String,
}

/// Column ownership across the partition tables of one entity type.
#[derive(Debug, Clone, Default)]
pub struct PartitionMap {
    foreign_key: String,
    tables: Vec<Arc<TableSchema>>,
    owners: HashMap<String, usize>,
}

impl PartitionMap {
    /// Introspects the main table and every partition table of `kind`.
    pub(crate) async fn build(ctx: &Context, kind: &EntityType) -> Result<Self, Error> {
        let spec = kind
            .partition
            .as_ref()
            .ok_or_else(|| Error::configuration(format!("{} declares no vertical partitions", kind.name)))?;

        let main = ctx.schema().table(ctx.db(), &kind.table).await?;
        let mut map = Self { foreign_key: spec.foreign_key.clone(), tables: Vec::new(), owners: HashMap::new() };

        for table in &spec.tables {
            let schema = ctx.schema().table(ctx.db(), table).await?;
            if !schema.has_column(&spec.foreign_key) {
                return Err(Error::schema(table, format!("partition table has no `{}` column", spec.foreign_key)));
            }

            let index = map.tables.len();
            for column in schema.column_names() {
                if column == spec.foreign_key || main.has_column(column) || map.owners.contains_key(column) {
                    continue;
                }
                map.owners.insert(column.to_string(), index);
            }
            map.tables.push(schema);
        }

        log::debug!("mapped {} partition columns of {}", map.owners.len(), kind.name);
        Ok(map)
    }

    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// The partition table owning `column`.
    pub fn owner(&self, column: &str) -> Option<&str> {
        self.owners.get(column).map(|&i| self.tables[i].name.as_str())
    }

    /// Columns owned by `table`, in schema order.
    pub fn owned_columns(&self, table: &str) -> Vec<(&str, LogicalType)> {
        let Some(index) = self.tables.iter().position(|t| t.name == table) else {
            return Vec::new();
        };
        self.tables[index]
            .columns
            .iter()
            .filter(|c| self.owners.get(&c.name) == Some(&index))
            .map(|c| (c.name.as_str(), c.logical_type))
            .collect()
    }

    fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables.iter().any(|t| t.name == table && t.has_column(column))
    }
}

// ============================================================================
// Lazy Column Resolution
// ============================================================================

impl Record {
    /// Value of `column`, loading the owning partition row on first access.
    ///
    /// Unsaved records get zero values for the whole partition table instead of a query.
    /// `None` when no table of the entity has the column.
    pub async fn resolve_column(&mut self, ctx: &Context, column: &str) -> Result<Option<&Value>, Error> {
        if self.get(column).is_none() && self.kind().is_partitioned() {
            let map = ctx.partition_map(self.kind()).await?;
            if let Some(table) = map.owner(column).map(str::to_string) {
                if !self.loaded_partitions.contains(&table) {
                    self.load_partition(ctx, &map, &table).await?;
                }
            }
        }
        Ok(self.get(column))
    }

    /// The partition map of this record's entity type.
    pub async fn partition_map(&self, ctx: &Context) -> Result<Arc<PartitionMap>, Error> {
        ctx.partition_map(self.kind()).await
    }

    async fn load_partition(&mut self, ctx: &Context, map: &PartitionMap, table: &str) -> Result<(), Error> {
        let owned = map.owned_columns(table);

        if !self.exists() {
            for (column, ty) in owned {
                self.insert_if_absent(column, ty.zero());
            }
            self.loaded_partitions.insert(table.to_string());
            return Ok(());
        }

        let sql = format!("SELECT * FROM {table} WHERE {} = {} LIMIT 1", map.foreign_key(), self.id());
        let rows = match ctx.db().fetch_rows(&sql).await {
            Ok(rows) => rows,
            Err(e) if e.is_query() => {
                log::warn!("loading partition `{table}` of {}#{} failed: {e}", self.kind().name, self.id());
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match rows.first() {
            Some(row) => {
                for (column, ty) in owned {
                    let raw = row.get(column).unwrap_or(&RawValue::Null);
                    let value = decode_column(self.kind(), column, raw, ty)?;
                    self.set_persisted_value(column, value.clone());
                    self.insert_if_absent(column, value);
                }
            }
            None => log::debug!("{}#{} has no `{table}` row", self.kind().name, self.id()),
        }

        self.loaded_partitions.insert(table.to_string());
        Ok(())
    }
}

// ============================================================================
// Transactional Writes
// ============================================================================

pub(crate) async fn save_partitioned(record: &mut Record, ctx: &Context) -> Result<(), Error> {
    let map = ctx.partition_map(record.kind()).await?;
    let (prior_exists, prior_id) = (record.exists(), record.get("id").cloned());

    let scope = TransactionScope::begin(ctx.db()).await?;
    let written = write_partitioned(record, scope.handle(), &map).await;
    let outcome = match written {
        Ok(()) => scope.commit().await,
        Err(e) => {
            if let Err(rollback) = scope.rollback().await {
                log::warn!("rollback failed: {rollback}");
            }
            Err(e)
        }
    };

    match outcome {
        Ok(()) => {
            record.mark_persisted();
            Ok(())
        }
        Err(e) => {
            // the INSERT may have assigned an id that was never committed
            if !prior_exists {
                record.force_unsaved(prior_id.unwrap_or_default());
            }
            Err(e)
        }
    }
}

async fn write_partitioned(record: &mut Record, db: &dyn DatabaseHandle, map: &PartitionMap) -> Result<(), Error> {
    if !record.exists() {
        record.insert_main(db).await?;
        for table in map.tables() {
            insert_partition_row(record, db, map, table).await?;
        }
        return Ok(());
    }

    let dirty: Vec<&str> = map
        .tables()
        .filter(|table| map.owned_columns(table).iter().any(|(column, _)| record.is_dirty(column)))
        .collect();

    record.update_main(db, !dirty.is_empty()).await?;

    for table in dirty {
        let mut assignments = Vec::new();
        for (column, ty) in map.owned_columns(table) {
            if let Some(value) = record.get(column) {
                assignments.push(format!("{column} = {}", record.literal(db, column, ty, value)?));
            }
        }
        if map.has_column(table, UPDATED_AT) {
            assignments.push(format!("{UPDATED_AT} = CURRENT_TIMESTAMP"));
        }
        let link = format!("{} = {}", map.foreign_key(), record.id());
        let updated = db.execute(&format!("UPDATE {table} SET {} WHERE {link}", assignments.join(", "))).await?;

        // MySQL counts changed rows, not matched ones
        if updated.rows_affected == 0 {
            let existing = db.fetch_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE {link}")).await?;
            if existing.as_i64().unwrap_or(0) == 0 {
                log::warn!("{}#{} had no `{table}` row, inserting it", record.kind().name, record.id());
                insert_partition_row(record, db, map, table).await?;
            }
        }
    }
    Ok(())
}

/// INSERTs the `table` row of a saved record with every owned column that has a value.
async fn insert_partition_row(record: &Record, db: &dyn DatabaseHandle, map: &PartitionMap, table: &str) -> Result<(), Error> {
    let mut fields = vec![map.foreign_key().to_string()];
    let mut literals = vec![record.id().to_string()];
    for (column, ty) in map.owned_columns(table) {
        if let Some(value) = record.get(column).filter(|v| !v.is_empty()) {
            fields.push(column.to_string());
            literals.push(record.literal(db, column, ty, value)?);
        }
    }
    if map.has_column(table, CREATED_AT) {
        fields.push(CREATED_AT.to_string());
        literals.push("CURRENT_TIMESTAMP".to_string());
    }
    db.execute(&insert_statement(db.driver(), table, &fields, &literals)).await?;
    Ok(())
}

pub(crate) async fn destroy_partitioned(record: &mut Record, ctx: &Context) -> Result<(), Error> {
    let spec = record
        .kind()
        .partition
        .clone()
        .ok_or_else(|| Error::configuration(format!("{} declares no vertical partitions", record.kind().name)))?;
    let id = record.id();

    let scope = TransactionScope::begin(ctx.db()).await?;
    let db = scope.handle();
    let deleted: Result<(), Error> = async {
        db.execute(&format!("DELETE FROM {} WHERE id = {id}", record.table())).await?;
        for table in &spec.tables {
            db.execute(&format!("DELETE FROM {table} WHERE {} = {id}", spec.foreign_key)).await?;
        }
        Ok(())
    }
    .await;

    match deleted {
        Ok(()) => {
            scope.commit().await?;
            record.clear();
            Ok(())
        }
        Err(e) => {
            if let Err(rollback) = scope.rollback().await {
                log::warn!("rollback failed: {rollback}");
            }
            Err(e)
        }
    }
}
