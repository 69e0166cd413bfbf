//! # Collection Module
//!
//! Lazy, re-configurable query results.
//!
//! A [`RecordCollection`] accumulates a predicate, ordering, batch window, joins and computed
//! columns without touching the database. The first access (`next`, `get`, `count`,
//! `into_vec`) builds one SELECT, runs it and buffers the raw rows; entities are hydrated
//! individually on first access. Any configuration change invalidates the buffered result
//! so the next access re-queries.
//!
//! Conditions are rendered as SQL with escaped literals:
//!
//! - a column map becomes `(table.a = 1 AND table.b IS NULL)`
//! - a raw predicate is used verbatim, parenthesized once combined with anything else
//! - [`RecordCollection::narrow`] ANDs, [`RecordCollection::widen`] ORs
//!
//! # Example
//!
//! ```rust,ignore
//! let mut drafts = Post::find(&ctx, Conditions::eq("status", "draft"))?;
//! drafts.widen(Conditions::eq("status", "pending"));
//! drafts.set_order("published_at", Order::Descending);
//! drafts.set_batch(1, 10);
//!
//! while let Some(post) = drafts.next(&ctx).await? {
//!     println!("{:?}", post.record().get("title"));
//! }
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    association::{AssociationKind, Slot},
    context::Context,
    database::{DatabaseHandle, Row},
    entity::{AssociateRef, Entity, EntityType},
    record::Record,
    schema::TableSchema,
    value::{LogicalType, Value},
    Error,
};

// ============================================================================
// Conditions
// ============================================================================

/// A predicate over one entity type's table.
///
/// Column conditions are qualified with the table name (or replaced by the expression of a
/// computed column of the same name) when rendered. Column names containing `.` or `(` are
/// used as given.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conditions {
    columns: Vec<(String, Value)>,
    predicates: Vec<String>,
}

impl Conditions {
    /// Matches every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn raw(predicate: impl Into<String>) -> Self {
        Self { columns: Vec::new(), predicates: vec![predicate.into()] }
    }

    /// `column = value`, or `column IS NULL` for [`Value::Null`].
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { columns: vec![(column.into(), value.into())], predicates: Vec::new() }
    }

    pub fn and_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.push((column.into(), value.into()));
        self
    }

    pub fn and_raw(mut self, predicate: impl Into<String>) -> Self {
        self.predicates.push(predicate.into());
        self
    }

    pub fn is_all(&self) -> bool {
        self.columns.is_empty() && self.predicates.iter().all(|p| p.trim().is_empty())
    }

    fn render(&self, table: &str, computed: &[(String, String)], db: &dyn DatabaseHandle) -> String {
        let mut parts = Vec::with_capacity(self.predicates.len() + 1);

        if !self.columns.is_empty() {
            let terms: Vec<String> = self
                .columns
                .iter()
                .map(|(column, value)| {
                    let field = qualify(table, column, computed);
                    match value {
                        Value::Null => format!("{field} IS NULL"),
                        value => format!("{field} = {}", value.literal(db)),
                    }
                })
                .collect();
            parts.push(format!("({})", terms.join(" AND ")));
        }

        let raw: Vec<&str> = self.predicates.iter().map(|p| p.trim()).filter(|p| !p.is_empty()).collect();
        if parts.is_empty() && raw.len() == 1 {
            return raw[0].to_string();
        }
        parts.extend(raw.iter().map(|p| format!("({p})")));

        if parts.is_empty() {
            "1".to_string()
        } else {
            parts.join(" AND ")
        }
    }

    /// Renders for combination with other predicates: a lone raw predicate is parenthesized.
    fn render_grouped(&self, table: &str, computed: &[(String, String)], db: &dyn DatabaseHandle) -> String {
        let sql = self.render(table, computed, db);
        let lone_raw = self.columns.is_empty() && self.predicates.iter().filter(|p| !p.trim().is_empty()).count() == 1;
        if lone_raw {
            format!("({sql})")
        } else {
            sql
        }
    }
}

fn qualify(table: &str, column: &str, computed: &[(String, String)]) -> String {
    if column.contains('.') || column.contains('(') {
        return column.to_string();
    }
    match computed.iter().find(|(alias, _)| alias == column) {
        Some((_, expression)) => format!("({expression})"),
        None => format!("{table}.{column}"),
    }
}

impl From<&str> for Conditions {
    fn from(predicate: &str) -> Self {
        Conditions::raw(predicate)
    }
}

impl From<String> for Conditions {
    fn from(predicate: String) -> Self {
        Conditions::raw(predicate)
    }
}

impl<K: Into<String>, V: Into<Value>> From<Vec<(K, V)>> for Conditions {
    fn from(pairs: Vec<(K, V)>) -> Self {
        Self { columns: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(), predicates: Vec::new() }
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Conditions {
    fn from(pairs: [(K, V); N]) -> Self {
        Self { columns: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(), predicates: Vec::new() }
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl Order {
    fn as_sql(self) -> &'static str {
        match self {
            Order::Ascending => "ASC",
            Order::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connective {
    And,
    Or,
}

/// A one-to-one association eagerly joined into the collection's query.
struct Included {
    name: String,
    kind: AssociationKind,
    foreign_key: String,
    target: Arc<EntityType>,
    schema: Arc<TableSchema>,
}

// ============================================================================
// Record Collection
// ============================================================================

/// A lazy, ordered, optionally batched result set of one entity type.
pub struct RecordCollection<T: Entity> {
    kind: Arc<EntityType>,
    base: Conditions,
    refinements: Vec<(Connective, Conditions)>,
    order_by: String,
    order: Order,
    batch_number: usize,
    batch_size: usize,
    joins: Vec<String>,
    computed: Vec<(String, String)>,
    included: Vec<Included>,
    associate: Option<AssociateRef>,

    fetched: bool,
    statement: String,
    schema: Option<Arc<TableSchema>>,
    column_types: HashMap<String, LogicalType>,
    rows: Vec<Row>,
    entities: HashMap<usize, T>,
    cursor: usize,
}

impl<T: Entity> RecordCollection<T> {
    /// An unfiltered collection ordered by ascending id.
    pub fn new(kind: Arc<EntityType>, batch_size: usize) -> Self {
        let order_by = format!("{}.id", kind.table);
        Self {
            kind,
            base: Conditions::all(),
            refinements: Vec::new(),
            order_by,
            order: Order::Ascending,
            batch_number: 1,
            batch_size,
            joins: Vec::new(),
            computed: Vec::new(),
            included: Vec::new(),
            associate: None,
            fetched: false,
            statement: String::new(),
            schema: None,
            column_types: HashMap::new(),
            rows: Vec::new(),
            entities: HashMap::new(),
            cursor: 0,
        }
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.kind
    }

    fn invalidate(&mut self) {
        self.fetched = false;
        self.rows.clear();
        self.entities.clear();
        self.cursor = 0;
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Replaces the predicate.
    pub fn set_conditions(&mut self, conditions: impl Into<Conditions>) {
        self.base = conditions.into();
        self.refinements.clear();
        self.invalidate();
    }

    /// ANDs `conditions` onto the current predicate. A match-all predicate is replaced.
    pub fn narrow(&mut self, conditions: impl Into<Conditions>) {
        let conditions = conditions.into();
        if conditions.is_all() {
            return;
        }
        if self.base.is_all() && self.refinements.is_empty() {
            self.base = conditions;
        } else {
            self.refinements.push((Connective::And, conditions));
        }
        self.invalidate();
    }

    /// ORs `conditions` onto the current predicate.
    pub fn widen(&mut self, conditions: impl Into<Conditions>) {
        self.refinements.push((Connective::Or, conditions.into()));
        self.invalidate();
    }

    /// Widens the predicate to also match the row with `id`.
    pub fn add_id(&mut self, id: i64) {
        self.widen(Conditions::eq("id", id));
    }

    /// Orders by `column`. Bare column names are qualified with the table name.
    pub fn set_order(&mut self, column: &str, order: Order) {
        self.order_by = qualify(&self.kind.table, column, &self.computed);
        self.order = order;
        self.invalidate();
    }

    pub fn ascending(&mut self) {
        self.order = Order::Ascending;
        self.invalidate();
    }

    pub fn descending(&mut self) {
        self.order = Order::Descending;
        self.invalidate();
    }

    /// Selects the 1-based batch `number` of `size` rows. A size of 0 disables batching.
    pub fn set_batch(&mut self, number: usize, size: usize) {
        self.batch_number = number.max(1);
        self.batch_size = size;
        self.invalidate();
    }

    pub fn set_batch_size(&mut self, size: usize) {
        self.set_batch(self.batch_number, size);
    }

    pub fn set_batch_number(&mut self, number: usize) {
        self.set_batch(number, self.batch_size);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_number(&self) -> usize {
        self.batch_number
    }

    /// Row offset of the current batch.
    pub fn batch_offset(&self) -> usize {
        self.batch_number.saturating_sub(1).saturating_mul(self.batch_size)
    }

    /// Appends a raw JOIN clause.
    pub fn join(&mut self, clause: impl Into<String>) {
        self.joins.push(clause.into());
        self.invalidate();
    }

    /// Adds `(expression) AS alias` to the select list. Conditions on `alias` are rendered
    /// against the expression.
    pub fn add_computed_column(&mut self, alias: impl Into<String>, expression: impl Into<String>) {
        let alias = alias.into();
        let expression = expression.into();
        match self.computed.iter_mut().find(|(a, _)| *a == alias) {
            Some(existing) => existing.1 = expression,
            None => self.computed.push((alias, expression)),
        }
        self.invalidate();
    }

    /// Back-reference handed to every entity this collection yields.
    pub fn set_associate(&mut self, associate: Option<AssociateRef>) {
        self.associate = associate;
    }

    pub fn associate(&self) -> Option<&AssociateRef> {
        self.associate.as_ref()
    }

    /// Eagerly joins a one-to-one association so its associates are hydrated with the rows
    /// instead of resolving lazily one query per entity.
    pub async fn include_association(&mut self, ctx: &Context, name: &str) -> Result<(), Error> {
        if self.included.iter().any(|i| i.name == name) {
            return Ok(());
        }

        let spec = self.kind.association(name).cloned().ok_or_else(|| {
            Error::configuration(format!("{} declares no association `{name}`", self.kind.name))
        })?;
        if !spec.kind.is_one_to_one() {
            return Err(Error::configuration(format!(
                "only has_one and belongs_to associations can be included, `{name}` is {:?}",
                spec.kind
            )));
        }

        let target = ctx.entity_type(&spec.target)?;
        let schema = ctx.schema().table(ctx.db(), &target.table).await?;

        let local = &self.kind.table;
        let on = match spec.kind {
            AssociationKind::BelongsTo => format!("{name}.id = {local}.{}", spec.foreign_key),
            // has_one joins the newest matching row only
            _ => {
                // a self-referencing subquery needs its own name for the inner table
                let (inner, from) = if target.table == *local {
                    let alias = format!("{name}_newest");
                    let from = format!("{} AS {alias}", target.table);
                    (alias, from)
                } else {
                    (target.table.clone(), target.table.clone())
                };
                let mut filter = format!("{inner}.{} = {local}.id", spec.foreign_key);
                if !spec.conditions.is_all() {
                    filter.push_str(" AND ");
                    filter.push_str(&spec.conditions.render_grouped(&inner, &[], ctx.db()));
                }
                format!("{name}.id = (SELECT MAX({inner}.id) FROM {from} WHERE {filter})")
            }
        };
        self.joins.push(format!("LEFT JOIN {} AS {name} ON {on}", target.table));
        for column in schema.column_names() {
            self.computed.push((format!("{name}__{column}"), format!("{name}.{column}")));
        }

        self.included.push(Included { name: name.to_string(), kind: spec.kind, foreign_key: spec.foreign_key, target, schema });
        self.invalidate();
        Ok(())
    }

    /// Includes every one-to-one association the entity type declares.
    pub async fn include_associations(&mut self, ctx: &Context) -> Result<(), Error> {
        let names: Vec<String> =
            self.kind.associations.iter().filter(|a| a.kind.is_one_to_one()).map(|a| a.name.clone()).collect();
        for name in names {
            self.include_association(ctx, &name).await?;
        }
        Ok(())
    }

    // ========================================================================
    // SQL Generation
    // ========================================================================

    /// The current predicate as SQL.
    pub fn predicate(&self, db: &dyn DatabaseHandle) -> String {
        let table = &self.kind.table;
        if self.refinements.is_empty() {
            return self.base.render(table, &self.computed, db);
        }

        let mut sql = self.base.render_grouped(table, &self.computed, db);
        let mut ends_with_or = false;

        for (connective, conditions) in &self.refinements {
            let part = conditions.render_grouped(table, &self.computed, db);
            match connective {
                Connective::And => {
                    if ends_with_or {
                        sql = format!("({sql})");
                        ends_with_or = false;
                    }
                    sql = format!("{sql} AND {part}");
                }
                Connective::Or => {
                    sql = format!("{sql} OR {part}");
                    ends_with_or = true;
                }
            }
        }
        sql
    }

    fn from_clause(&self, db: &dyn DatabaseHandle) -> String {
        let mut sql = format!(" FROM {}", self.kind.table);
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        sql.push_str(" WHERE ");
        sql.push_str(&self.predicate(db));
        sql
    }

    fn select_sql(&self, db: &dyn DatabaseHandle, window: Option<(usize, usize)>) -> String {
        let mut sql = format!("SELECT {}.*", self.kind.table);
        for (alias, expression) in &self.computed {
            sql.push_str(&format!(", ({expression}) AS {alias}"));
        }
        sql.push_str(&self.from_clause(db));
        sql.push_str(&format!(" ORDER BY {} {}", self.order_by, self.order.as_sql()));
        if let Some((size, offset)) = window {
            sql.push_str(&format!(" LIMIT {size} OFFSET {offset}"));
        }
        sql
    }

    /// The SELECT the current configuration produces.
    pub fn to_sql(&self, db: &dyn DatabaseHandle) -> String {
        let window = (self.batch_size > 0).then(|| (self.batch_size, self.batch_offset()));
        self.select_sql(db, window)
    }

    /// The statement behind the buffered rows; empty before the first fetch.
    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn run(&self, ctx: &Context, sql: &str) -> Result<Vec<Row>, Error> {
        match ctx.db().fetch_rows(sql).await {
            Ok(rows) => Ok(rows),
            Err(e) if e.is_query() => {
                log::warn!("{} query failed, yielding no rows: {e}", self.kind.name);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the query unless the buffered rows are still valid.
    pub async fn fetch(&mut self, ctx: &Context) -> Result<(), Error> {
        if self.fetched {
            return Ok(());
        }

        let schema = ctx.schema().table(ctx.db(), &self.kind.table).await?;
        let sql = self.to_sql(ctx.db());
        let rows = self.run(ctx, &sql).await?;

        self.column_types = self.resolve_column_types(&schema, rows.first());
        self.schema = Some(schema);
        self.rows = rows;
        self.statement = sql;
        self.entities.clear();
        self.cursor = 0;
        self.fetched = true;
        Ok(())
    }

    /// Logical types of the result columns: the introspected schema first, then included
    /// associations, then the driver's result metadata.
    fn resolve_column_types(&self, schema: &TableSchema, row: Option<&Row>) -> HashMap<String, LogicalType> {
        let mut types: HashMap<String, LogicalType> = schema.column_types().into_iter().collect();
        for included in &self.included {
            for (column, ty) in included.schema.column_types() {
                types.insert(format!("{}__{column}", included.name), ty);
            }
        }
        if let Some(row) = row {
            for meta in row.columns() {
                types.entry(meta.name.clone()).or_insert_with(|| LogicalType::from_native(&meta.native_type));
            }
        }
        types
    }

    fn build(&self, row: &Row, schema: &Arc<TableSchema>, column_types: &HashMap<String, LogicalType>) -> Result<T, Error> {
        let prefixes: Vec<String> = self.included.iter().map(|i| format!("{}__", i.name)).collect();
        let mut record = Record::from_row(self.kind.clone(), schema.clone(), row, column_types, &prefixes)?;
        record.set_associate_ref(self.associate.clone());

        for (included, prefix) in self.included.iter().zip(&prefixes) {
            let key = match included.kind {
                AssociationKind::BelongsTo => record.get(&included.foreign_key).and_then(Value::as_i64).unwrap_or(0),
                _ => record.id(),
            };
            let mut associate = Record::from_prefixed(included.target.clone(), included.schema.clone(), row, prefix)?;
            if let Some(associate) = associate.as_mut() {
                associate.set_associate_ref(Some(record.associate_for(&included.name)));
            }
            record.slots.insert(included.name.clone(), Slot::preloaded(key, associate));
        }

        let mut entity = T::from_record(record);
        entity.rebuild();
        Ok(entity)
    }

    fn materialize(&mut self, index: usize) -> Result<Option<&mut T>, Error> {
        if index >= self.rows.len() {
            return Ok(None);
        }
        if !self.entities.contains_key(&index) {
            let schema = self.schema.clone().ok_or_else(|| Error::schema(&self.kind.table, "rows buffered without a schema"))?;
            let entity = self.build(&self.rows[index], &schema, &self.column_types)?;
            self.entities.insert(index, entity);
        }
        Ok(self.entities.get_mut(&index))
    }

    /// The entity at `index` within the buffered rows.
    pub async fn get(&mut self, ctx: &Context, index: usize) -> Result<Option<&mut T>, Error> {
        self.fetch(ctx).await?;
        self.materialize(index)
    }

    /// Advances the cursor.
    pub async fn next(&mut self, ctx: &Context) -> Result<Option<&mut T>, Error> {
        self.fetch(ctx).await?;
        if self.cursor >= self.rows.len() {
            return Ok(None);
        }
        let index = self.cursor;
        self.cursor += 1;
        self.materialize(index)
    }

    /// Resets the cursor without re-querying.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Cursor position, the index `next` yields from.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Number of rows in the current batch.
    pub async fn count(&mut self, ctx: &Context) -> Result<usize, Error> {
        self.fetch(ctx).await?;
        Ok(self.rows.len())
    }

    /// Number of rows matching the predicate, ignoring batching. Does not touch the buffer.
    pub async fn count_all(&self, ctx: &Context) -> Result<i64, Error> {
        let sql = format!("SELECT COUNT(*){}", self.from_clause(ctx.db()));
        match ctx.db().fetch_scalar(&sql).await {
            Ok(count) => Ok(count.as_i64().unwrap_or(0)),
            Err(e) if e.is_query() => {
                log::warn!("{} count failed: {e}", self.kind.name);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Batches needed to cover every matching row.
    pub async fn number_of_batches(&self, ctx: &Context) -> Result<i64, Error> {
        if self.batch_size == 0 {
            return Ok(1);
        }
        let total = self.count_all(ctx).await?;
        let size = i64::try_from(self.batch_size).unwrap_or(i64::MAX);
        Ok(total / size + i64::from(total % size != 0))
    }

    /// First entity of the current batch as a separate instance.
    ///
    /// Uses the buffered rows when present, otherwise runs a one-row query and leaves the
    /// buffer untouched.
    pub async fn first(&mut self, ctx: &Context) -> Result<Option<T>, Error> {
        if self.fetched {
            let Some(row) = self.rows.first() else {
                return Ok(None);
            };
            let schema = self.schema.clone().ok_or_else(|| Error::schema(&self.kind.table, "rows buffered without a schema"))?;
            return self.build(row, &schema, &self.column_types).map(Some);
        }

        let schema = ctx.schema().table(ctx.db(), &self.kind.table).await?;
        let sql = self.select_sql(ctx.db(), Some((1, self.batch_offset())));
        let rows = self.run(ctx, &sql).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let column_types = self.resolve_column_types(&schema, Some(row));
        self.build(row, &schema, &column_types).map(Some)
    }

    /// Every entity of the current batch.
    pub async fn into_vec(mut self, ctx: &Context) -> Result<Vec<T>, Error> {
        self.fetch(ctx).await?;
        let schema = self.schema.clone().ok_or_else(|| Error::schema(&self.kind.table, "rows buffered without a schema"))?;

        let mut entities = Vec::with_capacity(self.rows.len());
        for index in 0..self.rows.len() {
            match self.entities.remove(&index) {
                Some(entity) => entities.push(entity),
                None => entities.push(self.build(&self.rows[index], &schema, &self.column_types)?),
            }
        }
        Ok(entities)
    }
}

impl<T: Entity> fmt::Debug for RecordCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCollection")
            .field("entity", &self.kind.name)
            .field("base", &self.base)
            .field("order_by", &self.order_by)
            .field("order", &self.order)
            .field("batch_number", &self.batch_number)
            .field("batch_size", &self.batch_size)
            .field("fetched", &self.fetched)
            .field("rows", &self.rows.len())
            .finish()
    }
}
