//! # Context Module
//!
//! The explicit context every operation runs against: the database handle, the naming
//! utility, the schema cache, the entity registry and the partition maps.
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_orm::{Context, Database};
//!
//! let db = Database::builder().max_connections(1).connect("sqlite::memory:").await?;
//! let ctx = Context::builder(Arc::new(db)).default_batch_size(50).build();
//! ctx.register::<Post>()?;
//! ctx.register::<Comment>()?;
//! ctx.validate()?;
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use tokio::sync::Mutex;

use crate::{
    association::AssociationKind,
    database::DatabaseHandle,
    entity::{Entity, EntityType},
    naming::{Inflector, Naming},
    partition::PartitionMap,
    schema::SchemaIntrospector,
    Error,
};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    /// Batch size of new collections; 0 means unbatched.
    pub default_batch_size: usize,
    /// Treat every `has_one` as strict.
    pub strict_has_one: bool,
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    db: Arc<dyn DatabaseHandle>,
    naming: Arc<dyn Naming>,
    settings: Settings,
}

impl ContextBuilder {
    pub fn naming(mut self, naming: impl Naming + 'static) -> Self {
        self.naming = Arc::new(naming);
        self
    }

    pub fn default_batch_size(mut self, size: usize) -> Self {
        self.settings.default_batch_size = size;
        self
    }

    pub fn strict_has_one(mut self, strict: bool) -> Self {
        self.settings.strict_has_one = strict;
        self
    }

    pub fn build(self) -> Context {
        Context {
            db: self.db,
            naming: self.naming,
            schema: SchemaIntrospector::new(),
            registry: RwLock::new(HashMap::new()),
            partitions: Mutex::new(HashMap::new()),
            settings: self.settings,
        }
    }
}

// ============================================================================
// Context
// ============================================================================

pub struct Context {
    db: Arc<dyn DatabaseHandle>,
    naming: Arc<dyn Naming>,
    schema: SchemaIntrospector,
    registry: RwLock<HashMap<&'static str, Arc<EntityType>>>,
    partitions: Mutex<HashMap<&'static str, Arc<PartitionMap>>>,
    settings: Settings,
}

impl Context {
    /// A context with the default [`Inflector`] and settings.
    pub fn new(db: impl DatabaseHandle + 'static) -> Self {
        Self::builder(Arc::new(db)).build()
    }

    pub fn builder(db: Arc<dyn DatabaseHandle>) -> ContextBuilder {
        ContextBuilder { db, naming: Arc::new(Inflector), settings: Settings::default() }
    }

    pub fn db(&self) -> &dyn DatabaseHandle {
        self.db.as_ref()
    }

    pub fn naming(&self) -> &dyn Naming {
        self.naming.as_ref()
    }

    pub fn schema(&self) -> &SchemaIntrospector {
        &self.schema
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    /// Resolves and registers the declaration of `T`. Registering a type again replaces it.
    pub fn register<T: Entity>(&self) -> Result<Arc<EntityType>, Error> {
        let kind = Arc::new(EntityType::resolve(T::declare(), self.naming())?);
        log::debug!("registered {} on table `{}`", kind.name, kind.table);

        self.registry
            .write()
            .map_err(|_| Error::configuration("entity registry lock poisoned"))?
            .insert(kind.name, kind.clone());
        Ok(kind)
    }

    pub fn entity_type(&self, name: &str) -> Result<Arc<EntityType>, Error> {
        self.registry
            .read()
            .map_err(|_| Error::configuration("entity registry lock poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("entity type `{name}` is not registered")))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entity_type(name).is_ok()
    }

    /// Checks that every association targets a registered type and that every
    /// many-to-many association is declared on both sides.
    pub fn validate(&self) -> Result<(), Error> {
        let registry = self.registry.read().map_err(|_| Error::configuration("entity registry lock poisoned"))?;

        for kind in registry.values() {
            for association in &kind.associations {
                let Some(target) = registry.get(association.target.as_str()) else {
                    return Err(Error::configuration(format!(
                        "{}.{} targets unregistered entity type `{}`",
                        kind.name, association.name, association.target
                    )));
                };
                if association.kind == AssociationKind::ManyToMany
                    && !target
                        .associations
                        .iter()
                        .any(|a| a.kind == AssociationKind::ManyToMany && a.target == kind.name)
                {
                    return Err(Error::configuration(format!(
                        "{}.{} has no has_and_belongs_to_many counterpart on {}",
                        kind.name, association.name, target.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Column ownership of a partitioned entity type, introspected on first request.
    pub async fn partition_map(&self, kind: &EntityType) -> Result<Arc<PartitionMap>, Error> {
        let mut partitions = self.partitions.lock().await;
        if let Some(map) = partitions.get(kind.name) {
            return Ok(map.clone());
        }

        let map = Arc::new(PartitionMap::build(self, kind).await?);
        partitions.insert(kind.name, map.clone());
        Ok(map)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<&'static str> = self.registry.read().map(|r| r.keys().copied().collect()).unwrap_or_default();
        f.debug_struct("Context")
            .field("driver", &self.db.driver())
            .field("registered", &registered)
            .field("settings", &self.settings)
            .finish()
    }
}
