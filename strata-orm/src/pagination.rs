//! # Pagination Module
//!
//! This module provides pagination on top of [`RecordCollection`] batches.
//! It handles the calculation of batch windows and total page counts.

// ============================================================================
// External Crate Imports
// ============================================================================

use serde::{Deserialize, Serialize};

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{collection::RecordCollection, context::Context, entity::Entity, Error};

// ============================================================================
// Pagination Structs
// ============================================================================

/// Represents a paginated result set from the database.
///
/// Contains the requested subset of data along with metadata about the total
/// number of records and pages available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    /// The list of items for the current page
    pub data: Vec<T>,
    /// The total number of records matching the collection (ignoring batching)
    pub total: i64,
    /// The current page number (zero-based)
    pub page: usize,
    /// The number of items per page
    pub limit: usize,
    /// The total number of pages available
    pub total_pages: i64,
}

/// A builder for pagination settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    /// Zero-based page index
    pub page: usize,
    /// Number of items per page
    pub limit: usize,
    /// Maximum allowed items per page (safety limit)
    pub max_limit: usize,
}

impl Pagination {
    /// Creates a new Pagination instance with a custom safety limit.
    ///
    /// A `limit` of 0 or above `max_limit` falls back to 10 items per page.
    pub fn new_with_limit(page: usize, limit: usize, max_limit: usize) -> Self {
        let limit = if limit == 0 || limit > max_limit { 10 } else { limit };
        Self { page, limit, max_limit }
    }

    /// Creates a new Pagination instance with a default safety limit of 100.
    pub fn new(page: usize, limit: usize) -> Self {
        Self::new_with_limit(page, limit, 100)
    }

    /// Points the collection's batch window at this page.
    pub fn apply<T: Entity>(self, collection: &mut RecordCollection<T>) {
        collection.set_batch(self.page + 1, self.limit);
    }

    /// Counts the matching rows and fetches one page of entities.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let page = Pagination::new(0, 20).paginate(&ctx, Post::all(&ctx)?).await?;
    /// for post in page.data {
    ///     println!("{:?}", post.record().get("title"));
    /// }
    /// ```
    pub async fn paginate<T: Entity>(self, ctx: &Context, mut collection: RecordCollection<T>) -> Result<Paginated<T>, Error> {
        let total = collection.count_all(ctx).await?;

        self.apply(&mut collection);
        let data = collection.into_vec(ctx).await?;

        let total_pages = (total as f64 / self.limit as f64).ceil() as i64;

        Ok(Paginated { data, total, page: self.page, limit: self.limit, total_pages })
    }
}
