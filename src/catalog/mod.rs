//! The Study/Series/Instance catalog and its persistence contract.
mod entity;
mod filter;

pub use entity::*;
pub use filter::*;

use crate::types::QueryRetrieveLevel;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("{level} {uid} already exists")]
	Duplicate {
		level: QueryRetrieveLevel,
		uid: String,
	},
	#[error("{level} references missing parent {parent_id}")]
	MissingParent {
		level: QueryRetrieveLevel,
		parent_id: i64,
	},
	#[error("{level} with id {id} does not exist")]
	NotFound { level: QueryRetrieveLevel, id: i64 },
	#[error("Database operation failed: {0}")]
	Database(#[from] sqlx::Error),
	#[error("Database migration failed: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),
}

/// A relational store holding the three catalog tables.
///
/// Lookups on the store itself run outside of any transaction.
#[async_trait]
pub trait CatalogStore: Send + Sync {
	async fn find_by(
		&self,
		level: QueryRetrieveLevel,
		filter: &Filter,
		page: Page,
	) -> Result<Vec<Record>, StoreError>;

	async fn count_by(&self, level: QueryRetrieveLevel, filter: &Filter)
		-> Result<u64, StoreError>;

	async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

/// An open transaction. Dropping it without calling [`Transaction::commit`] discards all writes.
#[async_trait]
pub trait Transaction: Send {
	async fn find_by(
		&mut self,
		level: QueryRetrieveLevel,
		filter: &Filter,
		page: Page,
	) -> Result<Vec<Record>, StoreError>;

	/// Inserts the record, assigning its id and timestamps.
	async fn create(
		&mut self,
		level: QueryRetrieveLevel,
		record: &mut Record,
	) -> Result<(), StoreError>;

	/// Overwrites the row identified by `record.id`, refreshing `updated_at`.
	async fn update(
		&mut self,
		level: QueryRetrieveLevel,
		record: &mut Record,
	) -> Result<(), StoreError>;

	async fn commit(self: Box<Self>) -> Result<(), StoreError>;

	async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("{level} {uid} not found")]
	NotFound {
		level: QueryRetrieveLevel,
		uid: String,
	},
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Entities addressed by a UID path such as `/studies/{study}/series/{series}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
	pub study: Study,
	pub series: Option<Series>,
	pub instance: Option<Instance>,
}

/// Typed access to a shared [`CatalogStore`].
#[derive(Clone)]
pub struct Catalog {
	store: Arc<dyn CatalogStore>,
}

impl Catalog {
	pub fn new(store: impl CatalogStore + 'static) -> Self {
		Self {
			store: Arc::new(store),
		}
	}

	pub async fn find_by<E: Entity>(
		&self,
		filter: &Filter,
		page: Page,
	) -> Result<Vec<E>, StoreError> {
		let records = self.store.find_by(E::LEVEL, filter, page).await?;
		Ok(records.into_iter().map(E::from_record).collect())
	}

	pub async fn count_by<E: Entity>(&self, filter: &Filter) -> Result<u64, StoreError> {
		self.store.count_by(E::LEVEL, filter).await
	}

	/// Untyped lookup for callers that select the level at runtime.
	pub async fn find_records(
		&self,
		level: QueryRetrieveLevel,
		filter: &Filter,
		page: Page,
	) -> Result<Vec<Record>, StoreError> {
		self.store.find_by(level, filter, page).await
	}

	pub async fn count_records(
		&self,
		level: QueryRetrieveLevel,
		filter: &Filter,
	) -> Result<u64, StoreError> {
		self.store.count_by(level, filter).await
	}

	pub async fn begin(&self) -> Result<CatalogTransaction, StoreError> {
		let inner = self.store.begin().await?;
		Ok(CatalogTransaction { inner })
	}

	/// Finds the single entity with the given UID below `parent_id`.
	pub async fn resolve<E: Entity>(
		&self,
		uid: &str,
		parent_id: Option<i64>,
	) -> Result<E, ResolveError> {
		let mut filter = Filter::by_uid(E::LEVEL, uid);
		if let Some(parent_id) = parent_id {
			filter = filter.with_parent_ids(FilterValue::Single(parent_id));
		}

		let mut matches = self.find_by::<E>(&filter, Page::new(2, 0)).await?;
		match (matches.pop(), matches.is_empty()) {
			(Some(entity), true) => Ok(entity),
			_ => Err(ResolveError::NotFound {
				level: E::LEVEL,
				uid: uid.to_owned(),
			}),
		}
	}

	/// Resolves each UID of the path within the scope of its parent.
	pub async fn resolve_path(
		&self,
		study_instance_uid: &str,
		series_instance_uid: Option<&str>,
		sop_instance_uid: Option<&str>,
	) -> Result<ResolvedPath, ResolveError> {
		let study: Study = self.resolve(study_instance_uid, None).await?;

		let series: Option<Series> = match series_instance_uid {
			Some(uid) => Some(self.resolve(uid, Some(study.id())).await?),
			None => None,
		};

		let instance: Option<Instance> = match (sop_instance_uid, &series) {
			(Some(uid), Some(series)) => Some(self.resolve(uid, Some(series.id())).await?),
			(Some(uid), None) => {
				return Err(ResolveError::NotFound {
					level: QueryRetrieveLevel::Image,
					uid: uid.to_owned(),
				})
			}
			(None, _) => None,
		};

		Ok(ResolvedPath {
			study,
			series,
			instance,
		})
	}
}

/// Typed access to an open [`Transaction`].
pub struct CatalogTransaction {
	inner: Box<dyn Transaction>,
}

impl CatalogTransaction {
	pub async fn find_by<E: Entity>(
		&mut self,
		filter: &Filter,
		page: Page,
	) -> Result<Vec<E>, StoreError> {
		let records = self.inner.find_by(E::LEVEL, filter, page).await?;
		Ok(records.into_iter().map(E::from_record).collect())
	}

	pub async fn find_by_uid<E: Entity>(&mut self, uid: &str) -> Result<Option<E>, StoreError> {
		let filter = Filter::by_uid(E::LEVEL, uid);
		let mut matches = self.find_by::<E>(&filter, Page::new(1, 0)).await?;
		Ok(matches.pop())
	}

	pub async fn create<E: Entity>(&mut self, entity: &mut E) -> Result<(), StoreError> {
		self.inner.create(E::LEVEL, entity.record_mut()).await
	}

	pub async fn update<E: Entity>(&mut self, entity: &mut E) -> Result<(), StoreError> {
		self.inner.update(E::LEVEL, entity.record_mut()).await
	}

	pub async fn commit(self) -> Result<(), StoreError> {
		self.inner.commit().await
	}

	pub async fn rollback(self) -> Result<(), StoreError> {
		self.inner.rollback().await
	}
}
