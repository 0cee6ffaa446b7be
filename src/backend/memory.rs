//! Process-local catalog store.
//!
//! Transactions stage their writes privately and publish them on commit, after re-validating
//! business-key uniqueness and parent references against the tables as they are at that moment.
use crate::catalog::{CatalogStore, Filter, Page, Record, StoreError, Transaction};
use crate::types::QueryRetrieveLevel;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

type Table = BTreeMap<i64, Record>;

#[derive(Debug, Default)]
struct Tables(HashMap<QueryRetrieveLevel, Table>);

impl Tables {
	fn table(&self, level: QueryRetrieveLevel) -> Option<&Table> {
		self.0.get(&level)
	}

	fn insert(&mut self, level: QueryRetrieveLevel, record: Record) {
		self.0.entry(level).or_default().insert(record.id, record);
	}

	fn is_empty(&self) -> bool {
		self.0.values().all(BTreeMap::is_empty)
	}
}

/// The rows of `level` as seen by a transaction: committed rows overlaid by staged rows.
fn view(live: &Tables, staged: &Tables, level: QueryRetrieveLevel) -> Table {
	let mut rows = live.table(level).cloned().unwrap_or_default();
	if let Some(staged) = staged.table(level) {
		rows.extend(staged.iter().map(|(id, record)| (*id, record.clone())));
	}
	rows
}

fn select<'a>(rows: impl Iterator<Item = &'a Record>, filter: &Filter, page: Page) -> Vec<Record> {
	rows.filter(|record| filter.matches(record))
		.skip(page.offset)
		.take(page.limit.unwrap_or(usize::MAX))
		.cloned()
		.collect()
}

fn check_constraints(
	rows: &Table,
	parents: Option<&Table>,
	level: QueryRetrieveLevel,
	record: &Record,
) -> Result<(), StoreError> {
	let uid = record.attribute(level.business_key());
	let duplicate = rows
		.values()
		.any(|other| other.id != record.id && other.attribute(level.business_key()) == uid);
	if duplicate {
		return Err(StoreError::Duplicate {
			level,
			uid: uid.to_owned(),
		});
	}

	if let Some(parents) = parents {
		let parent_id = record.parent_id.unwrap_or_default();
		if !parents.contains_key(&parent_id) {
			return Err(StoreError::MissingParent { level, parent_id });
		}
	}
	Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
	tables: Arc<RwLock<Tables>>,
	sequence: Arc<AtomicI64>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl CatalogStore for MemoryStore {
	async fn find_by(
		&self,
		level: QueryRetrieveLevel,
		filter: &Filter,
		page: Page,
	) -> Result<Vec<Record>, StoreError> {
		let tables = self.tables.read().await;
		let rows = tables.table(level).into_iter().flat_map(BTreeMap::values);
		Ok(select(rows, filter, page))
	}

	async fn count_by(
		&self,
		level: QueryRetrieveLevel,
		filter: &Filter,
	) -> Result<u64, StoreError> {
		let matches = self.find_by(level, filter, Page::unbounded()).await?;
		Ok(matches.len() as u64)
	}

	async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
		Ok(Box::new(MemoryTransaction {
			tables: Arc::clone(&self.tables),
			sequence: Arc::clone(&self.sequence),
			staged: Tables::default(),
		}))
	}
}

pub struct MemoryTransaction {
	tables: Arc<RwLock<Tables>>,
	sequence: Arc<AtomicI64>,
	staged: Tables,
}

impl MemoryTransaction {
	async fn validate(&self, level: QueryRetrieveLevel, record: &Record) -> Result<(), StoreError> {
		let live = self.tables.read().await;
		let rows = view(&live, &self.staged, level);
		let parents = level
			.parent()
			.map(|parent| view(&live, &self.staged, parent));
		check_constraints(&rows, parents.as_ref(), level, record)
	}
}

#[async_trait]
impl Transaction for MemoryTransaction {
	async fn find_by(
		&mut self,
		level: QueryRetrieveLevel,
		filter: &Filter,
		page: Page,
	) -> Result<Vec<Record>, StoreError> {
		let live = self.tables.read().await;
		let rows = view(&live, &self.staged, level);
		Ok(select(rows.values(), filter, page))
	}

	async fn create(
		&mut self,
		level: QueryRetrieveLevel,
		record: &mut Record,
	) -> Result<(), StoreError> {
		record.id = 0;
		self.validate(level, record).await?;

		let now = Utc::now();
		record.id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
		record.created_at = Some(now);
		record.updated_at = Some(now);
		if level == QueryRetrieveLevel::Image && record.tools_data.is_none() {
			record.tools_data = Some(serde_json::Value::Object(serde_json::Map::new()));
		}
		self.staged.insert(level, record.clone());
		Ok(())
	}

	async fn update(
		&mut self,
		level: QueryRetrieveLevel,
		record: &mut Record,
	) -> Result<(), StoreError> {
		let existing = {
			let live = self.tables.read().await;
			view(&live, &self.staged, level).remove(&record.id)
		};
		let Some(existing) = existing else {
			return Err(StoreError::NotFound {
				level,
				id: record.id,
			});
		};
		self.validate(level, record).await?;

		record.created_at = existing.created_at;
		record.updated_at = Some(Utc::now());
		if record.tools_data.is_none() {
			record.tools_data = existing.tools_data;
		}
		self.staged.insert(level, record.clone());
		Ok(())
	}

	async fn commit(self: Box<Self>) -> Result<(), StoreError> {
		let Self { tables, staged, .. } = *self;
		if staged.is_empty() {
			return Ok(());
		}

		let mut live = tables.write().await;
		for level in QueryRetrieveLevel::ALL {
			let Some(records) = staged.table(level) else {
				continue;
			};
			let rows = view(&live, &staged, level);
			let parents = level.parent().map(|parent| view(&live, &staged, parent));
			for record in records.values() {
				check_constraints(&rows, parents.as_ref(), level, record)?;
			}
		}

		for (level, records) in staged.0 {
			for record in records.into_values() {
				live.insert(level, record);
			}
		}
		Ok(())
	}

	async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
		debug!("Discarding staged catalog writes");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::catalog::{
		Attributes, Catalog, Entity, FilterValue, ResolveError, Series, Study,
	};
	use dicom::dictionary_std::tags;

	fn study(uid: &str) -> Study {
		Study::new(Attributes::from([(tags::STUDY_INSTANCE_UID, uid.to_owned())]))
	}

	fn series(study_id: i64, uid: &str, modality: &str) -> Series {
		Series::new(
			study_id,
			Attributes::from([
				(tags::SERIES_INSTANCE_UID, uid.to_owned()),
				(tags::MODALITY, modality.to_owned()),
			]),
		)
	}

	#[tokio::test]
	async fn committed_writes_are_visible() {
		let catalog = Catalog::new(MemoryStore::new());
		let mut tx = catalog.begin().await.unwrap();
		let mut s1 = study("1.2.3");
		tx.create(&mut s1).await.unwrap();
		assert!(s1.id() > 0);
		assert!(s1.record().created_at.is_some());

		// Not visible outside the transaction before commit.
		let outside = catalog.find_by::<Study>(&Filter::new(), Page::unbounded()).await;
		assert!(outside.unwrap().is_empty());

		let inside = tx.find_by_uid::<Study>("1.2.3").await.unwrap();
		assert_eq!(inside, Some(s1.clone()));

		tx.commit().await.unwrap();
		let found = catalog
			.find_by::<Study>(&Filter::by_uid(QueryRetrieveLevel::Study, "1.2.3"), Page::unbounded())
			.await
			.unwrap();
		assert_eq!(found, vec![s1]);
	}

	#[tokio::test]
	async fn rollback_and_drop_discard_writes() {
		let catalog = Catalog::new(MemoryStore::new());

		let mut tx = catalog.begin().await.unwrap();
		tx.create(&mut study("1")).await.unwrap();
		tx.rollback().await.unwrap();

		let mut tx = catalog.begin().await.unwrap();
		tx.create(&mut study("2")).await.unwrap();
		drop(tx);

		assert_eq!(catalog.count_by::<Study>(&Filter::new()).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn business_keys_are_unique() {
		let catalog = Catalog::new(MemoryStore::new());
		let mut tx = catalog.begin().await.unwrap();
		tx.create(&mut study("1")).await.unwrap();
		let err = tx.create(&mut study("1")).await.unwrap_err();
		assert!(matches!(err, StoreError::Duplicate { .. }));
	}

	#[tokio::test]
	async fn concurrent_duplicate_fails_on_commit() {
		let catalog = Catalog::new(MemoryStore::new());
		let mut first = catalog.begin().await.unwrap();
		let mut second = catalog.begin().await.unwrap();
		first.create(&mut study("1")).await.unwrap();
		second.create(&mut study("1")).await.unwrap();
		first.commit().await.unwrap();
		assert!(matches!(
			second.commit().await,
			Err(StoreError::Duplicate { .. })
		));
		assert_eq!(catalog.count_by::<Study>(&Filter::new()).await.unwrap(), 1);
	}

	#[tokio::test]
	async fn children_require_existing_parent() {
		let catalog = Catalog::new(MemoryStore::new());
		let mut tx = catalog.begin().await.unwrap();
		let err = tx.create(&mut series(42, "1.1", "CT")).await.unwrap_err();
		assert!(matches!(
			err,
			StoreError::MissingParent { parent_id: 42, .. }
		));
	}

	#[tokio::test]
	async fn update_keeps_creation_time() {
		let catalog = Catalog::new(MemoryStore::new());
		let mut tx = catalog.begin().await.unwrap();
		let mut s1 = study("1");
		tx.create(&mut s1).await.unwrap();
		tx.commit().await.unwrap();

		let mut tx = catalog.begin().await.unwrap();
		let mut updated = study("1");
		updated.record_mut().id = s1.id();
		tx.update(&mut updated).await.unwrap();
		tx.commit().await.unwrap();

		assert_eq!(updated.record().created_at, s1.record().created_at);
		assert!(updated.record().updated_at >= s1.record().updated_at);

		let mut tx = catalog.begin().await.unwrap();
		let mut missing = study("2");
		missing.record_mut().id = 999;
		assert!(matches!(
			tx.update(&mut missing).await,
			Err(StoreError::NotFound { id: 999, .. })
		));
	}

	#[tokio::test]
	async fn find_by_filters_and_paginates() {
		let catalog = Catalog::new(MemoryStore::new());
		let mut tx = catalog.begin().await.unwrap();
		let mut s1 = study("1");
		tx.create(&mut s1).await.unwrap();
		for (uid, modality) in [("1.1", "CT"), ("1.2", "MR"), ("1.3", "CT")] {
			tx.create(&mut series(s1.id(), uid, modality)).await.unwrap();
		}
		tx.commit().await.unwrap();

		let ct = Filter::new().with_attribute(tags::MODALITY, FilterValue::Single("CT".into()));
		let found = catalog.find_by::<Series>(&ct, Page::unbounded()).await.unwrap();
		let uids: Vec<&str> = found.iter().map(Entity::uid).collect();
		assert_eq!(uids, ["1.1", "1.3"]);

		let second = catalog.find_by::<Series>(&ct, Page::new(1, 1)).await.unwrap();
		assert_eq!(second[0].uid(), "1.3");
		assert_eq!(catalog.count_by::<Series>(&ct).await.unwrap(), 2);
	}

	#[tokio::test]
	async fn resolve_path_scopes_by_parent() {
		let catalog = Catalog::new(MemoryStore::new());
		let mut tx = catalog.begin().await.unwrap();
		let (mut s1, mut s2) = (study("1"), study("2"));
		tx.create(&mut s1).await.unwrap();
		tx.create(&mut s2).await.unwrap();
		tx.create(&mut series(s1.id(), "1.1", "CT")).await.unwrap();
		tx.commit().await.unwrap();

		let path = catalog.resolve_path("1", Some("1.1"), None).await.unwrap();
		assert_eq!(path.study, s1);
		assert_eq!(path.series.unwrap().record().parent_id, Some(s1.id()));

		let wrong_parent = catalog.resolve_path("2", Some("1.1"), None).await;
		assert!(matches!(
			wrong_parent,
			Err(ResolveError::NotFound {
				level: QueryRetrieveLevel::Series,
				..
			})
		));
		assert!(catalog.resolve_path("3", None, None).await.is_err());
	}
}
