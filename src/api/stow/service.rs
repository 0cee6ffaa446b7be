use crate::catalog::{
	Attributes, Catalog, CatalogTransaction, Entity, Instance, Record, Series, StoreError, Study,
};
use crate::mapping::{self, ExtractError};
use crate::storage::{self, FileStore};
use crate::types::{QueryRetrieveLevel, UI};
use crate::utils::dataset::{self, ParseError};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, info, instrument, warn};

pub struct StoreRequest {
	/// The uploaded objects in the order of the request body.
	pub objects: Vec<Bytes>,
	/// Set if the objects were uploaded to `/studies/{study}`.
	pub study_instance_uid: Option<UI>,
}

/// Outcome of a successfully stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredInstance {
	pub study: Study,
	pub sop_instance_uid: UI,
}

/// Outcomes of the uploaded objects, in request order.
#[derive(Debug)]
pub struct StoreResponse {
	pub outcomes: Vec<Result<StoredInstance, IngestError>>,
}

impl StoreResponse {
	/// The study of the last successfully stored object.
	pub fn last_study(&self) -> Option<&Study> {
		self.outcomes
			.iter()
			.rev()
			.find_map(|outcome| outcome.as_ref().ok())
			.map(|stored| &stored.study)
	}
}

/// Reasons for a single object to be rejected. Other objects of the request are unaffected.
#[derive(Debug, Error)]
pub enum IngestError {
	#[error(transparent)]
	Parse(#[from] ParseError),
	#[error(transparent)]
	Extract(#[from] ExtractError),
	#[error("The object has no {level} instance UID")]
	MissingUid { level: QueryRetrieveLevel },
	#[error("The object belongs to study {actual}, not {expected}")]
	StudyMismatch { expected: UI, actual: UI },
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("Failed to write the object file: {0}")]
	Write(#[from] std::io::Error),
	#[error("Parsing task failed: {0}")]
	Task(#[from] JoinError),
}

/// Catalog attributes of one object, per level.
struct Extracted {
	study: Attributes,
	series: Attributes,
	instance: Attributes,
}

fn business_key(attributes: &Attributes, level: QueryRetrieveLevel) -> Result<UI, IngestError> {
	attributes
		.get(&level.business_key())
		.filter(|uid| !uid.is_empty())
		.cloned()
		.ok_or(IngestError::MissingUid { level })
}

/// Updates the entity with the given UID or inserts a new one.
///
/// An existing entity keeps its id and tools data but is moved below `parent_id`.
async fn upsert<E: Entity>(
	tx: &mut CatalogTransaction,
	uid: &str,
	parent_id: Option<i64>,
	attributes: Attributes,
) -> Result<E, StoreError> {
	if let Some(mut entity) = tx.find_by_uid::<E>(uid).await? {
		let record = entity.record_mut();
		record.attributes = attributes;
		record.parent_id = parent_id;
		tx.update(&mut entity).await?;
		return Ok(entity);
	}

	let mut entity = E::from_record(Record {
		parent_id,
		attributes,
		..Record::default()
	});
	tx.create(&mut entity).await?;
	Ok(entity)
}

/// Stores uploaded objects in the catalog and the file store.
///
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.5>
pub struct StowService {
	catalog: Catalog,
	files: Arc<dyn FileStore>,
}

impl StowService {
	pub fn new(catalog: Catalog, files: Arc<dyn FileStore>) -> Self {
		Self { catalog, files }
	}

	/// Ingests every object independently. A failing object does not affect the others.
	pub async fn store(&self, request: StoreRequest) -> StoreResponse {
		let mut outcomes = Vec::with_capacity(request.objects.len());
		for (index, data) in request.objects.into_iter().enumerate() {
			let outcome = self
				.ingest(data, request.study_instance_uid.as_deref())
				.await;
			if let Err(err) = &outcome {
				warn!(index, "Failed to store object: {err}");
			}
			outcomes.push(outcome);
		}
		StoreResponse { outcomes }
	}

	#[instrument(skip_all)]
	async fn ingest(
		&self,
		data: Bytes,
		expected_study: Option<&str>,
	) -> Result<StoredInstance, IngestError> {
		let parsed = data.clone();
		let extracted = tokio::task::spawn_blocking(move || {
			let object = dataset::parse_object(&parsed)?;
			let extracted = Extracted {
				study: mapping::extract(&object, QueryRetrieveLevel::Study)?,
				series: mapping::extract(&object, QueryRetrieveLevel::Series)?,
				instance: mapping::extract(&object, QueryRetrieveLevel::Image)?,
			};
			Ok::<_, IngestError>(extracted)
		})
		.await??;

		let study_uid = business_key(&extracted.study, QueryRetrieveLevel::Study)?;
		let series_uid = business_key(&extracted.series, QueryRetrieveLevel::Series)?;
		let sop_instance_uid = business_key(&extracted.instance, QueryRetrieveLevel::Image)?;
		if let Some(expected) = expected_study {
			if expected != study_uid {
				return Err(IngestError::StudyMismatch {
					expected: expected.to_owned(),
					actual: study_uid,
				});
			}
		}

		let mut tx = self.catalog.begin().await?;
		let result = self
			.write(
				&mut tx,
				extracted,
				[study_uid.as_str(), series_uid.as_str(), sop_instance_uid.as_str()],
				data,
			)
			.await;

		match result {
			Ok(stored) => {
				tx.commit().await?;
				info!(
					study_instance_uid = %study_uid,
					series_instance_uid = %series_uid,
					sop_instance_uid = %sop_instance_uid,
					"Stored instance"
				);
				Ok(stored)
			}
			Err(err) => {
				if let Err(rollback) = tx.rollback().await {
					error!(%sop_instance_uid, "Failed to roll back transaction: {rollback}");
				}
				Err(err)
			}
		}
	}

	/// Upserts the three levels and writes the file within `tx`.
	async fn write(
		&self,
		tx: &mut CatalogTransaction,
		extracted: Extracted,
		[study_uid, series_uid, sop_instance_uid]: [&str; 3],
		data: Bytes,
	) -> Result<StoredInstance, IngestError> {
		let study: Study = upsert(tx, study_uid, None, extracted.study).await?;
		let series: Series = upsert(tx, series_uid, Some(study.id()), extracted.series).await?;
		let _instance: Instance =
			upsert(tx, sop_instance_uid, Some(series.id()), extracted.instance).await?;

		let path = storage::instance_path(study_uid, series_uid, sop_instance_uid);
		self.files.save(&path, data).await?;

		Ok(StoredInstance {
			study,
			sop_instance_uid: sop_instance_uid.to_owned(),
		})
	}
}
