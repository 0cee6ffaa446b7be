use crate::catalog::{Catalog, CatalogTransaction, Entity, Instance, ResolveError, StoreError};
use crate::types::QueryRetrieveLevel;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ToolsError {
	#[error(transparent)]
	Resolve(#[from] ResolveError),
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl IntoResponse for ToolsError {
	fn into_response(self) -> Response {
		match self {
			Self::Resolve(ResolveError::NotFound { .. }) => {
				(StatusCode::NOT_FOUND, self.to_string()).into_response()
			}
			_ => {
				error!("{self}");
				(StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
			}
		}
	}
}

/// Viewer annotations sent for an instance.
///
/// Only the freehand ROI annotations are kept. A missing list stores an empty one.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateToolsRequest {
	#[serde(rename = "FreehandRoiTool", default)]
	pub freehand_roi_tool: Vec<Value>,
}

impl UpdateToolsRequest {
	fn into_tools_data(self) -> Value {
		json!({ "FreehandRoiTool": self.freehand_roi_tool })
	}
}

/// Reads and replaces the viewer tools data attached to instances.
pub struct ToolsService {
	catalog: Catalog,
}

impl ToolsService {
	pub const fn new(catalog: Catalog) -> Self {
		Self { catalog }
	}

	/// The tools data of the instance with the given SOP Instance UID.
	pub async fn load(&self, sop_instance_uid: &str) -> Result<Value, ToolsError> {
		let instance: Instance = self.catalog.resolve(sop_instance_uid, None).await?;
		Ok(instance
			.record()
			.tools_data
			.clone()
			.unwrap_or_else(|| json!({})))
	}

	/// Replaces the tools data of an instance and returns what was stored.
	pub async fn update(
		&self,
		sop_instance_uid: &str,
		request: UpdateToolsRequest,
	) -> Result<Value, ToolsError> {
		let tools_data = request.into_tools_data();
		let mut tx = self.catalog.begin().await?;
		match replace(&mut tx, sop_instance_uid, tools_data).await {
			Ok(stored) => {
				tx.commit().await?;
				info!(%sop_instance_uid, "Updated tools data");
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
}

/// Sets the tools data of the instance as read within `tx`. Its attributes are written back as
/// they are.
async fn replace(
	tx: &mut CatalogTransaction,
	sop_instance_uid: &str,
	tools_data: Value,
) -> Result<Value, ToolsError> {
	let Some(mut instance) = tx.find_by_uid::<Instance>(sop_instance_uid).await? else {
		return Err(ResolveError::NotFound {
			level: QueryRetrieveLevel::Image,
			uid: sop_instance_uid.to_owned(),
		}
		.into());
	};
	instance.record_mut().tools_data = Some(tools_data.clone());
	tx.update(&mut instance).await?;
	Ok(tools_data)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::memory::MemoryStore;
	use crate::catalog::{Attributes, Series, Study};
	use dicom::dictionary_std::tags;

	async fn catalog() -> Catalog {
		let catalog = Catalog::new(MemoryStore::new());
		let mut tx = catalog.begin().await.unwrap();
		let mut study = Study::new(Attributes::from([(
			tags::STUDY_INSTANCE_UID,
			String::from("S1"),
		)]));
		tx.create(&mut study).await.unwrap();
		let mut series = Series::new(
			study.id(),
			Attributes::from([(tags::SERIES_INSTANCE_UID, String::from("SE1"))]),
		);
		tx.create(&mut series).await.unwrap();
		let mut instance = Instance::new(
			series.id(),
			Attributes::from([
				(tags::SOP_INSTANCE_UID, String::from("I1")),
				(tags::INSTANCE_NUMBER, String::from("7")),
			]),
		);
		tx.create(&mut instance).await.unwrap();
		tx.commit().await.unwrap();
		catalog
	}

	#[tokio::test]
	async fn update_replaces_only_tools_data() {
		let catalog = catalog().await;
		let service = ToolsService::new(catalog.clone());
		assert_eq!(service.load("I1").await.unwrap(), json!({}));

		let request = UpdateToolsRequest {
			freehand_roi_tool: vec![json!({"handles": [1, 2]})],
		};
		let stored = service.update("I1", request).await.unwrap();
		assert_eq!(stored, json!({"FreehandRoiTool": [{"handles": [1, 2]}]}));
		assert_eq!(service.load("I1").await.unwrap(), stored);

		let instance: Instance = catalog.resolve("I1", None).await.unwrap();
		assert_eq!(instance.record().attribute(tags::INSTANCE_NUMBER), "7");
	}

	#[tokio::test]
	async fn missing_list_stores_empty_annotations() {
		let service = ToolsService::new(catalog().await);
		let stored = service
			.update("I1", UpdateToolsRequest::default())
			.await
			.unwrap();
		assert_eq!(stored, json!({"FreehandRoiTool": []}));
	}

	#[tokio::test]
	async fn unknown_instances_are_not_found() {
		let service = ToolsService::new(catalog().await);
		let err = service.load("I2").await.unwrap_err();
		assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

		let err = service
			.update("I2", UpdateToolsRequest::default())
			.await
			.unwrap_err();
		assert!(matches!(
			err,
			ToolsError::Resolve(ResolveError::NotFound {
				level: QueryRetrieveLevel::Image,
				..
			})
		));
	}
}
