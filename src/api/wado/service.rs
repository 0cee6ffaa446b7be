use crate::catalog::{
	Catalog, Entity, Filter, FilterValue, Instance, Page, ResolveError, Series, StoreError,
};
use crate::config::RenderingConfig;
use crate::mapping;
use crate::rendering::{
	self, ImageQuality, RenderedMediaType, RenderingError, RenderingOptions, Window,
};
use crate::storage::{self, FileStore};
use crate::types::UI;
use crate::utils::dataset::{self, ParseError};
use crate::AppState;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{FromRef, FromRequestParts, Path, Query};
use axum::http::header::ACCEPT;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use dicom::core::header::{HasLength, Header};
use dicom::core::{DicomValue, Length, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom_json::DicomJson;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::{Error, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::error;

#[derive(Debug, Error)]
pub enum RetrieveError {
	#[error(transparent)]
	Resolve(#[from] ResolveError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("No instances found")]
	NoInstances,
	#[error("Rendering requires a single instance")]
	NotAnInstance,
	#[error("Failed to read {}: {source}", .path.display())]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error(transparent)]
	Parse(#[from] ParseError),
	#[error(transparent)]
	Rendering(#[from] RenderingError),
	#[error("Failed to encode metadata: {0}")]
	Json(#[from] serde_json::Error),
	#[error("Decoding task failed: {0}")]
	Task(#[from] JoinError),
}

impl IntoResponse for RetrieveError {
	fn into_response(self) -> Response {
		match self {
			Self::Resolve(ResolveError::NotFound { .. }) | Self::NoInstances => {
				(StatusCode::NOT_FOUND, self.to_string()).into_response()
			}
			Self::NotAnInstance | Self::Rendering(RenderingError::MissingPixelData) => {
				(StatusCode::BAD_REQUEST, self.to_string()).into_response()
			}
			_ => {
				error!("{self}");
				(StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
			}
		}
	}
}

pub struct RetrieveInstanceRequest {
	pub query: ResourceQuery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderingRequest {
	pub query: ResourceQuery,
	pub options: RenderingOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequest {
	pub query: ResourceQuery,
}

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_8.3.5.html#table_8.3.5-1>
#[derive(Debug, PartialEq, Deserialize)]
pub struct RetrieveRenderedQueryParameters {
	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_8.3.3.html#sect_8.3.3.1>
	pub accept: Option<RenderedMediaType>,
	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_8.3.5.html#sect_8.3.5.1.2>
	pub quality: Option<ImageQuality>,
	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_8.3.5.html#sect_8.3.5.1.4>
	#[serde(deserialize_with = "deserialize_window", default)]
	pub window: Option<Window>,
}

impl RenderingOptions {
	/// Combines the request parameters with the configured defaults.
	fn from_request(
		params: RetrieveRenderedQueryParameters,
		accept: Option<&str>,
		config: &RenderingConfig,
	) -> Self {
		let media_type = params
			.accept
			.or_else(|| accept.and_then(|s| RenderedMediaType::from_str(s).ok()))
			.unwrap_or_default();

		let configured_window = match (config.window_center, config.window_width) {
			(Some(center), Some(width)) => Some(Window {
				center,
				width,
				function: config.function,
			}),
			_ => None,
		};

		Self {
			media_type,
			quality: params.quality.unwrap_or(config.quality),
			window: params.window.or(configured_window),
			downsample: config.downsample,
		}
	}
}

impl<S> FromRequestParts<S> for RenderingRequest
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = Response;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Path(query): Path<ResourceQuery> = Path::from_request_parts(parts, state)
			.await
			.map_err(PathRejection::into_response)?;

		let Query(params): Query<RetrieveRenderedQueryParameters> =
			Query::from_request_parts(parts, state)
				.await
				.map_err(QueryRejection::into_response)?;

		let state = AppState::from_ref(state);
		let accept = parts.headers.get(ACCEPT).and_then(|v| v.to_str().ok());
		let options = RenderingOptions::from_request(params, accept, &state.config.rendering);

		Ok(Self { query, options })
	}
}

impl<S> FromRequestParts<S> for MetadataRequest
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = Response;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Path(query): Path<ResourceQuery> = Path::from_request_parts(parts, state)
			.await
			.map_err(PathRejection::into_response)?;

		Ok(Self { query })
	}
}

impl<S> FromRequestParts<S> for RetrieveInstanceRequest
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = Response;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Path(query): Path<ResourceQuery> = Path::from_request_parts(parts, state)
			.await
			.map_err(PathRejection::into_response)?;

		Ok(Self { query })
	}
}

/// Stored files in the order of the catalog, read lazily.
pub struct InstanceResponse {
	pub stream: BoxStream<'static, Result<Bytes, RetrieveError>>,
}

#[derive(Debug)]
pub struct RenderedResponse(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceQuery {
	#[serde(rename = "study")]
	pub study_instance_uid: UI,
	#[serde(rename = "series")]
	pub series_instance_uid: Option<UI>,
	#[serde(rename = "instance")]
	pub sop_instance_uid: Option<UI>,
}

/// Custom deserialization visitor for the `window` query parameter of the form
/// `<center>,<width>,<function>`.
struct WindowVisitor;

impl Visitor<'_> for WindowVisitor {
	type Value = Option<Window>;

	fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
		write!(formatter, "a value of <center,width,function>")
	}

	fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
	where
		E: Error,
	{
		let values = v.split(',').collect::<Vec<&str>>();
		if values.len() != 3 {
			return Err(E::custom("expected 3 comma-separated values"));
		}

		Ok(Some(Window {
			center: values[0].parse().map_err(E::custom)?,
			width: values[1].parse().map_err(E::custom)?,
			function: values[2].parse().map_err(E::custom)?,
		}))
	}
}

/// See [`WindowVisitor`].
fn deserialize_window<'de, D>(deserializer: D) -> Result<Option<Window>, D::Error>
where
	D: Deserializer<'de>,
{
	deserializer.deserialize_any(WindowVisitor)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkdataRemovalOptions {
	pub max_length: u32,
}

impl Default for BulkdataRemovalOptions {
	fn default() -> Self {
		Self { max_length: 10240 }
	}
}

/// Strips pixel data and other binary payloads, including those nested in sequences.
pub fn remove_bulkdata(object: &mut InMemDicomObject, options: &BulkdataRemovalOptions) {
	object.remove_element(tags::PIXEL_DATA);
	object.remove_element(tags::FLOAT_PIXEL_DATA);
	object.remove_element(tags::DOUBLE_FLOAT_PIXEL_DATA);
	object.remove_element(tags::PIXEL_DATA_PROVIDER_URL);
	object.remove_element(tags::SPECTROSCOPY_DATA);
	object.remove_element(tags::ENCAPSULATED_DOCUMENT);

	let bulk_tags: Vec<(Tag, VR, Length)> = object
		.iter()
		.map(|element| (element.tag(), element.vr(), element.length()))
		.collect();
	for (tag, vr, length) in bulk_tags {
		match vr {
			VR::OB | VR::OW | VR::OD | VR::OF | VR::OL => {
				object.remove_element(tag);
			}
			// 10240 is the same as the maximum length allowed for LT (Long Text)
			VR::UN | VR::UT if length > Length::defined(options.max_length) => {
				object.remove_element(tag);
			}
			VR::SQ => {
				object.update_value(tag, |value| {
					if let DicomValue::Sequence(sequence) = value {
						for item in sequence.items_mut() {
							remove_bulkdata(item, options);
						}
					}
				});
			}
			_ => (),
		}
	}
}

/// Provides the functionality of a retrieve transaction.
///
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html>
pub struct WadoService {
	catalog: Catalog,
	files: Arc<dyn FileStore>,
	function: rendering::VoiLutFunction,
}

impl WadoService {
	pub fn new(catalog: Catalog, files: Arc<dyn FileStore>, config: &RenderingConfig) -> Self {
		Self {
			catalog,
			files,
			function: config.function,
		}
	}

	/// Paths of every stored instance addressed by `query`.
	async fn instance_paths(&self, query: &ResourceQuery) -> Result<Vec<PathBuf>, RetrieveError> {
		let resolved = self
			.catalog
			.resolve_path(
				&query.study_instance_uid,
				query.series_instance_uid.as_deref(),
				query.sop_instance_uid.as_deref(),
			)
			.await?;
		let study_uid = resolved.study.uid();

		if let (Some(series), Some(instance)) = (&resolved.series, &resolved.instance) {
			return Ok(vec![storage::instance_path(
				study_uid,
				series.uid(),
				instance.uid(),
			)]);
		}

		let series: Vec<Series> = match resolved.series {
			Some(series) => vec![series],
			None => {
				let filter =
					Filter::new().with_parent_ids(FilterValue::Single(resolved.study.id()));
				self.catalog.find_by(&filter, Page::unbounded()).await?
			}
		};
		let series_uids: HashMap<i64, &str> =
			series.iter().map(|series| (series.id(), series.uid())).collect();

		let Some(parent_ids) = FilterValue::from_values(series_uids.keys().copied().collect())
		else {
			return Err(RetrieveError::NoInstances);
		};
		let instances: Vec<Instance> = self
			.catalog
			.find_by(&Filter::new().with_parent_ids(parent_ids), Page::unbounded())
			.await?;

		let paths: Vec<PathBuf> = instances
			.iter()
			.filter_map(|instance| {
				let series_uid = series_uids.get(&instance.record().parent_id?)?;
				Some(storage::instance_path(study_uid, series_uid, instance.uid()))
			})
			.collect();
		if paths.is_empty() {
			return Err(RetrieveError::NoInstances);
		}
		Ok(paths)
	}

	async fn read(&self, path: PathBuf) -> Result<Bytes, RetrieveError> {
		read_file(self.files.as_ref(), path).await
	}

	/// Streams the stored files verbatim.
	pub async fn retrieve(
		&self,
		request: RetrieveInstanceRequest,
	) -> Result<InstanceResponse, RetrieveError> {
		let paths = self.instance_paths(&request.query).await?;
		let files = Arc::clone(&self.files);
		let stream = futures::stream::iter(paths)
			.then(move |path| {
				let files = Arc::clone(&files);
				async move { read_file(files.as_ref(), path).await }
			})
			.boxed();
		Ok(InstanceResponse { stream })
	}

	/// Parses every addressed file into DICOM JSON without bulk data, keyed by lowercase tags.
	pub async fn metadata(
		&self,
		request: MetadataRequest,
	) -> Result<Vec<serde_json::Value>, RetrieveError> {
		let paths = self.instance_paths(&request.query).await?;
		let mut objects = Vec::with_capacity(paths.len());
		for path in paths {
			let data = self.read(path).await?;
			let object = tokio::task::spawn_blocking(move || {
				let mut object = dataset::parse_object(&data)?.into_inner();
				remove_bulkdata(&mut object, &BulkdataRemovalOptions::default());
				let json = serde_json::to_value(DicomJson::from(object))?;
				Ok::<_, RetrieveError>(mapping::lowercase_tag_keys(json))
			})
			.await??;
			objects.push(object);
		}
		Ok(objects)
	}

	/// Renders the first frame of a single instance.
	pub async fn render(&self, request: RenderingRequest) -> Result<RenderedResponse, RetrieveError> {
		if request.query.sop_instance_uid.is_none() {
			return Err(RetrieveError::NotAnInstance);
		}
		let mut paths = self.instance_paths(&request.query).await?;
		let path = paths.pop().ok_or(RetrieveError::NoInstances)?;
		let data = self.read(path).await?;

		let function = self.function;
		let content = tokio::task::spawn_blocking(move || {
			let object = dataset::parse_object(&data)?;
			let content = rendering::render(&object, &request.options, function)?;
			Ok::<_, RetrieveError>(content)
		})
		.await??;
		Ok(RenderedResponse(content))
	}
}

async fn read_file(files: &dyn FileStore, path: PathBuf) -> Result<Bytes, RetrieveError> {
	files
		.read(&path)
		.await
		.map_err(|source| RetrieveError::Read { path, source })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::stow::{StoreRequest, StowService};
	use crate::backend::memory::MemoryStore;
	use crate::rendering::VoiLutFunction;
	use crate::storage::LocalFileStore;
	use crate::testing::{dataset, to_part10, with_pixel_data};
	use axum::http::Uri;
	use dicom::core::value::DataSetSequence;
	use dicom::core::{DataElement, PrimitiveValue};
	use dicom::dicom_value;
	use dicom::object::mem::InMemElement;
	use futures::TryStreamExt;
	use tempfile::TempDir;

	fn config() -> RenderingConfig {
		RenderingConfig {
			window_center: None,
			window_width: None,
			function: VoiLutFunction::Sigmoid,
			downsample: false,
			quality: ImageQuality::default(),
		}
	}

	fn image(study: &str, series: &str, instance: &str) -> Bytes {
		let object = with_pixel_data(
			dataset(study, series, instance),
			2,
			2,
			8,
			dicom_value!(U8, [0, 64, 128, 255]),
		);
		Bytes::from(to_part10(object))
	}

	async fn service(objects: Vec<Bytes>) -> (TempDir, WadoService) {
		let root = tempfile::tempdir().unwrap();
		let catalog = Catalog::new(MemoryStore::new());
		let files: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(root.path()));

		let stow = StowService::new(catalog.clone(), Arc::clone(&files));
		let response = stow
			.store(StoreRequest {
				objects,
				study_instance_uid: None,
			})
			.await;
		assert!(response.outcomes.iter().all(Result::is_ok));

		(root, WadoService::new(catalog, files, &config()))
	}

	fn query(study: &str, series: Option<&str>, instance: Option<&str>) -> ResourceQuery {
		ResourceQuery {
			study_instance_uid: study.to_owned(),
			series_instance_uid: series.map(str::to_owned),
			sop_instance_uid: instance.map(str::to_owned),
		}
	}

	async fn retrieve(service: &WadoService, query: ResourceQuery) -> Result<Vec<Bytes>, RetrieveError> {
		let response = service.retrieve(RetrieveInstanceRequest { query }).await?;
		response.stream.try_collect().await
	}

	#[tokio::test]
	async fn retrieve_collects_files_of_every_level() {
		let files = vec![
			image("S1", "SE1", "I1"),
			image("S1", "SE1", "I2"),
			image("S1", "SE2", "I3"),
		];
		let (_root, service) = service(files.clone()).await;

		let mut study = retrieve(&service, query("S1", None, None)).await.unwrap();
		study.sort();
		let mut expected = files.clone();
		expected.sort();
		assert_eq!(study, expected);

		let series = retrieve(&service, query("S1", Some("SE2"), None)).await.unwrap();
		assert_eq!(series, vec![files[2].clone()]);

		let instance = retrieve(&service, query("S1", Some("SE1"), Some("I2")))
			.await
			.unwrap();
		assert_eq!(instance, vec![files[1].clone()]);
	}

	#[tokio::test]
	async fn unresolved_uids_are_not_found() {
		let (_root, service) = service(vec![image("S1", "SE1", "I1")]).await;

		for query in [
			query("S2", None, None),
			query("S1", Some("SE9"), None),
			query("S1", Some("SE1"), Some("I9")),
		] {
			let err = retrieve(&service, query).await.unwrap_err();
			assert!(matches!(err, RetrieveError::Resolve(ResolveError::NotFound { .. })));
			assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
		}
	}

	#[tokio::test]
	async fn metadata_excludes_pixel_data() {
		let (_root, service) = service(vec![image("S1", "SE1", "I1")]).await;
		let metadata = service
			.metadata(MetadataRequest {
				query: query("S1", None, None),
			})
			.await
			.unwrap();

		let json = serde_json::to_value(&metadata).unwrap();
		assert_eq!(json[0]["0020000d"]["Value"][0], "S1");
		assert_eq!(json[0]["00280010"]["Value"][0], 2);
		assert!(json[0].get("7fe00010").is_none());
		assert!(json[0].get("0020000D").is_none());
	}

	#[tokio::test]
	async fn render_encodes_single_instance() {
		let (_root, service) = service(vec![image("S1", "SE1", "I1")]).await;
		let options = RenderingOptions::from_request(
			RetrieveRenderedQueryParameters {
				accept: None,
				quality: None,
				window: None,
			},
			Some("image/png"),
			&config(),
		);

		let RenderedResponse(png) = service
			.render(RenderingRequest {
				query: query("S1", Some("SE1"), Some("I1")),
				options: options.clone(),
			})
			.await
			.unwrap();
		assert_eq!(&png[1..4], b"PNG");

		let err = service
			.render(RenderingRequest {
				query: query("S1", Some("SE1"), None),
				options,
			})
			.await
			.unwrap_err();
		assert!(matches!(err, RetrieveError::NotAnInstance));
	}

	#[test]
	fn rendering_options_prefer_request_parameters() {
		let configured = RenderingConfig {
			window_center: Some(40.0),
			window_width: Some(400.0),
			quality: ImageQuality::new(80).unwrap(),
			..config()
		};

		let defaults = RenderingOptions::from_request(
			RetrieveRenderedQueryParameters {
				accept: None,
				quality: None,
				window: None,
			},
			Some("image/gif"),
			&configured,
		);
		assert_eq!(defaults.media_type, RenderedMediaType::Gif);
		assert_eq!(defaults.quality.as_u8(), 80);
		assert_eq!(
			defaults.window,
			Some(Window {
				center: 40.0,
				width: 400.0,
				function: VoiLutFunction::Sigmoid,
			})
		);

		let window = Window {
			center: 100.0,
			width: 200.0,
			function: VoiLutFunction::Linear,
		};
		let requested = RenderingOptions::from_request(
			RetrieveRenderedQueryParameters {
				accept: Some(RenderedMediaType::Png),
				quality: Some(ImageQuality::new(10).unwrap()),
				window: Some(window.clone()),
			},
			Some("image/gif"),
			&configured,
		);
		assert_eq!(requested.media_type, RenderedMediaType::Png);
		assert_eq!(requested.quality.as_u8(), 10);
		assert_eq!(requested.window, Some(window));
	}

	#[test]
	fn parse_rendered_query_params() {
		let uri = Uri::from_static("http://test?window=100,200,SIGMOID&quality=50");
		let Query(params) = Query::<RetrieveRenderedQueryParameters>::try_from_uri(&uri).unwrap();

		assert_eq!(
			params,
			RetrieveRenderedQueryParameters {
				accept: None,
				quality: Some(ImageQuality::new(50).unwrap()),
				window: Some(Window {
					center: 100.0,
					width: 200.0,
					function: VoiLutFunction::Sigmoid,
				}),
			}
		);

		let uri = Uri::from_static("http://test?window=100,200");
		assert!(Query::<RetrieveRenderedQueryParameters>::try_from_uri(&uri).is_err());
	}

	#[test]
	fn remove_bulkdata_recurses_into_sequences() {
		let item = InMemDicomObject::from_element_iter([
			DataElement::new(tags::CODE_VALUE, VR::SH, PrimitiveValue::from("121")),
			DataElement::new(tags::ICC_PROFILE, VR::OB, dicom_value!(U8, [1, 2, 3])),
		]);
		let mut object = with_pixel_data(dataset("S1", "SE1", "I1"), 1, 1, 8, dicom_value!(U8, [1]));
		object.put(InMemElement::new(
			tags::REFERENCED_IMAGE_SEQUENCE,
			VR::SQ,
			DicomValue::Sequence(DataSetSequence::new(vec![item], Length::UNDEFINED)),
		));
		object.put(DataElement::new(
			tags::TEXT_VALUE,
			VR::UT,
			PrimitiveValue::from("x".repeat(20_000)),
		));

		remove_bulkdata(&mut object, &BulkdataRemovalOptions::default());

		assert!(object.element(tags::PIXEL_DATA).is_err());
		assert!(object.element(tags::TEXT_VALUE).is_err());
		assert!(object.element(tags::STUDY_INSTANCE_UID).is_ok());
		let sequence = object.element(tags::REFERENCED_IMAGE_SEQUENCE).unwrap();
		let items = sequence.items().unwrap();
		assert!(items[0].element(tags::CODE_VALUE).is_ok());
		assert!(items[0].element(tags::ICC_PROFILE).is_err());
	}
}
