use crate::api::stow::{StoreRequest, StoreResponse};
use crate::backend::ServiceProvider;
use crate::catalog::Entity;
use crate::config::StowResponseMode;
use crate::mapping;
use crate::types::QueryRetrieveLevel;
use crate::utils::multipart::DicomMultipart;
use crate::AppState;
use axum::extract::rejection::LengthLimitError;
use axum::extract::{FromRef, FromRequest, Path, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, RequestExt, Router};
use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, instrument, warn};

/// HTTP Router for the Store Transaction
///
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.5>
pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/studies", post(studies))
		.route("/studies/{study}", post(study))
}

#[derive(Debug, Error)]
pub enum StowRejection {
	#[error("Unsupported media type {0:?}, expected application/dicom or multipart/related")]
	UnsupportedMediaType(String),
	#[error("The multipart/related request has no boundary")]
	MissingBoundary,
	#[error("Upload limit exceeded")]
	UploadLimitExceeded,
	#[error("Part {index} has media type {content_type:?}, expected application/dicom")]
	InvalidPart { index: usize, content_type: String },
	#[error("The request contains no DICOM files")]
	Empty,
	#[error("Failed to read multipart stream: {0}")]
	Stream(multer::Error),
	#[error("Failed to read request body: {0}")]
	Body(axum::Error),
}

impl IntoResponse for StowRejection {
	fn into_response(self) -> Response {
		warn!("Rejected upload: {self}");
		(StatusCode::BAD_REQUEST, self.to_string()).into_response()
	}
}

fn is_limit_exceeded(err: &(dyn std::error::Error + 'static)) -> bool {
	let mut source = Some(err);
	while let Some(err) = source {
		if err.is::<LengthLimitError>() {
			return true;
		}
		source = err.source();
	}
	false
}

impl From<multer::Error> for StowRejection {
	fn from(err: multer::Error) -> Self {
		match &err {
			multer::Error::StreamSizeExceeded { .. } => Self::UploadLimitExceeded,
			multer::Error::StreamReadFailed(stream_error) if is_limit_exceeded(stream_error.as_ref()) => {
				Self::UploadLimitExceeded
			}
			_ => Self::Stream(err),
		}
	}
}

impl From<axum::Error> for StowRejection {
	fn from(err: axum::Error) -> Self {
		if is_limit_exceeded(&err) {
			Self::UploadLimitExceeded
		} else {
			Self::Body(err)
		}
	}
}

/// The files of a STOW-RS request body.
///
/// Accepts a single `application/dicom` body or a `multipart/related` body whose parts are all
/// `application/dicom`.
pub struct DicomUpload(pub Vec<Bytes>);

impl<S> FromRequest<S> for DicomUpload
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = StowRejection;

	async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
		let max_size = AppState::from_ref(state).config.server.http.max_upload_size;

		let content_length = request
			.headers()
			.get(CONTENT_LENGTH)
			.and_then(|value| value.to_str().ok())
			.and_then(|value| value.parse::<usize>().ok());
		if content_length.is_some_and(|length| length > max_size) {
			return Err(StowRejection::UploadLimitExceeded);
		}

		let content_type = request
			.headers()
			.get(CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.unwrap_or_default()
			.to_owned();

		let is_single_file = content_type
			.parse::<mime::Mime>()
			.is_ok_and(|mime| mime.essence_str() == "application/dicom");
		if is_single_file {
			let data = axum::body::to_bytes(request.with_limited_body().into_body(), max_size).await?;
			if data.is_empty() {
				return Err(StowRejection::Empty);
			}
			return Ok(Self(vec![data]));
		}

		let boundary = DicomMultipart::parse_boundary(&content_type).map_err(|err| match err {
			multer::Error::NoBoundary => StowRejection::MissingBoundary,
			_ => StowRejection::UnsupportedMediaType(content_type.clone()),
		})?;

		let mut multipart =
			DicomMultipart::new(request.with_limited_body().into_body(), boundary, max_size);
		let mut files = Vec::new();
		while let Some(field) = multipart.next_field().await? {
			let part_type = field.content_type().map(mime::Mime::essence_str);
			if part_type != Some("application/dicom") {
				return Err(StowRejection::InvalidPart {
					index: files.len(),
					content_type: part_type.unwrap_or_default().to_owned(),
				});
			}
			files.push(field.bytes().await?);
		}

		if files.is_empty() {
			return Err(StowRejection::Empty);
		}
		Ok(Self(files))
	}
}

/// Renders the outcomes in the configured response mode.
fn stow_response(mode: StowResponseMode, response: &StoreResponse) -> Response {
	match mode {
		StowResponseMode::Status => {
			let status: Map<String, Value> = response
				.outcomes
				.iter()
				.enumerate()
				.map(|(index, outcome)| (index.to_string(), Value::Bool(outcome.is_ok())))
				.collect();
			(StatusCode::OK, Json(status)).into_response()
		}
		StowResponseMode::Study => {
			let Some(study) = response.last_study() else {
				return (StatusCode::CONFLICT, "None of the uploaded files could be stored")
					.into_response();
			};
			let mut json = Map::new();
			match mapping::format_record(QueryRetrieveLevel::Study, study.record(), |_| true, &mut json)
			{
				Ok(()) => (StatusCode::OK, Json(json)).into_response(),
				Err(err) => {
					error!("{err}");
					(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
				}
			}
		}
	}
}

#[instrument(skip_all)]
async fn studies(
	provider: ServiceProvider,
	State(state): State<AppState>,
	DicomUpload(objects): DicomUpload,
) -> impl IntoResponse {
	let request = StoreRequest {
		objects,
		study_instance_uid: None,
	};
	let response = provider.stow.store(request).await;
	stow_response(state.config.stow.response, &response)
}

#[instrument(skip_all, fields(study_instance_uid = %study))]
async fn study(
	provider: ServiceProvider,
	State(state): State<AppState>,
	Path(study): Path<String>,
	DicomUpload(objects): DicomUpload,
) -> impl IntoResponse {
	let request = StoreRequest {
		objects,
		study_instance_uid: Some(study),
	};
	let response = provider.stow.store(request).await;
	stow_response(state.config.stow.response, &response)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::stow::{IngestError, StoredInstance};
	use crate::catalog::{Record, Study};
	use axum::body::Body;
	use dicom::dictionary_std::tags;

	fn stored(study_uid: &str) -> StoredInstance {
		let mut record = Record::default();
		record
			.attributes
			.insert(tags::STUDY_INSTANCE_UID, study_uid.to_owned());
		StoredInstance {
			study: Study::from_record(record),
			sop_instance_uid: "1".to_owned(),
		}
	}

	async fn json_body(response: Response) -> Value {
		let body = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		serde_json::from_slice(&body).unwrap()
	}

	#[tokio::test]
	async fn status_mode_reports_each_object() {
		let response = StoreResponse {
			outcomes: vec![
				Ok(stored("S1")),
				Err(IngestError::MissingUid {
					level: QueryRetrieveLevel::Study,
				}),
			],
		};
		let response = stow_response(StowResponseMode::Status, &response);
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(
			json_body(response).await,
			serde_json::json!({"0": true, "1": false})
		);
	}

	#[tokio::test]
	async fn study_mode_formats_last_stored_study() {
		let response = StoreResponse {
			outcomes: vec![Ok(stored("S1")), Ok(stored("S2"))],
		};
		let response = stow_response(StowResponseMode::Study, &response);
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(
			json_body(response).await["0020000d"],
			serde_json::json!({"vr": "UI", "Value": ["S2"]})
		);
	}

	#[test]
	fn study_mode_conflicts_without_stored_objects() {
		let response = StoreResponse {
			outcomes: vec![Err(IngestError::MissingUid {
				level: QueryRetrieveLevel::Image,
			})],
		};
		let response = stow_response(StowResponseMode::Study, &response);
		assert_eq!(response.status(), StatusCode::CONFLICT);
	}

	async fn upload(content_type: &str, body: Vec<u8>) -> Result<Vec<Bytes>, StowRejection> {
		let root = tempfile::tempdir().unwrap();
		let state = crate::testing::app_state(root.path()).await;
		let request = Request::builder()
			.header(CONTENT_TYPE, content_type)
			.header(CONTENT_LENGTH, body.len())
			.body(Body::from(body))
			.unwrap();
		DicomUpload::from_request(request, &state)
			.await
			.map(|DicomUpload(files)| files)
	}

	#[tokio::test]
	async fn accepts_single_file_body() {
		let files = upload("application/dicom", b"DICM".to_vec()).await.unwrap();
		assert_eq!(files, vec![Bytes::from_static(b"DICM")]);
	}

	#[tokio::test]
	async fn accepts_multipart_related_body() {
		let body = b"--b\r\nContent-Type: application/dicom\r\n\r\none\r\n--b\r\nContent-Type: application/dicom\r\n\r\ntwo\r\n--b--\r\n";
		let files = upload(r#"multipart/related; type="application/dicom"; boundary=b"#, body.to_vec())
			.await
			.unwrap();
		assert_eq!(files, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
	}

	#[tokio::test]
	async fn rejects_malformed_uploads() {
		assert!(matches!(
			upload("application/json", b"{}".to_vec()).await,
			Err(StowRejection::UnsupportedMediaType(_))
		));
		assert!(matches!(
			upload("multipart/related", Vec::new()).await,
			Err(StowRejection::MissingBoundary)
		));
		assert!(matches!(
			upload("multipart/related; boundary=b", b"--b--\r\n".to_vec()).await,
			Err(StowRejection::Empty)
		));

		let body = b"--b\r\nContent-Type: text/plain\r\n\r\nhello\r\n--b--\r\n";
		assert!(matches!(
			upload("multipart/related; boundary=b", body.to_vec()).await,
			Err(StowRejection::InvalidPart { index: 0, .. })
		));
	}

	#[tokio::test]
	async fn rejects_oversized_uploads() {
		let root = tempfile::tempdir().unwrap();
		let state = crate::testing::app_state(root.path()).await;
		let max_size = state.config.server.http.max_upload_size;
		let request = Request::builder()
			.header(CONTENT_TYPE, "application/dicom")
			.header(CONTENT_LENGTH, max_size + 1)
			.body(Body::empty())
			.unwrap();
		assert!(matches!(
			DicomUpload::from_request(request, &state).await,
			Err(StowRejection::UploadLimitExceeded)
		));
	}
}
