use crate::api::wado::{
	MetadataRequest, RenderedResponse, RenderingRequest, ResourceQuery, RetrieveInstanceRequest,
};
use crate::backend::ServiceProvider;
use crate::types::UI;
use crate::utils::multipart::DicomMultipartWriter;
use crate::AppState;
use axum::body::Body;
use axum::extract::Query;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_streams::StreamBodyAs;
use serde::Deserialize;
use thiserror::Error;
use tracing::{instrument, warn};

/// HTTP Router for the Retrieve Transaction
///
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.4>
#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
	Router::new()
		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#sect_10.4.1.1.1
		.route("/studies/{study}", get(study_instances))
		.route("/studies/{study}/series/{series}", get(series_instances))
		.route("/studies/{study}/series/{series}/instances/{instance}", get(instance))

		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#sect_10.4.1.1.2
		.route("/studies/{study}/metadata", get(study_metadata))
		.route("/studies/{study}/series/{series}/metadata", get(series_metadata))
		.route("/studies/{study}/series/{series}/instances/{instance}/metadata", get(instance_metadata))

		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#sect_10.4.1.1.3
		.route("/studies/{study}/series/{series}/instances/{instance}/rendered", get(rendered_instance))

		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_9.html
		.route("/wado", get(wado_uri))
}

async fn instance_resource(provider: ServiceProvider, request: RetrieveInstanceRequest) -> Response {
	let study_instance_uid: UI = request.query.study_instance_uid.clone();
	let response = match provider.wado.retrieve(request).await {
		Ok(response) => response,
		Err(err) => return err.into_response(),
	};

	let writer = DicomMultipartWriter::new();
	Response::builder()
		.header(
			CONTENT_DISPOSITION,
			format!(r#"attachment; filename="{study_instance_uid}""#),
		)
		.header(CONTENT_TYPE, writer.content_type())
		.body(Body::from_stream(writer.into_stream(response.stream)))
		.map_or_else(
			|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
			IntoResponse::into_response,
		)
}

async fn rendered_resource(provider: ServiceProvider, request: RenderingRequest) -> Response {
	let content_type = request.options.media_type.to_string();
	match provider.wado.render(request).await {
		Ok(RenderedResponse(content)) => {
			([(CONTENT_TYPE, content_type)], Body::from(content)).into_response()
		}
		Err(err) => err.into_response(),
	}
}

async fn metadata_resource(provider: ServiceProvider, request: MetadataRequest) -> Response {
	match provider.wado.metadata(request).await {
		Ok(json) => Response::builder()
			.status(StatusCode::OK)
			.header(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
			.body(StreamBodyAs::json_array(futures::stream::iter(json)))
			.map_or_else(
				|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
				IntoResponse::into_response,
			),
		Err(err) => err.into_response(),
	}
}

#[instrument(skip_all)]
async fn study_instances(
	provider: ServiceProvider,
	request: RetrieveInstanceRequest,
) -> impl IntoResponse {
	instance_resource(provider, request).await
}

#[instrument(skip_all)]
async fn series_instances(
	provider: ServiceProvider,
	request: RetrieveInstanceRequest,
) -> impl IntoResponse {
	instance_resource(provider, request).await
}

#[instrument(skip_all)]
async fn instance(
	provider: ServiceProvider,
	request: RetrieveInstanceRequest,
) -> impl IntoResponse {
	instance_resource(provider, request).await
}

#[instrument(skip_all)]
async fn study_metadata(provider: ServiceProvider, request: MetadataRequest) -> impl IntoResponse {
	metadata_resource(provider, request).await
}

#[instrument(skip_all)]
async fn series_metadata(provider: ServiceProvider, request: MetadataRequest) -> impl IntoResponse {
	metadata_resource(provider, request).await
}

#[instrument(skip_all)]
async fn instance_metadata(
	provider: ServiceProvider,
	request: MetadataRequest,
) -> impl IntoResponse {
	metadata_resource(provider, request).await
}

#[instrument(skip_all)]
async fn rendered_instance(
	provider: ServiceProvider,
	request: RenderingRequest,
) -> impl IntoResponse {
	rendered_resource(provider, request).await
}

/// Query parameters of a URI based WADO request.
///
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_9.html#table_9.1.2-1>
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WadoUriParameters {
	pub request_type: Option<String>,
	#[serde(rename = "studyUID")]
	pub study_uid: Option<UI>,
	#[serde(rename = "seriesUID")]
	pub series_uid: Option<UI>,
	#[serde(rename = "objectUID")]
	pub object_uid: Option<UI>,
	pub content_type: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum WadoUriError {
	#[error("Missing required parameter {0}")]
	Missing(&'static str),
	#[error("Invalid value {value:?} for parameter {name}")]
	Invalid { name: &'static str, value: String },
}

impl IntoResponse for WadoUriError {
	fn into_response(self) -> Response {
		warn!("Rejected WADO-URI request: {self}");
		(StatusCode::BAD_REQUEST, self.to_string()).into_response()
	}
}

fn required<T>(value: Option<T>, name: &'static str) -> Result<T, WadoUriError> {
	value.ok_or(WadoUriError::Missing(name))
}

fn expect_value(value: Option<String>, name: &'static str, expected: &str) -> Result<(), WadoUriError> {
	let value = required(value, name)?;
	if value == expected {
		Ok(())
	} else {
		Err(WadoUriError::Invalid { name, value })
	}
}

impl WadoUriParameters {
	/// Checks the mandatory parameters. Only `application/dicom` responses are supported.
	pub fn into_query(self) -> Result<ResourceQuery, WadoUriError> {
		expect_value(self.request_type, "requestType", "WADO")?;
		let study = required(self.study_uid, "studyUID")?;
		let series = required(self.series_uid, "seriesUID")?;
		let object = required(self.object_uid, "objectUID")?;
		expect_value(self.content_type, "contentType", "application/dicom")?;

		Ok(ResourceQuery {
			study_instance_uid: study,
			series_instance_uid: Some(series),
			sop_instance_uid: Some(object),
		})
	}
}

#[instrument(skip_all)]
async fn wado_uri(
	provider: ServiceProvider,
	Query(parameters): Query<WadoUriParameters>,
) -> Response {
	match parameters.into_query() {
		Ok(query) => instance_resource(provider, RetrieveInstanceRequest { query }).await,
		Err(err) => err.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::http::Uri;

	fn parse(uri: &'static str) -> Result<ResourceQuery, WadoUriError> {
		let Query(parameters) = Query::<WadoUriParameters>::try_from_uri(&Uri::from_static(uri)).unwrap();
		parameters.into_query()
	}

	#[test]
	fn wado_uri_parameters_resolve_instance() {
		let query = parse(
			"http://test/wado?requestType=WADO&studyUID=1&seriesUID=2&objectUID=3&contentType=application%2Fdicom",
		)
		.unwrap();
		assert_eq!(
			query,
			ResourceQuery {
				study_instance_uid: "1".to_owned(),
				series_instance_uid: Some("2".to_owned()),
				sop_instance_uid: Some("3".to_owned()),
			}
		);
	}

	#[test]
	fn wado_uri_names_missing_or_invalid_parameter() {
		assert_eq!(
			parse("http://test/wado?studyUID=1&seriesUID=2&objectUID=3&contentType=application%2Fdicom"),
			Err(WadoUriError::Missing("requestType"))
		);
		assert_eq!(
			parse("http://test/wado?requestType=WADO&studyUID=1&objectUID=3&contentType=application%2Fdicom"),
			Err(WadoUriError::Missing("seriesUID"))
		);
		assert_eq!(
			parse("http://test/wado?requestType=WADO&studyUID=1&seriesUID=2&objectUID=3&contentType=image%2Fjpeg"),
			Err(WadoUriError::Invalid {
				name: "contentType",
				value: "image/jpeg".to_owned()
			})
		);

		let response = WadoUriError::Missing("objectUID").into_response();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}
}
