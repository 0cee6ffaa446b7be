use crate::api::qido::{QueryParameters, ResourceQuery, SearchRequest};
use crate::backend::ServiceProvider;
use crate::types::QueryRetrieveLevel;
use crate::AppState;
use axum::extract::Path;
use axum::http::header;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::extract::Query;
use axum_streams::StreamBodyAs;
use tracing::instrument;

/// HTTP Router for the Search Transaction.
///
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.6>
#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/studies", get(all_studies))
		.route("/studies/{study}/series", get(studys_series))
		.route("/studies/{study}/series/{series}/instances", get(studys_series_instances))
		.route("/studies/{study}/instances", get(studys_instances))
		.route("/series", get(all_series))
		.route("/instances", get(all_instances))
}

/// Header carrying the number of matches before pagination.
pub const TOTAL_COUNT: &str = "X-Total-Count";

async fn qido_handler(provider: ServiceProvider, request: SearchRequest) -> Response {
	match provider.qido.search(request).await {
		Ok(response) => Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
			.header(TOTAL_COUNT, response.total)
			.body(StreamBodyAs::json_array(futures::stream::iter(
				response.matches,
			)))
			.map_or_else(
				|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
				IntoResponse::into_response,
			),
		Err(err) => err.into_response(),
	}
}

fn search_request(
	query_retrieve_level: QueryRetrieveLevel,
	study_instance_uid: Option<String>,
	series_instance_uid: Option<String>,
	parameters: QueryParameters,
) -> SearchRequest {
	SearchRequest {
		query: ResourceQuery {
			query_retrieve_level,
			study_instance_uid,
			series_instance_uid,
		},
		parameters,
	}
}

#[instrument(skip_all)]
async fn all_studies(
	provider: ServiceProvider,
	Query(parameters): Query<QueryParameters>,
) -> impl IntoResponse {
	let request = search_request(QueryRetrieveLevel::Study, None, None, parameters);
	qido_handler(provider, request).await
}

#[instrument(skip_all, fields(study_instance_uid = %study))]
async fn studys_series(
	provider: ServiceProvider,
	Path(study): Path<String>,
	Query(parameters): Query<QueryParameters>,
) -> impl IntoResponse {
	let request = search_request(QueryRetrieveLevel::Series, Some(study), None, parameters);
	qido_handler(provider, request).await
}

#[instrument(skip_all, fields(study_instance_uid = %study, series_instance_uid = %series))]
async fn studys_series_instances(
	provider: ServiceProvider,
	Path((study, series)): Path<(String, String)>,
	Query(parameters): Query<QueryParameters>,
) -> impl IntoResponse {
	let request = search_request(
		QueryRetrieveLevel::Image,
		Some(study),
		Some(series),
		parameters,
	);
	qido_handler(provider, request).await
}

#[instrument(skip_all, fields(study_instance_uid = %study))]
async fn studys_instances(
	provider: ServiceProvider,
	Path(study): Path<String>,
	Query(parameters): Query<QueryParameters>,
) -> impl IntoResponse {
	let request = search_request(QueryRetrieveLevel::Image, Some(study), None, parameters);
	qido_handler(provider, request).await
}

#[instrument(skip_all)]
async fn all_series(
	provider: ServiceProvider,
	Query(parameters): Query<QueryParameters>,
) -> impl IntoResponse {
	let request = search_request(QueryRetrieveLevel::Series, None, None, parameters);
	qido_handler(provider, request).await
}

#[instrument(skip_all)]
async fn all_instances(
	provider: ServiceProvider,
	Query(parameters): Query<QueryParameters>,
) -> impl IntoResponse {
	let request = search_request(QueryRetrieveLevel::Image, None, None, parameters);
	qido_handler(provider, request).await
}
