use crate::api::tools::UpdateToolsRequest;
use crate::backend::ServiceProvider;
use crate::types::UI;
use crate::AppState;
use axum::extract::Path;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tracing::instrument;

/// HTTP Router for the viewer tools data of instances.
pub fn routes() -> Router<AppState> {
	Router::new().route("/instance/{instance}/tools", get(load_tools).put(update_tools))
}

#[instrument(skip_all, fields(sop_instance_uid = %instance))]
async fn load_tools(provider: ServiceProvider, Path(instance): Path<UI>) -> impl IntoResponse {
	match provider.tools.load(&instance).await {
		Ok(tools_data) => Json(tools_data).into_response(),
		Err(err) => err.into_response(),
	}
}

#[instrument(skip_all, fields(sop_instance_uid = %instance))]
async fn update_tools(
	provider: ServiceProvider,
	Path(instance): Path<UI>,
	Json(request): Json<UpdateToolsRequest>,
) -> impl IntoResponse {
	match provider.tools.update(&instance, request).await {
		Ok(tools_data) => Json(tools_data).into_response(),
		Err(err) => err.into_response(),
	}
}
