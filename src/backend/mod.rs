use crate::api::qido::QidoService;
use crate::api::stow::StowService;
use crate::api::tools::ToolsService;
use crate::api::wado::WadoService;
use crate::catalog::{Catalog, StoreError};
use crate::config::CatalogConfig;
use crate::AppState;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use std::convert::Infallible;
use tracing::info;

pub mod memory;
pub mod postgres;

/// Opens the catalog store selected by the configuration.
pub async fn create_catalog(config: &CatalogConfig) -> Result<Catalog, StoreError> {
	match config {
		CatalogConfig::Memory => {
			info!("Using the in-memory catalog");
			Ok(Catalog::new(memory::MemoryStore::new()))
		}
		CatalogConfig::Postgres(postgres_config) => {
			let store = postgres::PostgresStore::connect(postgres_config).await?;
			info!(
				max_connections = postgres_config.max_connections,
				"Connected to PostgreSQL catalog"
			);
			Ok(Catalog::new(store))
		}
	}
}

/// The services of a request, sharing the catalog and file store of [`AppState`].
pub struct ServiceProvider {
	pub qido: QidoService,
	pub wado: WadoService,
	pub stow: StowService,
	pub tools: ToolsService,
}

impl<S> FromRequestParts<S> for ServiceProvider
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = Infallible;

	async fn from_request_parts(_parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let state = AppState::from_ref(state);

		Ok(Self {
			qido: QidoService::new(state.catalog.clone()),
			wado: WadoService::new(
				state.catalog.clone(),
				state.files.clone(),
				&state.config.rendering,
			),
			tools: ToolsService::new(state.catalog.clone()),
			stow: StowService::new(state.catalog, state.files),
		})
	}
}
