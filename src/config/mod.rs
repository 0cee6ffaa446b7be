use crate::rendering::{ImageQuality, VoiLutFunction};
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub catalog: CatalogConfig,
	pub storage: StorageConfig,
	pub stow: StowConfig,
	pub rendering: RenderingConfig,
}

impl AppConfig {
	/// Loads the configuration from the following sources, each overriding the previous one:
	/// 1. The embedded `defaults.toml`
	/// 2. `config.toml` in the working directory, if present
	/// 3. Environment variables prefixed with `DICOM_ARCHIVE`
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let config = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(config::Environment::with_prefix("DICOM_ARCHIVE").separator("_"))
			.build()?;

		config.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Default log level. `RUST_LOG` takes precedence.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: tracing::Level,
	/// Sentry DSN. Sentry is disabled if absent.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let level = String::deserialize(deserializer)?;
	tracing::Level::from_str(&level).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub http: HttpServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	/// Prefix of all DICOMweb routes.
	pub base_path: String,
	/// Maximum size of a request body in bytes.
	pub max_upload_size: usize,
	/// Request timeout in seconds.
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CatalogConfig {
	/// Process-local catalog. Its content is lost on shutdown.
	Memory,
	Postgres(PostgresConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PostgresConfig {
	pub url: String,
	#[serde(default = "PostgresConfig::default_max_connections")]
	pub max_connections: u32,
	/// Applies the embedded schema migrations on startup.
	#[serde(default = "PostgresConfig::default_migrate")]
	pub migrate: bool,
}

impl PostgresConfig {
	const fn default_max_connections() -> u32 {
		20
	}

	const fn default_migrate() -> bool {
		true
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
	/// Directory below which instance files are stored.
	pub root: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StowConfig {
	pub response: StowResponseMode,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StowResponseMode {
	/// Map from the index of each uploaded object to its outcome.
	Status,
	/// Catalog attributes of the study the objects were stored in.
	Study,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RenderingConfig {
	/// Default window center. Tuned to the bit depth of the image if absent.
	pub window_center: Option<f64>,
	/// Default window width. Tuned to the bit depth of the image if absent.
	pub window_width: Option<f64>,
	pub function: VoiLutFunction,
	/// Halves the number of rows and columns of rendered images.
	pub downsample: bool,
	pub quality: ImageQuality,
}
