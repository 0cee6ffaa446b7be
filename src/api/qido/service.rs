use crate::catalog::{
	Catalog, Entity, Filter, FilterValue, Page, Record, ResolveError, Series, StoreError, Study,
};
use crate::dictionary::{self, TagKey};
use crate::mapping::{self, FormatError};
use crate::types::{QueryRetrieveLevel, UI};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dicom::core::Tag;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Formatter;
use thiserror::Error;
use tracing::{debug, error};

pub struct SearchRequest {
	pub query: ResourceQuery,
	pub parameters: QueryParameters,
}

/// Data used to identify a specific search transaction resource.
///
/// As an example, the "Study's Series" resource searches for all series in a specified study.
/// This information can be represented as follows:
/// ```ignore
/// let studys_series_query = ResourceQuery {
///   // Search for series...
///   query_retrieve_level: QueryRetrieveLevel::Series,
///   // for the study with UID 123.
///   study_instance_uid: Some("123".into()),
///   // Not used as we want to select *all* series.
///   series_instance_uid: None
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ResourceQuery {
	/// The query retrieve level.
	pub query_retrieve_level: QueryRetrieveLevel,
	/// The UID of the study.
	pub study_instance_uid: Option<UI>,
	/// The UID of the series.
	pub series_instance_uid: Option<UI>,
}

/// Attributes to return in addition to the unique keys of each level.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IncludeField {
	#[default]
	All,
	List(Vec<Tag>),
}

impl IncludeField {
	pub fn includes(&self, tag: Tag) -> bool {
		match self {
			Self::All => true,
			Self::List(tags) => tags.contains(&tag),
		}
	}
}

/// Query parameters for a QIDO-RS request.
///
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#table_8.3.4-1>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameters {
	/// Allowed values per attribute.
	pub match_criteria: BTreeMap<Tag, FilterValue>,
	pub include_field: IncludeField,
	pub limit: usize,
	pub offset: usize,
}

impl Default for QueryParameters {
	fn default() -> Self {
		Self {
			match_criteria: BTreeMap::new(),
			include_field: IncludeField::All,
			limit: 10,
			offset: 0,
		}
	}
}

fn split_values(values: &[String]) -> impl Iterator<Item = &str> {
	values
		.iter()
		.flat_map(|value| value.split(','))
		.map(str::trim)
		.filter(|value| !value.is_empty())
}

fn resolve_tag(name: &str) -> Option<Tag> {
	match dictionary::resolve(name) {
		Ok(info) => Some(info.tag),
		Err(err) => {
			debug!(name, kind = ?TagKey::classify(name), "Skipping query parameter: {err}");
			None
		}
	}
}

impl QueryParameters {
	/// Interprets the decoded query string. Repeated keys accumulate their values.
	pub fn from_pairs<I>(pairs: I) -> Self
	where
		I: IntoIterator<Item = (String, Vec<String>)>,
	{
		let mut parameters = Self::default();
		let mut includes = Vec::new();
		let mut include_all = false;
		let mut criteria: BTreeMap<Tag, Vec<String>> = BTreeMap::new();

		for (key, values) in pairs {
			match key.as_str() {
				"limit" => match values.last().map(|value| value.parse()) {
					Some(Ok(limit)) => parameters.limit = limit,
					_ => debug!(?values, "Ignoring invalid limit"),
				},
				"offset" => match values.last().map(|value| value.parse()) {
					Some(Ok(offset)) => parameters.offset = offset,
					_ => debug!(?values, "Ignoring invalid offset"),
				},
				"includefield" => {
					for value in split_values(&values) {
						if value == "all" {
							include_all = true;
						} else if let Some(tag) = resolve_tag(value) {
							includes.push(tag);
						}
					}
				}
				name => {
					if let Some(tag) = resolve_tag(name) {
						criteria
							.entry(tag)
							.or_default()
							.extend(split_values(&values).map(String::from));
					}
				}
			}
		}

		parameters.include_field = if include_all || includes.is_empty() {
			IncludeField::All
		} else {
			IncludeField::List(includes)
		};
		parameters.match_criteria = criteria
			.into_iter()
			.filter_map(|(tag, values)| FilterValue::from_values(values).map(|value| (tag, value)))
			.collect();
		parameters
	}
}

struct QueryParametersVisitor;

impl<'de> Visitor<'de> for QueryParametersVisitor {
	type Value = QueryParameters;

	fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
		write!(formatter, "a query string of QIDO-RS parameters")
	}

	fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
	where
		A: MapAccess<'de>,
	{
		let mut pairs = Vec::new();
		while let Some(pair) = map.next_entry::<String, Vec<String>>()? {
			pairs.push(pair);
		}
		Ok(QueryParameters::from_pairs(pairs))
	}
}

impl<'de> Deserialize<'de> for QueryParameters {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		deserializer.deserialize_map(QueryParametersVisitor)
	}
}

#[derive(Debug)]
pub struct SearchResponse {
	/// One DICOM JSON object per match, including the attributes of its ancestors.
	pub matches: Vec<Map<String, Value>>,
	/// Number of matches before pagination.
	pub total: u64,
}

impl SearchResponse {
	const fn empty() -> Self {
		Self {
			matches: Vec::new(),
			total: 0,
		}
	}
}

#[derive(Debug, Error)]
pub enum SearchError {
	#[error(transparent)]
	Resolve(#[from] ResolveError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Format(#[from] FormatError),
}

impl IntoResponse for SearchError {
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

/// Provides the functionality of a search transaction.
///
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.html>
pub struct QidoService {
	catalog: Catalog,
}

type LevelFilters = BTreeMap<QueryRetrieveLevel, Filter>;

/// Parent ids the query level is restricted to.
enum ParentScope {
	Any,
	Within(FilterValue<i64>),
	/// No ancestor matches, so neither does any record of the query level.
	Nothing,
}

impl QidoService {
	pub const fn new(catalog: Catalog) -> Self {
		Self { catalog }
	}

	pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, SearchError> {
		let level = request.query.query_retrieve_level;
		let parameters = request.parameters;

		// Attribute filters grouped by the level storing the attribute.
		let mut filters = LevelFilters::new();
		for (tag, value) in parameters.match_criteria {
			match QueryRetrieveLevel::of_tag(tag) {
				Some(owner) if owner <= level => {
					filters.entry(owner).or_default().attributes.insert(tag, value);
				}
				_ => debug!(%tag, %level, "Ignoring filter below the query level"),
			}
		}

		let mut filter = filters.remove(&level).unwrap_or_default();
		match self.resolve_ancestors(level, &request.query, &mut filters).await? {
			ParentScope::Any => {}
			ParentScope::Within(parent_ids) => filter.parent_ids = Some(parent_ids),
			ParentScope::Nothing => return Ok(SearchResponse::empty()),
		}

		let total = self.catalog.count_records(level, &filter).await?;
		let records = self
			.catalog
			.find_records(level, &filter, Page::new(parameters.limit, parameters.offset))
			.await?;

		let matches = self
			.format_matches(level, &records, &parameters.include_field)
			.await?;
		Ok(SearchResponse { matches, total })
	}

	/// Resolves path-bound UIDs and ancestor filters into the parent ids of the query level.
	async fn resolve_ancestors(
		&self,
		level: QueryRetrieveLevel,
		query: &ResourceQuery,
		filters: &mut LevelFilters,
	) -> Result<ParentScope, SearchError> {
		if level == QueryRetrieveLevel::Study {
			return Ok(ParentScope::Any);
		}

		let study = match &query.study_instance_uid {
			Some(uid) => Some(self.catalog.resolve::<Study>(uid, None).await?),
			None => None,
		};
		let series = match (&query.series_instance_uid, &study) {
			(Some(uid), study) => Some(
				self.catalog
					.resolve::<Series>(uid, study.as_ref().map(|study| study.id()))
					.await?,
			),
			(None, _) => None,
		};

		let mut study_ids = study.map(|study| FilterValue::Single(study.id()));
		if let Some(mut filter) = filters.remove(&QueryRetrieveLevel::Study) {
			if let Some(ids) = study_ids {
				filter.ids = Some(ids);
			}
			let Some(ids) = self.find_ids(QueryRetrieveLevel::Study, &filter).await? else {
				return Ok(ParentScope::Nothing);
			};
			study_ids = Some(ids);
		}

		if level == QueryRetrieveLevel::Series {
			return Ok(study_ids.map_or(ParentScope::Any, ParentScope::Within));
		}

		let series_filter = filters.remove(&QueryRetrieveLevel::Series);
		if series.is_none() && series_filter.is_none() && study_ids.is_none() {
			return Ok(ParentScope::Any);
		}

		let mut filter = series_filter.unwrap_or_default();
		if let Some(series) = series {
			filter.ids = Some(FilterValue::Single(series.id()));
		}
		if let Some(study_ids) = study_ids {
			filter.parent_ids = Some(study_ids);
		}
		Ok(self
			.find_ids(QueryRetrieveLevel::Series, &filter)
			.await?
			.map_or(ParentScope::Nothing, ParentScope::Within))
	}

	/// Ids of all records matching `filter`, or `None` if there are none.
	async fn find_ids(
		&self,
		level: QueryRetrieveLevel,
		filter: &Filter,
	) -> Result<Option<FilterValue<i64>>, SearchError> {
		let ids = self
			.catalog
			.find_records(level, filter, Page::unbounded())
			.await?
			.into_iter()
			.map(|record| record.id)
			.collect();
		let ids = FilterValue::from_values(ids);
		if ids.is_none() {
			debug!(%level, "No ancestor matches the query");
		}
		Ok(ids)
	}

	/// Formats the matches, merging in the attributes of their ancestors.
	async fn format_matches(
		&self,
		level: QueryRetrieveLevel,
		records: &[Record],
		include_field: &IncludeField,
	) -> Result<Vec<Map<String, Value>>, SearchError> {
		let include = |tag: Tag| is_unique_key(tag) || include_field.includes(tag);

		let mut matches = Vec::with_capacity(records.len());
		for record in records {
			let mut object = Map::new();
			mapping::format_record(level, record, include, &mut object)?;
			matches.push(object);
		}

		let mut parent_ids: Vec<Option<i64>> = records.iter().map(|record| record.parent_id).collect();
		let mut current = level;
		while let Some(parent) = current.parent() {
			let wanted: Vec<i64> = parent_ids.iter().flatten().copied().collect();
			let parents = self.find_by_ids(parent, &wanted).await?;
			for (object, parent_id) in matches.iter_mut().zip(parent_ids.iter_mut()) {
				let parent_record = parent_id.and_then(|id| parents.get(&id));
				if let Some(record) = parent_record {
					mapping::format_record(parent, record, include, object)?;
				}
				*parent_id = parent_record.and_then(|record| record.parent_id);
			}
			current = parent;
		}

		Ok(matches)
	}

	async fn find_by_ids(
		&self,
		level: QueryRetrieveLevel,
		ids: &[i64],
	) -> Result<HashMap<i64, Record>, SearchError> {
		let mut ids = ids.to_vec();
		ids.sort_unstable();
		ids.dedup();
		let Some(ids) = FilterValue::from_values(ids) else {
			return Ok(HashMap::new());
		};

		let records = self
			.catalog
			.find_records(level, &Filter::new().with_ids(ids), Page::unbounded())
			.await?;
		Ok(records.into_iter().map(|record| (record.id, record)).collect())
	}
}

fn is_unique_key(tag: Tag) -> bool {
	QueryRetrieveLevel::ALL
		.into_iter()
		.any(|level| level.business_key() == tag)
}
