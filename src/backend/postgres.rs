//! Catalog store backed by PostgreSQL.
use crate::catalog::{
	Attributes, CatalogStore, Filter, FilterValue, Page, Record, StoreError, Transaction,
};
use crate::config::PostgresConfig;
use crate::types::QueryRetrieveLevel;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

type Query = QueryBuilder<'static, Postgres>;

pub struct PostgresStore {
	pool: PgPool,
}

impl PostgresStore {
	pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
		let pool = PgPoolOptions::new()
			.max_connections(config.max_connections)
			.connect(&config.url)
			.await?;

		if config.migrate {
			sqlx::migrate!("./migrations").run(&pool).await?;
			info!("Applied catalog schema migrations");
		}

		Ok(Self { pool })
	}
}

fn push_text_condition(query: &mut Query, expression: &str, value: &FilterValue) {
	query.push(" AND ").push(expression);
	match value {
		FilterValue::Single(value) => query.push(" = ").push_bind(value.clone()),
		FilterValue::Multi(values) => query.push(" = ANY(").push_bind(values.clone()).push(")"),
	};
}

fn push_id_condition(query: &mut Query, column: &str, value: &FilterValue<i64>) {
	query.push(" AND ").push(column);
	match value {
		FilterValue::Single(value) => query.push(" = ").push_bind(*value),
		FilterValue::Multi(values) => query.push(" = ANY(").push_bind(values.clone()).push(")"),
	};
}

fn push_filter(query: &mut Query, level: QueryRetrieveLevel, filter: &Filter) {
	query.push(" WHERE TRUE");
	if let Some(ids) = &filter.ids {
		push_id_condition(query, "id", ids);
	}
	if let Some(parent_ids) = &filter.parent_ids {
		match level.parent_column() {
			Some(column) => push_id_condition(query, column, parent_ids),
			None => {
				query.push(" AND FALSE");
			}
		}
	}
	for (tag, value) in &filter.attributes {
		// Attributes of other levels read as empty strings, like unset columns.
		let expression = level.column(*tag).map_or("''", |column| column.name);
		push_text_condition(query, expression, value);
	}
}

fn to_i64(value: usize) -> i64 {
	i64::try_from(value).unwrap_or(i64::MAX)
}

fn select_query(level: QueryRetrieveLevel, filter: &Filter, page: Page) -> Query {
	let mut query = QueryBuilder::new(format!("SELECT * FROM {}", level.table()));
	push_filter(&mut query, level, filter);
	query.push(" ORDER BY id");
	if let Some(limit) = page.limit {
		query.push(" LIMIT ").push_bind(to_i64(limit));
	}
	if page.offset > 0 {
		query.push(" OFFSET ").push_bind(to_i64(page.offset));
	}
	query
}

fn count_query(level: QueryRetrieveLevel, filter: &Filter) -> Query {
	let mut query = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", level.table()));
	push_filter(&mut query, level, filter);
	query
}

fn tools_data(record: &Record) -> Json<serde_json::Value> {
	Json(
		record
			.tools_data
			.clone()
			.unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
	)
}

fn insert_query(level: QueryRetrieveLevel, record: &Record) -> Query {
	let mut query = QueryBuilder::new(format!("INSERT INTO {} (", level.table()));

	let mut columns = query.separated(", ");
	for column in level.columns() {
		columns.push(column.name);
	}
	if let Some(parent) = level.parent_column() {
		columns.push(parent);
	}
	if level == QueryRetrieveLevel::Image {
		columns.push("tools_data");
	}

	query.push(") VALUES (");
	let mut values = query.separated(", ");
	for column in level.columns() {
		values.push_bind(record.attribute(column.tag).to_owned());
	}
	if level.parent_column().is_some() {
		values.push_bind(record.parent_id);
	}
	if level == QueryRetrieveLevel::Image {
		values.push_bind(tools_data(record));
	}
	query.push(") RETURNING id, created_at, updated_at");
	query
}

fn update_query(level: QueryRetrieveLevel, record: &Record) -> Query {
	let mut query = QueryBuilder::new(format!("UPDATE {} SET ", level.table()));

	let mut assignments = query.separated(", ");
	for column in level.columns() {
		assignments
			.push(format!("{} = ", column.name))
			.push_bind_unseparated(record.attribute(column.tag).to_owned());
	}
	if let Some(parent) = level.parent_column() {
		assignments
			.push(format!("{parent} = "))
			.push_bind_unseparated(record.parent_id);
	}
	if level == QueryRetrieveLevel::Image && record.tools_data.is_some() {
		assignments
			.push("tools_data = ")
			.push_bind_unseparated(tools_data(record));
	}
	assignments.push("updated_at = now()");

	query
		.push(" WHERE id = ")
		.push_bind(record.id)
		.push(" RETURNING created_at, updated_at, ")
		.push(if level == QueryRetrieveLevel::Image {
			"tools_data"
		} else {
			"NULL::jsonb AS tools_data"
		});
	query
}

fn decode_record(level: QueryRetrieveLevel, row: &PgRow) -> Result<Record, sqlx::Error> {
	let mut attributes = Attributes::new();
	for column in level.columns() {
		let value: Option<String> = row.try_get(column.name)?;
		attributes.insert(column.tag, value.unwrap_or_default());
	}

	let parent_id = match level.parent_column() {
		Some(column) => Some(row.try_get::<i64, _>(column)?),
		None => None,
	};
	let tools_data = if level == QueryRetrieveLevel::Image {
		let Json(value) = row.try_get::<Json<serde_json::Value>, _>("tools_data")?;
		Some(value)
	} else {
		None
	};

	Ok(Record {
		id: row.try_get("id")?,
		parent_id,
		created_at: Some(row.try_get("created_at")?),
		updated_at: Some(row.try_get("updated_at")?),
		attributes,
		tools_data,
	})
}

fn decode_all(level: QueryRetrieveLevel, rows: &[PgRow]) -> Result<Vec<Record>, StoreError> {
	let records = rows
		.iter()
		.map(|row| decode_record(level, row))
		.collect::<Result<_, _>>()?;
	Ok(records)
}

/// Maps constraint violations onto the store's error variants.
fn write_error(level: QueryRetrieveLevel, record: &Record, err: sqlx::Error) -> StoreError {
	match err.as_database_error() {
		Some(db) if db.is_unique_violation() => StoreError::Duplicate {
			level,
			uid: record.attribute(level.business_key()).to_owned(),
		},
		Some(db) if db.is_foreign_key_violation() => StoreError::MissingParent {
			level,
			parent_id: record.parent_id.unwrap_or_default(),
		},
		_ => StoreError::Database(err),
	}
}

#[async_trait]
impl CatalogStore for PostgresStore {
	async fn find_by(
		&self,
		level: QueryRetrieveLevel,
		filter: &Filter,
		page: Page,
	) -> Result<Vec<Record>, StoreError> {
		let rows = select_query(level, filter, page)
			.build()
			.fetch_all(&self.pool)
			.await?;
		decode_all(level, &rows)
	}

	async fn count_by(
		&self,
		level: QueryRetrieveLevel,
		filter: &Filter,
	) -> Result<u64, StoreError> {
		let row = count_query(level, filter)
			.build()
			.fetch_one(&self.pool)
			.await?;
		let count: i64 = row.try_get(0)?;
		Ok(count.unsigned_abs())
	}

	async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
		let tx = self.pool.begin().await?;
		Ok(Box::new(PostgresTransaction { tx }))
	}
}

/// Wraps a sqlx transaction, which rolls back when dropped uncommitted.
pub struct PostgresTransaction {
	tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PostgresTransaction {
	async fn find_by(
		&mut self,
		level: QueryRetrieveLevel,
		filter: &Filter,
		page: Page,
	) -> Result<Vec<Record>, StoreError> {
		let rows = select_query(level, filter, page)
			.build()
			.fetch_all(&mut *self.tx)
			.await?;
		decode_all(level, &rows)
	}

	async fn create(
		&mut self,
		level: QueryRetrieveLevel,
		record: &mut Record,
	) -> Result<(), StoreError> {
		let row = insert_query(level, record)
			.build()
			.fetch_one(&mut *self.tx)
			.await
			.map_err(|err| write_error(level, record, err))?;

		record.id = row.try_get("id")?;
		record.created_at = Some(row.try_get("created_at")?);
		record.updated_at = Some(row.try_get("updated_at")?);
		if level == QueryRetrieveLevel::Image && record.tools_data.is_none() {
			record.tools_data = Some(serde_json::Value::Object(serde_json::Map::new()));
		}
		Ok(())
	}

	async fn update(
		&mut self,
		level: QueryRetrieveLevel,
		record: &mut Record,
	) -> Result<(), StoreError> {
		let row = update_query(level, record)
			.build()
			.fetch_optional(&mut *self.tx)
			.await
			.map_err(|err| write_error(level, record, err))?
			.ok_or(StoreError::NotFound {
				level,
				id: record.id,
			})?;

		record.created_at = Some(row.try_get("created_at")?);
		record.updated_at = Some(row.try_get("updated_at")?);
		if level == QueryRetrieveLevel::Image {
			let Json(value) = row.try_get::<Json<serde_json::Value>, _>("tools_data")?;
			record.tools_data = Some(value);
		}
		Ok(())
	}

	async fn commit(self: Box<Self>) -> Result<(), StoreError> {
		self.tx.commit().await?;
		Ok(())
	}

	async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
		self.tx.rollback().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::dictionary_std::tags;

	#[test]
	fn select_with_equality_and_pagination() {
		let filter = Filter::by_uid(QueryRetrieveLevel::Study, "1.2.3");
		let query = select_query(QueryRetrieveLevel::Study, &filter, Page::new(10, 5));
		assert_eq!(
			query.sql(),
			"SELECT * FROM study WHERE TRUE AND study_instance_uid = $1 ORDER BY id LIMIT $2 OFFSET $3"
		);
	}

	#[test]
	fn select_with_membership_and_parent_ids() {
		let filter = Filter::new()
			.with_attribute(
				tags::MODALITY,
				FilterValue::Multi(vec!["CT".into(), "MR".into()]),
			)
			.with_parent_ids(FilterValue::Multi(vec![1, 2]));
		let query = select_query(QueryRetrieveLevel::Series, &filter, Page::unbounded());
		assert_eq!(
			query.sql(),
			"SELECT * FROM series WHERE TRUE AND study_id = ANY($1) AND modality = ANY($2) ORDER BY id"
		);
	}

	#[test]
	fn foreign_attributes_compare_against_empty_string() {
		let filter = Filter::new().with_attribute(tags::MODALITY, FilterValue::Single("CT".into()));
		let query = count_query(QueryRetrieveLevel::Study, &filter);
		assert_eq!(
			query.sql(),
			"SELECT COUNT(*) FROM study WHERE TRUE AND '' = $1"
		);
	}

	#[test]
	fn insert_lists_every_column() {
		let query = insert_query(QueryRetrieveLevel::Image, &Record::default());
		assert_eq!(
			query.sql(),
			"INSERT INTO instance (sop_class_uid, sop_instance_uid, instance_number, series_id, tools_data) \
			 VALUES ($1, $2, $3, $4, $5) RETURNING id, created_at, updated_at"
		);
	}

	#[test]
	fn update_refreshes_timestamp() {
		let query = update_query(QueryRetrieveLevel::Image, &Record::default());
		assert_eq!(
			query.sql(),
			"UPDATE instance SET sop_class_uid = $1, sop_instance_uid = $2, instance_number = $3, \
			 series_id = $4, updated_at = now() WHERE id = $5 RETURNING created_at, updated_at, tools_data"
		);
	}
}
