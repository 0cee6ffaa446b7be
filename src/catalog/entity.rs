use crate::types::QueryRetrieveLevel;
use chrono::{DateTime, Utc};
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use std::collections::BTreeMap;

/// A catalog column backing one DICOM attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Column {
	pub tag: Tag,
	pub name: &'static str,
}

const fn column(tag: Tag, name: &'static str) -> Column {
	Column { tag, name }
}

#[rustfmt::skip]
static STUDY_COLUMNS: &[Column] = &[
	column(tags::STUDY_DATE, "study_date"),
	column(tags::STUDY_TIME, "study_time"),
	column(tags::ACCESSION_NUMBER, "accession_number"),
	column(tags::INSTANCE_AVAILABILITY, "instance_availability"),
	column(tags::MODALITIES_IN_STUDY, "modalities_in_study"),
	column(tags::REFERRING_PHYSICIAN_NAME, "referring_physician_name"),
	column(tags::TIMEZONE_OFFSET_FROM_UTC, "timezone_offset_from_utc"),
	column(tags::RETRIEVE_URL, "retrieve_url"),
	column(tags::PATIENT_NAME, "patient_name"),
	column(tags::PATIENT_ID, "patient_id"),
	column(tags::PATIENT_BIRTH_DATE, "patient_birth_date"),
	column(tags::PATIENT_SEX, "patient_sex"),
	column(tags::STUDY_INSTANCE_UID, "study_instance_uid"),
	column(tags::STUDY_ID, "study_id_code"),
	column(tags::NUMBER_OF_STUDY_RELATED_SERIES, "number_of_study_related_series"),
	column(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, "number_of_study_related_instances"),
];

#[rustfmt::skip]
static SERIES_COLUMNS: &[Column] = &[
	column(tags::MODALITY, "modality"),
	column(tags::SERIES_INSTANCE_UID, "series_instance_uid"),
	column(tags::SERIES_NUMBER, "series_number"),
	column(tags::PERFORMED_PROCEDURE_STEP_START_DATE, "performed_procedure_step_start_date"),
	column(tags::PERFORMED_PROCEDURE_STEP_START_TIME, "performed_procedure_step_start_time"),
	column(tags::REQUEST_ATTRIBUTES_SEQUENCE, "request_attributes_sequence"),
	column(tags::SCHEDULED_PROCEDURE_STEP_ID, "scheduled_procedure_step_id"),
	column(tags::REQUESTED_PROCEDURE_ID, "requested_procedure_id"),
];

#[rustfmt::skip]
static INSTANCE_COLUMNS: &[Column] = &[
	column(tags::SOP_CLASS_UID, "sop_class_uid"),
	column(tags::SOP_INSTANCE_UID, "sop_instance_uid"),
	column(tags::INSTANCE_NUMBER, "instance_number"),
];

impl QueryRetrieveLevel {
	/// The attribute columns stored at this level.
	pub const fn columns(self) -> &'static [Column] {
		match self {
			Self::Study => STUDY_COLUMNS,
			Self::Series => SERIES_COLUMNS,
			Self::Image => INSTANCE_COLUMNS,
		}
	}

	pub const fn table(self) -> &'static str {
		match self {
			Self::Study => "study",
			Self::Series => "series",
			Self::Image => "instance",
		}
	}

	/// Foreign key column referencing the parent level.
	pub const fn parent_column(self) -> Option<&'static str> {
		match self {
			Self::Study => None,
			Self::Series => Some("study_id"),
			Self::Image => Some("series_id"),
		}
	}

	/// The globally unique business key of this level.
	pub const fn business_key(self) -> Tag {
		match self {
			Self::Study => tags::STUDY_INSTANCE_UID,
			Self::Series => tags::SERIES_INSTANCE_UID,
			Self::Image => tags::SOP_INSTANCE_UID,
		}
	}

	pub fn column(self, tag: Tag) -> Option<&'static Column> {
		self.columns().iter().find(|column| column.tag == tag)
	}

	/// Finds the level that stores the given attribute.
	pub fn of_tag(tag: Tag) -> Option<Self> {
		Self::ALL
			.into_iter()
			.find(|level| level.column(tag).is_some())
	}
}

/// Attribute values of a catalog row, keyed by tag.
pub type Attributes = BTreeMap<Tag, String>;

/// A persisted catalog row at any level.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
	/// Surrogate key, assigned by the store on creation.
	pub id: i64,
	pub parent_id: Option<i64>,
	pub created_at: Option<DateTime<Utc>>,
	pub updated_at: Option<DateTime<Utc>>,
	pub attributes: Attributes,
	/// Opaque viewer annotations, only present on instances.
	pub tools_data: Option<serde_json::Value>,
}

impl Record {
	pub fn attribute(&self, tag: Tag) -> &str {
		self.attributes.get(&tag).map_or("", String::as_str)
	}
}

/// Typed view of a [`Record`] at a fixed level.
pub trait Entity: Sized + Send {
	const LEVEL: QueryRetrieveLevel;

	fn from_record(record: Record) -> Self;
	fn record(&self) -> &Record;
	fn record_mut(&mut self) -> &mut Record;

	fn id(&self) -> i64 {
		self.record().id
	}

	fn uid(&self) -> &str {
		self.record().attribute(Self::LEVEL.business_key())
	}
}

macro_rules! entity {
	($name:ident, $level:expr) => {
		#[derive(Debug, Clone, PartialEq, Default)]
		pub struct $name(Record);

		impl Entity for $name {
			const LEVEL: QueryRetrieveLevel = $level;

			fn from_record(record: Record) -> Self {
				Self(record)
			}

			fn record(&self) -> &Record {
				&self.0
			}

			fn record_mut(&mut self) -> &mut Record {
				&mut self.0
			}
		}
	};
}

entity!(Study, QueryRetrieveLevel::Study);
entity!(Series, QueryRetrieveLevel::Series);
entity!(Instance, QueryRetrieveLevel::Image);

impl Study {
	pub fn new(attributes: Attributes) -> Self {
		Self(Record {
			attributes,
			..Record::default()
		})
	}
}

impl Series {
	pub fn new(study_id: i64, attributes: Attributes) -> Self {
		Self(Record {
			parent_id: Some(study_id),
			attributes,
			..Record::default()
		})
	}
}

impl Instance {
	pub fn new(series_id: i64, attributes: Attributes) -> Self {
		Self(Record {
			parent_id: Some(series_id),
			attributes,
			tools_data: Some(serde_json::Value::Object(serde_json::Map::new())),
			..Record::default()
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn attributes_belong_to_exactly_one_level() {
		for level in QueryRetrieveLevel::ALL {
			for column in level.columns() {
				assert_eq!(QueryRetrieveLevel::of_tag(column.tag), Some(level));
			}
			assert!(level.column(level.business_key()).is_some());
		}
		assert_eq!(QueryRetrieveLevel::of_tag(tags::PATIENT_WEIGHT), None);
	}

	#[test]
	fn every_column_is_in_the_dictionary() {
		for level in QueryRetrieveLevel::ALL {
			for column in level.columns() {
				assert!(crate::dictionary::lookup(column.tag).is_some(), "{}", column.name);
			}
		}
	}

	#[test]
	fn new_instances_start_with_empty_tools_data() {
		let instance = Instance::new(7, Attributes::new());
		assert_eq!(instance.record().parent_id, Some(7));
		assert_eq!(instance.record().tools_data, Some(serde_json::json!({})));
		assert_eq!(instance.uid(), "");
	}
}
