use crate::catalog::Record;
use crate::types::QueryRetrieveLevel;
use dicom::core::Tag;
use std::collections::BTreeMap;

/// A filter operand: equality on one value or membership in a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue<T = String> {
	Single(T),
	Multi(Vec<T>),
}

impl<T: PartialEq> FilterValue<T> {
	/// Builds an operand from a list of allowed values. An empty list yields `None`.
	pub fn from_values(mut values: Vec<T>) -> Option<Self> {
		match values.len() {
			0 => None,
			1 => values.pop().map(Self::Single),
			_ => Some(Self::Multi(values)),
		}
	}

	pub fn matches(&self, value: &T) -> bool {
		match self {
			Self::Single(expected) => expected == value,
			Self::Multi(allowed) => allowed.contains(value),
		}
	}
}

impl FilterValue<String> {
	pub fn matches_str(&self, value: &str) -> bool {
		match self {
			Self::Single(expected) => expected == value,
			Self::Multi(allowed) => allowed.iter().any(|allowed| allowed == value),
		}
	}
}

/// Filter fields of a catalog lookup. All present fields must match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Filter {
	pub attributes: BTreeMap<Tag, FilterValue>,
	pub ids: Option<FilterValue<i64>>,
	pub parent_ids: Option<FilterValue<i64>>,
}

impl Filter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Equality on the business key of `level`.
	pub fn by_uid(level: QueryRetrieveLevel, uid: impl Into<String>) -> Self {
		Self::new().with_attribute(level.business_key(), FilterValue::Single(uid.into()))
	}

	#[must_use]
	pub fn with_attribute(mut self, tag: Tag, value: FilterValue) -> Self {
		self.attributes.insert(tag, value);
		self
	}

	#[must_use]
	pub fn with_ids(mut self, ids: FilterValue<i64>) -> Self {
		self.ids = Some(ids);
		self
	}

	#[must_use]
	pub fn with_parent_ids(mut self, parent_ids: FilterValue<i64>) -> Self {
		self.parent_ids = Some(parent_ids);
		self
	}

	pub fn matches(&self, record: &Record) -> bool {
		let ids = self.ids.as_ref().is_none_or(|ids| ids.matches(&record.id));
		let parents = self
			.parent_ids
			.as_ref()
			.is_none_or(|ids| record.parent_id.is_some_and(|id| ids.matches(&id)));
		ids && parents
			&& self
				.attributes
				.iter()
				.all(|(tag, value)| value.matches_str(record.attribute(*tag)))
	}
}

/// Pagination of a lookup.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Page {
	/// `None` returns every match.
	pub limit: Option<usize>,
	pub offset: usize,
}

impl Page {
	pub const fn new(limit: usize, offset: usize) -> Self {
		Self {
			limit: Some(limit),
			offset,
		}
	}

	pub const fn unbounded() -> Self {
		Self {
			limit: None,
			offset: 0,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::catalog::Attributes;
	use dicom::dictionary_std::tags;

	fn record(id: i64, parent_id: Option<i64>, modality: &str) -> Record {
		Record {
			id,
			parent_id,
			attributes: Attributes::from([(tags::MODALITY, modality.to_owned())]),
			..Record::default()
		}
	}

	#[test]
	fn values_become_equality_or_membership() {
		assert_eq!(FilterValue::<String>::from_values(Vec::new()), None);
		assert_eq!(
			FilterValue::from_values(vec![1]),
			Some(FilterValue::Single(1))
		);
		assert_eq!(
			FilterValue::from_values(vec![1, 2]),
			Some(FilterValue::Multi(vec![1, 2]))
		);
	}

	#[test]
	fn filter_matches_all_fields() {
		let ct = record(1, Some(10), "CT");
		let filter = Filter::new()
			.with_attribute(
				tags::MODALITY,
				FilterValue::Multi(vec!["CT".into(), "MR".into()]),
			)
			.with_parent_ids(FilterValue::Single(10));
		assert!(filter.matches(&ct));
		assert!(!filter.matches(&record(2, Some(11), "CT")));
		assert!(!filter.matches(&record(3, Some(10), "US")));
		assert!(!filter.matches(&record(4, None, "CT")));
	}

	#[test]
	fn missing_attributes_match_empty_string() {
		let filter = Filter::new().with_attribute(tags::MODALITY, FilterValue::Single(String::new()));
		assert!(filter.matches(&Record::default()));
		assert!(Filter::new().with_ids(FilterValue::Single(0)).matches(&Record::default()));
	}
}
