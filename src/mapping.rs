//! Conversion between DICOM datasets, catalog attributes and DICOM JSON responses.
use crate::catalog::{Attributes, Record};
use crate::dictionary::{self, TagInfo};
use crate::types::QueryRetrieveLevel;
use dicom::core::{DicomValue, Tag, VR};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
	#[error("{name} {tag} cannot be converted to a string: {reason}")]
	NotStringConvertible {
		name: &'static str,
		tag: Tag,
		reason: String,
	},
}

#[derive(Debug, Error)]
pub enum FormatError {
	#[error("Stored value of {name} is not valid JSON: {source}")]
	InvalidJson {
		name: &'static str,
		source: serde_json::Error,
	},
	#[error("Stored value of {name} is not a JSON array")]
	NotAnArray { name: &'static str },
}

/// Reads the catalog attributes of `level` from a dataset.
///
/// Attributes absent from the dataset are stored as empty strings.
pub fn extract(
	dataset: &InMemDicomObject,
	level: QueryRetrieveLevel,
) -> Result<Attributes, ExtractError> {
	let mut attributes = Attributes::new();
	for column in level.columns() {
		let Some(info) = dictionary::lookup(column.tag) else {
			continue;
		};
		let value = match dataset.get(column.tag) {
			Some(element) => element_to_string(element, info)?,
			None => String::new(),
		};
		attributes.insert(column.tag, value);
	}
	Ok(attributes)
}

/// Converts an element into its stored string form.
///
/// Sequences and multi-valued attributes are stored as JSON arrays, single-valued attributes as
/// their first value.
pub fn element_to_string(element: &InMemElement, info: &TagInfo) -> Result<String, ExtractError> {
	let not_convertible = |reason: String| ExtractError::NotStringConvertible {
		name: info.name,
		tag: info.tag,
		reason,
	};

	match element.value() {
		DicomValue::Sequence(sequence) => {
			let items = sequence
				.items()
				.iter()
				.map(|item| dicom_json::to_value(item).map(lowercase_tag_keys))
				.collect::<Result<Vec<Value>, _>>()
				.map_err(|err| not_convertible(err.to_string()))?;
			Ok(Value::Array(items).to_string())
		}
		DicomValue::PixelSequence(_) => Err(not_convertible(String::from(
			"encapsulated pixel data",
		))),
		DicomValue::Primitive(_) => {
			let values = element
				.to_multi_str()
				.map_err(|err| not_convertible(err.to_string()))?;
			let values: Vec<&str> = values
				.iter()
				.map(|value| value.trim_end_matches(['\0', ' ']))
				.collect();

			if info.is_single_valued() {
				Ok(values.first().copied().unwrap_or_default().to_owned())
			} else if values.is_empty() {
				Ok(String::new())
			} else {
				Ok(json!(values).to_string())
			}
		}
	}
}

/// Formats a stored value as the `Value` array of a DICOM JSON attribute.
pub fn format_value(info: &TagInfo, raw: &str) -> Result<Value, FormatError> {
	if info.vr == VR::PN {
		return Ok(json!([{ "Alphabetic": raw }]));
	}
	if info.is_single_valued() && info.vr != VR::SQ {
		return Ok(json!([raw]));
	}
	if raw.is_empty() || raw == "[]" {
		return Ok(Value::Array(Vec::new()));
	}

	match serde_json::from_str(raw) {
		Ok(value @ Value::Array(_)) => Ok(value),
		Ok(_) => Err(FormatError::NotAnArray { name: info.name }),
		Err(source) => Err(FormatError::InvalidJson {
			name: info.name,
			source,
		}),
	}
}

pub fn format_attribute(info: &TagInfo, raw: &str) -> Result<Value, FormatError> {
	Ok(json!({
		"vr": info.vr.to_string(),
		"Value": format_value(info, raw)?,
	}))
}

/// Lowercases the tag keys of a DICOM JSON object, descending into the items of its sequences.
///
/// Values that are not objects are returned unchanged.
pub fn lowercase_tag_keys(value: Value) -> Value {
	let object = match value {
		Value::Object(object) => object,
		other => return other,
	};
	let object = object
		.into_iter()
		.map(|(key, mut attribute)| {
			if attribute.get("vr").and_then(Value::as_str) == Some("SQ") {
				if let Some(Value::Array(items)) = attribute.get_mut("Value") {
					for item in items {
						*item = lowercase_tag_keys(item.take());
					}
				}
			}
			(key.to_ascii_lowercase(), attribute)
		})
		.collect();
	Value::Object(object)
}

/// Adds the attributes of `record` selected by `include` to a DICOM JSON object.
pub fn format_record(
	level: QueryRetrieveLevel,
	record: &Record,
	include: impl Fn(Tag) -> bool,
	target: &mut Map<String, Value>,
) -> Result<(), FormatError> {
	for column in level.columns() {
		if !include(column.tag) {
			continue;
		}
		let Some(info) = dictionary::lookup(column.tag) else {
			continue;
		};
		target.insert(
			dictionary::tag_key(column.tag),
			format_attribute(info, record.attribute(column.tag))?,
		);
	}
	Ok(())
}
