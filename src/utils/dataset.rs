use dicom::object::DefaultDicomObject;
use thiserror::Error;

const PREAMBLE_LENGTH: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

#[derive(Debug, Error)]
#[error("Failed to parse DICOM object: {0}")]
pub struct ParseError(String);

/// Parses a DICOM Part 10 file held in memory, with or without the 128 byte preamble.
pub fn parse_object(bytes: &[u8]) -> Result<DefaultDicomObject, ParseError> {
	let data = match bytes.get(PREAMBLE_LENGTH..PREAMBLE_LENGTH + MAGIC.len()) {
		Some(magic) if magic == MAGIC => &bytes[PREAMBLE_LENGTH..],
		_ => bytes,
	};
	dicom::object::from_reader(data).map_err(|err| ParseError(err.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{dataset, to_part10};

	#[test]
	fn parses_with_and_without_preamble() {
		let bytes = to_part10(dataset("1", "2", "3"));
		assert_eq!(&bytes[128..132], b"DICM");

		let with_preamble = parse_object(&bytes).unwrap();
		let without_preamble = parse_object(&bytes[128..]).unwrap();
		assert_eq!(
			with_preamble.meta().media_storage_sop_instance_uid(),
			without_preamble.meta().media_storage_sop_instance_uid()
		);
	}

	#[test]
	fn rejects_garbage() {
		assert!(parse_object(b"not a dicom file").is_err());
		assert!(parse_object(&[]).is_err());
	}
}
