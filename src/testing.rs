//! DICOM fixtures shared by the unit tests.
use crate::config::AppConfig;
use crate::AppState;
use config::{Config, File, FileFormat};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::meta::FileMetaTableBuilder;
use dicom::object::{DefaultDicomObject, InMemDicomObject};
use std::path::Path;

/// A minimal secondary capture dataset with the three hierarchy UIDs.
pub fn dataset(study: &str, series: &str, instance: &str) -> InMemDicomObject {
	InMemDicomObject::from_element_iter([
		DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			PrimitiveValue::from(uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
		),
		DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(instance)),
		DataElement::new(tags::STUDY_DATE, VR::DA, PrimitiveValue::from("20240131")),
		DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("OT")),
		DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("DOE^JOHN")),
		DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P1")),
		DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study)),
		DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(series)),
		DataElement::new(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from("1")),
	])
}

/// Adds a single-frame monochrome image to `dataset`.
pub fn with_pixel_data(
	mut dataset: InMemDicomObject,
	rows: u16,
	columns: u16,
	bits: u16,
	pixels: PrimitiveValue,
) -> InMemDicomObject {
	let vr = if bits > 8 { VR::OW } else { VR::OB };
	for element in [
		DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
		DataElement::new(
			tags::PHOTOMETRIC_INTERPRETATION,
			VR::CS,
			PrimitiveValue::from("MONOCHROME2"),
		),
		DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
		DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns)),
		DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(bits)),
		DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(bits)),
		DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(bits - 1)),
		DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
		DataElement::new(tags::PIXEL_DATA, vr, pixels),
	] {
		dataset.put(element);
	}
	dataset
}

/// Wraps `dataset` in a Part 10 file object with explicit VR little endian.
pub fn to_file(dataset: InMemDicomObject) -> DefaultDicomObject {
	let sop_class_uid = dataset
		.element(tags::SOP_CLASS_UID)
		.unwrap()
		.to_str()
		.unwrap()
		.to_string();
	let sop_instance_uid = dataset
		.element(tags::SOP_INSTANCE_UID)
		.unwrap()
		.to_str()
		.unwrap()
		.to_string();

	dataset
		.with_meta(
			FileMetaTableBuilder::new()
				.transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
				.media_storage_sop_class_uid(sop_class_uid)
				.media_storage_sop_instance_uid(sop_instance_uid),
		)
		.unwrap()
}

/// Encodes `dataset` as a Part 10 file in explicit VR little endian.
pub fn to_part10(dataset: InMemDicomObject) -> Vec<u8> {
	let mut bytes = Vec::new();
	to_file(dataset).write_all(&mut bytes).unwrap();
	bytes
}

/// Application state with the default configuration, an in-memory catalog and files below `root`.
pub async fn app_state(root: &Path) -> AppState {
	let mut config: AppConfig = Config::builder()
		.add_source(File::from_str(
			include_str!("config/defaults.toml"),
			FileFormat::Toml,
		))
		.build()
		.unwrap()
		.try_deserialize()
		.unwrap();
	config.storage.root = root.to_string_lossy().into_owned();
	AppState::new(config).await.unwrap()
}
