//! Static attribute dictionary for the catalogued DICOM attributes.
//!
//! Every attribute stored in the catalog is described here once, with the value representation
//! and multiplicity that drive extraction from datasets and formatting of responses.
use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Value multiplicity of an attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Multiplicity {
	/// VM "1"
	Single,
	/// VM "1-n" or any other multiplicity that allows more than one value.
	Multiple,
}

impl Display for Multiplicity {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Single => write!(f, "1"),
			Self::Multiple => write!(f, "1-n"),
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TagInfo {
	pub tag: Tag,
	/// The DICOM keyword, e.g. `StudyInstanceUID`.
	pub name: &'static str,
	pub vr: VR,
	pub vm: Multiplicity,
}

impl TagInfo {
	const fn new(tag: Tag, name: &'static str, vr: VR, vm: Multiplicity) -> Self {
		Self { tag, name, vr, vm }
	}

	pub const fn is_single_valued(&self) -> bool {
		matches!(self.vm, Multiplicity::Single)
	}
}

use Multiplicity::{Multiple, Single};

#[rustfmt::skip]
static DICTIONARY: &[TagInfo] = &[
	// Study
	TagInfo::new(tags::STUDY_DATE, "StudyDate", VR::DA, Single),
	TagInfo::new(tags::STUDY_TIME, "StudyTime", VR::TM, Single),
	TagInfo::new(tags::ACCESSION_NUMBER, "AccessionNumber", VR::SH, Single),
	TagInfo::new(tags::INSTANCE_AVAILABILITY, "InstanceAvailability", VR::CS, Single),
	TagInfo::new(tags::MODALITIES_IN_STUDY, "ModalitiesInStudy", VR::CS, Multiple),
	TagInfo::new(tags::REFERRING_PHYSICIAN_NAME, "ReferringPhysicianName", VR::PN, Single),
	TagInfo::new(tags::TIMEZONE_OFFSET_FROM_UTC, "TimezoneOffsetFromUTC", VR::SH, Single),
	TagInfo::new(tags::RETRIEVE_URL, "RetrieveURL", VR::UR, Single),
	TagInfo::new(tags::PATIENT_NAME, "PatientName", VR::PN, Single),
	TagInfo::new(tags::PATIENT_ID, "PatientID", VR::LO, Single),
	TagInfo::new(tags::PATIENT_BIRTH_DATE, "PatientBirthDate", VR::DA, Single),
	TagInfo::new(tags::PATIENT_SEX, "PatientSex", VR::CS, Single),
	TagInfo::new(tags::STUDY_INSTANCE_UID, "StudyInstanceUID", VR::UI, Single),
	TagInfo::new(tags::STUDY_ID, "StudyID", VR::SH, Single),
	TagInfo::new(tags::NUMBER_OF_STUDY_RELATED_SERIES, "NumberOfStudyRelatedSeries", VR::IS, Single),
	TagInfo::new(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, "NumberOfStudyRelatedInstances", VR::IS, Single),
	// Series
	TagInfo::new(tags::MODALITY, "Modality", VR::CS, Single),
	TagInfo::new(tags::SERIES_INSTANCE_UID, "SeriesInstanceUID", VR::UI, Single),
	TagInfo::new(tags::SERIES_NUMBER, "SeriesNumber", VR::IS, Single),
	TagInfo::new(tags::PERFORMED_PROCEDURE_STEP_START_DATE, "PerformedProcedureStepStartDate", VR::DA, Single),
	TagInfo::new(tags::PERFORMED_PROCEDURE_STEP_START_TIME, "PerformedProcedureStepStartTime", VR::TM, Single),
	TagInfo::new(tags::REQUEST_ATTRIBUTES_SEQUENCE, "RequestAttributesSequence", VR::SQ, Single),
	TagInfo::new(tags::SCHEDULED_PROCEDURE_STEP_ID, "ScheduledProcedureStepID", VR::SH, Single),
	TagInfo::new(tags::REQUESTED_PROCEDURE_ID, "RequestedProcedureID", VR::SH, Single),
	// Instance
	TagInfo::new(tags::SOP_CLASS_UID, "SOPClassUID", VR::UI, Single),
	TagInfo::new(tags::SOP_INSTANCE_UID, "SOPInstanceUID", VR::UI, Single),
	TagInfo::new(tags::INSTANCE_NUMBER, "InstanceNumber", VR::IS, Single),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{0}` is not a known attribute name or tag code")]
pub struct ParseTagError(pub String);

/// The two accepted shapes of an attribute reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TagKey<'a> {
	/// Exactly eight hexadecimal digits, group followed by element.
	Code(Tag),
	/// Anything else is treated as a keyword.
	Name(&'a str),
}

impl<'a> TagKey<'a> {
	pub fn classify(input: &'a str) -> Self {
		if input.len() != 8 || !input.bytes().all(|b| b.is_ascii_hexdigit()) {
			return Self::Name(input);
		}
		match (
			u16::from_str_radix(&input[..4], 16),
			u16::from_str_radix(&input[4..], 16),
		) {
			(Ok(group), Ok(element)) => Self::Code(Tag(group, element)),
			_ => Self::Name(input),
		}
	}
}

/// Resolves an attribute keyword or 8-digit hex code into its [`TagInfo`].
pub fn resolve(name_or_code: &str) -> Result<&'static TagInfo, ParseTagError> {
	let found = match TagKey::classify(name_or_code) {
		TagKey::Code(tag) => lookup(tag),
		TagKey::Name(name) => DICTIONARY.iter().find(|info| info.name == name),
	};
	found.ok_or_else(|| ParseTagError(name_or_code.to_owned()))
}

pub fn lookup(tag: Tag) -> Option<&'static TagInfo> {
	DICTIONARY.iter().find(|info| info.tag == tag)
}

/// Formats a tag as the 8-digit lowercase hex key used in responses.
pub fn tag_key(tag: Tag) -> String {
	format!("{:04x}{:04x}", tag.group(), tag.element())
}
