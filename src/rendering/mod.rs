//! Rendering of single-frame grayscale images.
use dicom::core::{DicomValue, Tag};
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, InMemDicomObject};
use dicom_pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, PixelRepresentation};
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::imageops::FilterType as ResizeFilter;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Deserializer};
use std::fmt::{Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RenderingError {
	#[error("The object has no pixel data")]
	MissingPixelData,
	#[error("Missing or invalid pixel attribute {name}")]
	InvalidAttribute { name: &'static str },
	#[error("Unsupported pixel data: {0}")]
	Unsupported(String),
	#[error("Pixel data holds {actual} samples, expected {expected}")]
	Truncated { expected: usize, actual: usize },
	#[error(transparent)]
	PixelData(#[from] dicom_pixeldata::Error),
	#[error(transparent)]
	Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderingOptions {
	pub media_type: RenderedMediaType,
	pub quality: ImageQuality,
	/// Explicit window. If absent, the window is taken from the object or tuned to its bit depth.
	pub window: Option<Window>,
	pub downsample: bool,
}

/// The first frame of an image, one sample per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub rows: u32,
	pub columns: u32,
	pub bits_stored: u32,
	pub samples: Vec<u32>,
}

impl Frame {
	/// Largest value representable with the stored bit depth.
	pub const fn max_value(&self) -> u32 {
		max_value(self.bits_stored)
	}
}

const fn max_value(bits: u32) -> u32 {
	if bits >= 32 {
		u32::MAX
	} else {
		(1 << bits) - 1
	}
}

fn read_u16(object: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<u16, RenderingError> {
	object
		.element(tag)
		.ok()
		.and_then(|element| element.to_int::<u16>().ok())
		.ok_or(RenderingError::InvalidAttribute { name })
}

fn read_f64(object: &InMemDicomObject, tag: Tag) -> Option<f64> {
	object
		.element(tag)
		.ok()
		.and_then(|element| element.to_multi_float64().ok())
		.and_then(|values| values.first().copied())
}

/// Decodes the first frame of the pixel data.
///
/// Native pixel data is decoded according to its pixel representation. Encapsulated pixel data is
/// read from its first fragment as a packed bit stream of `BitsStored` bits per sample.
pub fn decode_frame(object: &DefaultDicomObject) -> Result<Frame, RenderingError> {
	let samples_per_pixel = object
		.element(tags::SAMPLES_PER_PIXEL)
		.ok()
		.and_then(|element| element.to_int::<u16>().ok())
		.unwrap_or(1);
	if samples_per_pixel != 1 {
		return Err(RenderingError::Unsupported(format!(
			"{samples_per_pixel} samples per pixel"
		)));
	}

	let rows = u32::from(read_u16(object, tags::ROWS, "Rows")?);
	let columns = u32::from(read_u16(object, tags::COLUMNS, "Columns")?);
	let bits_allocated = u32::from(read_u16(object, tags::BITS_ALLOCATED, "BitsAllocated")?);
	let bits_stored = object
		.element(tags::BITS_STORED)
		.ok()
		.and_then(|element| element.to_int::<u16>().ok())
		.map_or(bits_allocated, u32::from);
	if bits_stored == 0 || bits_stored > 16 || bits_stored > bits_allocated {
		return Err(RenderingError::InvalidAttribute { name: "BitsStored" });
	}

	let pixel_count = rows as usize * columns as usize;
	let pixel_data = object
		.element(tags::PIXEL_DATA)
		.map_err(|_| RenderingError::MissingPixelData)?;

	let samples = match pixel_data.value() {
		DicomValue::Primitive(_) => native_samples(object, bits_stored)?,
		DicomValue::PixelSequence(sequence) => {
			let fragment = sequence
				.fragments()
				.first()
				.ok_or(RenderingError::MissingPixelData)?;
			unpack_bits(fragment, bits_stored, pixel_count)
		}
		DicomValue::Sequence(_) => return Err(RenderingError::MissingPixelData),
	};

	if samples.len() < pixel_count {
		return Err(RenderingError::Truncated {
			expected: pixel_count,
			actual: samples.len(),
		});
	}

	let mut samples = samples;
	samples.truncate(pixel_count);
	Ok(Frame {
		rows,
		columns,
		bits_stored,
		samples,
	})
}

/// Signed samples are moved into the unsigned range by flipping their sign bit, so that the order
/// of the values is kept.
fn native_samples(object: &DefaultDicomObject, bits_stored: u32) -> Result<Vec<u32>, RenderingError> {
	let decoded = object.decode_pixel_data()?;
	let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
	let values: Vec<i32> = decoded.to_vec_frame_with_options(0, &options)?;

	let mask = i64::from(max_value(bits_stored));
	let sign = match decoded.pixel_representation() {
		PixelRepresentation::Signed => 1_i64 << (bits_stored - 1),
		PixelRepresentation::Unsigned => 0,
	};
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	let samples = values
		.into_iter()
		.map(|value| ((i64::from(value) & mask) ^ sign) as u32)
		.collect();
	Ok(samples)
}

/// Reads `count` samples of `bits` bits each, most significant bit first.
fn unpack_bits(data: &[u8], bits: u32, count: usize) -> Vec<u32> {
	let mut samples = Vec::with_capacity(count);
	let mut accumulator: u64 = 0;
	let mut available = 0;
	for &byte in data {
		accumulator = (accumulator << 8) | u64::from(byte);
		available += 8;
		while available >= bits {
			available -= bits;
			#[allow(clippy::cast_possible_truncation)]
			samples.push(((accumulator >> available) & u64::from(max_value(bits))) as u32);
			if samples.len() == count {
				return samples;
			}
		}
		accumulator &= (1 << available) - 1;
	}
	samples
}

/// `(y_max - y_min) / (1 + exp(-4 * (x - center) / width)) + y_min`
pub fn sigmoid(x: f64, center: f64, width: f64, y_min: f64, y_max: f64) -> f64 {
	(y_max - y_min) / (1.0 + (-4.0 * (x - center) / width).exp()) + y_min
}

/// Window used when neither the request, the configuration nor the object provide one.
pub fn default_window(bits_stored: u32, function: VoiLutFunction) -> Window {
	let range = f64::from(max_value(bits_stored)) + 1.0;
	Window {
		center: range / 2.0 - 1.0,
		width: range - 1.0,
		function,
	}
}

/// Window declared by the WindowCenter and WindowWidth attributes of the object.
pub fn object_window(object: &InMemDicomObject, function: VoiLutFunction) -> Option<Window> {
	let center = read_f64(object, tags::WINDOW_CENTER)?;
	let width = read_f64(object, tags::WINDOW_WIDTH)?;
	(width > 0.0).then_some(Window {
		center,
		width,
		function,
	})
}

/// Applies the VOI LUT function of `window` to every sample.
///
/// Only the sigmoid function remaps samples; the linear functions leave them unchanged.
pub fn apply_window(frame: &mut Frame, window: &Window) {
	match window.function {
		VoiLutFunction::Sigmoid => {
			let y_max = f64::from(frame.max_value());
			for sample in &mut frame.samples {
				let value = sigmoid(f64::from(*sample), window.center, window.width, 0.0, y_max);
				#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
				let value = value.clamp(0.0, y_max) as u32;
				*sample = value;
			}
		}
		VoiLutFunction::Linear | VoiLutFunction::LinearExact => {
			debug!(function = ?window.function, "VOI LUT function is not applied");
		}
	}
}

pub fn negate(frame: &mut Frame) {
	let max = frame.max_value();
	for sample in &mut frame.samples {
		*sample = max - (*sample).min(max);
	}
}

/// Reduces the samples to 8 bits and assembles the raster.
pub fn to_gray_image(frame: &Frame) -> Result<GrayImage, RenderingError> {
	let shift = frame.bits_stored.saturating_sub(8);
	#[allow(clippy::cast_possible_truncation)]
	let pixels = frame
		.samples
		.iter()
		.map(|&sample| (sample >> shift).min(255) as u8)
		.collect();
	GrayImage::from_raw(frame.columns, frame.rows, pixels).ok_or(RenderingError::Truncated {
		expected: frame.rows as usize * frame.columns as usize,
		actual: frame.samples.len(),
	})
}

/// Renders the first frame of `object` into the encoded bytes of `options.media_type`.
pub fn render(
	object: &DefaultDicomObject,
	options: &RenderingOptions,
	function: VoiLutFunction,
) -> Result<Vec<u8>, RenderingError> {
	let mut frame = decode_frame(object)?;
	let window = options
		.window
		.clone()
		.or_else(|| object_window(object, function))
		.unwrap_or_else(|| default_window(frame.bits_stored, function));

	apply_window(&mut frame, &window);
	negate(&mut frame);

	let mut image = DynamicImage::ImageLuma8(to_gray_image(&frame)?);
	if options.downsample {
		image = image.resize_exact(
			(frame.columns / 2).max(1),
			(frame.rows / 2).max(1),
			ResizeFilter::Triangle,
		);
	}

	encode(&image, options)
}

/// Encodes the image using the options provided in the [`RenderingOptions`].
///
/// This supports the following rendered media types:
/// - `image/jpeg`
/// - `image/png`
/// - `image/gif`
fn encode(image: &DynamicImage, options: &RenderingOptions) -> Result<Vec<u8>, RenderingError> {
	let mut render_buffer = Vec::new();

	match options.media_type {
		RenderedMediaType::Jpeg => {
			let encoder = JpegEncoder::new_with_quality(&mut render_buffer, options.quality.into());
			image.write_with_encoder(encoder)?;
		}
		RenderedMediaType::Png => {
			let encoder = PngEncoder::new_with_quality(
				&mut render_buffer,
				CompressionType::default(),
				FilterType::default(),
			);
			image.write_with_encoder(encoder)?;
		}
		RenderedMediaType::Gif => {
			let mut encoder = GifEncoder::new(&mut render_buffer);
			encoder.encode_frame(image::Frame::new(image.to_rgba8()))?;
		}
	}

	Ok(render_buffer)
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum RenderedMediaType {
	#[default]
	Jpeg,
	Png,
	Gif,
}

impl<'de> Deserialize<'de> for RenderedMediaType {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

impl Display for RenderedMediaType {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl RenderedMediaType {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Jpeg => "image/jpeg",
			Self::Png => "image/png",
			Self::Gif => "image/gif",
		}
	}
}

#[derive(Debug, Error)]
#[error("`{0}` is not a supported rendered media type")]
pub struct ParseRenderedMediaTypeError(String);

impl FromStr for RenderedMediaType {
	type Err = ParseRenderedMediaTypeError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"image/png" => Ok(Self::Png),
			"image/jpeg" => Ok(Self::Jpeg),
			"image/gif" => Ok(Self::Gif),
			_ => Err(ParseRenderedMediaTypeError(s.to_owned())),
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ImageQuality(u8);

impl ImageQuality {
	pub const fn new(value: u8) -> Result<Self, ParseImageQualityError> {
		match value {
			0..=100 => Ok(Self(value)),
			_ => Err(ParseImageQualityError::OutOfRange { value }),
		}
	}
	pub const fn as_u8(self) -> u8 {
		self.0
	}
}

impl From<ImageQuality> for u8 {
	fn from(quality: ImageQuality) -> Self {
		quality.0
	}
}

impl Default for ImageQuality {
	fn default() -> Self {
		Self(100)
	}
}

impl<'de> Deserialize<'de> for ImageQuality {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u8::deserialize(deserializer)?;
		Self::new(value).map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Error)]
pub enum ParseImageQualityError {
	#[error(transparent)]
	ParseInt(#[from] ParseIntError),
	#[error("{value} is outside of the range 0..=100")]
	OutOfRange { value: u8 },
}

impl FromStr for ImageQuality {
	type Err = ParseImageQualityError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s.parse()?)
	}
}

/// Controls the windowing of the images as defined in Section C.8.11.3.1.5 in PS3.3.
///
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_8.3.5.html#sect_8.3.5.1.4>
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
	/// Decimal number containing the window-center value.
	pub center: f64,
	/// Decimal number containing the window-width value.
	pub width: f64,
	/// The VOI LUT function to apply
	pub function: VoiLutFunction,
}

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part03/sect_C.11.2.html#sect_C.11.2.1.3>
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum VoiLutFunction {
	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part03/sect_C.11.2.html#sect_C.11.2.1.2.1>
	Linear,
	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part03/sect_C.11.2.html#sect_C.11.2.1.3.2>
	LinearExact,
	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part03/sect_C.11.2.html#sect_C.11.2.1.3.1>
	#[default]
	Sigmoid,
}

#[derive(Debug, Error)]
pub enum ParseVoiLutFunctionError {
	#[error("Unknown VOI LUT function: {function}")]
	UnknownFunction { function: String },
}

impl FromStr for VoiLutFunction {
	type Err = ParseVoiLutFunctionError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"LINEAR" => Ok(Self::Linear),
			"LINEAR_EXACT" => Ok(Self::LinearExact),
			"SIGMOID" => Ok(Self::Sigmoid),
			_ => Err(ParseVoiLutFunctionError::UnknownFunction { function: s.into() }),
		}
	}
}

impl<'de> Deserialize<'de> for VoiLutFunction {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}
