use async_stream::try_stream;
use axum::body::Body;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use multer::{Constraints, SizeLimit};
use uuid::Uuid;

/// This uses the `multer` crate (just like axum with the `multipart` feature enabled) to parse
/// request bodies to DICOM files.
/// `axum::extract::Multipart` cannot be used because the Content-Type is not multipart/form-data.
pub struct DicomMultipart<'a>(multer::Multipart<'a>);

impl DicomMultipart<'static> {
	/// Reads the parts of `body`, failing once more than `max_size` bytes were received.
	pub fn new(body: Body, boundary: String, max_size: usize) -> Self {
		let constraints =
			Constraints::new().size_limit(SizeLimit::new().whole_stream(max_size as u64));
		Self(multer::Multipart::with_constraints(
			body.into_data_stream(),
			boundary,
			constraints,
		))
	}
}

impl<'a> DicomMultipart<'a> {
	/// This implementation is based on [`multer::parse_boundary`],
	/// but with multipart/related instead of multipart/form-data.
	pub fn parse_boundary(content_type: &str) -> multer::Result<String> {
		let mime = content_type
			.parse::<mime::Mime>()
			.map_err(multer::Error::DecodeContentType)?;

		// The `multer` crate expects multipart/form-data here, but in DICOM multipart/related is used.
		if !(mime.type_() == mime::MULTIPART && mime.subtype().as_str() == "related") {
			return Err(multer::Error::NoMultipart);
		}

		mime.get_param(mime::BOUNDARY)
			.map(|name| name.as_str().to_owned())
			.ok_or(multer::Error::NoBoundary)
	}

	/// See [`multer::Multipart::next_field`]
	pub async fn next_field(&mut self) -> multer::Result<Option<multer::Field<'a>>> {
		self.0.next_field().await
	}
}

/// Writes `multipart/related` bodies with one `application/dicom` part per file.
#[derive(Debug, Clone)]
pub struct DicomMultipartWriter {
	boundary: String,
}

impl Default for DicomMultipartWriter {
	fn default() -> Self {
		Self::new()
	}
}

impl DicomMultipartWriter {
	/// Creates a writer with a random boundary.
	pub fn new() -> Self {
		Self {
			boundary: Uuid::new_v4().simple().to_string(),
		}
	}

	pub fn boundary(&self) -> &str {
		&self.boundary
	}

	/// Value of the Content-Type header of the response.
	pub fn content_type(&self) -> String {
		format!(
			r#"multipart/related; type="application/dicom"; boundary={}"#,
			self.boundary
		)
	}

	fn part_header(&self, length: usize) -> Bytes {
		Bytes::from(format!(
			"--{}\r\nContent-Type: application/dicom\r\nContent-Length: {length}\r\n\r\n",
			self.boundary
		))
	}

	fn closing_delimiter(&self) -> Bytes {
		Bytes::from(format!("--{}--\r\n", self.boundary))
	}

	/// Frames each file of `files` as a part. The first error ends the body.
	pub fn into_stream<S, E>(self, files: S) -> impl Stream<Item = Result<Bytes, E>> + Send
	where
		S: Stream<Item = Result<Bytes, E>> + Send + 'static,
		E: Send + 'static,
	{
		try_stream! {
			let mut files = std::pin::pin!(files);
			while let Some(file) = files.next().await {
				let file = file?;
				yield self.part_header(file.len());
				yield file;
				yield Bytes::from_static(b"\r\n");
			}
			yield self.closing_delimiter();
		}
	}
}
