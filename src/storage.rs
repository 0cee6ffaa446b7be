//! Content-addressed storage of the uploaded DICOM files.
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

fn hash(uid: &str) -> String {
	format!("{:x}", Sha256::digest(uid.as_bytes()))
}

/// Relative location of an instance file, derived only from its three UIDs.
pub fn instance_path(
	study_instance_uid: &str,
	series_instance_uid: &str,
	sop_instance_uid: &str,
) -> PathBuf {
	PathBuf::from(hash(study_instance_uid))
		.join(hash(series_instance_uid))
		.join(format!("{}.dcm", hash(sop_instance_uid)))
}

#[async_trait]
pub trait FileStore: Send + Sync {
	/// Writes `data` to `path`, replacing an existing file and creating missing directories.
	async fn save(&self, path: &Path, data: Bytes) -> io::Result<()>;

	async fn read(&self, path: &Path) -> io::Result<Bytes>;
}

/// Stores files below a root directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
	root: PathBuf,
}

impl LocalFileStore {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}
}

#[async_trait]
impl FileStore for LocalFileStore {
	async fn save(&self, path: &Path, data: Bytes) -> io::Result<()> {
		let target = self.root.join(path);
		if let Some(parent) = target.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		// Readers never observe a partially written file.
		let staging = target.with_extension(format!("{}.part", Uuid::new_v4().simple()));
		if let Err(err) = tokio::fs::write(&staging, &data).await {
			let _ = tokio::fs::remove_file(&staging).await;
			return Err(err);
		}
		tokio::fs::rename(&staging, &target).await
	}

	async fn read(&self, path: &Path) -> io::Result<Bytes> {
		let data = tokio::fs::read(self.root.join(path)).await?;
		Ok(Bytes::from(data))
	}
}
