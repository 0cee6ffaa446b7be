pub mod dataset;
pub mod multipart;
