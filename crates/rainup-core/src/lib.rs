mod archive;
mod catalog;
mod release;

pub use archive::ArchiveType;
pub use catalog::ReleaseCatalog;
pub use release::{Platform, ReleaseDescriptor};
