use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("could not open archive {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not read archive directory of {}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not locate entry '{entry}' in {}", .archive.display())]
    EntryMissing { archive: PathBuf, entry: String },

    #[error("could not write to file {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("entry '{entry}' in {} escapes the extraction root", .archive.display())]
    UnsafeEntry { archive: PathBuf, entry: String },

    #[error("unsupported archive format: {}", .path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("could not decompress {}", .path.display())]
    Decompress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
