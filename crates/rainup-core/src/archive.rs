use std::path::Path;

/// On-disk container formats a release can ship as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveType {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveType {
    pub fn cache_extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
        }
    }

    pub fn infer_from_url(url: &str) -> Option<Self> {
        let lower = url.to_ascii_lowercase();
        let without_fragment = lower.split('#').next().unwrap_or(&lower);
        let without_query = without_fragment
            .split('?')
            .next()
            .unwrap_or(without_fragment);
        Self::infer_from_file_name(without_query.rsplit('/').next().unwrap_or(""))
    }

    pub fn infer_from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?.to_ascii_lowercase();
        Self::infer_from_file_name(&file_name)
    }

    fn infer_from_file_name(file_name: &str) -> Option<Self> {
        if file_name.ends_with(".zip") {
            return Some(Self::Zip);
        }
        if file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz") {
            return Some(Self::TarGz);
        }
        if file_name.ends_with(".tar") {
            return Some(Self::Tar);
        }
        None
    }
}
