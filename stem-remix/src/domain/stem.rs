//! Stem identities and the persisted stem set of a job.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One of the four sources produced by separation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StemKind {
    Vocals,
    Drums,
    Bass,
    Other,
}

impl StemKind {
    /// All stems in canonical order.
    pub const ALL: [StemKind; 4] = [Self::Vocals, Self::Drums, Self::Bass, Self::Other];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vocals => "vocals",
            Self::Drums => "drums",
            Self::Bass => "bass",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vocals" => Some(Self::Vocals),
            "drums" => Some(Self::Drums),
            "bass" => Some(Self::Bass),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// File name of the persisted stem inside a job directory.
    pub fn file_name(&self) -> String {
        format!("{}.wav", self.as_str())
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Vocals => 0,
            Self::Drums => 1,
            Self::Bass => 2,
            Self::Other => 3,
        }
    }
}

impl std::fmt::Display for StemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locations of the four persisted stems of a job.
///
/// Stem files are written once by the separation step and never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemSet {
    pub vocals: PathBuf,
    pub drums: PathBuf,
    pub bass: PathBuf,
    pub other: PathBuf,
}

impl StemSet {
    /// Stem set laid out as `<dir>/{vocals,drums,bass,other}.wav`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            vocals: dir.join(StemKind::Vocals.file_name()),
            drums: dir.join(StemKind::Drums.file_name()),
            bass: dir.join(StemKind::Bass.file_name()),
            other: dir.join(StemKind::Other.file_name()),
        }
    }

    pub fn path(&self, kind: StemKind) -> &Path {
        match kind {
            StemKind::Vocals => &self.vocals,
            StemKind::Drums => &self.drums,
            StemKind::Bass => &self.bass,
            StemKind::Other => &self.other,
        }
    }

    /// Iterate `(kind, path)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (StemKind, &Path)> {
        StemKind::ALL.into_iter().map(move |k| (k, self.path(k)))
    }

    /// Stems whose file is missing on disk.
    pub async fn missing(&self) -> Vec<StemKind> {
        let mut missing = Vec::new();
        for (kind, path) in self.iter() {
            if !crate::utils::fs::is_file(path).await {
                missing.push(kind);
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem_set_layout() {
        let set = StemSet::in_dir(Path::new("/jobs/abc"));
        assert_eq!(set.path(StemKind::Bass), Path::new("/jobs/abc/bass.wav"));
        let kinds: Vec<_> = set.iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, StemKind::ALL.to_vec());
    }

    #[test]
    fn test_stem_kind_parse() {
        for kind in StemKind::ALL {
            assert_eq!(StemKind::parse(kind.as_str()), Some(kind));
            assert_eq!(StemKind::ALL[kind.index()], kind);
        }
        assert_eq!(StemKind::parse("piano"), None);
    }

    #[tokio::test]
    async fn test_missing_stems() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("vocals.wav"), b"x").unwrap();
        let set = StemSet::in_dir(tmp.path());
        assert_eq!(
            set.missing().await,
            vec![StemKind::Drums, StemKind::Bass, StemKind::Other]
        );
    }
}
