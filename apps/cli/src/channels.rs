//! Channel naming under the channel root.
//!
//! Uploads land in `<root>/<category>/<name>`, where the category comes from
//! the file extension and the name from the file name with dots replaced.

use std::fmt;
use std::path::{Path, PathBuf};

/// Coarse file category used to group channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Videos,
    Images,
    Documents,
    Others,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Videos => "Videos",
            Self::Images => "Images",
            Self::Documents => "Documents",
            Self::Others => "Others",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the category for `file_name` by extension.
pub fn category_for(file_name: &str) -> Category {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "mkv" | "avi" => Category::Videos,
        "jpg" | "jpeg" | "png" | "gif" => Category::Images,
        "pdf" | "docx" | "txt" => Category::Documents,
        _ => Category::Others,
    }
}

/// Base channel name for `file_name`: lowercase, dots become dashes.
pub fn channel_name_for(file_name: &str) -> String {
    file_name.replace('.', "-").to_lowercase()
}

/// Returns a channel directory for `file_name` that does not exist yet.
///
/// Repeated uploads of the same name get `name-2`, `name-3`, ...
pub fn new_channel_dir(root: &Path, file_name: &str) -> PathBuf {
    let parent = root.join(category_for(file_name).as_str());
    let base = channel_name_for(file_name);
    let mut candidate = parent.join(&base);
    let mut counter = 2u32;
    while candidate.exists() {
        candidate = parent.join(format!("{base}-{counter}"));
        counter += 1;
    }
    candidate
}

/// Resolves a channel argument: an existing path as given, otherwise a path
/// relative to the channel root.
pub fn resolve_channel_dir(root: &Path, arg: &str) -> PathBuf {
    let given = PathBuf::from(arg);
    if given.is_absolute() || given.exists() {
        given
    } else {
        root.join(given)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_by_extension() {
        assert_eq!(category_for("trip.MKV"), Category::Videos);
        assert_eq!(category_for("cat.jpeg"), Category::Images);
        assert_eq!(category_for("notes.txt"), Category::Documents);
        assert_eq!(category_for("archive.tar.gz"), Category::Others);
        assert_eq!(category_for("README"), Category::Others);
    }

    #[test]
    fn channel_names() {
        assert_eq!(channel_name_for("My.Report.pdf"), "my-report-pdf");
    }

    #[test]
    fn repeated_names_get_a_counter() {
        let root = tempfile::tempdir().unwrap();
        let first = new_channel_dir(root.path(), "a.txt");
        assert_eq!(first, root.path().join("Documents").join("a-txt"));

        std::fs::create_dir_all(&first).unwrap();
        let second = new_channel_dir(root.path(), "a.txt");
        assert_eq!(second, root.path().join("Documents").join("a-txt-2"));

        std::fs::create_dir_all(&second).unwrap();
        assert!(new_channel_dir(root.path(), "a.txt").ends_with("a-txt-3"));
    }

    #[test]
    fn relative_channel_resolves_under_root() {
        let root = tempfile::tempdir().unwrap();
        let resolved = resolve_channel_dir(root.path(), "Videos/clip-mp4");
        assert_eq!(resolved, root.path().join("Videos").join("clip-mp4"));
    }
}
