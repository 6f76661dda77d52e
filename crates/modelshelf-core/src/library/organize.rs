//! Base-model folder layout used by auto-organize.

use crate::config::LibraryConfig;
use crate::types::ModelRecord;
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Characters not allowed in a folder name on common filesystems.
static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]+"#).expect("folder regex must compile"));

static REPEATED_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("whitespace regex must compile"));

/// Folder name for a base model, e.g. `SDXL 1.0` stays `SDXL 1.0`,
/// `SD 1.5/Inpaint` becomes `SD 1.5_Inpaint`.
pub fn folder_name(base_model: &str) -> Option<String> {
    let replaced = UNSAFE_CHARS.replace_all(base_model.trim(), "_");
    let collapsed = REPEATED_SPACE.replace_all(&replaced, " ");
    let name = collapsed.trim_matches(|c: char| c == '.' || c == ' ' || c == '_');
    (!name.is_empty()).then(|| name.to_string())
}

/// Where auto-organize would put `record`.
///
/// Returns `None` when the record has no base model or no owning root.
pub fn target_path(config: &LibraryConfig, record: &ModelRecord) -> Option<PathBuf> {
    let folder = folder_name(record.base_model()?)?;
    let root = config.root_for(&record.path)?;
    Some(root.path.join(folder).join(&record.file_name))
}
