// ── dere engine: Personality Assets ────────────────────────────────────────
// Personality prompt text is read-only asset data loaded from disk: the
// override directory from config first, then the embedded asset root next
// to the data dir. Loaded files are cached for the process lifetime.

use crate::engine::paths;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

static CACHE: LazyLock<Mutex<HashMap<String, Option<String>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn default_dir() -> PathBuf {
    paths::data_dir().join("personalities")
}

/// Load the prompt text for a personality tag, or None when no asset
/// exists. Results (including misses) are cached.
pub fn load_prompt(override_dir: Option<&PathBuf>, tag: &str) -> Option<String> {
    if tag.is_empty() {
        return None;
    }
    let mut cache = CACHE.lock();
    if let Some(cached) = cache.get(tag) {
        return cached.clone();
    }
    let mut candidates = Vec::new();
    if let Some(dir) = override_dir {
        candidates.push(dir.join(format!("{tag}.md")));
    }
    candidates.push(default_dir().join(format!("{tag}.md")));

    let loaded = candidates
        .iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string());
    if loaded.is_none() {
        debug!("[personality] No asset for tag '{tag}'");
    }
    cache.insert(tag.to_string(), loaded.clone());
    loaded
}

/// Header line prepended to assembled context, flavored by personality.
pub fn context_header(tag: Option<&str>) -> &'static str {
    match tag.unwrap_or("") {
        "tsun" => "## Previous Context (you'd better remember this)",
        "kuu" => "## Historical Context",
        "yan" => "## Everything We Share",
        "ero" => "## Previous Context",
        _ => "## Previous Context",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_defaults_for_unknown_tags() {
        assert_eq!(context_header(None), "## Previous Context");
        assert_eq!(context_header(Some("nonexistent")), "## Previous Context");
        assert_eq!(context_header(Some("kuu")), "## Historical Context");
    }

    #[test]
    fn override_dir_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("custom-tag.md"), "Be terse.\n").unwrap();
        let text = load_prompt(Some(&dir.path().to_path_buf()), "custom-tag");
        assert_eq!(text.as_deref(), Some("Be terse."));
    }

    #[test]
    fn empty_tag_loads_nothing() {
        assert!(load_prompt(None, "").is_none());
    }
}
