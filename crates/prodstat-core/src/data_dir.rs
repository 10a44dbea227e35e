use std::path::{Path, PathBuf};

/// Directory name used below the platform data directory.
pub const DATA_DIR_APP_NAME: &str = "ProdStat";

/// Resolves the directory that holds derived artifacts.
///
/// An explicit override wins; otherwise the platform data directory is used
/// (`~/.local/share/ProdStat` on Linux), falling back to `./prodstat-data`.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    dirs::data_dir()
        .map(|dir| dir.join(DATA_DIR_APP_NAME))
        .unwrap_or_else(|| PathBuf::from("./prodstat-data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_resolve_data_dir_prefers_override() {
        let dir = resolve_data_dir(Some(Path::new("/tmp/prodstat-test")));
        assert_eq!(dir, PathBuf::from("/tmp/prodstat-test"));
    }

    #[test]
    fn unit_resolve_data_dir_defaults_under_app_name() {
        let dir = resolve_data_dir(None);
        assert!(dir.ends_with(DATA_DIR_APP_NAME) || dir.ends_with("prodstat-data"));
    }
}
