use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use schemars::schema_for;

use crate::feature::config::ManifestDocument;
use crate::orchestrator::CascadeReport;

pub const MANIFEST_SCHEMA: &str = "manifest.schema.json";
pub const CASCADE_SCHEMA: &str = "cascade-report.schema.json";

/// Write the manifest and cascade report JSON schemas into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir).with_context(|| format!("could not create {}", out_dir.display()))?;

    let manifest = serde_json::to_string_pretty(&schema_for!(ManifestDocument))?;
    let cascade = serde_json::to_string_pretty(&schema_for!(CascadeReport))?;

    let mut written = Vec::new();
    for (name, body) in [(MANIFEST_SCHEMA, manifest), (CASCADE_SCHEMA, cascade)] {
        let path = out_dir.join(name);
        fs::write(&path, body).with_context(|| format!("could not write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn test_writes_both_schemas() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("schemas");
        let written = write_schema(&out).unwrap();
        assert_eq!(written.len(), 2);

        let manifest: Value = serde_json::from_str(&fs::read_to_string(out.join(MANIFEST_SCHEMA)).unwrap()).unwrap();
        let text = manifest.to_string();
        assert!(text.contains("componentConfigs"));
        assert!(text.contains("providerConfigs"));

        let cascade: Value = serde_json::from_str(&fs::read_to_string(out.join(CASCADE_SCHEMA)).unwrap()).unwrap();
        assert!(cascade.to_string().contains("truncated"));
    }
}
