//! Manifest patching for digest promotion
//!
//! A downstream manifest is any YAML document with a top-level `images` list
//! (kustomization style). Entries whose `name` matches the promoted image get
//! their value field overwritten.

use serde_yaml::{Mapping, Value};

use crate::domain::rule::ImageField;

/// Prefix every promotable artifact must start with
pub const DIGEST_PREFIX: &str = "sha256:";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("artifact file is empty")]
    EmptyArtifact,

    #[error("artifact file does not contain an image digest")]
    NotADigest,

    #[error("manifest is empty")]
    EmptyManifest,

    #[error("manifest is malformed: {0}")]
    Malformed(String),
}

/// Reads an image digest reference out of an artifact file's contents
pub fn parse_digest(contents: &[u8]) -> Result<String, ManifestError> {
    if contents.is_empty() {
        return Err(ManifestError::EmptyArtifact);
    }
    if !contents.starts_with(DIGEST_PREFIX.as_bytes()) {
        return Err(ManifestError::NotADigest);
    }
    let text = std::str::from_utf8(contents).map_err(|_| ManifestError::NotADigest)?;
    Ok(text.trim_end_matches(['\n', '\r']).to_string())
}

/// Outcome of patching one manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPatch {
    /// Entries whose name matched the image
    pub matched: usize,
    /// Re-serialized document, present only when a value actually changed
    pub updated: Option<String>,
}

impl ManifestPatch {
    pub fn is_changed(&self) -> bool {
        self.updated.is_some()
    }
}

/// Overwrites `field` of every `images[]` entry named `image_name` with `value`
pub fn patch_images(
    contents: &str,
    image_name: &str,
    field: ImageField,
    value: &str,
) -> Result<ManifestPatch, ManifestError> {
    if contents.trim().is_empty() {
        return Err(ManifestError::EmptyManifest);
    }

    let mut doc: Value =
        serde_yaml::from_str(contents).map_err(|e| ManifestError::Malformed(e.to_string()))?;
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| ManifestError::Malformed("top level is not a mapping".to_string()))?;

    let images = match root.get_mut("images") {
        None | Some(Value::Null) => {
            return Ok(ManifestPatch {
                matched: 0,
                updated: None,
            });
        }
        Some(Value::Sequence(images)) => images,
        Some(_) => return Err(ManifestError::Malformed("images is not a list".to_string())),
    };

    let mut matched = 0;
    let mut changed = false;
    for entry in images.iter_mut() {
        let Some(entry) = entry.as_mapping_mut() else {
            continue;
        };
        if entry.get("name").and_then(Value::as_str) != Some(image_name) {
            continue;
        }
        matched += 1;
        changed |= set_field(entry, field.key(), value);
    }

    let updated = if changed {
        Some(serde_yaml::to_string(&doc).map_err(|e| ManifestError::Malformed(e.to_string()))?)
    } else {
        None
    };

    Ok(ManifestPatch { matched, updated })
}

fn set_field(entry: &mut Mapping, key: &str, value: &str) -> bool {
    if entry.get(key).and_then(Value::as_str) == Some(value) {
        return false;
    }
    entry.insert(Value::from(key), Value::from(value));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUSTOMIZATION: &str = "\
apiVersion: kustomize.config.k8s.io/v1beta1
kind: Kustomization
resources:
  - deployment.yaml
images:
  - name: registry/svc
    digest: sha256:old
  - name: registry/other
    newTag: v1
";

    #[test]
    fn test_parse_digest() {
        assert_eq!(parse_digest(b"sha256:abc123\n").unwrap(), "sha256:abc123");
        assert!(matches!(parse_digest(b""), Err(ManifestError::EmptyArtifact)));
        assert!(matches!(
            parse_digest(b"registry/svc:latest"),
            Err(ManifestError::NotADigest)
        ));
    }

    #[test]
    fn test_patch_digest() {
        let patch =
            patch_images(KUSTOMIZATION, "registry/svc", ImageField::Digest, "sha256:abc123")
                .unwrap();
        assert_eq!(patch.matched, 1);
        let updated = patch.updated.unwrap();
        let doc: Value = serde_yaml::from_str(&updated).unwrap();
        assert_eq!(doc["images"][0]["digest"].as_str(), Some("sha256:abc123"));
        assert_eq!(doc["images"][1]["newTag"].as_str(), Some("v1"));
        assert_eq!(doc["resources"][0].as_str(), Some("deployment.yaml"));
    }

    #[test]
    fn test_patch_new_tag_dialect() {
        let patch = patch_images(KUSTOMIZATION, "registry/other", ImageField::NewTag, "v2").unwrap();
        let doc: Value = serde_yaml::from_str(&patch.updated.unwrap()).unwrap();
        assert_eq!(doc["images"][1]["newTag"].as_str(), Some("v2"));
    }

    #[test]
    fn test_patch_same_value_is_unchanged() {
        let patch =
            patch_images(KUSTOMIZATION, "registry/svc", ImageField::Digest, "sha256:old").unwrap();
        assert_eq!(patch.matched, 1);
        assert!(!patch.is_changed());
    }

    #[test]
    fn test_patch_no_matching_image() {
        let patch =
            patch_images(KUSTOMIZATION, "registry/missing", ImageField::Digest, "sha256:x").unwrap();
        assert_eq!(patch.matched, 0);
        assert!(!patch.is_changed());
    }

    #[test]
    fn test_patch_without_images_list() {
        let patch = patch_images("kind: Kustomization\n", "img", ImageField::Digest, "sha256:x")
            .unwrap();
        assert_eq!(patch.matched, 0);
    }

    #[test]
    fn test_patch_rejects_empty_and_malformed() {
        assert!(matches!(
            patch_images("  \n", "img", ImageField::Digest, "sha256:x"),
            Err(ManifestError::EmptyManifest)
        ));
        assert!(matches!(
            patch_images("- a\n- b\n", "img", ImageField::Digest, "sha256:x"),
            Err(ManifestError::Malformed(_))
        ));
        assert!(matches!(
            patch_images("images: nope\n", "img", ImageField::Digest, "sha256:x"),
            Err(ManifestError::Malformed(_))
        ));
    }
}
