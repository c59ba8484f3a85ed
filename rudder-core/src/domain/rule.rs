//! Rule domain types
//!
//! Build rules are loaded once at process start and never change afterwards.
//! Diff-run rules live inside the watched repository and are fetched per event.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::job::{MAX_JOB_NAME_LEN, is_dns_label};

/// Errors raised while validating rules
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("invalid repository slug '{0}': expected owner/name")]
    InvalidSlug(String),

    #[error("rule '{0}' has a post_process section but no artifacts")]
    MissingArtifact(String),

    #[error("rule name must not be empty")]
    EmptyName,

    #[error(
        "invalid rule name '{0}': use lowercase alphanumerics and '-', at most {max} characters",
        max = MAX_JOB_NAME_LEN
    )]
    InvalidName(String),

    #[error("invalid manifest path '{0}': must stay inside the target repository")]
    InvalidManifestPath(String),

    #[error("duplicate rule name '{0}'")]
    DuplicateName(String),

    #[error("failed to parse rule file: {0}")]
    Parse(String),
}

/// A GitHub repository identified as `owner/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositorySlug {
    owner: String,
    name: String,
}

impl RepositorySlug {
    /// Parses `owner/name`, stripping a trailing `.git`
    pub fn parse(input: &str) -> Result<Self, RuleError> {
        let (owner, name) = input
            .trim()
            .split_once('/')
            .ok_or_else(|| RuleError::InvalidSlug(input.to_string()))?;
        let name = name.strip_suffix(".git").unwrap_or(name);

        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(RuleError::InvalidSlug(input.to_string()));
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `owner/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn https_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.name)
    }

    pub fn ssh_url(&self) -> String {
        format!("git@github.com:{}/{}.git", self.owner, self.name)
    }
}

impl fmt::Display for RepositorySlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Which value field of a manifest `images` entry gets overwritten
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageField {
    #[default]
    #[serde(rename = "digest")]
    Digest,
    #[serde(rename = "newTag")]
    NewTag,
}

impl ImageField {
    pub fn key(&self) -> &'static str {
        match self {
            ImageField::Digest => "digest",
            ImageField::NewTag => "newTag",
        }
    }
}

/// Promotion settings attached to a build rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcess {
    /// Target repository (`owner/name`) holding the manifests
    #[serde(rename = "repo")]
    pub repository: String,
    /// Image name matched against `images[].name`
    #[serde(rename = "image")]
    pub image_name: String,
    /// Manifest paths relative to the target repository root, visited in order
    #[serde(rename = "paths")]
    pub manifest_paths: Vec<String>,
    #[serde(default)]
    pub field: ImageField,
}

impl PostProcess {
    pub fn target(&self) -> Result<RepositorySlug, RuleError> {
        RepositorySlug::parse(&self.repository)
    }

    /// Manifest paths with any leading `/` removed, in configured order.
    /// Paths with `.` or `..` segments are rejected.
    pub fn relative_manifest_paths(&self) -> Result<Vec<&str>, RuleError> {
        self.manifest_paths
            .iter()
            .map(|path| {
                let relative = path.trim_start_matches('/');
                let escapes = relative
                    .split('/')
                    .any(|segment| segment.is_empty() || segment == "." || segment == "..");
                if escapes {
                    Err(RuleError::InvalidManifestPath(path.clone()))
                } else {
                    Ok(relative)
                }
            })
            .collect()
    }
}

/// One buildable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRule {
    pub name: String,
    #[serde(rename = "repo")]
    pub repository: String,
    /// Private repositories are cloned over SSH
    #[serde(default)]
    pub private: bool,
    /// Overrides the tag of the configured build image
    #[serde(default)]
    pub bazel_version: Option<String>,
    /// Opaque argument handed to the build tool
    #[serde(rename = "target")]
    pub build_target: String,
    /// The first entry is the primary artifact
    #[serde(rename = "artifacts", default)]
    pub artifact_paths: Vec<String>,
    #[serde(default)]
    pub post_process: Option<PostProcess>,
}

impl BuildRule {
    pub fn slug(&self) -> Result<RepositorySlug, RuleError> {
        RepositorySlug::parse(&self.repository)
    }

    pub fn primary_artifact(&self) -> Option<&str> {
        self.artifact_paths.first().map(String::as_str)
    }

    pub fn clone_url(&self) -> Result<String, RuleError> {
        let slug = self.slug()?;
        Ok(if self.private {
            slug.ssh_url()
        } else {
            slug.https_url()
        })
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.name.is_empty() {
            return Err(RuleError::EmptyName);
        }
        // The name becomes the `{name}-{id}` Pod name.
        if self.name.len() > MAX_JOB_NAME_LEN || !is_dns_label(&self.name) {
            return Err(RuleError::InvalidName(self.name.clone()));
        }
        self.slug()?;
        if let Some(post_process) = &self.post_process {
            post_process.target()?;
            post_process.relative_manifest_paths()?;
            if self.artifact_paths.is_empty() {
                return Err(RuleError::MissingArtifact(self.name.clone()));
            }
        }
        Ok(())
    }
}

/// Contents of the build rule file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRuleSet {
    #[serde(default)]
    pub rules: Vec<BuildRule>,
}

impl BuildRuleSet {
    pub fn from_yaml(contents: &str) -> Result<Self, RuleError> {
        let set: BuildRuleSet =
            serde_yaml::from_str(contents).map_err(|e| RuleError::Parse(e.to_string()))?;
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !seen.insert(rule.name.as_str()) {
                return Err(RuleError::DuplicateName(rule.name.clone()));
            }
        }
        Ok(())
    }
}

/// Secret exposed to the diff-run container as an environment variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
    pub env_name: String,
}

/// Rule file committed inside a configuration-as-code repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRunRule {
    /// Directory (relative to the repository root) whose changes trigger a run
    pub dir: String,
    #[serde(default)]
    pub image: Option<String>,
    /// Only pushes to this branch execute
    #[serde(alias = "master_branch", default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub secret: Option<SecretRef>,
}

fn default_branch() -> String {
    "master".to_string()
}

impl DiffRunRule {
    pub fn from_yaml(contents: &str) -> Result<Self, RuleError> {
        serde_yaml::from_str(contents).map_err(|e| RuleError::Parse(e.to_string()))
    }

    /// Whether any of the changed paths lives under the watched directory
    pub fn is_affected_by(&self, changed: &[String]) -> bool {
        let dir = self.dir.trim_matches('/');
        if dir.is_empty() {
            return !changed.is_empty();
        }
        changed.iter().any(|path| {
            let path = path.trim_start_matches('/');
            path == dir
                || path
                    .strip_prefix(dir)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}
