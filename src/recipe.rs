//! Recipe catalog.
//!
//! A recipe is a directory under the catalog root holding a `recipe.toml`
//! manifest plus the workload bundle (compose definition and any supporting
//! files). Everything except the manifest is uploaded to the lab as-is.
//!
//! ```text
//! recipes/
//!   web-basic/
//!     recipe.toml
//!     compose.yaml
//!     target/Dockerfile
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{LabError, LabResult};
use crate::runtime::RuntimeKind;

pub const MANIFEST_FILE: &str = "recipe.toml";

/// Upper bound on the total size of a bundle.
pub const MAX_BUNDLE_BYTES: usize = 16 * 1024 * 1024;

const MAX_BUNDLE_FILES: usize = 512;

static RECIPE_REF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").expect("static pattern"));

/// Reject anything that is not a plain catalog name.
pub fn validate_recipe_ref(recipe_ref: &str) -> LabResult<()> {
    if RECIPE_REF_PATTERN.is_match(recipe_ref) {
        Ok(())
    } else {
        Err(LabError::InvalidInput(format!(
            "recipe_ref {recipe_ref:?} is not a valid recipe name"
        )))
    }
}

/// Where the gateway reaches the lab once it is READY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Compose service exposing the endpoint.
    pub service: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecipeManifest {
    /// Runtime override; the manager default applies when absent.
    #[serde(default)]
    pub runtime: Option<RuntimeKind>,
    #[serde(default = "default_compose_file")]
    pub compose_file: String,
    pub endpoint: EndpointSpec,
}

fn default_compose_file() -> String {
    "compose.yaml".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    /// `/`-separated path relative to the bundle root.
    pub path: String,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Recipe {
    pub recipe_ref: String,
    pub runtime: Option<RuntimeKind>,
    pub compose_file: String,
    pub endpoint: EndpointSpec,
    pub files: Vec<BundleFile>,
}

impl Recipe {
    pub fn compose_contents(&self) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|f| f.path == self.compose_file)
            .map(|f| f.contents.as_slice())
    }
}

pub trait RecipeCatalog: Send + Sync {
    /// Resolve a validated recipe reference. Unknown references are
    /// `InvalidInput` so they fail the create call synchronously.
    fn resolve(&self, recipe_ref: &str) -> LabResult<Recipe>;
}

// ---------------------------------------------------------------------------
// Directory catalog
// ---------------------------------------------------------------------------

pub struct DirCatalog {
    root: PathBuf,
}

impl DirCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl RecipeCatalog for DirCatalog {
    fn resolve(&self, recipe_ref: &str) -> LabResult<Recipe> {
        validate_recipe_ref(recipe_ref)?;
        let dir = self.root.join(recipe_ref);
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(LabError::InvalidInput(format!(
                "unknown recipe {recipe_ref:?}"
            )));
        }

        let raw = std::fs::read_to_string(&manifest_path)
            .map_err(|e| LabError::Internal(format!("read {}: {e}", manifest_path.display())))?;
        let manifest: RecipeManifest = toml::from_str(&raw).map_err(|e| {
            LabError::Internal(format!("parse {}: {e}", manifest_path.display()))
        })?;

        let mut files = Vec::new();
        collect_files(&dir, &dir, &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let recipe = Recipe {
            recipe_ref: recipe_ref.to_string(),
            runtime: manifest.runtime,
            compose_file: manifest.compose_file,
            endpoint: manifest.endpoint,
            files,
        };
        if recipe.compose_contents().is_none() {
            return Err(LabError::Internal(format!(
                "recipe {recipe_ref:?} lacks {}",
                recipe.compose_file
            )));
        }
        Ok(recipe)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<BundleFile>) -> LabResult<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| LabError::Internal(format!("read {}: {e}", dir.display())))?;

    for entry in entries {
        let entry = entry.map_err(|e| LabError::Internal(e.to_string()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| LabError::Internal(format!("stat {}: {e}", path.display())))?;

        // Symlinks could point anywhere on the host.
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }

        let rel = path
            .strip_prefix(root)
            .map_err(|e| LabError::Internal(e.to_string()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rel == MANIFEST_FILE {
            continue;
        }

        let contents = std::fs::read(&path)
            .map_err(|e| LabError::Internal(format!("read {}: {e}", path.display())))?;
        out.push(BundleFile {
            path: rel,
            contents,
        });

        if out.len() > MAX_BUNDLE_FILES {
            return Err(LabError::Internal(format!(
                "bundle has more than {MAX_BUNDLE_FILES} files"
            )));
        }
        let total: usize = out.iter().map(|f| f.contents.len()).sum();
        if total > MAX_BUNDLE_BYTES {
            return Err(LabError::Internal(format!(
                "bundle exceeds {MAX_BUNDLE_BYTES} bytes"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Static catalog
// ---------------------------------------------------------------------------

/// Fixed in-memory catalog.
#[derive(Default)]
pub struct StaticCatalog {
    recipes: HashMap<String, Recipe>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, recipe: Recipe) -> Self {
        self.recipes.insert(recipe.recipe_ref.clone(), recipe);
        self
    }
}

impl RecipeCatalog for StaticCatalog {
    fn resolve(&self, recipe_ref: &str) -> LabResult<Recipe> {
        validate_recipe_ref(recipe_ref)?;
        self.recipes
            .get(recipe_ref)
            .cloned()
            .ok_or_else(|| LabError::InvalidInput(format!("unknown recipe {recipe_ref:?}")))
    }
}
