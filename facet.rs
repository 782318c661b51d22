//! Facet store
//!
//! A facet is a reusable prompt fragment: a persona, policy, knowledge
//! snippet, instruction, or output contract. Resolution walks three layers,
//! project-local first, so a project can override a user-global facet, which
//! in turn can override a built-in.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FacetError {
    #[error("facet not found: {facet_type}/{name}")]
    NotFound { facet_type: String, name: String },

    #[error("facet {facet_type}/{name} already exists at {path}")]
    AlreadyExists {
        facet_type: String,
        name: String,
        path: PathBuf,
    },

    #[error("io error resolving facet {facet_type}/{name}: {source}")]
    Io {
        facet_type: String,
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetType {
    Persona,
    Policy,
    Knowledge,
    Instruction,
    OutputContract,
}

impl FacetType {
    fn dir_name(self) -> &'static str {
        match self {
            FacetType::Persona => "personas",
            FacetType::Policy => "policies",
            FacetType::Knowledge => "knowledge",
            FacetType::Instruction => "instructions",
            FacetType::OutputContract => "output_contracts",
        }
    }
}

impl std::fmt::Display for FacetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Three-layer facet resolver: project-local → user-global → built-in.
pub struct FacetStore {
    project_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
    builtin_dir: PathBuf,
}

impl FacetStore {
    pub fn new(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>, builtin_dir: PathBuf) -> Self {
        debug!(?project_dir, ?user_dir, ?builtin_dir, "FacetStore::new: called");
        Self {
            project_dir,
            user_dir,
            builtin_dir,
        }
    }

    fn layers(&self) -> impl Iterator<Item = &PathBuf> {
        self.project_dir
            .iter()
            .chain(self.user_dir.iter())
            .chain(std::iter::once(&self.builtin_dir))
    }

    fn candidate_path(layer: &Path, facet_type: FacetType, name: &str) -> PathBuf {
        layer.join(facet_type.dir_name()).join(format!("{name}.md"))
    }

    /// Resolve a facet reference to its absolute path and text content.
    pub fn resolve(&self, facet_type: FacetType, name: &str) -> Result<(PathBuf, String), FacetError> {
        debug!(%facet_type, %name, "FacetStore::resolve: called");
        for layer in self.layers() {
            let path = Self::candidate_path(layer, facet_type, name);
            if path.is_file() {
                debug!(?path, "FacetStore::resolve: found in layer");
                let text = std::fs::read_to_string(&path).map_err(|source| FacetError::Io {
                    facet_type: facet_type.to_string(),
                    name: name.to_string(),
                    source,
                })?;
                return Ok((path, text));
            }
        }
        debug!(%facet_type, %name, "FacetStore::resolve: not found in any layer");
        Err(FacetError::NotFound {
            facet_type: facet_type.to_string(),
            name: name.to_string(),
        })
    }

    /// Copy a facet from the built-in layer into `project_dir` (or, failing
    /// that, `user_dir`) so it can be customised. Refuses to overwrite.
    pub fn eject(&self, facet_type: FacetType, name: &str) -> Result<PathBuf, FacetError> {
        debug!(%facet_type, %name, "FacetStore::eject: called");
        let target_layer = self
            .project_dir
            .as_ref()
            .or(self.user_dir.as_ref())
            .expect("eject requires a project or user directory configured");

        let source_path = Self::candidate_path(&self.builtin_dir, facet_type, name);
        let text = std::fs::read_to_string(&source_path).map_err(|source| FacetError::Io {
            facet_type: facet_type.to_string(),
            name: name.to_string(),
            source,
        })?;

        let dest_path = Self::candidate_path(target_layer, facet_type, name);
        if dest_path.exists() {
            debug!(?dest_path, "FacetStore::eject: destination already exists");
            return Err(FacetError::AlreadyExists {
                facet_type: facet_type.to_string(),
                name: name.to_string(),
                path: dest_path,
            });
        }

        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| FacetError::Io {
                facet_type: facet_type.to_string(),
                name: name.to_string(),
                source,
            })?;
        }
        std::fs::write(&dest_path, &text).map_err(|source| FacetError::Io {
            facet_type: facet_type.to_string(),
            name: name.to_string(),
            source,
        })?;
        debug!(?dest_path, "FacetStore::eject: wrote ejected copy");

        Ok(dest_path)
    }
}
