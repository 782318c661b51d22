//! Piece loader & normalizer (§4.2)
//!
//! Turns a piece descriptor — as deserialized straight off disk — into the
//! immutable, referentially-sound [`Piece`] the engine runs. Resolution walks
//! five layers before normalization ever starts; normalization then validates
//! the chosen descriptor and binds structured-output schemas.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::model::{AggregateMode, Movement, NextMovement, Piece, Rule, RuleKind, Terminal};

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("piece not found: {0}")]
    PieceNotFound(String),

    #[error("ambiguous piece {name}: found in {count} locations within the same layer")]
    AmbiguousPiece { name: String, count: usize },

    #[error("facet not found: {0}")]
    FacetNotFound(String),

    #[error("structured-output schema not found: {0}")]
    SchemaNotFound(String),

    #[error("invalid piece {piece}: {reason}")]
    Invalid { piece: String, reason: String },

    #[error("failed to read piece descriptor at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse piece descriptor at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Where a piece descriptor was found, highest precedence first.
#[derive(Debug, Clone)]
pub enum PieceSource {
    AbsolutePath(PathBuf),
    ProjectLocal(PathBuf),
    UserGlobal(PathBuf),
    Repertoire(PathBuf),
    Builtin(PathBuf),
}

/// Resolves piece names to descriptor files across the five-layer search
/// order (§4.2), then validates and normalizes the chosen descriptor.
pub struct PieceLoader {
    project_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
    repertoire_dir: Option<PathBuf>,
    builtin_dir: PathBuf,
    schema_dir: PathBuf,
}

impl PieceLoader {
    pub fn new(
        project_dir: Option<PathBuf>,
        user_dir: Option<PathBuf>,
        repertoire_dir: Option<PathBuf>,
        builtin_dir: PathBuf,
        schema_dir: PathBuf,
    ) -> Self {
        Self {
            project_dir,
            user_dir,
            repertoire_dir,
            builtin_dir,
            schema_dir,
        }
    }

    /// Load and normalize a piece, resolving `reference` through the
    /// five-layer search order unless it is already an absolute path.
    pub fn load(&self, reference: &str) -> Result<Piece, PieceError> {
        debug!(%reference, "PieceLoader::load: called");
        let (source, path) = self.resolve(reference)?;
        debug!(?source, ?path, "PieceLoader::load: resolved descriptor");

        let text = std::fs::read_to_string(&path).map_err(|source_err| PieceError::Io {
            path: path.clone(),
            source: source_err,
        })?;
        let mut piece: Piece = serde_yaml::from_str(&text).map_err(|source_err| PieceError::Parse {
            path: path.clone(),
            source: source_err,
        })?;

        self.validate(&piece)?;
        self.bind_structured_output_schemas(&mut piece)?;

        debug!(piece = %piece.name, movements = piece.movements.len(), "PieceLoader::load: normalized");
        Ok(piece)
    }

    fn resolve(&self, reference: &str) -> Result<(PieceSource, PathBuf), PieceError> {
        if Path::new(reference).is_absolute() {
            let path = PathBuf::from(reference);
            return if path.is_file() {
                Ok((PieceSource::AbsolutePath(path.clone()), path))
            } else {
                Err(PieceError::PieceNotFound(reference.to_string()))
            };
        }

        let layers: [(fn(PathBuf) -> PieceSource, Option<&PathBuf>); 4] = [
            (PieceSource::ProjectLocal, self.project_dir.as_ref()),
            (PieceSource::UserGlobal, self.user_dir.as_ref()),
            (PieceSource::Repertoire, self.repertoire_dir.as_ref()),
            (PieceSource::Builtin, Some(&self.builtin_dir)),
        ];

        for (wrap, dir) in layers {
            let Some(dir) = dir else { continue };
            let matches = Self::candidates_in_layer(dir, reference);
            match matches.len() {
                0 => continue,
                1 => return Ok((wrap(matches[0].clone()), matches[0].clone())),
                count => {
                    return Err(PieceError::AmbiguousPiece {
                        name: reference.to_string(),
                        count,
                    });
                }
            }
        }

        Err(PieceError::PieceNotFound(reference.to_string()))
    }

    /// A piece named `foo` may live at `<dir>/foo.yaml` or `<dir>/foo/piece.yaml`.
    /// Both existing in the same layer is the `AmbiguousPiece` case.
    fn candidates_in_layer(dir: &Path, name: &str) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let flat = dir.join(format!("{name}.yaml"));
        if flat.is_file() {
            found.push(flat);
        }
        let nested = dir.join(name).join("piece.yaml");
        if nested.is_file() {
            found.push(nested);
        }
        found
    }

    fn validate(&self, piece: &Piece) -> Result<(), PieceError> {
        debug!(piece = %piece.name, "PieceLoader::validate: called");
        if let Some(version) = &piece.min_version {
            Self::validate_min_version(version).map_err(|reason| PieceError::Invalid {
                piece: piece.name.clone(),
                reason,
            })?;
        }

        let mut names = HashSet::new();
        for movement in &piece.movements {
            if !names.insert(movement.name().to_string()) {
                return Err(PieceError::Invalid {
                    piece: piece.name.clone(),
                    reason: format!("duplicate movement name `{}`", movement.name()),
                });
            }
        }

        if !names.contains(&piece.initial_movement) {
            return Err(PieceError::Invalid {
                piece: piece.name.clone(),
                reason: format!("initial_movement `{}` does not name a movement", piece.initial_movement),
            });
        }

        for movement in &piece.movements {
            self.validate_movement(piece, movement, &names)?;
        }

        Ok(())
    }

    fn validate_movement(&self, piece: &Piece, movement: &Movement, names: &HashSet<String>) -> Result<(), PieceError> {
        if let Movement::TeamLeader { max_parts, .. } = movement {
            if *max_parts > 3 {
                return Err(PieceError::Invalid {
                    piece: piece.name.clone(),
                    reason: format!("movement `{}`: max_parts {} exceeds the limit of 3", movement.name(), max_parts),
                });
            }
        }

        if let Movement::Parallel { sub_movements, .. } = movement {
            let aggregate_conditions: HashSet<&str> = movement
                .rules()
                .iter()
                .filter(|r| matches!(r.kind, RuleKind::Aggregate { .. }))
                .map(|r| r.condition.as_str())
                .collect();
            for sub in sub_movements {
                let has_matching_condition = sub.rules().iter().any(|r| aggregate_conditions.contains(r.condition.as_str()));
                if !has_matching_condition {
                    return Err(PieceError::Invalid {
                        piece: piece.name.clone(),
                        reason: format!(
                            "parallel movement `{}`: sub-movement `{}` has no rule whose condition matches one of the parent's aggregate conditions",
                            movement.name(),
                            sub.name()
                        ),
                    });
                }
                self.validate_movement(piece, sub, names)?;
            }
        }

        for rule in movement.rules() {
            self.validate_rule(piece, movement, rule, names)?;
        }

        Ok(())
    }

    fn validate_rule(&self, piece: &Piece, movement: &Movement, rule: &Rule, names: &HashSet<String>) -> Result<(), PieceError> {
        match &rule.next {
            NextMovement::Terminal(Terminal::Complete) | NextMovement::Terminal(Terminal::Abort) => Ok(()),
            NextMovement::Named(target) => {
                if names.contains(target) {
                    Ok(())
                } else {
                    Err(PieceError::Invalid {
                        piece: piece.name.clone(),
                        reason: format!(
                            "movement `{}`: rule `next` targets `{}`, which is not a movement or terminal",
                            movement.name(),
                            target
                        ),
                    })
                }
            }
        }
    }

    fn bind_structured_output_schemas(&self, piece: &mut Piece) -> Result<(), PieceError> {
        for movement in &mut piece.movements {
            self.bind_schema_for_movement(movement)?;
        }
        Ok(())
    }

    fn bind_schema_for_movement(&self, movement: &mut Movement) -> Result<(), PieceError> {
        let schema_ref = movement.common().structured_output_schema_ref.clone();
        if let Some(name) = schema_ref {
            let schema = self.load_schema(&name)?;
            movement.common_mut().structured_output_schema = Some(schema);
        }

        if let Movement::Parallel { sub_movements, .. } = movement {
            for sub in sub_movements {
                self.bind_schema_for_movement(sub)?;
            }
        }

        Ok(())
    }

    /// Load a named JSON schema file referenced by an `output_contracts` entry.
    pub fn load_schema(&self, name: &str) -> Result<serde_json::Value, PieceError> {
        debug!(%name, "PieceLoader::load_schema: called");
        let path = self.schema_dir.join(format!("{name}.json"));
        if !path.is_file() {
            warn!(%name, ?path, "PieceLoader::load_schema: schema file missing");
            return Err(PieceError::SchemaNotFound(name.to_string()));
        }
        let text = std::fs::read_to_string(&path).map_err(|source| PieceError::Io { path: path.clone(), source })?;
        serde_json::from_str(&text).map_err(|_| PieceError::SchemaNotFound(name.to_string()))
    }

    /// Validate a `min_version` descriptor field: `MAJOR.MINOR.PATCH`, no `v`
    /// prefix, no pre-release suffix.
    pub fn validate_min_version(version: &str) -> Result<(), String> {
        let parts: Vec<&str> = version.split('.').collect();
        if parts.len() != 3 {
            return Err(format!("min_version `{version}` must be MAJOR.MINOR.PATCH"));
        }
        for part in &parts {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(format!("min_version `{version}` has a non-numeric or empty component"));
            }
        }
        Ok(())
    }
}

/// Transitive reachability of the movement graph, used for diagnostics (not
/// load-bearing validation — movement graphs are expected to cycle, bounded
/// by `max_movements`). Grounded on the dependency-walk shape used elsewhere
/// in this codebase for DAGs, adapted here to a simple reachable-set pass
/// rather than a topological order, since back-edges are legal.
pub fn reachable_movements(piece: &Piece) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack = vec![piece.initial_movement.clone()];
    let by_name: HashMap<&str, &Movement> = piece.movements.iter().map(|m| (m.name(), m)).collect();

    while let Some(name) = stack.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let Some(movement) = by_name.get(name.as_str()) else { continue };
        for rule in movement.rules() {
            if let NextMovement::Named(target) = &rule.next {
                if !seen.contains(target) {
                    stack.push(target.clone());
                }
            }
        }
        if let Movement::Parallel { sub_movements, .. } = movement {
            for sub in sub_movements {
                stack.push(sub.name().to_string());
                seen.insert(sub.name().to_string());
            }
        }
    }

    seen
}
