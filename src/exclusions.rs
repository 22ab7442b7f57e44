use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

/// Username-to-owner-handle map, shared with the checker and refreshed from
/// the identifier store each reconcile cycle.
pub type OwnerDirectory = Arc<RwLock<HashMap<String, String>>>;

/// Minimum gap between stats of the exclusion file. Cheap enough that the
/// scheduler can call `refresh` at every dispatch decision.
pub const REFRESH_DEBOUNCE: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ExclusionError {
    #[error("line {line}: expected `username permanent|temporary`")]
    Malformed { line: usize },
    #[error("line {line}: unknown username `{username}`")]
    UnknownUser { line: usize, username: String },
}

#[derive(Debug, Default, Clone)]
struct ExclusionSets {
    permanent: HashSet<String>,
    temporary: HashSet<String>,
}

#[derive(Default)]
struct RegistryState {
    sets: ExclusionSets,
    file_mtime: Option<SystemTime>,
    last_stat: Option<Instant>,
}

/// Owner exclusion sets, reloaded from a file whenever its mtime changes.
///
/// Permanently excluded owners are dropped at reconcile time; temporarily
/// excluded owners keep their rows but are skipped by workset construction
/// and dispatch. A failed reload keeps the previous sets; the recorded mtime
/// still advances so a broken file is not reparsed every dispatch.
pub struct ExclusionRegistry {
    path: Option<PathBuf>,
    directory: OwnerDirectory,
    debounce: Duration,
    state: RwLock<RegistryState>,
}

impl ExclusionRegistry {
    pub fn new(path: Option<PathBuf>, directory: OwnerDirectory) -> Self {
        Self {
            path,
            directory,
            debounce: REFRESH_DEBOUNCE,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Override the stat debounce (tests drive reloads faster than 10 s).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Reload the exclusion file if its mtime changed and the debounce has
    /// elapsed. Never blocks dispatch on errors.
    pub fn refresh(&self) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        let mut st = self.state.write();
        if let Some(last) = st.last_stat {
            if last.elapsed() < self.debounce {
                return;
            }
        }
        st.last_stat = Some(Instant::now());

        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "could not stat exclusion file; keeping current sets"
                );
                return;
            }
        };
        let mtime = meta.modified().ok();
        if mtime.is_some() && mtime == st.file_mtime {
            return;
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "could not read exclusion file; keeping current sets"
                );
                return;
            }
        };

        match self.parse(&raw) {
            Ok(sets) => {
                tracing::info!(
                    permanent = sets.permanent.len(),
                    temporary = sets.temporary.len(),
                    "exclusion sets reloaded"
                );
                st.sets = sets;
                st.file_mtime = mtime;
            }
            Err(e) => {
                // Advance the recorded mtime anyway so the broken file is not
                // reparsed on every dispatch.
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "exclusion file reload failed; keeping current sets"
                );
                st.file_mtime = mtime;
            }
        }
    }

    fn parse(&self, raw: &str) -> Result<ExclusionSets, ExclusionError> {
        let directory = self.directory.read();
        let mut sets = ExclusionSets::default();
        for (index, line) in raw.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut tokens = trimmed.split_whitespace();
            let (Some(username), Some(kind), None) =
                (tokens.next(), tokens.next(), tokens.next())
            else {
                return Err(ExclusionError::Malformed { line: line_no });
            };
            let owner = directory
                .get(username)
                .ok_or_else(|| ExclusionError::UnknownUser {
                    line: line_no,
                    username: username.to_string(),
                })?;
            match kind {
                "permanent" => {
                    sets.permanent.insert(owner.clone());
                }
                "temporary" => {
                    sets.temporary.insert(owner.clone());
                }
                _ => return Err(ExclusionError::Malformed { line: line_no }),
            }
        }
        Ok(sets)
    }

    pub fn is_permanent(&self, owner_id: &str) -> bool {
        self.state.read().sets.permanent.contains(owner_id)
    }

    pub fn is_temporary(&self, owner_id: &str) -> bool {
        self.state.read().sets.temporary.contains(owner_id)
    }

    pub fn is_excluded(&self, owner_id: &str) -> bool {
        let st = self.state.read();
        st.sets.permanent.contains(owner_id) || st.sets.temporary.contains(owner_id)
    }
}
