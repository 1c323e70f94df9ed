use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use helm_core::StateSnapshot;
use thiserror::Error;

/// Result alias for persistence operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is not a valid snapshot: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Blocking storage for aggregator snapshots. Call from `spawn_blocking`.
pub trait StateRepository: Send + Sync + 'static {
    type Snapshot;

    /// Load the last saved snapshot, or an empty one when nothing was saved yet.
    fn load(&self) -> StateResult<Self::Snapshot>;

    fn save(&self, snapshot: &Self::Snapshot) -> StateResult<()>;
}

/// Pretty-printed JSON file, replaced atomically on every save.
#[derive(Clone, Debug)]
pub struct JsonStateRepository {
    path: PathBuf,
}

impl JsonStateRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StateRepository for JsonStateRepository {
    type Snapshot = StateSnapshot;

    fn load(&self) -> StateResult<StateSnapshot> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateSnapshot::default())
            }
            Err(err) => return Err(self.io_err(err)),
        };
        serde_json::from_str(&text).map_err(|source| StateError::Serialization {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, snapshot: &StateSnapshot) -> StateResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.io_err(err))?;
        }
        let body =
            serde_json::to_vec_pretty(snapshot).map_err(|source| StateError::Serialization {
                path: self.path.clone(),
                source,
            })?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        {
            let mut file = fs::File::create(&tmp_path).map_err(|err| self.io_err(err))?;
            file.write_all(&body).map_err(|err| self.io_err(err))?;
            file.sync_all().map_err(|err| self.io_err(err))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|err| self.io_err(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use helm_core::{StrategyInstance, StrategyStats, StrategyStatus};
    use rust_decimal::Decimal;

    #[test]
    fn missing_file_loads_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStateRepository::new(dir.path().join("absent.json"));
        assert_eq!(repo.load().unwrap(), StateSnapshot::default());
    }

    #[test]
    fn save_then_load_preserves_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStateRepository::new(dir.path().join("nested/state.json"));
        let now = Utc::now();
        let snapshot = StateSnapshot {
            strategies: vec![StrategyInstance {
                id: "s1".into(),
                name: "maker".into(),
                kind: "market_maker".into(),
                exchange: "paper".into(),
                pair: "ETH-USDT".into(),
                status: StrategyStatus::Stopped,
                config: serde_json::Map::new(),
                stats: StrategyStats {
                    total_orders: 4,
                    total_trades: 2,
                    realized_pnl: Decimal::new(125, 2),
                    unrealized_pnl: Decimal::ZERO,
                },
                created_at: now,
                updated_at: now,
                last_error: None,
            }],
            total_trades: 2,
            last_seq: 42,
            ..StateSnapshot::default()
        };
        repo.save(&snapshot).unwrap();
        assert_eq!(repo.load().unwrap(), snapshot);
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ nope").unwrap();
        let err = JsonStateRepository::new(&path).load().unwrap_err();
        assert!(matches!(err, StateError::Serialization { .. }));
    }
}
