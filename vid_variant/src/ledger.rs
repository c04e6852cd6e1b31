//! Cooldown ledger: cross-run memory of when each transformation last ran
//!
//! - Readers take cheap [`LedgerSnapshot`]s (an `Arc` of the current state)
//! - One writer at a time commits; the commit checks the version the plan was
//!   selected against and re-validates cooldowns if another run got in first
//! - Each commit is flushed to disk (temp file + rename) before it becomes
//!   visible, so a crash never leaves a half-written ledger
//! - Rejected or failed runs never touch the ledger

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, TransformationDescriptor};
use crate::errors::LedgerError;
use crate::selector::SelectionPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CooldownUnit {
    /// Cooldown counts committed runs
    #[default]
    Runs,
    /// Cooldown counts wall-clock seconds
    Seconds,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub last_run_index: u64,
    /// Unix seconds
    pub last_timestamp: i64,
}

/// Persisted ledger contents
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerState {
    /// Index the next committed run will receive
    pub next_run_index: u64,
    /// Bumped on every commit
    pub version: u64,
    pub entries: BTreeMap<String, LedgerEntry>,
}

impl LedgerState {
    /// Is `descriptor` inside its cooldown window at (`run_index`, `timestamp`)?
    ///
    /// A transformation committed at run R stays ineligible for runs
    /// `R..R + cooldown`.
    pub fn in_cooldown(
        &self,
        descriptor: &TransformationDescriptor,
        unit: CooldownUnit,
        run_index: u64,
        timestamp: i64,
    ) -> bool {
        if descriptor.cooldown == 0 {
            return false;
        }
        let Some(entry) = self.entries.get(&descriptor.id) else {
            return false;
        };
        match unit {
            CooldownUnit::Runs => run_index < entry.last_run_index.saturating_add(descriptor.cooldown),
            CooldownUnit::Seconds => {
                let window = i64::try_from(descriptor.cooldown).unwrap_or(i64::MAX);
                timestamp < entry.last_timestamp.saturating_add(window)
            }
        }
    }

    /// Canonical on-disk form (entries are key-ordered).
    pub fn to_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Read-only view of the ledger at one point in time
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    state: Arc<LedgerState>,
    unit: CooldownUnit,
    timestamp: i64,
}

impl LedgerSnapshot {
    pub fn new(state: Arc<LedgerState>, unit: CooldownUnit, timestamp: i64) -> Self {
        Self {
            state,
            unit,
            timestamp,
        }
    }

    /// Run index a plan selected against this snapshot would commit at,
    /// absent concurrent commits.
    pub fn run_index(&self) -> u64 {
        self.state.next_run_index
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn unit(&self) -> CooldownUnit {
        self.unit
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn is_eligible(&self, descriptor: &TransformationDescriptor) -> bool {
        !self
            .state
            .in_cooldown(descriptor, self.unit, self.run_index(), self.timestamp)
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub run_index: u64,
    pub version: u64,
}

/// Injectable ledger with explicit load / commit / rollback / save
#[derive(Debug)]
pub struct CooldownLedger {
    path: Option<PathBuf>,
    unit: CooldownUnit,
    current: RwLock<Arc<LedgerState>>,
    commit_lock: Mutex<()>,
}

impl CooldownLedger {
    /// Ledger that is never persisted.
    pub fn in_memory(unit: CooldownUnit) -> Self {
        Self::with_state(None, unit, LedgerState::default())
    }

    fn with_state(path: Option<PathBuf>, unit: CooldownUnit, state: LedgerState) -> Self {
        Self {
            path,
            unit,
            current: RwLock::new(Arc::new(state)),
            commit_lock: Mutex::new(()),
        }
    }

    /// Load from `path`; a missing file starts an empty ledger there.
    pub fn load(path: &Path, unit: CooldownUnit) -> Result<Self, LedgerError> {
        let state = if path.exists() {
            let bytes = fs::read(path).map_err(|source| LedgerError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let state: LedgerState = serde_json::from_slice(&bytes)?;
            info!(
                path = %path.display(),
                entries = state.entries.len(),
                next_run_index = state.next_run_index,
                version = state.version,
                "Cooldown ledger loaded"
            );
            state
        } else {
            debug!(path = %path.display(), "No ledger file yet, starting empty");
            LedgerState::default()
        };
        Ok(Self::with_state(Some(path.to_path_buf()), unit, state))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn unit(&self) -> CooldownUnit {
        self.unit
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.snapshot_at(chrono::Utc::now().timestamp())
    }

    pub fn snapshot_at(&self, timestamp: i64) -> LedgerSnapshot {
        let state = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        LedgerSnapshot::new(state, self.unit, timestamp)
    }

    /// Record `plan` as applied at `timestamp`.
    ///
    /// If the ledger moved since the plan's snapshot, every plan member is
    /// re-checked against the current state; any now in cooldown fails the
    /// commit with [`LedgerError::Conflict`] and nothing is written.
    pub fn commit(
        &self,
        plan: &SelectionPlan,
        catalog: &Catalog,
        timestamp: i64,
    ) -> Result<CommitReceipt, LedgerError> {
        let _writer = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if current.version != plan.ledger_version {
            let ids: Vec<String> = plan
                .transformations
                .iter()
                .filter(|id| {
                    catalog.get(id).is_some_and(|d| {
                        current.in_cooldown(d, self.unit, current.next_run_index, timestamp)
                    })
                })
                .cloned()
                .collect();
            if !ids.is_empty() {
                warn!(
                    seen_version = plan.ledger_version,
                    current_version = current.version,
                    conflicting = ?ids,
                    "Ledger commit conflict"
                );
                return Err(LedgerError::Conflict {
                    ids,
                    seen_version: plan.ledger_version,
                    current_version: current.version,
                });
            }
            debug!(
                seen_version = plan.ledger_version,
                current_version = current.version,
                "Ledger moved since selection, plan still eligible"
            );
        }

        let mut next = (*current).clone();
        let run_index = next.next_run_index;
        for id in &plan.transformations {
            next.entries.insert(
                id.clone(),
                LedgerEntry {
                    last_run_index: run_index,
                    last_timestamp: timestamp,
                },
            );
        }
        next.next_run_index += 1;
        next.version += 1;

        if let Some(path) = &self.path {
            persist(path, &next)?;
        }

        let receipt = CommitReceipt {
            run_index,
            version: next.version,
        };
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);

        info!(
            run_index,
            version = receipt.version,
            transformations = ?plan.transformations,
            "Ledger committed"
        );
        Ok(receipt)
    }

    /// Discard a plan. The ledger is only written on commit, so this only logs.
    pub fn rollback(&self, plan: &SelectionPlan) {
        debug!(
            seed = plan.seed,
            ledger_version = plan.ledger_version,
            "Ledger rollback, state untouched"
        );
    }

    /// Flush the current state to the backing file, if any.
    pub fn save(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _writer = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        persist(path, &state)
    }
}

/// Write `state` beside `path` and rename it into place.
fn persist(path: &Path, state: &LedgerState) -> Result<(), LedgerError> {
    let io_err = |source: std::io::Error| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let bytes = state.to_bytes()?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    {
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Category;
    use crate::params::{derive, ValidatedBounds};
    use tempfile::TempDir;

    fn catalog() -> Catalog {
        Catalog::new(vec![
            TransformationDescriptor::new("a", Category::Color, 1.0).cooldown(2),
            TransformationDescriptor::new("b", Category::Audio, 1.0).cooldown(0),
            TransformationDescriptor::new("c", Category::Motion, 1.0).cooldown(1),
        ])
        .unwrap()
    }

    fn plan(ids: &[&str], snapshot: &LedgerSnapshot) -> SelectionPlan {
        SelectionPlan {
            seed: 1,
            run_index: snapshot.run_index(),
            ledger_version: snapshot.version(),
            transformations: ids.iter().map(|s| s.to_string()).collect(),
            missing_categories: vec![],
            draws: 0,
            params: derive(1, &ValidatedBounds::default()),
        }
    }

    // ====================================================================
    // Cooldown window
    // ====================================================================

    #[test]
    fn test_cooldown_window_in_runs() {
        let catalog = catalog();
        let ledger = CooldownLedger::in_memory(CooldownUnit::Runs);
        let snap = ledger.snapshot_at(100);
        let receipt = ledger.commit(&plan(&["a", "b", "c"], &snap), &catalog, 100).unwrap();
        assert_eq!(receipt.run_index, 0);

        // run 1: a (cooldown 2) blocked, c (cooldown 1) free again, b never blocked
        let snap = ledger.snapshot_at(100);
        assert_eq!(snap.run_index(), 1);
        assert!(!snap.is_eligible(catalog.get("a").unwrap()));
        assert!(snap.is_eligible(catalog.get("b").unwrap()));
        assert!(snap.is_eligible(catalog.get("c").unwrap()));

        ledger.commit(&plan(&["b"], &snap), &catalog, 100).unwrap();
        let snap = ledger.snapshot_at(100);
        assert_eq!(snap.run_index(), 2);
        assert!(snap.is_eligible(catalog.get("a").unwrap()));
    }

    #[test]
    fn test_cooldown_window_in_seconds() {
        let catalog = catalog();
        let ledger = CooldownLedger::in_memory(CooldownUnit::Seconds);
        let snap = ledger.snapshot_at(1_000);
        ledger.commit(&plan(&["a"], &snap), &catalog, 1_000).unwrap();

        let a = catalog.get("a").unwrap();
        assert!(!ledger.snapshot_at(1_001).is_eligible(a));
        assert!(ledger.snapshot_at(1_002).is_eligible(a));
    }

    // ====================================================================
    // Commit / conflict / rollback
    // ====================================================================

    #[test]
    fn test_conflicting_commit_is_refused() {
        let catalog = catalog();
        let ledger = CooldownLedger::in_memory(CooldownUnit::Runs);
        let snap = ledger.snapshot_at(0);
        let first = plan(&["a", "b"], &snap);
        let second = plan(&["a", "c"], &snap);

        ledger.commit(&first, &catalog, 0).unwrap();
        let err = ledger.commit(&second, &catalog, 0).unwrap_err();
        match err {
            LedgerError::Conflict {
                ids,
                seen_version,
                current_version,
            } => {
                assert_eq!(ids, vec!["a".to_string()]);
                assert_eq!(seen_version, 0);
                assert_eq!(current_version, 1);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(ledger.snapshot().version(), 1);
    }

    #[test]
    fn test_stale_but_eligible_commit_succeeds() {
        let catalog = catalog();
        let ledger = CooldownLedger::in_memory(CooldownUnit::Runs);
        let snap = ledger.snapshot_at(0);
        ledger.commit(&plan(&["a"], &snap), &catalog, 0).unwrap();
        let receipt = ledger.commit(&plan(&["b", "c"], &snap), &catalog, 0).unwrap();
        assert_eq!(receipt.run_index, 1);
        assert_eq!(receipt.version, 2);
    }

    #[test]
    fn test_rollback_leaves_file_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        let catalog = catalog();

        let ledger = CooldownLedger::load(&path, CooldownUnit::Runs).unwrap();
        let snap = ledger.snapshot_at(5);
        ledger.commit(&plan(&["a"], &snap), &catalog, 5).unwrap();
        let before = fs::read(&path).unwrap();

        let snap = ledger.snapshot_at(6);
        ledger.rollback(&plan(&["b", "c"], &snap));

        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(ledger.snapshot().version(), 1);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("ledger.json");
        let catalog = catalog();

        {
            let ledger = CooldownLedger::load(&path, CooldownUnit::Runs).unwrap();
            assert_eq!(ledger.snapshot().version(), 0);
            let snap = ledger.snapshot_at(42);
            ledger.commit(&plan(&["a", "c"], &snap), &catalog, 42).unwrap();
        }

        let reloaded = CooldownLedger::load(&path, CooldownUnit::Runs).unwrap();
        let snap = reloaded.snapshot();
        assert_eq!(snap.version(), 1);
        assert_eq!(snap.run_index(), 1);
        assert_eq!(
            snap.state().entries.get("a"),
            Some(&LedgerEntry {
                last_run_index: 0,
                last_timestamp: 42
            })
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_ledger_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            CooldownLedger::load(&path, CooldownUnit::Runs),
            Err(LedgerError::Serde(_))
        ));
    }

    #[test]
    fn test_concurrent_commits_get_distinct_run_indexes() {
        let catalog = Arc::new(catalog());
        let ledger = Arc::new(CooldownLedger::in_memory(CooldownUnit::Runs));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let catalog = Arc::clone(&catalog);
                std::thread::spawn(move || {
                    let snap = ledger.snapshot_at(0);
                    ledger.commit(&plan(&["b"], &snap), &catalog, 0).unwrap().run_index
                })
            })
            .collect();

        let mut indexes: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        indexes.sort();
        assert_eq!(indexes, (0..8).collect::<Vec<_>>());
        assert_eq!(ledger.snapshot().version(), 8);
    }
}
