//! Trial history persistence: an in-process store for local searches and a
//! journal on a shared directory that several search processes can append to.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;
use tw_types::{
    Hyperparameters, ObjectiveDirection, PreconditionError, StoreError, TrialNumber, TrialRecord,
    TrialResolution, TwError, TwResult,
};

/// Backing store for one or more named studies.
pub trait StudyStorage: Send + Sync {
    /// Create the study; with `load_if_exists`, an existing study is reused
    /// and its stored direction returned.
    fn create_study(
        &self,
        name: &str,
        direction: ObjectiveDirection,
        load_if_exists: bool,
    ) -> TwResult<ObjectiveDirection>;

    /// Open an existing study.
    fn load_study(&self, name: &str) -> TwResult<ObjectiveDirection>;

    /// Allocate the next trial number and register the trial as running.
    fn create_trial(&self, study: &str) -> TwResult<TrialRecord>;

    fn set_params(&self, study: &str, number: TrialNumber, params: &Hyperparameters) -> TwResult<()>;

    /// Returns false when the step had already been reported (first report wins).
    fn report(&self, study: &str, number: TrialNumber, step: u64, value: f64) -> TwResult<bool>;

    fn finish_trial(&self, study: &str, number: TrialNumber, resolution: TrialResolution) -> TwResult<()>;

    fn trials(&self, study: &str) -> TwResult<Vec<TrialRecord>>;

    fn trial(&self, study: &str, number: TrialNumber) -> TwResult<TrialRecord> {
        self.trials(study)?
            .into_iter()
            .find(|t| t.number == number)
            .ok_or_else(|| {
                PreconditionError::TrialNotFound {
                    study: study.to_string(),
                    number,
                }
                .into()
            })
    }
}

// ---------------------------------------------------------------------------
// Shared mutation logic
// ---------------------------------------------------------------------------

/// In-memory image of one study, rebuilt from the journal or held directly.
#[derive(Debug, Clone)]
struct StudyState {
    direction: ObjectiveDirection,
    trials: Vec<TrialRecord>,
}

impl StudyState {
    fn new(direction: ObjectiveDirection) -> Self {
        Self {
            direction,
            trials: Vec::new(),
        }
    }

    fn next_number(&self) -> TrialNumber {
        self.trials.len() as TrialNumber
    }

    fn trial_mut(&mut self, study: &str, number: TrialNumber) -> TwResult<&mut TrialRecord> {
        self.trials
            .iter_mut()
            .find(|t| t.number == number)
            .ok_or_else(|| {
                PreconditionError::TrialNotFound {
                    study: study.to_string(),
                    number,
                }
                .into()
            })
    }

    fn running_trial_mut(&mut self, study: &str, number: TrialNumber) -> TwResult<&mut TrialRecord> {
        let trial = self.trial_mut(study, number)?;
        if trial.status.is_finished() {
            return Err(StoreError::TrialFinished { number }.into());
        }
        Ok(trial)
    }
}

// ---------------------------------------------------------------------------
// In-memory storage
// ---------------------------------------------------------------------------

/// Process-local study storage.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    studies: DashMap<String, RwLock<StudyState>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_study<T>(&self, name: &str, f: impl FnOnce(&mut StudyState) -> TwResult<T>) -> TwResult<T> {
        let entry = self.studies.get(name).ok_or_else(|| StoreError::StudyNotFound {
            name: name.to_string(),
        })?;
        let mut state = entry.write();
        f(&mut state)
    }
}

impl StudyStorage for InMemoryStorage {
    fn create_study(
        &self,
        name: &str,
        direction: ObjectiveDirection,
        load_if_exists: bool,
    ) -> TwResult<ObjectiveDirection> {
        if let Some(existing) = self.studies.get(name) {
            if load_if_exists {
                return Ok(existing.read().direction);
            }
            return Err(StoreError::StudyExists {
                name: name.to_string(),
            }
            .into());
        }
        self.studies
            .insert(name.to_string(), RwLock::new(StudyState::new(direction)));
        Ok(direction)
    }

    fn load_study(&self, name: &str) -> TwResult<ObjectiveDirection> {
        self.with_study(name, |state| Ok(state.direction))
    }

    fn create_trial(&self, study: &str) -> TwResult<TrialRecord> {
        self.with_study(study, |state| {
            let trial = TrialRecord::new(state.next_number());
            state.trials.push(trial.clone());
            Ok(trial)
        })
    }

    fn set_params(&self, study: &str, number: TrialNumber, params: &Hyperparameters) -> TwResult<()> {
        self.with_study(study, |state| {
            state.running_trial_mut(study, number)?.params = params.clone();
            Ok(())
        })
    }

    fn report(&self, study: &str, number: TrialNumber, step: u64, value: f64) -> TwResult<bool> {
        self.with_study(study, |state| {
            Ok(state.running_trial_mut(study, number)?.report(step, value))
        })
    }

    fn finish_trial(&self, study: &str, number: TrialNumber, resolution: TrialResolution) -> TwResult<()> {
        self.with_study(study, |state| {
            state.running_trial_mut(study, number)?.resolve(resolution);
            Ok(())
        })
    }

    fn trials(&self, study: &str) -> TwResult<Vec<TrialRecord>> {
        self.with_study(study, |state| Ok(state.trials.clone()))
    }
}

// ---------------------------------------------------------------------------
// Journal storage
// ---------------------------------------------------------------------------

/// One appended line of a study journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    CreateStudy {
        direction: ObjectiveDirection,
        created_at: DateTime<Utc>,
    },
    CreateTrial {
        number: TrialNumber,
        id: Uuid,
        created_at: DateTime<Utc>,
    },
    SetParams {
        number: TrialNumber,
        params: Hyperparameters,
    },
    Report {
        number: TrialNumber,
        step: u64,
        value: f64,
    },
    Finish {
        number: TrialNumber,
        resolution: TrialResolution,
        finished_at: DateTime<Utc>,
    },
}

/// Append-only JSON-lines journal per study in a shared directory.
///
/// Every mutation takes an exclusive lock file, replays the journal to
/// validate the operation against current state, appends one line, and
/// releases the lock. Readers replay without locking; a partially written
/// last line is skipped.
#[derive(Debug, Clone)]
pub struct JournalFileStorage {
    root: PathBuf,
    lock_timeout: Duration,
    /// A lock file older than this is treated as left behind by a dead
    /// process and removed.
    stale_lock_after: Duration,
}

/// Replayed journal plus the byte offset of a torn final line, if any.
struct Replayed {
    state: Option<StudyState>,
    torn_at: Option<u64>,
}

impl JournalFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> TwResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(unavailable)?;
        Ok(Self {
            root,
            lock_timeout: Duration::from_secs(30),
            stale_lock_after: Duration::from_secs(120),
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    fn journal_path(&self, study: &str) -> PathBuf {
        self.root.join(format!("{study}.journal"))
    }

    fn lock_path(&self, study: &str) -> PathBuf {
        self.root.join(format!("{study}.lock"))
    }

    fn lock(&self, study: &str) -> TwResult<JournalLock> {
        let path = self.lock_path(study);
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Owner line for whoever finds the lock left behind.
                    if let Err(e) = writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339()) {
                        debug!(path = %path.display(), error = %e, "could not record lock owner");
                    }
                    return Ok(JournalLock { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.break_stale_lock(&path) {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::Unavailable {
                            message: format!("timed out waiting for {}", path.display()),
                        }
                        .into());
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(unavailable(e)),
            }
        }
    }

    /// Remove the lock at `path` if it has not been touched for
    /// `stale_lock_after`. Returns true when the lock is gone.
    fn break_stale_lock(&self, path: &Path) -> bool {
        let age = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified.elapsed().unwrap_or_default(),
            Err(e) if e.kind() == ErrorKind::NotFound => return true,
            Err(_) => return false,
        };
        if age < self.stale_lock_after {
            return false;
        }
        let owner = std::fs::read_to_string(path).unwrap_or_default();
        warn!(
            path = %path.display(),
            age_secs = age.as_secs_f64(),
            owner = owner.trim(),
            "breaking stale journal lock"
        );
        match std::fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove stale journal lock");
                false
            }
        }
    }

    /// Replay the journal. `None` when the study does not exist.
    fn replay(&self, study: &str) -> TwResult<Option<StudyState>> {
        Ok(self.replay_journal(study)?.state)
    }

    fn replay_journal(&self, study: &str) -> TwResult<Replayed> {
        let file = match File::open(self.journal_path(study)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Replayed {
                    state: None,
                    torn_at: None,
                })
            }
            Err(e) => return Err(unavailable(e)),
        };

        let mut reader = BufReader::new(file);
        let mut state: Option<StudyState> = None;
        let mut line = Vec::new();
        let mut offset = 0u64;
        let mut number = 0usize;
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).map_err(unavailable)?;
            if read == 0 {
                break;
            }
            number += 1;
            let start = offset;
            offset += read as u64;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let op: JournalOp = match serde_json::from_slice(&line) {
                Ok(op) => op,
                Err(e) if line.last() != Some(&b'\n') => {
                    warn!(study, line = number, error = %e, "skipping torn journal tail");
                    return Ok(Replayed {
                        state,
                        torn_at: Some(start),
                    });
                }
                Err(e) => {
                    return Err(StoreError::Corrupt {
                        line: number,
                        message: e.to_string(),
                    }
                    .into())
                }
            };
            apply(&mut state, study, op).map_err(|e| StoreError::Corrupt {
                line: number,
                message: e.to_string(),
            })?;
        }
        Ok(Replayed { state, torn_at: None })
    }

    /// Append `op` as one line. A torn tail found by the replay that preceded
    /// this append, under the same lock, is cut off first.
    fn append(&self, study: &str, op: &JournalOp, torn_at: Option<u64>) -> TwResult<()> {
        let path = self.journal_path(study);
        if let Some(len) = torn_at {
            let file = OpenOptions::new().write(true).open(&path).map_err(unavailable)?;
            file.set_len(len).map_err(unavailable)?;
            warn!(study, offset = len, "truncated torn journal tail");
        }
        let mut line = serde_json::to_string(op)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(unavailable)?;
        file.write_all(line.as_bytes()).map_err(unavailable)?;
        file.sync_data().map_err(unavailable)?;
        Ok(())
    }

    /// Replay under the lock, failing when the study does not exist.
    fn replay_existing(&self, study: &str) -> TwResult<(StudyState, Option<u64>)> {
        let Replayed { state, torn_at } = self.replay_journal(study)?;
        let state = state.ok_or_else(|| StoreError::StudyNotFound {
            name: study.to_string(),
        })?;
        Ok((state, torn_at))
    }

    /// Validate `op` against the current state under the lock, then append it.
    fn mutate<T>(&self, study: &str, f: impl FnOnce(&mut StudyState) -> TwResult<(JournalOp, T)>) -> TwResult<T> {
        let _lock = self.lock(study)?;
        let (mut state, torn_at) = self.replay_existing(study)?;
        let (op, out) = f(&mut state)?;
        self.append(study, &op, torn_at)?;
        Ok(out)
    }
}

impl StudyStorage for JournalFileStorage {
    fn create_study(
        &self,
        name: &str,
        direction: ObjectiveDirection,
        load_if_exists: bool,
    ) -> TwResult<ObjectiveDirection> {
        let _lock = self.lock(name)?;
        let Replayed { state, torn_at } = self.replay_journal(name)?;
        if let Some(existing) = state {
            if load_if_exists {
                return Ok(existing.direction);
            }
            return Err(StoreError::StudyExists {
                name: name.to_string(),
            }
            .into());
        }
        self.append(
            name,
            &JournalOp::CreateStudy {
                direction,
                created_at: Utc::now(),
            },
            torn_at,
        )?;
        debug!(study = name, root = %self.root.display(), "created journal study");
        Ok(direction)
    }

    fn load_study(&self, name: &str) -> TwResult<ObjectiveDirection> {
        self.replay(name)?
            .map(|state| state.direction)
            .ok_or_else(|| {
                StoreError::StudyNotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    fn create_trial(&self, study: &str) -> TwResult<TrialRecord> {
        self.mutate(study, |state| {
            let trial = TrialRecord::new(state.next_number());
            let op = JournalOp::CreateTrial {
                number: trial.number,
                id: trial.id,
                created_at: trial.created_at,
            };
            Ok((op, trial))
        })
    }

    fn set_params(&self, study: &str, number: TrialNumber, params: &Hyperparameters) -> TwResult<()> {
        self.mutate(study, |state| {
            state.running_trial_mut(study, number)?;
            let op = JournalOp::SetParams {
                number,
                params: params.clone(),
            };
            Ok((op, ()))
        })
    }

    fn report(&self, study: &str, number: TrialNumber, step: u64, value: f64) -> TwResult<bool> {
        let _lock = self.lock(study)?;
        let (mut state, torn_at) = self.replay_existing(study)?;
        if state
            .running_trial_mut(study, number)?
            .intermediate_values
            .contains_key(&step)
        {
            return Ok(false);
        }
        self.append(study, &JournalOp::Report { number, step, value }, torn_at)?;
        Ok(true)
    }

    fn finish_trial(&self, study: &str, number: TrialNumber, resolution: TrialResolution) -> TwResult<()> {
        self.mutate(study, |state| {
            state.running_trial_mut(study, number)?;
            let op = JournalOp::Finish {
                number,
                resolution,
                finished_at: Utc::now(),
            };
            Ok((op, ()))
        })
    }

    fn trials(&self, study: &str) -> TwResult<Vec<TrialRecord>> {
        self.replay(study)?
            .map(|state| state.trials)
            .ok_or_else(|| {
                StoreError::StudyNotFound {
                    name: study.to_string(),
                }
                .into()
            })
    }
}

/// Apply one journal operation to the replayed state.
fn apply(state: &mut Option<StudyState>, study: &str, op: JournalOp) -> TwResult<()> {
    if let JournalOp::CreateStudy { direction, .. } = op {
        if state.is_some() {
            return Err(StoreError::StudyExists {
                name: study.to_string(),
            }
            .into());
        }
        *state = Some(StudyState::new(direction));
        return Ok(());
    }

    let state = state.as_mut().ok_or_else(|| StoreError::StudyNotFound {
        name: study.to_string(),
    })?;
    match op {
        JournalOp::CreateStudy { .. } => {}
        JournalOp::CreateTrial {
            number,
            id,
            created_at,
        } => {
            if number != state.next_number() {
                return Err(tw_types::internal_error!(
                    "trial number {number} out of sequence, expected {}",
                    state.next_number()
                ));
            }
            let mut trial = TrialRecord::new(number);
            trial.id = id;
            trial.created_at = created_at;
            state.trials.push(trial);
        }
        JournalOp::SetParams { number, params } => {
            state.trial_mut(study, number)?.params = params;
        }
        JournalOp::Report {
            number,
            step,
            value,
        } => {
            state.trial_mut(study, number)?.report(step, value);
        }
        JournalOp::Finish {
            number,
            resolution,
            finished_at,
        } => {
            let trial = state.trial_mut(study, number)?;
            trial.resolve(resolution);
            trial.finished_at = Some(finished_at);
        }
    }
    Ok(())
}

fn unavailable(e: std::io::Error) -> TwError {
    StoreError::Unavailable {
        message: e.to_string(),
    }
    .into()
}

/// Lock file guard; removes the file on drop.
struct JournalLock {
    path: PathBuf,
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release journal lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::{ParameterValue, TrialStatus};

    fn exercise(storage: &dyn StudyStorage) {
        assert_eq!(
            storage
                .create_study("search", ObjectiveDirection::Maximize, false)
                .unwrap(),
            ObjectiveDirection::Maximize
        );

        let t0 = storage.create_trial("search").unwrap();
        let t1 = storage.create_trial("search").unwrap();
        assert_eq!((t0.number, t1.number), (0, 1));

        let params = Hyperparameters::new().with("lr", ParameterValue::Float(1e-4));
        storage.set_params("search", 0, &params).unwrap();
        assert!(storage.report("search", 0, 100, 0.25).unwrap());
        assert!(!storage.report("search", 0, 100, 0.75).unwrap());
        storage
            .finish_trial("search", 0, TrialResolution::Completed { value: 0.25 })
            .unwrap();
        storage
            .finish_trial("search", 1, TrialResolution::Failed { error: "oom".into() })
            .unwrap();

        let trials = storage.trials("search").unwrap();
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[0].status, TrialStatus::Completed);
        assert_eq!(trials[0].params, params);
        assert_eq!(trials[0].intermediate_values.get(&100), Some(&0.25));
        assert_eq!(trials[1].status, TrialStatus::Failed);
        assert_eq!(trials[1].error.as_deref(), Some("oom"));

        // Finished trials are immutable.
        assert!(storage.report("search", 0, 200, 0.5).is_err());
        assert!(storage
            .finish_trial("search", 1, TrialResolution::Pruned)
            .is_err());

        assert!(storage.trial("search", 7).is_err());
    }

    #[test]
    fn in_memory_storage_lifecycle() {
        exercise(&InMemoryStorage::new());
    }

    #[test]
    fn journal_storage_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&JournalFileStorage::new(dir.path()).unwrap());
    }

    #[test]
    fn create_and_load_semantics() {
        let storage = InMemoryStorage::new();
        assert!(storage.load_study("missing").is_err());
        storage
            .create_study("s", ObjectiveDirection::Minimize, false)
            .unwrap();
        assert!(storage
            .create_study("s", ObjectiveDirection::Maximize, false)
            .is_err());
        assert_eq!(
            storage
                .create_study("s", ObjectiveDirection::Maximize, true)
                .unwrap(),
            ObjectiveDirection::Minimize
        );
    }

    #[test]
    fn journal_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let a = JournalFileStorage::new(dir.path()).unwrap();
        let b = JournalFileStorage::new(dir.path()).unwrap();

        a.create_study("shared", ObjectiveDirection::Maximize, true)
            .unwrap();
        assert_eq!(b.load_study("shared").unwrap(), ObjectiveDirection::Maximize);

        assert_eq!(a.create_trial("shared").unwrap().number, 0);
        assert_eq!(b.create_trial("shared").unwrap().number, 1);
        assert_eq!(a.create_trial("shared").unwrap().number, 2);
        assert_eq!(b.trials("shared").unwrap().len(), 3);
    }

    #[test]
    fn concurrent_trial_creation_allocates_unique_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JournalFileStorage::new(dir.path()).unwrap();
        storage
            .create_study("race", ObjectiveDirection::Maximize, false)
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let storage = storage.clone();
                std::thread::spawn(move || {
                    (0..5)
                        .map(|_| storage.create_trial("race").unwrap().number)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut numbers: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn held_lock_surfaces_as_transient_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JournalFileStorage::new(dir.path())
            .unwrap()
            .with_lock_timeout(Duration::from_millis(50));
        storage
            .create_study("busy", ObjectiveDirection::Maximize, false)
            .unwrap();
        std::fs::write(dir.path().join("busy.lock"), b"").unwrap();

        let err = storage.create_trial("busy").unwrap_err();
        assert!(err.is_transient(), "expected transient error, got {err}");
    }

    #[test]
    fn torn_tail_is_skipped_but_corruption_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JournalFileStorage::new(dir.path()).unwrap();
        storage
            .create_study("j", ObjectiveDirection::Maximize, false)
            .unwrap();
        storage.create_trial("j").unwrap();

        let path = dir.path().join("j.journal");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"report\",\"num").unwrap();
        assert_eq!(storage.trials("j").unwrap().len(), 1);

        file.write_all(b"\n{\"op\":\"create_trial\"}\n").unwrap();
        let err = storage.trials("j").unwrap_err();
        assert!(matches!(err, TwError::Store(StoreError::Corrupt { .. })));
    }

    #[test]
    fn torn_tail_is_cut_before_the_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JournalFileStorage::new(dir.path()).unwrap();
        storage
            .create_study("j", ObjectiveDirection::Maximize, false)
            .unwrap();
        storage.create_trial("j").unwrap();

        let path = dir.path().join("j.journal");
        let intact = std::fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"report\",\"num").unwrap();
        drop(file);

        assert_eq!(storage.create_trial("j").unwrap().number, 1);
        assert_eq!(storage.create_trial("j").unwrap().number, 2);
        let numbers: Vec<TrialNumber> = storage.trials("j").unwrap().iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("\"num{"));
        assert!(contents.len() as u64 > intact);
        for line in contents.lines() {
            serde_json::from_str::<JournalOp>(line).unwrap();
        }
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JournalFileStorage::new(dir.path())
            .unwrap()
            .with_lock_timeout(Duration::from_secs(5))
            .with_stale_lock_after(Duration::from_millis(10));
        storage
            .create_study("busy", ObjectiveDirection::Maximize, false)
            .unwrap();
        let lock = dir.path().join("busy.lock");
        std::fs::write(&lock, b"4242 2026-01-01T00:00:00Z\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(storage.create_trial("busy").unwrap().number, 0);
        assert!(!lock.exists());
    }

    #[test]
    fn lock_file_names_its_owner() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JournalFileStorage::new(dir.path()).unwrap();
        let guard = storage.lock("owned").unwrap();
        let owner = std::fs::read_to_string(dir.path().join("owned.lock")).unwrap();
        assert!(owner.starts_with(&format!("{} ", std::process::id())));
        drop(guard);
        assert!(!dir.path().join("owned.lock").exists());
    }
}
