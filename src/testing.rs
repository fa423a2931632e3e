//! In-memory collaborators with failure scripting and call counters.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::state_machine::ItemId;
use crate::storage::{ArtifactSlot, Location, Scratch, Storage};
use crate::transform::Transformer;

#[derive(Default)]
struct StorageInner {
    objects: HashMap<Location, (Vec<u8>, Option<String>)>,
    read_failures: HashMap<Location, VecDeque<CollaboratorError>>,
    write_failures: HashMap<Location, VecDeque<CollaboratorError>>,
    reads: HashMap<Location, usize>,
    writes: HashMap<Location, usize>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<StorageInner>,
}

impl MemoryStorage {
    pub fn insert(&self, location: &Location, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.objects.insert(location.clone(), (bytes, None));
    }

    pub fn get(&self, location: &Location) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.objects.get(location).map(|(b, _)| b.clone())
    }

    pub fn content_type(&self, location: &Location) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.objects.get(location).and_then(|(_, ct)| ct.clone())
    }

    /// Fail the next `times` writes to `location` with `err`.
    pub fn fail_writes(&self, location: &Location, times: usize, err: CollaboratorError) {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner.write_failures.entry(location.clone()).or_default();
        queue.extend(std::iter::repeat_n(err, times));
    }

    /// Fail the next `times` reads of `location` with `err`.
    pub fn fail_reads(&self, location: &Location, times: usize, err: CollaboratorError) {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner.read_failures.entry(location.clone()).or_default();
        queue.extend(std::iter::repeat_n(err, times));
    }

    pub fn reads(&self, location: &Location) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.reads.get(location).copied().unwrap_or(0)
    }

    pub fn writes(&self, location: &Location) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.writes.get(location).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, location: &Location) -> Result<Vec<u8>, CollaboratorError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.reads.entry(location.clone()).or_default() += 1;
        if let Some(err) = inner
            .read_failures
            .get_mut(location)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        inner
            .objects
            .get(location)
            .map(|(b, _)| b.clone())
            .ok_or_else(|| CollaboratorError::not_found(format!("{location} does not exist")))
    }

    async fn write(
        &self,
        location: &Location,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), CollaboratorError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.writes.entry(location.clone()).or_default() += 1;
        if let Some(err) = inner
            .write_failures
            .get_mut(location)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        inner
            .objects
            .insert(location.clone(), (bytes, Some(content_type.to_string())));
        Ok(())
    }
}

/// Prefixes its input with `enhanced:`; failures are scripted per input.
#[derive(Default)]
pub struct ScriptedTransformer {
    latency: Duration,
    failures: Mutex<HashMap<Vec<u8>, (usize, CollaboratorError)>>,
    calls: AtomicUsize,
    directives: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransformer {
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the first `times` calls whose input equals `input`.
    pub fn fail_times(self, input: &[u8], times: usize, err: CollaboratorError) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(input.to_vec(), (times, err));
        self
    }

    pub fn fail_always(self, input: &[u8], err: CollaboratorError) -> Self {
        self.fail_times(input, usize::MAX, err)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Directives received, in call order.
    pub fn directives(&self) -> Vec<String> {
        self.directives.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transformer for ScriptedTransformer {
    async fn transform(
        &self,
        input: Vec<u8>,
        directive: &str,
    ) -> Result<Vec<u8>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.directives.lock().unwrap().push(directive.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&input) {
                Some((remaining, err)) if *remaining > 0 => {
                    *remaining = remaining.saturating_sub(1);
                    Some(err.clone())
                }
                _ => None,
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match scripted {
            Some(err) => Err(err),
            None => {
                let mut out = b"enhanced:".to_vec();
                out.extend_from_slice(&input);
                Ok(out)
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryScratch {
    artifacts: Mutex<HashMap<PathBuf, Vec<u8>>>,
    releases: Mutex<HashMap<ItemId, usize>>,
    release_error: Option<CollaboratorError>,
}

impl MemoryScratch {
    pub fn failing_release(err: CollaboratorError) -> Self {
        Self {
            release_error: Some(err),
            ..Self::default()
        }
    }

    pub fn releases(&self, item: &ItemId) -> usize {
        self.releases.lock().unwrap().get(item).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.lock().unwrap().is_empty()
    }

    /// Drop `artifact` without counting a release, as a wiped temp dir would.
    pub fn lose(&self, artifact: &Path) {
        self.artifacts.lock().unwrap().remove(artifact);
    }
}

#[async_trait]
impl Scratch for MemoryScratch {
    async fn park(
        &self,
        item: &ItemId,
        slot: ArtifactSlot,
        bytes: Vec<u8>,
    ) -> Result<PathBuf, CollaboratorError> {
        let path = PathBuf::from(format!("mem/{item}.{slot:?}"));
        self.artifacts.lock().unwrap().insert(path.clone(), bytes);
        Ok(path)
    }

    async fn load(&self, artifact: &Path) -> Result<Vec<u8>, CollaboratorError> {
        self.artifacts
            .lock()
            .unwrap()
            .get(artifact)
            .cloned()
            .ok_or_else(|| {
                CollaboratorError::not_found(format!("{} is missing", artifact.display()))
            })
    }

    async fn contains(&self, artifact: &Path) -> bool {
        self.artifacts.lock().unwrap().contains_key(artifact)
    }

    async fn release(&self, item: &ItemId) -> Result<(), CollaboratorError> {
        *self.releases.lock().unwrap().entry(*item).or_default() += 1;
        let prefix = format!("mem/{item}.");
        self.artifacts
            .lock()
            .unwrap()
            .retain(|path, _| !path.to_string_lossy().starts_with(&prefix));
        match &self.release_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
