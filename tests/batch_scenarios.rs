//! End-to-end batches over filesystem storage, a mocked transformation
//! service and a file journal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use wiremock::matchers::{body_bytes, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use enhance_flow::batch::InputDefaults;
use enhance_flow::journal::{JournalEntry, recover};
use enhance_flow::state_machine::{StateMachine, Transition};
use enhance_flow::storage::ArtifactSlot;
use enhance_flow::{
    BatchDispatcher, BatchInput, CollaboratorError, Collaborators, FileJournal, HttpTransformer,
    ItemId, ItemStatus, ItemWorkflow, Journal, LocalScratch, LocalStorage, Location, RetryPolicy,
    Scratch, State, StepExecutor, StepKind, StepPolicies, StepTimeouts, Transformer, WorkItem,
};

/// Answers every request with `<directive>:` + the request body.
struct Echo {
    delay: Duration,
}

impl Respond for Echo {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let directive = request
            .url
            .query_pairs()
            .find(|(name, _)| name == "directive")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();
        let mut body = format!("{directive}:").into_bytes();
        body.extend_from_slice(&request.body);
        ResponseTemplate::new(200)
            .set_body_bytes(body)
            .set_delay(self.delay)
    }
}

/// Counts concurrent calls into the wrapped transformer.
struct Gauged {
    inner: HttpTransformer,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Transformer for Gauged {
    async fn transform(&self, input: Vec<u8>, directive: &str) -> Result<Vec<u8>, CollaboratorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.inner.transform(input, directive).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Counts releases per item.
struct CountingScratch {
    inner: LocalScratch,
    releases: Mutex<HashMap<ItemId, usize>>,
}

impl CountingScratch {
    fn releases(&self, item: &ItemId) -> usize {
        self.releases.lock().unwrap().get(item).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Scratch for CountingScratch {
    async fn park(
        &self,
        item: &ItemId,
        slot: ArtifactSlot,
        bytes: Vec<u8>,
    ) -> Result<PathBuf, CollaboratorError> {
        self.inner.park(item, slot, bytes).await
    }

    async fn load(&self, artifact: &Path) -> Result<Vec<u8>, CollaboratorError> {
        self.inner.load(artifact).await
    }

    async fn contains(&self, artifact: &Path) -> bool {
        self.inner.contains(artifact).await
    }

    async fn release(&self, item: &ItemId) -> Result<(), CollaboratorError> {
        *self.releases.lock().unwrap().entry(*item).or_default() += 1;
        self.inner.release(item).await
    }
}

struct Env {
    _dir: tempfile::TempDir,
    root: PathBuf,
    scratch_dir: PathBuf,
    journal_dir: PathBuf,
    server: MockServer,
}

impl Env {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("storage");
        let scratch_dir = dir.path().join("scratch");
        let journal_dir = dir.path().join("journal");
        Self {
            _dir: dir,
            root,
            scratch_dir,
            journal_dir,
            server: MockServer::start().await,
        }
    }

    async fn echo(&self, delay: Duration) {
        Mock::given(method("POST"))
            .and(path("/enhance"))
            .respond_with(Echo { delay })
            .mount(&self.server)
            .await;
    }

    fn put_source(&self, location: &Location, bytes: &[u8]) {
        let path = self.root.join(&location.bucket).join(&location.key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn read_dest(&self, location: &Location) -> Option<Vec<u8>> {
        std::fs::read(self.root.join(&location.bucket).join(&location.key)).ok()
    }

    fn build(&self) -> (BatchDispatcher, Arc<Gauged>, Arc<CountingScratch>) {
        let transformer = Arc::new(Gauged {
            inner: HttpTransformer::new(format!("{}/enhance", self.server.uri()), None).unwrap(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let scratch = Arc::new(CountingScratch {
            inner: LocalScratch::new(&self.scratch_dir),
            releases: Mutex::new(HashMap::new()),
        });
        let executor = StepExecutor::new(Collaborators {
            storage: Arc::new(LocalStorage::new(&self.root)),
            transformer: transformer.clone(),
            scratch: scratch.clone(),
        });
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(5),
            jitter: false,
            ..RetryPolicy::default()
        };
        let workflow = ItemWorkflow::new(
            executor,
            StepPolicies::uniform(policy),
            StepTimeouts::default(),
            Arc::new(FileJournal::new(&self.journal_dir)),
        );
        (BatchDispatcher::new(workflow), transformer, scratch)
    }

    fn scratch_is_empty(&self) -> bool {
        match std::fs::read_dir(&self.scratch_dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }
}

fn items(count: usize) -> Vec<WorkItem> {
    items_with(count, "brighten")
}

fn items_with(count: usize, directive: &str) -> Vec<WorkItem> {
    (0..count)
        .map(|i| {
            WorkItem::new(
                Location::new("photos", format!("img-{i}.png")),
                Location::new("enhanced", format!("enhanced_img-{i}.png")),
                directive,
            )
        })
        .collect()
}

async fn journal_in_flight(env: &Env, item: &WorkItem, entries: Vec<Transition>) {
    let journal = FileJournal::new(&env.journal_dir);
    journal
        .append(&item.id, &JournalEntry::admitted(item.clone()))
        .await
        .unwrap();
    for t in entries {
        journal
            .append(&item.id, &JournalEntry::transitioned(t))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn one_fatal_transform_fails_only_its_item() {
    let env = Env::new().await;
    Mock::given(method("POST"))
        .and(path("/enhance"))
        .and(body_bytes(b"pixels-2".to_vec()))
        .respond_with(
            ResponseTemplate::new(415)
                .set_body_json(serde_json::json!({"error": {"message": "unsupported format"}})),
        )
        .with_priority(1)
        .mount(&env.server)
        .await;
    env.echo(Duration::from_millis(40)).await;

    let items = items(5);
    for (i, item) in items.iter().enumerate() {
        env.put_source(&item.source, format!("pixels-{i}").as_bytes());
    }
    let (dispatcher, transformer, scratch) = env.build();

    let batch = dispatcher.run(items.clone(), 2).await.unwrap();

    assert_eq!(batch.total, 5);
    assert_eq!(batch.succeeded, 4);
    assert_eq!(batch.failed, 1);
    assert_eq!(batch.succeeded + batch.failed, batch.total);

    let failed = &batch.items[2];
    assert_eq!(failed.status, ItemStatus::Failed);
    let failure = failed.failure.as_ref().unwrap();
    assert_eq!(failure.step, StepKind::Transform);
    assert!(failure.to_string().contains("transform"), "{failure}");
    assert_eq!(failed.step_attempts.get(&StepKind::Transform), Some(&1));
    assert!(env.read_dest(&items[2].destination).is_none());

    for (i, item) in items.iter().enumerate() {
        assert_eq!(scratch.releases(&item.id), 1, "item {i}");
        if i != 2 {
            assert_eq!(
                env.read_dest(&item.destination).unwrap(),
                format!("brighten:pixels-{i}").into_bytes()
            );
        }
    }
    assert!(transformer.peak.load(Ordering::SeqCst) <= 2);
    assert!(env.scratch_is_empty());
}

#[tokio::test]
async fn simple_list_derives_destinations() {
    let env = Env::new().await;
    env.echo(Duration::ZERO).await;
    let defaults = InputDefaults {
        source_bucket: "in".into(),
        dest_bucket: "out".into(),
        ..InputDefaults::default()
    };
    let items = BatchInput::parse(Some("a.jpg,dir/b.png"), &defaults)
        .unwrap()
        .into_work_items("sharpen");
    for item in &items {
        env.put_source(&item.source, item.source.key.as_bytes());
    }
    let (dispatcher, _, _) = env.build();

    let batch = dispatcher.run(items, 5).await.unwrap();

    assert!(batch.is_success());
    assert_eq!(
        env.read_dest(&Location::new("out", "enhanced_a.jpg")).unwrap(),
        b"sharpen:a.jpg"
    );
    assert_eq!(
        env.read_dest(&Location::new("out", "dir/enhanced_b.png")).unwrap(),
        b"sharpen:dir/b.png"
    );
}

#[tokio::test]
async fn restart_resumes_without_refetching() {
    let env = Env::new().await;
    env.echo(Duration::ZERO).await;
    let item = items(1).remove(0);

    // A previous run fetched the source and stopped before transforming.
    let scratch = LocalScratch::new(&env.scratch_dir);
    let fetched = scratch
        .park(&item.id, ArtifactSlot::Fetched, b"pixels-0".to_vec())
        .await
        .unwrap();
    let journal = FileJournal::new(&env.journal_dir);
    for entry in [
        JournalEntry::admitted(item.clone()),
        JournalEntry::transitioned(StateMachine::start()),
        JournalEntry::transitioned(Transition::Advance {
            to: State::Transforming,
            artifact: Some(fetched),
            elapsed: Duration::from_millis(12),
        }),
    ] {
        journal.append(&item.id, &entry).await.unwrap();
    }
    // The source is gone, so a second fetch would fail the item.
    let (dispatcher, _, scratch) = env.build();

    let batch = dispatcher.run(vec![item.clone()], 1).await.unwrap();

    assert!(batch.is_success(), "{:?}", batch.items[0].failure);
    assert_eq!(env.read_dest(&item.destination).unwrap(), b"brighten:pixels-0");
    assert_eq!(scratch.releases(&item.id), 1);

    let entries = journal.replay(&item.id).await.unwrap();
    let recovered = recover(&item.id, &entries).unwrap().unwrap();
    assert_eq!(recovered.state, State::Completed);
    assert!(recovered.elapsed >= Duration::from_millis(12));
}

#[tokio::test]
async fn rerun_processes_finished_items_again() {
    let env = Env::new().await;
    env.echo(Duration::ZERO).await;
    let items = items(3);
    // img-1 is missing on the first run.
    env.put_source(&items[0].source, b"pixels-0");
    env.put_source(&items[2].source, b"pixels-2");

    let (dispatcher, _, _) = env.build();
    let first = dispatcher.run(items.clone(), 2).await.unwrap();
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.items[1].failure.as_ref().unwrap().step, StepKind::Fetch);
    assert_eq!(env.server.received_requests().await.unwrap().len(), 2);

    env.put_source(&items[1].source, b"pixels-1");
    let (dispatcher, _, scratch) = env.build();
    let second = dispatcher.run(items.clone(), 2).await.unwrap();

    assert!(second.is_success(), "{:?}", second.failures().collect::<Vec<_>>());
    assert_eq!(env.server.received_requests().await.unwrap().len(), 5);
    for (i, item) in items.iter().enumerate() {
        assert_eq!(scratch.releases(&item.id), 1, "item {i}");
        assert_eq!(
            env.read_dest(&item.destination).unwrap(),
            format!("brighten:pixels-{i}").into_bytes()
        );
    }
}

#[tokio::test]
async fn one_batch_applies_one_directive() {
    let env = Env::new().await;
    env.echo(Duration::ZERO).await;
    let old = items_with(3, "brighten");
    for (i, item) in old.iter().enumerate() {
        env.put_source(&item.source, format!("pixels-{i}").as_bytes());
    }
    let (dispatcher, _, _) = env.build();
    assert!(dispatcher.run(old.clone(), 3).await.unwrap().is_success());

    // img-0 was interrupted mid-run under the old directive.
    let scratch = LocalScratch::new(&env.scratch_dir);
    let fetched = scratch
        .park(&old[0].id, ArtifactSlot::Fetched, b"pixels-0".to_vec())
        .await
        .unwrap();
    FileJournal::new(&env.journal_dir)
        .discard(&old[0].id)
        .await
        .unwrap();
    journal_in_flight(
        &env,
        &old[0],
        vec![
            StateMachine::start(),
            Transition::Advance {
                to: State::Transforming,
                artifact: Some(fetched),
                elapsed: Duration::ZERO,
            },
        ],
    )
    .await;

    let new = items_with(3, "sharpen");
    let (dispatcher, _, _) = env.build();
    let batch = dispatcher.run(new.clone(), 3).await.unwrap();

    assert!(batch.is_success());
    let journal = FileJournal::new(&env.journal_dir);
    for (i, item) in new.iter().enumerate() {
        assert_eq!(
            env.read_dest(&item.destination).unwrap(),
            format!("sharpen:pixels-{i}").into_bytes()
        );
        let entries = journal.replay(&item.id).await.unwrap();
        let recovered = recover(&item.id, &entries).unwrap().unwrap();
        assert_eq!(recovered.item.directive, "sharpen");
    }
    assert!(env.scratch_is_empty());
}

#[tokio::test]
async fn wiped_scratch_on_resume_fetches_again() {
    let env = Env::new().await;
    env.echo(Duration::ZERO).await;
    let item = items(1).remove(0);
    env.put_source(&item.source, b"pixels-0");
    // Journaled as far as Storing; the scratch files did not survive.
    journal_in_flight(
        &env,
        &item,
        vec![
            StateMachine::start(),
            Transition::Advance {
                to: State::Transforming,
                artifact: Some(env.scratch_dir.join("gone.fetched")),
                elapsed: Duration::ZERO,
            },
            Transition::Advance {
                to: State::Storing,
                artifact: Some(env.scratch_dir.join("gone.transformed")),
                elapsed: Duration::ZERO,
            },
        ],
    )
    .await;

    let (dispatcher, _, scratch) = env.build();
    let batch = dispatcher.run(vec![item.clone()], 1).await.unwrap();

    assert!(batch.is_success(), "{:?}", batch.items[0].failure);
    assert_eq!(env.read_dest(&item.destination).unwrap(), b"brighten:pixels-0");
    assert_eq!(scratch.releases(&item.id), 1);
    assert_eq!(batch.items[0].step_attempts.get(&StepKind::Fetch), Some(&1));
}
