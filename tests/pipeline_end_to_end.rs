use crossbeam_channel::unbounded;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use transcriptor::chunking::{ChunkPlanner, MergeOptions, chunk_key};
use transcriptor::config::{Config, LaneMode};
use transcriptor::engine::{MockEngineFactory, MockTranscriber};
use transcriptor::ledger::{JobSettings, JobStatus, Ledger, MemoryLedger, NewJob};
use transcriptor::pipeline::{
    CheckpointStore, JobStage, PipelineEvent, PipelineJob, PipelineOrchestrator, PipelineSettings,
};
use transcriptor::pool::{PoolSettings, WorkerPool};
use transcriptor::prepare::MockPreparer;
use transcriptor::supervisor::{ProcessSupervisor, SupervisorSettings};

struct Env {
    _dir: tempfile::TempDir,
    root: PathBuf,
    ledger: Arc<MemoryLedger>,
    supervisor: ProcessSupervisor,
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let ledger = Arc::new(MemoryLedger::new());
        let supervisor = ProcessSupervisor::new(
            ledger.clone(),
            SupervisorSettings {
                heartbeat_interval: Duration::from_millis(100),
                stale_timeout: Duration::from_secs(60),
                graceful_timeout: Duration::from_secs(1),
                kill_reap_timeout: Duration::from_secs(1),
                ring_lines: 100,
                log_dir: root.join("logs"),
            },
        );
        Self {
            _dir: dir,
            root,
            ledger,
            supervisor,
        }
    }

    fn submit(&self, name: &str) -> PipelineJob {
        let id = self
            .ledger
            .create(NewJob {
                input: PathBuf::from(format!("/recordings/{name}.mp3")),
                output: self.root.join("transcripts").join(name),
                settings: JobSettings::from_config(&Config::default()),
            })
            .unwrap();
        PipelineJob::from(&self.ledger.get(id).unwrap().unwrap())
    }

    fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.root.join("checkpoints"))
    }

    fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_parallel_preparation: 2,
            checkpoint_every: 1,
            work_dir: self.root.join("work"),
            keep_work_dir: false,
            merge: MergeOptions::default(),
            graceful_timeout: Duration::from_secs(1),
        }
    }

    fn orchestrator(
        &self,
        preparer: MockPreparer,
        factory: MockEngineFactory,
        processes: usize,
        threads: usize,
    ) -> PipelineOrchestrator {
        let pool = WorkerPool::in_process(
            PoolSettings {
                processes,
                threads_per_process: threads,
                language: "en".into(),
            },
            Arc::new(factory),
        );
        PipelineOrchestrator::new(
            self.supervisor.clone(),
            Arc::new(preparer),
            pool,
            self.checkpoints(),
            self.settings(),
        )
    }
}

fn planner() -> ChunkPlanner {
    ChunkPlanner::new(20.0, 3.0).unwrap()
}

#[test]
fn test_plan_for_63_seconds() {
    let chunks = planner().plan(63.0);
    let cores: Vec<(f64, f64)> = chunks.iter().map(|c| (c.core_start, c.core_end)).collect();
    assert_eq!(cores, vec![(0.0, 20.0), (20.0, 40.0), (40.0, 60.0), (60.0, 63.0)]);
    let padded: Vec<(f64, f64)> = chunks.iter().map(|c| (c.padded_start, c.padded_end)).collect();
    assert_eq!(padded, vec![(0.0, 23.0), (17.0, 43.0), (37.0, 63.0), (57.0, 63.0)]);
}

#[test]
fn test_job_writes_all_artifacts() {
    let env = Env::new();
    let job = env.submit("lecture");
    let factory = MockEngineFactory::new(
        MockTranscriber::new("base")
            .with_response("chunk_001", "welcome to the lecture on rivers of the northern plains")
            .with_response("chunk_002", "rivers of the northern plains and how they carve valleys"),
    );
    let orchestrator = env.orchestrator(MockPreparer::new(planner(), 63.0), factory.clone(), 2, 2);

    let outcome = orchestrator.run_job(job.clone());
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(factory.mock().call_count(), 4);
    assert!(factory.mock().max_concurrent_calls() <= 2);

    let artifacts = outcome.artifacts.unwrap();
    assert_eq!(artifacts.text, env.root.join("transcripts").join("lecture.txt"));
    let text = std::fs::read_to_string(&artifacts.text).unwrap();
    // Repeated phrase across the first boundary is merged away
    assert!(text.starts_with(
        "welcome to the lecture on rivers of the northern plains\n\nand how they carve valleys\n\nmock transcription of chunk_003"
    ));
    assert!(text.ends_with("mock transcription of chunk_004"));

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&artifacts.json).unwrap()).unwrap();
    assert_eq!(json["transcription"].as_str(), Some(text.as_str()));
    assert_eq!(json["chunks"].as_array().unwrap().len(), 4);
    assert_eq!(json["metadata"]["total_chunks"], 4);
    assert_eq!(json["metadata"]["architecture"], "2x2");
    assert_eq!(json["metadata"]["language"], "en");

    let srt = std::fs::read_to_string(&artifacts.srt).unwrap();
    assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:01,000\nwelcome to the lecture on rivers of the northern plains\n"));
    // Second window starts at its padded start
    assert!(srt.contains("2\n00:00:17,000 --> 00:00:18,000\n"));

    let row = env.ledger.get(job.id).unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Completed);
    assert!(row.completed_at.is_some());
    assert!(!env.checkpoints().path_for(&job.output).exists());
}

#[test]
fn test_resubmitted_job_resumes_from_checkpoint() {
    let env = Env::new();

    // First attempt is cancelled part way through
    let first = env.submit("podcast");
    let slow = MockEngineFactory::new(MockTranscriber::new("base").with_delay(Duration::from_millis(30)));
    let (tx, rx) = unbounded();
    let orchestrator = env
        .orchestrator(MockPreparer::new(planner(), 200.0), slow.clone(), 1, 1)
        .with_events(tx);
    let cancel = orchestrator.cancel_token();
    let outcome = thread::scope(|scope| {
        let runner = scope.spawn(|| orchestrator.run_job(first.clone()));
        let mut saved = 0;
        for event in rx.iter() {
            if let PipelineEvent::CheckpointSaved { chunks, .. } = event {
                saved = chunks;
                if saved >= 3 {
                    cancel.cancel();
                    break;
                }
            }
        }
        assert!(saved >= 3);
        runner.join().unwrap()
    });
    assert_eq!(outcome.stage, JobStage::Cancelled);
    assert!(slow.mock().call_count() < 10);
    let checkpoint = env.checkpoints().load(&first.output).unwrap().unwrap();
    assert!(checkpoint.len() >= 3);
    assert!(checkpoint.len() < 10);

    // Resubmitted with the same output: finished chunks are not re-run
    let second = env.submit("podcast");
    assert_eq!(second.output, first.output);
    let fresh = MockEngineFactory::new(MockTranscriber::new("base"));
    let orchestrator = env.orchestrator(MockPreparer::new(planner(), 200.0), fresh.clone(), 2, 2);
    let outcome = orchestrator.run_job(second.clone());

    assert!(outcome.is_success(), "{:?}", outcome.error);
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.total_chunks, 10);
    assert_eq!(summary.successful_chunks, 10);
    assert_eq!(summary.reused_from_checkpoint, checkpoint.len());
    assert_eq!(summary.engine_invocations, 10 - checkpoint.len());
    assert_eq!(fresh.mock().call_count(), 10 - checkpoint.len());

    let mut rerun = fresh.mock().transcribed_files();
    for stem in &rerun {
        assert!(!checkpoint.chunks.contains_key(stem), "re-ran finished {stem}");
    }
    rerun.extend(checkpoint.chunks.keys().cloned());
    rerun.sort();
    let expected: Vec<String> = (0..10).map(chunk_key).collect();
    assert_eq!(rerun, expected);

    assert_eq!(env.ledger.get(first.id).unwrap().unwrap().status, JobStatus::Cancelled);
    assert_eq!(env.ledger.get(second.id).unwrap().unwrap().status, JobStatus::Completed);
    assert!(!env.checkpoints().path_for(&second.output).exists());
}

#[test]
fn test_batch_isolates_failures() {
    let env = Env::new();
    let jobs = vec![env.submit("one"), env.submit("broken"), env.submit("three")];
    let factory = MockEngineFactory::new(MockTranscriber::new("base"));
    let preparer = MockPreparer::new(planner(), 40.0)
        .with_duration("three.mp3", 90.0)
        .with_failing_input("broken.mp3");
    let orchestrator = env.orchestrator(preparer.clone(), factory.clone(), 2, 1);

    let outcomes = orchestrator.run_batch(jobs.clone());
    assert_eq!(outcomes.len(), 3);
    assert_eq!(preparer.call_count(), 3);
    // 2 + 5 chunks from the two good inputs
    assert_eq!(factory.mock().call_count(), 7);

    let status = |id| env.ledger.get(id).unwrap().unwrap().status;
    assert_eq!(status(jobs[0].id), JobStatus::Completed);
    assert_eq!(status(jobs[1].id), JobStatus::Failed);
    assert_eq!(status(jobs[2].id), JobStatus::Completed);

    let broken = outcomes.iter().find(|o| o.job_id == jobs[1].id).unwrap();
    assert!(!broken.is_success());
    assert!(broken.summary.is_none());
    assert!(!env.root.join("transcripts").join("broken.txt").exists());
}

#[test]
fn test_every_chunk_failing_still_completes_with_zero_rate() {
    let env = Env::new();
    let job = env.submit("silence");
    let factory = MockEngineFactory::new(MockTranscriber::new("base").with_failure());
    let orchestrator = env.orchestrator(MockPreparer::new(planner(), 30.0), factory, 1, 2);

    let outcome = orchestrator.run_job(job);
    assert_eq!(outcome.stage, JobStage::Completed);
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.successful_chunks, 0);
    assert_eq!(summary.success_rate, 0.0);
    assert_eq!(std::fs::read_to_string(outcome.artifacts.unwrap().text).unwrap(), "");
}

#[test]
fn test_pool_mode_is_in_process() {
    let env = Env::new();
    let orchestrator = env.orchestrator(
        MockPreparer::new(planner(), 30.0),
        MockEngineFactory::new(MockTranscriber::new("base")),
        3,
        2,
    );
    assert_eq!(orchestrator.pool().mode(), LaneMode::InProcess);
    assert_eq!(orchestrator.pool().architecture(), "3x2");
}
