//! Tests for the pipeline engine: advancing, bounded rework, context and blockers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use pipewright::engine::pipeline::{DEFAULT_MAX_LOOPS, PipelineEngine, ReworkOutcome, ReworkRequest};
use pipewright::engine::stages;
use pipewright::engine::types::*;
use pipewright::engine::PipelineError;
use pipewright::storage::StateStore;
use pipewright::storage::json_store::JsonStateStore;
use pipewright::storage::memory_store::MemoryStateStore;

fn engine() -> PipelineEngine {
    PipelineEngine::new(Arc::new(MemoryStateStore::new()))
}

fn score(v: i64) -> Score {
    Score::new(v).unwrap()
}

// ===== advance =====

#[tokio::test]
async fn advance_moves_to_next_regardless_of_score() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();

    for window in stages::PIPELINE.windows(2) {
        let next = engine
            .advance("p", window[0].name, score(0), None)
            .await
            .unwrap();
        assert_eq!(next, window[1].name);

        let state = engine.get_state("p").await.unwrap();
        assert_eq!(state.current_agent, window[1].name);
        assert_eq!(state.current_phase, window[1].phase);
    }
}

#[tokio::test]
async fn advance_last_stage_completes() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();

    let next = engine
        .advance("p", "retrospective-agent", score(75), None)
        .await
        .unwrap();
    assert_eq!(next, COMPLETE);

    let state = engine.get_state("p").await.unwrap();
    assert!(state.is_complete());
    assert_eq!(state.current_phase, Phase::Complete);
    assert!(engine.current_stage("p").await.unwrap().is_none());
}

#[tokio::test]
async fn advance_unknown_stage_completes() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();

    let next = engine.advance("p", "bogus-agent", score(50), None).await.unwrap();
    assert_eq!(next, COMPLETE);

    let state = engine.get_state("p").await.unwrap();
    assert_eq!(state.score_for("bogus-agent"), Some(score(50)));
}

#[tokio::test]
async fn advance_records_score_and_completion_once() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();

    engine.advance("p", "project-planner", score(70), None).await.unwrap();
    engine.advance("p", "project-planner", score(90), None).await.unwrap();

    let state = engine.get_state("p").await.unwrap();
    assert_eq!(state.completed_agents, vec!["project-planner".to_string()]);
    assert_eq!(state.score_for("project-planner"), Some(score(90)));
}

#[tokio::test]
async fn advance_stores_notes_only_when_present() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();

    engine
        .advance("p", "project-planner", score(90), Some("12 tasks planned"))
        .await
        .unwrap();
    engine
        .advance("p", "code-architect", score(90), Some(""))
        .await
        .unwrap();

    let state = engine.get_state("p").await.unwrap();
    assert_eq!(
        state.shared_context.get("project-planner_notes"),
        Some(&serde_json::json!("12 tasks planned"))
    );
    assert!(!state.shared_context.contains_key("code-architect_notes"));
}

#[tokio::test]
async fn demo_scenario() {
    let engine = engine();
    engine.initialize("demo", "demo").await.unwrap();

    engine.advance("demo", "project-planner", score(90), None).await.unwrap();
    engine.advance("demo", "code-architect", score(40), None).await.unwrap();

    let state = engine.get_state("demo").await.unwrap();
    assert_eq!(state.current_agent, "implementation-agent");
    assert_eq!(state.quality_scores.len(), 2);
    assert_eq!(state.score_for("project-planner"), Some(score(90)));
    assert_eq!(state.score_for("code-architect"), Some(score(40)));
}

// ===== request_rework =====

#[tokio::test]
async fn rework_granted_up_to_max_then_refused() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();

    for i in 1..=3u32 {
        // Put the cursor back on the reviewer before each request.
        engine.advance("p", "implementation-agent", score(80), None).await.unwrap();

        let req = ReworkRequest::new("code-reviewer", "implementation-agent", "fix lints", "review_loop")
            .with_max_loops(3);
        let outcome = engine.request_rework("p", &req).await.unwrap();
        assert_eq!(
            outcome,
            ReworkOutcome::Granted {
                target_stage: "implementation-agent".to_string(),
                loop_count: i,
                max_loops: 3,
            }
        );
    }

    engine.advance("p", "implementation-agent", score(80), None).await.unwrap();
    let before = engine.get_state("p").await.unwrap();
    assert_eq!(before.current_agent, "code-reviewer");

    let req = ReworkRequest::new("code-reviewer", "implementation-agent", "still failing", "review_loop")
        .with_max_loops(3);
    let outcome = engine.request_rework("p", &req).await.unwrap();
    assert!(!outcome.is_granted());
    match outcome {
        ReworkOutcome::CeilingReached {
            loop_key,
            loop_count,
            max_loops,
            blocker,
        } => {
            assert_eq!(loop_key, "review_loop");
            assert_eq!(loop_count, 4);
            assert_eq!(max_loops, 3);
            assert!(blocker.contains("review_loop hit max loops (3)"));
            assert!(blocker.contains("code-reviewer"));
            assert!(blocker.contains("still failing"));
        }
        other => panic!("expected ceiling, got {:?}", other),
    }

    let after = engine.get_state("p").await.unwrap();
    assert_eq!(after.current_agent, "code-reviewer");
    assert_eq!(after.loop_count("review_loop"), 4);
    assert_eq!(after.blockers.len(), 1);
}

#[tokio::test]
async fn rework_uses_default_max_loops() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();
    assert_eq!(engine.default_max_loops(), DEFAULT_MAX_LOOPS);

    let req = ReworkRequest::new("testing-agent", "implementation-agent", "tests fail", "test_loop");
    for _ in 0..DEFAULT_MAX_LOOPS {
        assert!(engine.request_rework("p", &req).await.unwrap().is_granted());
    }
    assert!(!engine.request_rework("p", &req).await.unwrap().is_granted());
}

#[tokio::test]
async fn rework_configured_default_max_loops() {
    let engine = engine().with_default_max_loops(1);
    engine.initialize("p", "Demo").await.unwrap();

    let req = ReworkRequest::new("code-reviewer", "implementation-agent", "again", "review_loop");
    assert!(engine.request_rework("p", &req).await.unwrap().is_granted());
    assert!(!engine.request_rework("p", &req).await.unwrap().is_granted());
}

#[tokio::test]
async fn rework_max_loops_zero_refuses_first_request() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();

    let req = ReworkRequest::new("code-reviewer", "implementation-agent", "nope", "review_loop")
        .with_max_loops(0);
    let outcome = engine.request_rework("p", &req).await.unwrap();
    assert!(!outcome.is_granted());

    let state = engine.get_state("p").await.unwrap();
    assert_eq!(state.current_agent, "project-planner");
    assert_eq!(state.loop_count("review_loop"), 1);
}

#[tokio::test]
async fn rework_loop_keys_are_independent() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();

    let review = ReworkRequest::new("code-reviewer", "implementation-agent", "r", "review_loop")
        .with_max_loops(1);
    let test = ReworkRequest::new("testing-agent", "implementation-agent", "t", "test_loop")
        .with_max_loops(1);

    assert!(engine.request_rework("p", &review).await.unwrap().is_granted());
    assert!(engine.request_rework("p", &test).await.unwrap().is_granted());
    assert!(!engine.request_rework("p", &review).await.unwrap().is_granted());
}

#[tokio::test]
async fn rework_removes_target_from_completed() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();

    for stage in ["project-planner", "code-architect", "implementation-agent"] {
        engine.advance("p", stage, score(90), None).await.unwrap();
    }
    let before = engine.get_state("p").await.unwrap();
    assert!(before.is_completed("implementation-agent"));

    let req = ReworkRequest::new("code-reviewer", "implementation-agent", "missing error handling", "review_loop");
    engine.request_rework("p", &req).await.unwrap();

    let after = engine.get_state("p").await.unwrap();
    assert!(!after.is_completed("implementation-agent"));
    assert!(after.is_completed("project-planner"));
    assert!(after.is_completed("code-architect"));
    assert_eq!(after.current_agent, "implementation-agent");
    assert_eq!(after.current_phase, Phase::Implementation);
    assert_eq!(
        after.shared_context.get("review_loop_feedback"),
        Some(&serde_json::json!("missing error handling"))
    );
    // Scores are kept across rework.
    assert_eq!(after.score_for("implementation-agent"), Some(score(90)));
}

#[tokio::test]
async fn rework_unknown_target_leaves_state_untouched() {
    let engine = engine();
    engine.initialize("p", "Demo").await.unwrap();
    let before = engine.get_state("p").await.unwrap();

    let req = ReworkRequest::new("code-reviewer", "nonexistent-agent", "?", "review_loop");
    let err = engine.request_rework("p", &req).await.unwrap_err();
    assert!(err.is_unknown_stage());

    let after = engine.get_state("p").await.unwrap();
    assert_eq!(after, before);
}

// ===== initialize =====

#[tokio::test]
async fn initialize_resets_everything() {
    let engine = engine();
    engine.initialize("p", "First").await.unwrap();

    engine.advance("p", "project-planner", score(90), None).await.unwrap();
    engine.add_blocker("p", "stuck").await.unwrap();
    engine
        .set_context("p", "tech_stack", serde_json::json!("rust"))
        .await
        .unwrap();
    let req = ReworkRequest::new("code-architect", "project-planner", "redo", "plan_loop");
    engine.request_rework("p", &req).await.unwrap();

    let state = engine.initialize("p", "Second").await.unwrap();
    assert_eq!(state.project_name, "Second");
    assert_eq!(state.current_agent, "project-planner");
    assert!(state.loop_counts.is_empty());
    assert!(state.blockers.is_empty());
    assert!(state.completed_agents.is_empty());
    assert!(state.quality_scores.is_empty());
    assert!(state.shared_context.is_empty());

    assert_eq!(engine.get_state("p").await.unwrap(), state);
}

// ===== context & blockers =====

#[tokio::test]
async fn set_context_last_write_wins() {
    let engine = engine();
    engine.set_context("p", "db", serde_json::json!("sqlite")).await.unwrap();
    engine
        .set_context("p", "db", serde_json::json!({ "engine": "postgres", "version": 16 }))
        .await
        .unwrap();

    let state = engine.get_state("p").await.unwrap();
    assert_eq!(
        state.shared_context.get("db"),
        Some(&serde_json::json!({ "engine": "postgres", "version": 16 }))
    );
}

#[tokio::test]
async fn blockers_append_in_order() {
    let engine = engine();
    engine.add_blocker("p", "first").await.unwrap();
    engine.add_blocker("p", "second").await.unwrap();

    let state = engine.get_state("p").await.unwrap();
    assert_eq!(state.blockers, vec!["first".to_string(), "second".to_string()]);
}

// ===== persistence =====

#[tokio::test]
async fn get_state_creates_default_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path()));
    let engine = PipelineEngine::new(store.clone());

    let state = engine.get_state("fresh").await.unwrap();
    assert_eq!(state.current_agent, "project-planner");
    assert!(store.state_path("fresh").unwrap().exists());
}

#[tokio::test]
async fn engine_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = PipelineEngine::new(Arc::new(JsonStateStore::new(dir.path())));
        engine.initialize("demo", "Demo").await.unwrap();
        engine.advance("demo", "project-planner", score(88), Some("plan")).await.unwrap();
    }

    let engine = PipelineEngine::new(Arc::new(JsonStateStore::new(dir.path())));
    let state = engine.get_state("demo").await.unwrap();
    assert_eq!(state.project_name, "Demo");
    assert_eq!(state.current_agent, "code-architect");
    assert_eq!(state.score_for("project-planner"), Some(score(88)));
}

#[tokio::test]
async fn storage_failure_is_typed() {
    let dir = tempfile::tempdir().unwrap();
    let file_root = dir.path().join("file");
    std::fs::write(&file_root, "x").unwrap();

    let engine = PipelineEngine::new(Arc::new(JsonStateStore::new(&file_root)));
    let err = engine.initialize("p", "Demo").await.unwrap_err();
    assert!(matches!(err, PipelineError::StorageUnavailable { .. }));
}

#[tokio::test]
async fn invalid_project_key_is_typed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = PipelineEngine::new(Arc::new(JsonStateStore::new(dir.path())));

    let err = engine.get_state("../outside").await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidProjectKey { .. }));
}

/// Memory store whose saves can be switched to fail.
struct FlakyStore {
    inner: MemoryStateStore,
    fail_saves: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStateStore::new(),
            fail_saves: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn load(&self, project: &str) -> anyhow::Result<WorkflowState> {
        self.inner.load(project).await
    }

    async fn save(&self, project: &str, state: &mut WorkflowState) -> anyhow::Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.save(project, state).await
    }
}

#[tokio::test]
async fn failed_save_leaves_record_unchanged() {
    let store = Arc::new(FlakyStore::new());
    let engine = PipelineEngine::new(store.clone());
    engine.initialize("p", "Demo").await.unwrap();
    for stage in ["project-planner", "code-architect", "implementation-agent"] {
        engine.advance("p", stage, score(90), None).await.unwrap();
    }
    let req = ReworkRequest::new("code-reviewer", "implementation-agent", "r", "review_loop");
    engine.request_rework("p", &req).await.unwrap();
    let before = engine.get_state("p").await.unwrap();

    store.fail_saves.store(true, Ordering::SeqCst);

    let err = engine
        .advance("p", "implementation-agent", score(95), Some("again"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::StorageUnavailable { .. }));
    assert!(format!("{:#}", anyhow::Error::from(err)).contains("disk full"));

    let err = engine.request_rework("p", &req).await.unwrap_err();
    assert!(matches!(err, PipelineError::StorageUnavailable { .. }));

    let err = engine.add_blocker("p", "lost").await.unwrap_err();
    assert!(matches!(err, PipelineError::StorageUnavailable { .. }));

    store.fail_saves.store(false, Ordering::SeqCst);
    let after = engine.get_state("p").await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.loop_count("review_loop"), 1);
    assert_eq!(after.current_agent, "implementation-agent");
    assert!(!after.completed_agents.contains(&"implementation-agent".to_string()));
    assert!(after.shared_context.get("implementation-agent_notes").is_none());
}

// ===== concurrency =====

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn key_spellings_share_one_lock() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(PipelineEngine::new(Arc::new(JsonStateStore::new(dir.path()))));
    engine.initialize("p", "Demo").await.unwrap();

    let spellings = ["p", "./p", "p/", "p/."];
    let mut handles = Vec::new();
    for i in 0..80 {
        let engine = engine.clone();
        let key = spellings[i % spellings.len()];
        handles.push(tokio::spawn(async move {
            engine.add_blocker(key, &format!("blocker {}", i)).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let state = engine.get_state("p").await.unwrap();
    assert_eq!(state.blockers.len(), 80);
    assert_eq!(engine.get_state("./p/").await.unwrap(), state);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mutations_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(PipelineEngine::new(Arc::new(JsonStateStore::new(dir.path()))));
    engine.initialize("p", "Demo").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.add_blocker("p", &format!("blocker {}", i)).await.unwrap();
            engine
                .set_context("p", &format!("key_{}", i), serde_json::json!(i))
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let state = engine.get_state("p").await.unwrap();
    assert_eq!(state.blockers.len(), 20);
    assert_eq!(state.shared_context.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reworks_count_every_request() {
    let engine = Arc::new(engine());
    engine.initialize("p", "Demo").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let req = ReworkRequest::new("code-reviewer", "implementation-agent", "r", "review_loop")
                .with_max_loops(5);
            engine.request_rework("p", &req).await.unwrap()
        }));
    }

    let mut granted = 0;
    for h in handles {
        if h.await.unwrap().is_granted() {
            granted += 1;
        }
    }

    assert_eq!(granted, 5);
    let state = engine.get_state("p").await.unwrap();
    assert_eq!(state.loop_count("review_loop"), 10);
    assert_eq!(state.blockers.len(), 5);
}

#[tokio::test]
async fn engine_store_accessor() {
    let engine = engine();
    let state = engine.store().load("p").await.unwrap();
    assert_eq!(state.current_agent, "project-planner");
}
