// Integration tests for the master side: PutSchedul, validation pipeline,
// record reconciliation and the master role

use common::config::{NodeConfig, Settings, StoreBackend};
use common::datacenter::DataCenterConfig;
use common::errors::{RuntimeError, SchedulingError};
use common::job::job_hash;
use common::leader::{LeaderElector, LeadershipHandler, StoreLeaderElector};
use common::lock::{DistributedLock, StoreLocker};
use common::models::{
    ConfigValue, DependStrategy, ExecutionRecord, Job, RunMode, RunStatus, ScheduleState,
    SchedulerMode, Shell, Strategy, Task, TaskPhase, TaskStatus, TaskTemplate, COMPLE_FAILURE,
    COMPLE_SUCCESS,
};
use common::registry::{NodeRegistry, StaticNodeRegistry};
use common::repositories::ExecutionRepository;
use common::scheduler::{MasterRole, RecordReconciler, TaskEngine};
use common::store::{KvStore, MemoryStore};
use common::watch::Watcher;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn node(id: &str, role: &str) -> NodeConfig {
    NodeConfig {
        id: id.to_string(),
        labels: HashMap::from([("role".to_string(), role.to_string())]),
    }
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.store.backend = StoreBackend::Memory;
    settings.node.id = "master-1".to_string();
    settings.cluster.nodes = vec![node("n1", "compute"), node("n2", "compute"), node("m1", "manage")];
    settings.scheduler.next_timeout_ms = 50;
    settings.scheduler.requeue_delay_ms = 50;
    settings
}

fn template(cmd: &[&str]) -> TaskTemplate {
    TaskTemplate {
        shell: Shell {
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
        },
        labels: HashMap::from([("role".to_string(), "compute".to_string())]),
        ..Default::default()
    }
}

fn task(id: &str, mode: RunMode) -> Task {
    let mut task = Task::new(id, template(&["echo", id]));
    task.run_mode = mode;
    if mode == RunMode::Cycle {
        task.timer = "@every 1s".to_string();
    }
    task
}

struct Harness {
    store: Arc<dyn KvStore>,
    engine: Arc<TaskEngine>,
    cancel: CancellationToken,
    errors: mpsc::Receiver<RuntimeError>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(settings()).await
    }

    async fn start_with(settings: Settings) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let nodes: Arc<dyn NodeRegistry> =
            Arc::new(StaticNodeRegistry::from_config(&settings.cluster.nodes));
        let datacenter =
            Arc::new(DataCenterConfig::new(store.clone(), &settings.paths.global_config).unwrap());
        let engine = Arc::new(TaskEngine::new(&settings, store.clone(), nodes, datacenter));
        let cancel = CancellationToken::new();
        let (tx, errors) = mpsc::channel(8);
        engine.start(cancel.clone(), tx).await.unwrap();
        Self {
            store,
            engine,
            cancel,
            errors,
        }
    }

    async fn job(&self, task_id: &str, node_id: &str) -> Option<Job> {
        let key = format!("{}/{}", Settings::default().paths.jobs, job_hash(task_id, node_id));
        let kv = self.store.get(&key).await.unwrap()?;
        Some(serde_json::from_str(&kv.value).unwrap())
    }

    async fn put_job(&self, job: &Job) {
        let key = format!("{}/{}", Settings::default().paths.jobs, job.hash);
        self.store
            .put(&key, &serde_json::to_string(job).unwrap(), None)
            .await
            .unwrap();
    }

    async fn task(&self, id: &str) -> Task {
        self.engine.get_task(id).await.unwrap().unwrap()
    }

    async fn wait_job<F>(&self, task_id: &str, node_id: &str, pred: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        let pred = &pred;
        eventually(move || async move {
            self.job(task_id, node_id).await.filter(|job| pred(job))
        })
        .await
    }

    fn no_errors(&mut self) {
        assert!(self.errors.try_recv().is_err());
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

fn can_run(job: &Job) -> bool {
    job.scheduler.as_ref().map(|s| s.can_run).unwrap_or(false)
}

fn scheduler_state(job: &Job) -> Option<ScheduleState> {
    job.scheduler.as_ref().map(|s| s.scheduler_status)
}

fn ran(job: &Job, status: &str) -> Job {
    let mut job = job.clone();
    job.run_status = Some(RunStatus {
        status: status.to_string(),
        start_time: Utc::now(),
        end_time: Some(Utc::now()),
        record_id: "r1".to_string(),
    });
    job
}

fn completed(job_id: &str, comple_status: &str) -> TaskStatus {
    TaskStatus {
        job_id: job_id.to_string(),
        status: TaskPhase::Complete,
        start_time: Some(Utc::now()),
        end_time: Some(Utc::now()),
        take_time: 1,
        comple_status: comple_status.to_string(),
        shell_code: 0,
        message: String::new(),
    }
}

#[tokio::test]
async fn test_cycle_job_is_validated_once_and_released() {
    let mut h = Harness::start().await;
    h.engine.add_task(task("T1", RunMode::Cycle)).await.unwrap();

    let job = h.engine.put_schedul("T1", "n1").await.unwrap();
    assert!(job.scheduler.is_none());
    assert_eq!(job.rule.timer, "@every 1s");

    let job = h.wait_job("T1", "n1", can_run).await;
    assert_eq!(job.node_id, "n1");
    assert!(job.is_run_on("n1"));

    let task = h.task("T1").await;
    assert_eq!(task.scheduler.status["n1"].status, ScheduleState::Success);
    assert_eq!(task.scheduler.status["n1"].scheduler_master, "master-1");
    assert_eq!(task.status["n1"].status, TaskPhase::Start);
    assert_eq!(task.status["n1"].job_id, job.id);
    h.no_errors();
}

#[tokio::test]
async fn test_second_put_schedul_of_cycle_task_is_rejected() {
    let h = Harness::start().await;
    h.engine.add_task(task("cleanup", RunMode::Cycle)).await.unwrap();

    h.engine.put_schedul("cleanup", "n1").await.unwrap();
    let err = h.engine.put_schedul("cleanup", "n1").await.unwrap_err();
    assert!(matches!(err, SchedulingError::RunModeViolation { .. }));
    assert!(err.to_string().contains("only run mode"), "{}", err);

    // Still rejected after validation succeeded
    h.wait_job("cleanup", "n1", can_run).await;
    assert!(h.engine.put_schedul("cleanup", "n1").await.is_err());
}

#[tokio::test]
async fn test_put_schedul_rejects_unknown_identities() {
    let h = Harness::start().await;
    h.engine.add_task(task("t", RunMode::ManyOnce)).await.unwrap();

    assert!(matches!(
        h.engine.put_schedul("", "n1").await,
        Err(SchedulingError::EmptyIdentity)
    ));
    assert!(matches!(
        h.engine.put_schedul("missing", "n1").await,
        Err(SchedulingError::TaskNotFound(_))
    ));
    assert!(matches!(
        h.engine.put_schedul("t", "ghost").await,
        Err(SchedulingError::NodeNotFound(_))
    ));
}

#[tokio::test]
async fn test_many_once_may_run_again_after_success() {
    let h = Harness::start().await;
    h.engine.add_task(task("report", RunMode::ManyOnce)).await.unwrap();
    let first = h.engine.put_schedul("report", "n1").await.unwrap();
    h.wait_job("report", "n1", can_run).await;

    let second = h.engine.put_schedul("report", "n1").await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(first.hash, second.hash);
}

#[tokio::test]
async fn test_only_once_task_is_not_rerun_on_a_completed_node() {
    let h = Harness::start().await;
    h.engine.add_task(task("bootstrap", RunMode::OnlyOnce)).await.unwrap();
    h.engine.put_schedul("bootstrap", "n1").await.unwrap();
    let job = h.wait_job("bootstrap", "n1", can_run).await;

    let job_id = job.id.clone();
    h.engine
        .modify_task("bootstrap", move |t| {
            t.update_node_status("n1", completed(&job_id, COMPLE_SUCCESS))
        })
        .await
        .unwrap();

    // A leftover successful job blocks PutSchedul directly
    h.put_job(&ran(&job, COMPLE_SUCCESS)).await;
    assert!(h.engine.put_schedul("bootstrap", "n1").await.is_err());

    // Without the job, the validation pipeline rejects the rerun
    h.engine.stop_task("bootstrap", "n1").await.unwrap();
    h.engine.put_schedul("bootstrap", "n1").await.unwrap();
    let job = h
        .wait_job("bootstrap", "n1", |j| scheduler_state(j) == Some(ScheduleState::Failure))
        .await;
    assert!(!job.scheduler.as_ref().unwrap().can_run);
    let task = h.task("bootstrap").await;
    assert_eq!(task.scheduler.status["n1"].status, ScheduleState::Failure);
}

#[tokio::test]
async fn test_only_once_task_can_be_rescheduled_after_a_failed_run() {
    let h = Harness::start().await;
    h.engine.add_task(task("install", RunMode::OnlyOnce)).await.unwrap();
    h.engine.put_schedul("install", "n1").await.unwrap();
    let job = h.wait_job("install", "n1", can_run).await;

    h.put_job(&ran(&job, COMPLE_FAILURE)).await;
    let job_id = job.id.clone();
    h.engine
        .modify_task("install", move |t| {
            t.update_node_status("n1", completed(&job_id, COMPLE_FAILURE))
        })
        .await
        .unwrap();

    let retry = h.engine.put_schedul("install", "n1").await.unwrap();
    assert_ne!(retry.id, job.id);
    let released = h.wait_job("install", "n1", |j| j.id == retry.id && can_run(j)).await;
    assert!(released.run_status.is_none());
}

#[tokio::test]
async fn test_at_least_once_dependent_waits_while_dependency_only_failed() {
    let h = Harness::start().await;
    h.engine.add_task(task("B", RunMode::OnlyOnce)).await.unwrap();
    let mut a = task("A", RunMode::OnlyOnce);
    a.temp.as_mut().unwrap().depends = vec![DependStrategy {
        depend_task_id: "B".to_string(),
        strategy: Strategy::AtLeastOnce,
    }];
    h.engine.add_task(a).await.unwrap();
    h.engine
        .modify_task("B", |t| {
            t.update_node_status("n1", completed("j1", COMPLE_FAILURE));
            t.update_node_status("n2", completed("j2", COMPLE_FAILURE));
        })
        .await
        .unwrap();

    h.engine.put_schedul("A", "m1").await.unwrap();
    h.wait_job("A", "m1", |j| scheduler_state(j) == Some(ScheduleState::Waiting))
        .await;

    // Several requeue rounds later it is still waiting, not failed
    tokio::time::sleep(Duration::from_millis(400)).await;
    let job = h.job("A", "m1").await.unwrap();
    assert_eq!(scheduler_state(&job), Some(ScheduleState::Waiting));
    assert!(!can_run(&job));
    assert_eq!(
        h.task("A").await.scheduler.status["m1"].status,
        ScheduleState::Waiting
    );
}

#[tokio::test]
async fn test_at_least_once_dependency_gates_and_cascades() {
    let h = Harness::start().await;
    h.engine.add_task(task("B", RunMode::OnlyOnce)).await.unwrap();
    let mut a = task("A", RunMode::OnlyOnce);
    a.temp.as_mut().unwrap().depends = vec![DependStrategy {
        depend_task_id: "B".to_string(),
        strategy: Strategy::AtLeastOnce,
    }];
    h.engine.add_task(a).await.unwrap();

    h.engine.put_schedul("A", "n2").await.unwrap();
    let waiting = h
        .wait_job("A", "n2", |j| scheduler_state(j) == Some(ScheduleState::Waiting))
        .await;
    assert!(!can_run(&waiting));
    assert!(waiting.scheduler.as_ref().unwrap().waiting_since.is_some());

    // The passive dependency was scheduled on the first compute node
    let b_job = h.wait_job("B", "n1", can_run).await;

    let task_a = h.task("A").await;
    assert_eq!(task_a.scheduler.status["n2"].status, ScheduleState::Waiting);

    h.engine
        .modify_task("B", move |t| {
            t.update_node_status("n1", completed(&b_job.id, COMPLE_SUCCESS))
        })
        .await
        .unwrap();

    let released = h.wait_job("A", "n2", can_run).await;
    assert_eq!(released.id, waiting.id);
    assert_eq!(
        h.task("A").await.scheduler.status["n2"].status,
        ScheduleState::Success
    );
}

#[tokio::test]
async fn test_same_node_dependency_failure_is_permanent() {
    let h = Harness::start().await;
    h.engine.add_task(task("prepare", RunMode::OnlyOnce)).await.unwrap();
    let mut deploy = task("deploy", RunMode::OnlyOnce);
    deploy.temp.as_mut().unwrap().depends = vec![DependStrategy {
        depend_task_id: "prepare".to_string(),
        strategy: Strategy::SameNode,
    }];
    h.engine.add_task(deploy).await.unwrap();

    h.engine
        .modify_task("prepare", |t| {
            t.update_node_status("n1", completed("j", COMPLE_FAILURE))
        })
        .await
        .unwrap();

    h.engine.put_schedul("deploy", "n1").await.unwrap();
    h.wait_job("deploy", "n1", |j| scheduler_state(j) == Some(ScheduleState::Failure))
        .await;
    let status = &h.task("deploy").await.scheduler.status["n1"];
    assert_eq!(status.status, ScheduleState::Failure);
    assert!(status.message.contains("prepare"), "{}", status.message);
}

#[tokio::test]
async fn test_same_node_dependency_cascades_on_the_same_node() {
    let h = Harness::start().await;
    h.engine.add_task(task("prepare", RunMode::OnlyOnce)).await.unwrap();
    let mut deploy = task("deploy", RunMode::OnlyOnce);
    deploy.temp.as_mut().unwrap().depends = vec![DependStrategy {
        depend_task_id: "prepare".to_string(),
        strategy: Strategy::SameNode,
    }];
    h.engine.add_task(deploy).await.unwrap();

    h.engine.put_schedul("deploy", "n2").await.unwrap();
    h.wait_job("prepare", "n2", can_run).await;
    assert!(h.job("prepare", "n1").await.is_none());
    let job = h
        .wait_job("deploy", "n2", |j| scheduler_state(j).is_some())
        .await;
    assert!(!can_run(&job));
    assert_eq!(scheduler_state(&job), Some(ScheduleState::Waiting));
    assert_eq!(
        h.task("deploy").await.scheduler.status["n2"].status,
        ScheduleState::Waiting
    );
}

#[tokio::test]
async fn test_missing_dependency_is_a_hard_failure() {
    let h = Harness::start().await;
    let mut orphan = task("orphan", RunMode::OnlyOnce);
    orphan.temp.as_mut().unwrap().depends = vec![DependStrategy {
        depend_task_id: "ghost".to_string(),
        strategy: Strategy::AtLeastOnce,
    }];
    h.engine.add_task(orphan).await.unwrap();
    h.engine.put_schedul("orphan", "n1").await.unwrap();
    h.wait_job("orphan", "n1", |j| scheduler_state(j) == Some(ScheduleState::Failure))
        .await;
    let status = &h.task("orphan").await.scheduler.status["n1"];
    assert_eq!(status.message, "depend task ghost is not found");
}

#[tokio::test]
async fn test_waiting_beyond_task_timeout_is_dropped() {
    let h = Harness::start().await;
    let mut dep = task("slow", RunMode::OnlyOnce);
    dep.scheduler.mode = SchedulerMode::Intime;
    dep.nodes = vec!["m1".to_string()];
    h.engine.add_task(dep).await.unwrap();

    let mut waiting = task("impatient", RunMode::OnlyOnce);
    waiting.time_out = 1;
    waiting.temp.as_mut().unwrap().depends = vec![DependStrategy {
        depend_task_id: "slow".to_string(),
        strategy: Strategy::AtLeastOnce,
    }];
    h.engine.add_task(waiting).await.unwrap();
    h.engine.put_schedul("impatient", "n1").await.unwrap();

    h.wait_job("impatient", "n1", |j| scheduler_state(j) == Some(ScheduleState::Timeout))
        .await;
    let status = &h.task("impatient").await.scheduler.status["n1"];
    assert_eq!(status.status, ScheduleState::Timeout);
    assert_eq!(status.message, "dependency timeout");
}

#[tokio::test]
async fn test_placeholders_are_resolved_at_release() {
    let h = Harness::start().await;
    h.engine
        .datacenter()
        .put_config(common::models::ConfigUnit::string("TARGET", "db-1"))
        .await
        .unwrap();
    let mut t = task("backup", RunMode::OnlyOnce);
    t.temp = Some(template(&["backup", "--host", "${TARGET}"]));
    h.engine.add_task(t).await.unwrap();
    h.engine.put_schedul("backup", "n1").await.unwrap();

    let job = h.wait_job("backup", "n1", can_run).await;
    assert_eq!(job.command, "backup --host db-1");
}

#[tokio::test]
async fn test_undefined_placeholder_fails_the_task_on_the_node() {
    let h = Harness::start().await;
    let mut t = task("broken", RunMode::OnlyOnce);
    t.temp = Some(template(&["run", "${NOPE}"]));
    h.engine.add_task(t).await.unwrap();
    h.engine.put_schedul("broken", "n1").await.unwrap();

    h.wait_job("broken", "n1", |j| scheduler_state(j) == Some(ScheduleState::Failure))
        .await;
    let task = h.task("broken").await;
    assert_eq!(task.status["n1"].comple_status, COMPLE_FAILURE);
    assert!(task.status["n1"]
        .message
        .starts_with("update job config error,"));
}

#[tokio::test]
async fn test_add_task_keeps_runtime_state_and_expands_nodes() {
    let h = Harness::start().await;
    let added = h.engine.add_task(task("agent", RunMode::ManyOnce)).await.unwrap();
    assert_eq!(added.nodes, vec!["n1".to_string(), "n2".to_string()]);

    h.engine
        .modify_task("agent", |t| {
            t.exec_count = 3;
            t.update_node_status("n1", completed("j", COMPLE_SUCCESS));
        })
        .await
        .unwrap();

    let mut updated = task("agent", RunMode::ManyOnce);
    updated.temp = Some(template(&["echo", "v2"]));
    let updated = h.engine.add_task(updated).await.unwrap();
    assert_eq!(updated.exec_count, 3);
    assert!(updated.has_succeeded_on("n1"));
    assert_eq!(updated.temp.unwrap().shell.cmd, vec!["echo", "v2"]);

    let mut no_template = task("empty", RunMode::OnlyOnce);
    no_template.temp = None;
    assert!(matches!(
        h.engine.add_task(no_template).await,
        Err(SchedulingError::MissingTemplate)
    ));

    let mut bad_timer = task("bad", RunMode::Cycle);
    bad_timer.timer = "not a timer".to_string();
    assert!(matches!(
        h.engine.add_task(bad_timer).await,
        Err(SchedulingError::InvalidRule(_))
    ));
}

#[tokio::test]
async fn test_intime_task_is_scheduled_on_every_matching_node() {
    let h = Harness::start().await;
    let mut t = task("fanout", RunMode::OnlyOnce);
    t.scheduler.mode = SchedulerMode::Intime;
    h.engine.add_task(t).await.unwrap();

    h.wait_job("fanout", "n1", can_run).await;
    h.wait_job("fanout", "n2", can_run).await;
    assert!(h.job("fanout", "m1").await.is_none());
}

#[tokio::test]
async fn test_stop_task_removes_job_and_records() {
    let h = Harness::start().await;
    h.engine.add_task(task("t", RunMode::OnlyOnce)).await.unwrap();
    let job = h.engine.put_schedul("t", "n1").await.unwrap();

    let records = ExecutionRepository::new(h.store.clone(), Settings::default().paths.records);
    records.create(&record(&job, true, "")).await.unwrap();
    assert_eq!(records.list_for_job(&job.id).await.unwrap().len(), 1);

    h.engine.stop_task("t", "n1").await.unwrap();
    assert!(h.job("t", "n1").await.is_none());
    assert!(records.list_for_job(&job.id).await.unwrap().is_empty());
    assert!(h.engine.get_job(&job.hash).await.unwrap().is_none());
}

#[tokio::test]
async fn test_schedule_group_runs_every_member() {
    let h = Harness::start().await;
    h.engine.add_task(task("g-a", RunMode::OnlyOnce)).await.unwrap();
    h.engine.add_task(task("g-b", RunMode::OnlyOnce)).await.unwrap();
    let group = common::models::TaskGroup {
        id: "install".to_string(),
        name: "install".to_string(),
        tasks: vec!["g-a".to_string(), "g-b".to_string()],
        create_time: Utc::now(),
        status: None,
    };
    h.engine.update_group(&group).await.unwrap();
    assert_eq!(h.task("g-a").await.group_id, "install");

    let started = h.engine.schedule_group("install", "n1").await.unwrap();
    assert_eq!(
        started.status.unwrap().status,
        common::models::GroupState::Start
    );
    h.wait_job("g-a", "n1", can_run).await;
    h.wait_job("g-b", "n1", can_run).await;

    let empty = common::models::TaskGroup {
        id: "empty".to_string(),
        tasks: Vec::new(),
        ..group
    };
    h.engine.update_group(&empty).await.unwrap();
    let status = h.engine.schedule_group("empty", "n1").await.unwrap().status.unwrap();
    assert_eq!(status.status, common::models::GroupState::NotDefineTask);
    assert!(matches!(
        h.engine.schedule_group("missing", "n1").await,
        Err(SchedulingError::GroupNotFound(_))
    ));
}

#[tokio::test]
async fn test_static_tasks_are_loaded_from_json_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("task-agent.json"),
        r#"{"name":"agent","temp":{"shell":{"cmd":["install-agent"]}}}"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("group-base.json"),
        r#"{"name":"base","tasks":["agent"]}"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("task-broken.json"), "{ nope").unwrap();
    std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

    let mut settings = settings();
    settings.scheduler.static_task_path = Some(dir.path().to_path_buf());
    let h = Harness::start_with(settings).await;

    assert_eq!(h.engine.load_static_tasks().await, 2);
    let agent = h.task("agent").await;
    assert_eq!(agent.group_id, "base");
    assert_eq!(agent.scheduler.mode, SchedulerMode::Passive);
    assert!(h.engine.get_task_group("base").await.unwrap().is_some());
}

fn record(job: &Job, success: bool, output: &str) -> ExecutionRecord {
    ExecutionRecord {
        id: uuid::Uuid::new_v4().to_string(),
        job_id: job.id.clone(),
        task_id: job.task_id.clone(),
        node_id: job.node_id.clone(),
        name: job.name.clone(),
        command: job.command.clone(),
        output: output.to_string(),
        success,
        begin_time: Utc::now() - chrono::Duration::seconds(3),
        end_time: Utc::now(),
        is_handled: false,
    }
}

fn reconciler(h: &Harness) -> (RecordReconciler, ExecutionRepository) {
    let defaults = Settings::default();
    let records = ExecutionRepository::new(h.store.clone(), defaults.paths.records.clone());
    let locker: Arc<dyn DistributedLock> =
        Arc::new(StoreLocker::new(h.store.clone(), defaults.paths.locks, 600));
    (
        RecordReconciler::new(
            h.engine.clone(),
            records.clone(),
            locker,
            Watcher::new(h.store.clone(), &defaults.watch),
            30,
        ),
        records,
    )
}

#[tokio::test]
async fn test_reconciler_folds_record_into_task() {
    let h = Harness::start().await;
    let mut check = task("check", RunMode::OnlyOnce);
    check.group_id = "g1".to_string();
    h.engine.add_task(check).await.unwrap();
    h.engine.add_task(task("follow-up", RunMode::OnlyOnce)).await.unwrap();
    let job = h.engine.put_schedul("check", "n1").await.unwrap();

    let output = r#"checking...
{"global":{"master_ip":"10.0.0.1,10.0.0.2,10.0.0.1"},"inner":{"token":"abc"},"type":"check","status":[{"name":"disk","condition_type":"DiskReady","condition_status":"True","next_tasks":["follow-up"]}],"exec_status":"Success"}"#;
    let (reconciler, records) = reconciler(&h);
    let rec = record(&job, true, output);
    records.create(&rec).await.unwrap();

    assert!(reconciler.handle(&rec).await.unwrap());
    // A second delivery is a no-op
    assert!(!reconciler.handle(&rec).await.unwrap());

    let task = h.task("check").await;
    assert_eq!(task.exec_count, 1);
    assert_eq!(task.status["n1"].status, TaskPhase::Complete);
    assert_eq!(task.status["n1"].comple_status, COMPLE_SUCCESS);
    assert_eq!(task.status["n1"].take_time, 3);
    assert_eq!(task.outputs.len(), 1);
    assert_eq!(task.outputs[0].node_id, "n1");
    assert!(task.complete_time.is_some());

    let dc = h.engine.datacenter();
    assert_eq!(
        dc.get_config("MASTER_IP").unwrap().value,
        ConfigValue::Array(vec!["10.0.0.1".into(), "10.0.0.2".into()])
    );
    assert_eq!(dc.group_value("g1", "token").as_deref(), Some("abc"));

    let node = h.engine.nodes().get_node("n1").await.unwrap();
    assert_eq!(node.conditions.get("DiskReady").map(String::as_str), Some("True"));
    assert!(h.job("follow-up", "n1").await.is_some());

    let stored = records.get(&rec.job_id, &rec.id).await.unwrap().unwrap();
    assert!(stored.is_handled);
}

#[tokio::test]
async fn test_reconciler_marks_unparseable_output_as_failure() {
    let h = Harness::start().await;
    h.engine.add_task(task("plain", RunMode::ManyOnce)).await.unwrap();
    let job = h.engine.put_schedul("plain", "n1").await.unwrap();
    let (reconciler, records) = reconciler(&h);

    let rec = record(&job, true, "all good, no json here");
    records.create(&rec).await.unwrap();
    reconciler.handle(&rec).await.unwrap();
    assert_eq!(h.task("plain").await.status["n1"].comple_status, COMPLE_FAILURE);

    let rec = record(&job, true, r#"{"body":"ok"}"#);
    records.create(&rec).await.unwrap();
    reconciler.handle(&rec).await.unwrap();
    let task = h.task("plain").await;
    assert_eq!(task.status["n1"].comple_status, COMPLE_SUCCESS);
    assert_eq!(task.exec_count, 2);
    assert_eq!(task.outputs.len(), 1);
}

#[tokio::test]
async fn test_reconciler_loop_handles_new_records() {
    let h = Harness::start().await;
    h.engine.add_task(task("looped", RunMode::ManyOnce)).await.unwrap();
    h.engine.put_schedul("looped", "n1").await.unwrap();
    // Records only exist for released jobs
    let job = h.wait_job("looped", "n1", can_run).await;
    let (reconciler, records) = reconciler(&h);

    let cancel = h.cancel.child_token();
    let loop_cancel = cancel.clone();
    let handle = tokio::spawn(async move { reconciler.run(loop_cancel).await });

    let rec = record(&job, false, "exit status 1\nboom");
    records.create(&rec).await.unwrap();
    let (records_ref, rec_ref) = (&records, &rec);
    let stored = eventually(move || async move {
        records_ref
            .get(&rec_ref.job_id, &rec_ref.id)
            .await
            .unwrap()
            .filter(|r| r.is_handled)
    })
    .await;
    assert!(stored.is_handled);
    assert_eq!(h.task("looped").await.status["n1"].message, "exit status 1\nboom");

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_master_role_starts_engine_on_election() {
    let settings = settings();
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let nodes: Arc<dyn NodeRegistry> =
        Arc::new(StaticNodeRegistry::from_config(&settings.cluster.nodes));
    let (tx, mut errors) = mpsc::channel(8);
    let role = Arc::new(MasterRole::new(settings.clone(), store.clone(), nodes, tx));
    let elector = StoreLeaderElector::new(store, &settings.paths.master_key, "master-1", 3);

    let shutdown = CancellationToken::new();
    let handler: Arc<dyn LeadershipHandler> = role.clone();
    let token = shutdown.clone();
    let election = tokio::spawn(async move { elector.run(handler, token).await });

    let role_ref = &role;
    let engine = eventually(move || async move { role_ref.engine().await }).await;
    engine.add_task(task("elected", RunMode::OnlyOnce)).await.unwrap();
    engine.put_schedul("elected", "n1").await.unwrap();
    let engine_ref = &engine;
    eventually(move || async move {
        engine_ref
            .get_job(&job_hash("elected", "n1"))
            .await
            .unwrap()
            .filter(can_run)
    })
    .await;

    shutdown.cancel();
    assert!(election.await.unwrap().is_ok());
    assert!(errors.try_recv().is_err());
}
