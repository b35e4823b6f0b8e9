#![allow(dead_code)]

//! Recording test doubles for the collaborator interfaces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sched_core::config::SchedulerConfig;
use sched_core::error::{Result, SchedulerError};
use sched_core::infra::{BoxFuture, Infrastructure};
use sched_core::model::{
    Credentials, Job, JobId, JobInfo, JobPriority, OnTaskError, ResourceLease, Task, TaskInfo,
    TaskResult,
};
use sched_core::policy::{DefaultPolicy, EligibleTask};
use sched_core::ports::{
    NodeProber, NodeRequest, NotificationData, Persistence, RmProxiesManager, RmProxy,
    SchedulerEvent, SchedulerStateUpdate, TaskLaunchPad, TaskLauncher,
};
use sched_core::registry::{LiveJobs, RunningTaskData};
use sched_core::service::SchedulingService;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub struct RecordingDb {
    pub calls: Mutex<Vec<String>>,
    pub restarts: AtomicUsize,
    pub stored: Mutex<HashMap<JobId, Job>>,
    pub removed: Mutex<Vec<(JobId, bool)>>,
}

impl RecordingDb {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn restart_records(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Persistence for RecordingDb {
    async fn new_job_submitted(&self, job: &Job) {
        self.record(format!("new_job_submitted {}", job.id));
        self.stored.lock().unwrap().insert(job.id, job.clone());
    }

    async fn update_job_and_tasks_state(&self, job: &Job) {
        self.record(format!("update_job_and_tasks_state {}", job.id));
        self.stored.lock().unwrap().insert(job.id, job.clone());
    }

    async fn job_task_started(&self, job: &Job, task_name: &str, first_task_started: bool) {
        self.record(format!(
            "job_task_started {}/{task_name} first={first_task_started}",
            job.id
        ));
        self.stored.lock().unwrap().insert(job.id, job.clone());
    }

    async fn update_after_task_finished(&self, job: &Job, task_name: &str, _result: &TaskResult) {
        self.record(format!("update_after_task_finished {}/{task_name}", job.id));
    }

    async fn task_restarted(&self, job: &Job, task_name: &str) {
        self.record(format!("task_restarted {}/{task_name}", job.id));
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    async fn load_job_with_tasks_if_not_removed(&self, job_id: JobId) -> Option<Job> {
        self.stored.lock().unwrap().get(&job_id).cloned()
    }

    async fn remove_job(&self, job_id: JobId, _removed_at: DateTime<Utc>, remove_data: bool) {
        self.removed.lock().unwrap().push((job_id, remove_data));
        self.stored.lock().unwrap().remove(&job_id);
    }
}

#[derive(Default)]
pub struct RecordingListener {
    pub submitted: Mutex<Vec<JobInfo>>,
    pub job_events: Mutex<Vec<(String, NotificationData<JobInfo>)>>,
    pub task_events: Mutex<Vec<(String, NotificationData<TaskInfo>)>>,
    pub scheduler_events: Mutex<Vec<SchedulerEvent>>,
}

impl RecordingListener {
    pub fn last_job_event(&self) -> Option<NotificationData<JobInfo>> {
        self.job_events.lock().unwrap().last().map(|(_, n)| n.clone())
    }

    pub fn task_events_for(&self, task_name: &str) -> Vec<NotificationData<TaskInfo>> {
        self.task_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, n)| n.data.id.name == task_name)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn scheduler_event_count(&self, event: SchedulerEvent) -> usize {
        self.scheduler_events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == event)
            .count()
    }
}

impl SchedulerStateUpdate for RecordingListener {
    fn job_submitted(&self, job: &JobInfo) {
        self.submitted.lock().unwrap().push(job.clone());
    }

    fn job_state_updated(&self, owner: &str, notification: NotificationData<JobInfo>) {
        self.job_events
            .lock()
            .unwrap()
            .push((owner.to_string(), notification));
    }

    fn task_state_updated(&self, owner: &str, notification: NotificationData<TaskInfo>) {
        self.task_events
            .lock()
            .unwrap()
            .push((owner.to_string(), notification));
    }

    fn scheduler_state_updated(&self, event: SchedulerEvent) {
        self.scheduler_events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    pub kills: AtomicUsize,
}

impl FakeLauncher {
    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskLauncher for FakeLauncher {
    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

/// Resource-manager proxy with optionally scripted booking outcomes; when
/// the script runs out every booking succeeds with a one-node lease.
#[derive(Default)]
pub struct FakeProxy {
    pub scripted: Mutex<Vec<Option<ResourceLease>>>,
    pub bookings: Mutex<Vec<NodeRequest>>,
    pub releases: Mutex<Vec<(ResourceLease, Option<String>)>>,
}

impl FakeProxy {
    pub fn refuse_all(&self) {
        // A long script of refusals; enough for any test pass.
        *self.scripted.lock().unwrap() = vec![None; 64];
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.lock().unwrap().len()
    }

    pub fn release_count(&self) -> usize {
        self.releases.lock().unwrap().len()
    }
}

#[async_trait]
impl RmProxy for FakeProxy {
    async fn book_nodes(&self, request: &NodeRequest) -> Result<Option<ResourceLease>> {
        self.bookings.lock().unwrap().push(request.clone());
        let mut scripted = self.scripted.lock().unwrap();
        if scripted.is_empty() {
            Ok(Some(ResourceLease::new(vec!["node-1".to_string()])))
        } else {
            Ok(scripted.remove(0))
        }
    }

    async fn release_nodes(
        &self,
        lease: ResourceLease,
        cleaning_script: Option<String>,
    ) -> Result<()> {
        self.releases.lock().unwrap().push((lease, cleaning_script));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProxies {
    pub proxy: Arc<FakeProxy>,
    pub requested_owners: Mutex<Vec<String>>,
}

#[async_trait]
impl RmProxiesManager for FakeProxies {
    async fn user_proxy(&self, owner: &str, _credentials: &Credentials) -> Result<Arc<dyn RmProxy>> {
        self.requested_owners.lock().unwrap().push(owner.to_string());
        Ok(Arc::clone(&self.proxy) as Arc<dyn RmProxy>)
    }
}

#[derive(Default)]
pub struct FakeLaunchPad {
    pub launches: Mutex<Vec<(JobId, String)>>,
    pub launchers: Mutex<Vec<Arc<FakeLauncher>>>,
    pub fail: AtomicBool,
}

impl FakeLaunchPad {
    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskLaunchPad for FakeLaunchPad {
    async fn launch(
        &self,
        task: &EligibleTask,
        _lease: &ResourceLease,
    ) -> Result<Arc<dyn TaskLauncher>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SchedulerError::Launch("scripted launch failure".into()));
        }
        self.launches
            .lock()
            .unwrap()
            .push((task.job_id, task.task_name.clone()));
        let launcher = Arc::new(FakeLauncher::default());
        self.launchers.lock().unwrap().push(Arc::clone(&launcher));
        Ok(launcher)
    }
}

/// Scripted liveness prober: tasks whose name appears in `dead` fail the
/// probe, everything else answers.
#[derive(Default)]
pub struct FakeProber {
    pub dead: Mutex<Vec<String>>,
}

#[async_trait]
impl NodeProber for FakeProber {
    async fn ping(&self, task: &RunningTaskData) -> bool {
        !self.dead.lock().unwrap().contains(&task.task_id.name)
    }
}

/// Infrastructure double: nothing runs on its own, callables are captured
/// and replayed explicitly by the test.
pub struct RecordingInfrastructure {
    db: Arc<dyn Persistence>,
    proxies: Arc<dyn RmProxiesManager>,
    pub scheduled: Mutex<Vec<(Duration, BoxFuture)>>,
    pub internal: Mutex<Vec<BoxFuture>>,
    pub shutdowns: AtomicUsize,
}

impl RecordingInfrastructure {
    pub fn new(db: Arc<RecordingDb>, proxies: Arc<FakeProxies>) -> Self {
        Self {
            db: db as Arc<dyn Persistence>,
            proxies: proxies as Arc<dyn RmProxiesManager>,
            scheduled: Mutex::new(Vec::new()),
            internal: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().unwrap().len()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Run every captured delayed callable, in capture order.
    pub async fn run_scheduled(&self) {
        let futs: Vec<(Duration, BoxFuture)> =
            std::mem::take(&mut *self.scheduled.lock().unwrap());
        for (_, fut) in futs {
            fut.await;
        }
    }

    /// Run every captured internal-pool operation.
    pub async fn run_internal(&self) {
        let futs: Vec<BoxFuture> = std::mem::take(&mut *self.internal.lock().unwrap());
        for fut in futs {
            fut.await;
        }
    }
}

impl Infrastructure for RecordingInfrastructure {
    fn schedule(&self, delay: Duration, fut: BoxFuture) {
        self.scheduled.lock().unwrap().push((delay, fut));
    }

    fn spawn_internal(&self, fut: BoxFuture) {
        self.internal.lock().unwrap().push(fut);
    }

    fn db(&self) -> &Arc<dyn Persistence> {
        &self.db
    }

    fn rm_proxies(&self) -> &Arc<dyn RmProxiesManager> {
        &self.proxies
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// A job with one task per name, normal priority, owned by "alice".
pub fn sample_job(id: JobId, on_error: OnTaskError, task_names: &[&str]) -> Job {
    let mut job = Job::new(id, format!("job-{id}"), "alice", JobPriority::Normal, on_error);
    for name in task_names {
        job = job.with_task(Task::new(id, *name));
    }
    job
}

pub struct RegistryFixture {
    pub jobs: Arc<LiveJobs>,
    pub db: Arc<RecordingDb>,
    pub listener: Arc<RecordingListener>,
}

pub fn registry_fixture(config: SchedulerConfig) -> RegistryFixture {
    init_tracing();
    let db = Arc::new(RecordingDb::default());
    let listener = Arc::new(RecordingListener::default());
    let jobs = Arc::new(LiveJobs::new(
        config,
        Arc::clone(&db) as Arc<dyn Persistence>,
        Arc::clone(&listener) as Arc<dyn SchedulerStateUpdate>,
    ));
    RegistryFixture { jobs, db, listener }
}

pub struct ServiceFixture {
    pub service: Arc<SchedulingService>,
    pub db: Arc<RecordingDb>,
    pub listener: Arc<RecordingListener>,
    pub proxies: Arc<FakeProxies>,
    pub launch_pad: Arc<FakeLaunchPad>,
    pub infra: Arc<RecordingInfrastructure>,
}

pub fn service_fixture(config: SchedulerConfig) -> ServiceFixture {
    init_tracing();
    let db = Arc::new(RecordingDb::default());
    let listener = Arc::new(RecordingListener::default());
    let proxies = Arc::new(FakeProxies::default());
    let launch_pad = Arc::new(FakeLaunchPad::default());
    let infra = Arc::new(RecordingInfrastructure::new(
        Arc::clone(&db),
        Arc::clone(&proxies),
    ));
    let service = SchedulingService::new(
        config,
        Arc::clone(&infra) as Arc<dyn Infrastructure>,
        Arc::clone(&listener) as Arc<dyn SchedulerStateUpdate>,
        Arc::new(DefaultPolicy),
        Arc::clone(&launch_pad) as Arc<dyn TaskLaunchPad>,
    );
    ServiceFixture {
        service,
        db,
        listener,
        proxies,
        launch_pad,
        infra,
    }
}

/// Drive one task of an already submitted job into RUNNING directly through
/// the registry, returning its running entry.
pub async fn start_task(
    jobs: &LiveJobs,
    job_id: JobId,
    task_name: &str,
) -> Arc<RunningTaskData> {
    let mut snapshot = jobs.lock_jobs_to_schedule().await;
    let locked = snapshot
        .job_mut(job_id)
        .expect("job not in scheduling snapshot");
    let launcher = Arc::new(FakeLauncher::default());
    let lease = ResourceLease::new(vec!["node-1".to_string()]);
    jobs.task_started(locked, task_name, launcher, lease)
        .await
        .expect("task not found")
}
