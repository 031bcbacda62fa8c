//! The size-based elastic scheduler.
//!
//! One thread runs the placement loop, a second one redistributes core
//! slack, and every termination spawns a short-lived worker. The two loop
//! threads talk through channels; the queues live behind one mutex.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use zoe_definitions::state::{
    BackendStatus, Execution, ExecutionFilter, ExecutionStatus, ServiceFilter, StateStore,
};
use zoe_definitions::Config;

use super::simulated_platform::SimulatedPlatform;
use crate::backends::interface::{self, StartResult};
use crate::backends::ContainerBackend;
use crate::{Error, Result};

/// Idle wakeups before the scheduler triggers itself, to recover from
/// platform resources changing outside its control
pub const SELF_TRIGGER_TIMEOUT: u32 = 60;

/// Queue ordering policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    Fifo,
    Size,
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Policy> {
        match s.to_ascii_uppercase().as_str() {
            "FIFO" => Ok(Policy::Fifo),
            "SIZE" => Ok(Policy::Size),
            other => bail!("unsupported scheduler policy '{}'", other),
        }
    }
}

/// Whether a candidate placement improved utilization enough to keep going
///
/// The walk over candidates stops at the first one that does not shrink the
/// aggregate free memory.
pub type PlacementGate = fn(current_free: i64, previous_free: i64) -> bool;

fn default_placement_gate(current_free: i64, previous_free: i64) -> bool {
    current_free < previous_free
}

/// Scheduler-side progress bookkeeping for one pending execution
#[derive(Default, Debug)]
struct ExecutionProgress {
    last_time_scheduled: Option<Instant>,
    progress_sequence: Vec<f64>,
}

/// One observed interval, as a fraction of the predicted remaining run time
fn progress_tick(elapsed: f64, services_count: f64, running_count: f64, size: f64) -> f64 {
    elapsed / ((services_count / running_count) * size)
}

/// The refreshed execution size given total observed progress
fn remaining_size(progress: f64, services_count: f64, original_unit: f64) -> f64 {
    (1.0 - progress.min(1.0)) * services_count * original_unit
}

/// SIZE policy ordering, smallest expected remaining time first
fn sort_by_size(queue: &mut [Execution]) {
    queue.sort_by(|a, b| a.size.partial_cmp(&b.size).unwrap_or(CmpOrdering::Equal));
}

struct Queues {
    queue: Vec<Execution>,
    queue_running: Vec<Execution>,
    progress: HashMap<i32, ExecutionProgress>,
}

/// Point-in-time view of the scheduler state
#[derive(Serialize, Debug)]
pub struct SchedulerStats {
    pub queue_length: usize,
    pub running_length: usize,
    pub termination_threads_count: usize,
    pub queue: Vec<i32>,
    pub running_queue: Vec<i32>,
}

struct SchedulerCore {
    state: Arc<StateStore>,
    config: Config,
    backend: Arc<dyn ContainerBackend>,
    policy: Policy,
    placement_gate: PlacementGate,
    queues: Mutex<Queues>,
    quit: AtomicBool,
    trigger_tx: Mutex<Sender<()>>,
    rebalance_tx: Mutex<Sender<()>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

enum LaunchOutcome {
    /// Fatal failure, the execution is gone
    Dropped,
    /// Transient failure, pushed back at the head of the queue
    Requeued,
    /// Everything is up, moved to the running queue
    Promoted,
    /// Essentials up but elastic capacity still pending
    Kept,
}

/// The scheduler for size-based scheduling; policy is FIFO or SIZE
pub struct ElasticScheduler {
    core: Arc<SchedulerCore>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    core_limit_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ElasticScheduler {
    pub fn new(state: Arc<StateStore>, backend: Arc<dyn ContainerBackend>, config: Config) -> Result<ElasticScheduler> {
        Self::with_placement_gate(state, backend, config, default_placement_gate)
    }

    pub fn with_placement_gate(
        state: Arc<StateStore>,
        backend: Arc<dyn ContainerBackend>,
        config: Config,
        placement_gate: PlacementGate,
    ) -> Result<ElasticScheduler> {
        let policy: Policy = config.scheduler_policy.parse()?;
        let (trigger_tx, trigger_rx) = channel();
        let (rebalance_tx, rebalance_rx) = channel();

        let mut queues = Queues {
            queue: Vec::new(),
            queue_running: Vec::new(),
            progress: HashMap::new(),
        };
        // pick up the executions that were running before a restart
        for execution in state.executions().select(&ExecutionFilter {
            status: Some(ExecutionStatus::Running),
            ..ExecutionFilter::default()
        })? {
            if execution.all_services_active(&state)? {
                queues.queue_running.push(execution);
            } else {
                queues.progress.insert(execution.id, ExecutionProgress::default());
                queues.queue.push(execution);
            }
        }

        let core = Arc::new(SchedulerCore {
            state,
            config,
            backend,
            policy,
            placement_gate,
            queues: Mutex::new(queues),
            quit: AtomicBool::new(false),
            trigger_tx: Mutex::new(trigger_tx),
            rebalance_tx: Mutex::new(rebalance_tx),
            workers: Mutex::new(Vec::new()),
        });

        let loop_core = Arc::clone(&core);
        let loop_handle = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || loop_core.scheduler_loop(trigger_rx))?;
        let limit_core = Arc::clone(&core);
        let core_limit_handle = thread::Builder::new()
            .name("adjust_core_limits".to_string())
            .spawn(move || limit_core.core_limit_loop(rebalance_rx))?;

        Ok(ElasticScheduler {
            core,
            loop_handle: Mutex::new(Some(loop_handle)),
            core_limit_handle: Mutex::new(Some(core_limit_handle)),
        })
    }

    /// Trigger a scheduler run
    pub fn trigger(&self) {
        self.core.trigger();
    }

    /// Add an execution at the end of the queue and trigger the scheduler
    pub fn incoming(&self, mut execution: Execution) -> Result<()> {
        execution.set_scheduled(&self.core.state)?;
        {
            let mut q = self.core.queues.lock().unwrap();
            q.progress.insert(execution.id, ExecutionProgress::default());
            q.queue.push(execution);
        }
        self.core.trigger();
        Ok(())
    }

    /// Tear an execution down asynchronously
    pub fn terminate(&self, execution: &Execution) {
        {
            let mut q = self.core.queues.lock().unwrap();
            let found_pending = remove_by_id(&mut q.queue, execution.id);
            let found_running = remove_by_id(&mut q.queue_running, execution.id);
            if !found_pending && !found_running {
                debug!("Execution {} is not queued, terminating it anyway", execution.id);
            }
            q.progress.remove(&execution.id);
        }
        self.core.signal_rebalance();

        let core = Arc::clone(&self.core);
        let mut target = execution.clone();
        let spawned = thread::Builder::new()
            .name(format!("termination_{}", execution.id))
            .spawn(move || {
                target.termination_lock.acquire();
                let result =
                    interface::terminate_execution(&core.state, &core.backend, &mut target);
                target.termination_lock.release();
                match result {
                    Ok(()) => {
                        debug!("Execution {} terminated successfully", target.id);
                        core.trigger();
                    }
                    Err(e) => error!("Error in termination thread: {}", e),
                }
            });
        match spawned {
            Ok(handle) => self.core.workers.lock().unwrap().push(handle),
            Err(e) => error!("Cannot spawn a termination worker: {}", e),
        }
    }

    /// Scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let q = self.core.queues.lock().unwrap();
        let mut queue_ids: Vec<i32> = q.queue.iter().map(|e| e.id).collect();
        if self.core.policy == Policy::Size {
            let mut sorted: Vec<(i32, f64)> = q.queue.iter().map(|e| (e.id, e.size)).collect();
            sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(CmpOrdering::Equal));
            queue_ids = sorted.into_iter().map(|(id, _)| id).collect();
        }
        SchedulerStats {
            queue_length: q.queue.len(),
            running_length: q.queue_running.len(),
            termination_threads_count: self.core.workers.lock().unwrap().len(),
            queue: queue_ids,
            running_queue: q.queue_running.iter().map(|e| e.id).collect(),
        }
    }

    /// Stop both loop threads and drain what termination workers finished
    pub fn quit(&self) {
        self.core.quit.store(true, Ordering::Relaxed);
        self.core.trigger();
        self.core.signal_rebalance();
        if let Some(handle) = self.loop_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.core_limit_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut workers = self.core.workers.lock().unwrap();
        for handle in workers.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("Abandoning a termination worker still in flight");
            }
        }
    }

    /// Block until the scheduler loop exits
    pub fn wait(&self) {
        if let Some(handle) = self.loop_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn remove_by_id(queue: &mut Vec<Execution>, id: i32) -> bool {
    match queue.iter().position(|e| e.id == id) {
        Some(index) => {
            queue.remove(index);
            true
        }
        None => false,
    }
}

impl SchedulerCore {
    fn trigger(&self) {
        let _ = self.trigger_tx.lock().unwrap().send(());
    }

    fn signal_rebalance(&self) {
        let _ = self.rebalance_tx.lock().unwrap().send(());
    }

    fn reap_workers(&self) {
        let mut workers = self.workers.lock().unwrap();
        let mut alive = Vec::new();
        for handle in workers.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                alive.push(handle);
            }
        }
        *workers = alive;
    }

    fn scheduler_loop(&self, trigger_rx: Receiver<()>) {
        let mut auto_trigger = SELF_TRIGGER_TIMEOUT;
        loop {
            match trigger_rx.recv_timeout(Duration::from_secs(1)) {
                Err(RecvTimeoutError::Timeout) => {
                    self.reap_workers();
                    auto_trigger -= 1;
                    if auto_trigger == 0 {
                        auto_trigger = SELF_TRIGGER_TIMEOUT;
                        self.trigger();
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Ok(()) => {}
            }
            if self.quit.load(Ordering::Relaxed) {
                break;
            }
            if self.queues.lock().unwrap().queue.is_empty() {
                debug!("Scheduler loop has been triggered, but the queue is empty");
                self.signal_rebalance();
                continue;
            }
            debug!("Scheduler loop has been triggered");
            if let Err(e) = self.inner_loop() {
                error!("Unmanaged error in the scheduler loop: {}", e);
            }
        }
        debug!("Scheduler thread terminated");
    }

    /// Runs until no new execution can be started or the queue is empty
    fn inner_loop(&self) -> Result<()> {
        loop {
            self.refresh_execution_sizes()?;
            if self.policy == Policy::Size {
                sort_by_size(&mut self.queues.lock().unwrap().queue);
            }

            let mut candidates = self.pop_candidates();
            if candidates.is_empty() {
                break;
            }
            debug!(
                "Scheduler inner loop, executions to attempt scheduling: {:?}",
                candidates.iter().map(|j| j.id).collect::<Vec<_>>()
            );

            let snapshot = match interface::get_platform_state(self.backend.as_ref()) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!("Cannot retrieve platform state, cannot schedule: {}", e);
                    self.requeue_candidates(candidates);
                    break;
                }
            };

            // fetch the services of every candidate once for this round
            let mut services = Vec::with_capacity(candidates.len());
            let mut fetch_failed = false;
            for job in &candidates {
                match job.services(&self.state) {
                    Ok(list) => services.push(list),
                    Err(e) => {
                        error!("Cannot read the services of execution {}: {}", job.id, e);
                        fetch_failed = true;
                        break;
                    }
                }
            }
            if fetch_failed {
                self.requeue_candidates(candidates);
                break;
            }

            let mut sim = SimulatedPlatform::new(&snapshot);
            let mut to_launch: Vec<usize> = Vec::new();
            let mut free_resources = sim.aggregated_free_memory();

            // find a placement solution on the snapshot, candidate by candidate
            for idx in 0..candidates.len() {
                let to_launch_checkpoint = to_launch.clone();

                // elastic services from the previous iteration would skew the fit
                for &launched in &to_launch {
                    sim.deallocate_elastic(&candidates[launched]);
                }

                let job = &candidates[idx];
                let mut job_can_start = false;
                if !job.is_running() {
                    job_can_start = sim.allocate_essential(job, &services[idx]);
                }
                if job_can_start || job.is_running() {
                    to_launch.push(idx);
                }

                for &launched in &to_launch {
                    sim.allocate_elastic(&candidates[launched], &services[launched]);
                }

                let current_free = sim.aggregated_free_memory();
                if !(self.placement_gate)(current_free, free_resources) {
                    // adding this candidate did not improve utilization
                    to_launch = to_launch_checkpoint;
                    break;
                }
                free_resources = current_free;
            }

            let placements = sim.get_service_allocation();
            debug!("Allocation after simulation: {:?}", placements);

            let launched_any = !to_launch.is_empty();
            let mut consumed = vec![false; candidates.len()];
            for &idx in &to_launch {
                let job = &mut candidates[idx];
                match self.launch(job, &placements) {
                    Ok(LaunchOutcome::Kept) => {}
                    Ok(LaunchOutcome::Dropped) | Ok(LaunchOutcome::Requeued) | Ok(LaunchOutcome::Promoted) => {
                        consumed[idx] = true;
                    }
                    Err(e) => {
                        error!("Error while launching execution {}: {}", job.id, e);
                    }
                }
            }

            self.signal_rebalance();

            // whoever was not consumed goes back to the head of the queue
            let leftovers: Vec<Execution> = candidates
                .into_iter()
                .zip(consumed)
                .filter(|(_, used)| !used)
                .map(|(job, _)| {
                    job.termination_lock.release();
                    job
                })
                .collect();
            let queue_empty = {
                let mut q = self.queues.lock().unwrap();
                let mut rebuilt = leftovers;
                rebuilt.extend(q.queue.drain(..));
                q.queue = rebuilt;
                q.queue.is_empty()
            };

            if queue_empty {
                debug!("empty queue, exiting inner loop");
                break;
            }
            if !launched_any {
                debug!("No executions could be started, exiting inner loop");
                break;
            }
        }
        Ok(())
    }

    /// Materialize the simulated placement of one execution
    fn launch(&self, job: &mut Execution, placements: &HashMap<i32, String>) -> Result<LaunchOutcome> {
        if !job.essential_services_running(&self.state)? {
            match interface::start_essential(&self.state, self.backend.as_ref(), &self.config, job, placements)? {
                StartResult::Fatal => {
                    job.termination_lock.release();
                    self.queues.lock().unwrap().progress.remove(&job.id);
                    return Ok(LaunchOutcome::Dropped);
                }
                StartResult::Requeue => {
                    job.termination_lock.release();
                    self.queues.lock().unwrap().queue.insert(0, job.clone());
                    return Ok(LaunchOutcome::Requeued);
                }
                StartResult::Ok => {
                    job.set_running(&self.state)?;
                }
            }
        }
        interface::start_elastic(&self.state, self.backend.as_ref(), &self.config, job, placements)?;

        if job.all_services_active(&self.state)? {
            debug!("execution {}: all services are active", job.id);
            job.termination_lock.release();
            self.queues.lock().unwrap().queue_running.push(job.clone());
            return Ok(LaunchOutcome::Promoted);
        }
        Ok(LaunchOutcome::Kept)
    }

    /// Pop the whole queue, keeping only lock-free, still-live executions
    fn pop_candidates(&self) -> Vec<Execution> {
        let drained: Vec<Execution> = {
            let mut q = self.queues.lock().unwrap();
            q.queue.drain(..).collect()
        };
        let mut out = Vec::new();
        for job in drained {
            if !job.termination_lock.try_acquire() {
                debug!(
                    "While popping, throwing away execution {} that has the termination lock held",
                    job.id
                );
                continue;
            }
            // the status may have moved while the execution sat in the queue
            match self.state.executions().get(job.id) {
                Ok(Some(fresh)) if !fresh.status.is_terminal() => out.push(fresh),
                Ok(_) => {
                    debug!("While popping, throwing away terminated execution {}", job.id);
                    job.termination_lock.release();
                    self.queues.lock().unwrap().progress.remove(&job.id);
                }
                Err(e) => {
                    warn!("Cannot refresh execution {}, keeping it queued: {}", job.id, e);
                    job.termination_lock.release();
                    self.queues.lock().unwrap().queue.push(job);
                }
            }
        }
        out
    }

    fn requeue_candidates(&self, candidates: Vec<Execution>) {
        let mut q = self.queues.lock().unwrap();
        let mut rebuilt: Vec<Execution> = candidates
            .into_iter()
            .map(|job| {
                job.termination_lock.release();
                job
            })
            .collect();
        rebuilt.extend(q.queue.drain(..));
        q.queue = rebuilt;
    }

    /// Refresh every pending execution's size from its observed progress
    fn refresh_execution_sizes(&self) -> Result<()> {
        let mut q = self.queues.lock().unwrap();
        let Queues {
            ref mut queue,
            ref mut progress,
            ..
        } = *q;
        for job in queue.iter_mut() {
            let entry = progress.entry(job.id).or_insert_with(ExecutionProgress::default);
            let services_count = job.services_count() as f64;
            let running = job.running_services_count(&self.state)? as f64;
            if running > 0.0 {
                if let Some(last) = entry.last_time_scheduled {
                    if job.size > 0.0 {
                        entry
                            .progress_sequence
                            .push(progress_tick(last.elapsed().as_secs_f64(), services_count, running, job.size));
                    }
                }
                entry.last_time_scheduled = Some(Instant::now());
            }
            let total: f64 = entry.progress_sequence.iter().sum();
            let new_size = remaining_size(total, services_count, job.original_size_unit());
            if (new_size - job.size).abs() > std::f64::EPSILON {
                self.state.executions().update_size(job.id, new_size)?;
                job.size = new_size;
            }
        }
        Ok(())
    }

    fn core_limit_loop(&self, rebalance_rx: Receiver<()>) {
        loop {
            if rebalance_rx.recv().is_err() {
                break;
            }
            if self.quit.load(Ordering::Relaxed) {
                break;
            }
            // coalesce pending signals into one recalculation
            while rebalance_rx.try_recv().is_ok() {}
            debug!("Updating core limits");
            let started = Instant::now();
            if let Err(e) = self.adjust_core_limits() {
                error!("Cannot adjust core limits: {}", e);
            }
            debug!("Update core limits took {:.2}s", started.elapsed().as_secs_f64());
        }
        debug!("Core limit thread terminated");
    }

    /// Spread each node's spare cores over the services running on it
    ///
    /// Purely additive: allocations never drop below the reservation.
    fn adjust_core_limits(&self) -> Result<()> {
        let stats = interface::get_platform_state(self.backend.as_ref())?;
        for node in &stats.nodes {
            let node_services = self.state.services().select(&ServiceFilter {
                backend_host: Some(node.name.clone()),
                backend_status: Some(BackendStatus::Started),
                ..ServiceFilter::default()
            })?;
            if node_services.is_empty() {
                continue;
            }
            let cores_to_add = if node.cores_reserved < node.cores_total {
                node.free_cores() / node_services.len() as f64
            } else {
                0.0
            };
            for service in &node_services {
                let target = service.reservation().cores.min + cores_to_add;
                if let Err(e) =
                    interface::update_service_resource_limits(self.backend.as_ref(), service, Some(target), None)
                {
                    warn!("Cannot update the core limit of service {}: {}", service.id, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_policy_is_fatal() {
        assert!("FIFO".parse::<Policy>().is_ok());
        assert!("size".parse::<Policy>().is_ok());
        assert!("FAIR".parse::<Policy>().is_err());
    }

    #[test]
    fn progress_shrinks_the_size_of_nearly_done_executions() {
        // five services, all running, size 100: after 50 time units the
        // execution observed half of its predicted run time
        let tick = progress_tick(50.0, 5.0, 5.0, 100.0);
        assert!((tick - 0.5).abs() < 1e-9);
        let refreshed = remaining_size(tick, 5.0, 20.0);
        assert!((refreshed - 50.0).abs() < 1e-9);
    }

    #[test]
    fn progress_is_clamped_to_one() {
        assert_eq!(remaining_size(3.0, 5.0, 20.0), 0.0);
    }

    #[test]
    fn partially_running_executions_progress_slower() {
        // only one service out of four running stretches the prediction
        let full = progress_tick(10.0, 4.0, 4.0, 100.0);
        let partial = progress_tick(10.0, 4.0, 1.0, 100.0);
        assert!(partial < full);
    }

    #[test]
    fn size_policy_orders_smallest_first() {
        fn execution(id: i32, size: f64) -> Execution {
            let description = serde_json::from_str(
                r#"{"name": "app", "version": 1,
                    "processes": [{"name": "p", "docker_image": "i", "required_resources": {"memory": 1}}]}"#,
            )
            .unwrap();
            Execution {
                id,
                name: format!("app-{}", id),
                user_id: 1,
                description,
                status: ExecutionStatus::Queued,
                size,
                error_message: None,
                time_submit: chrono::Utc::now(),
                time_start: None,
                time_end: None,
                termination_lock: zoe_definitions::state::TerminationLock::new(),
            }
        }
        // submitted in the order x(100), y(10), z(50)
        let mut queue = vec![execution(1, 100.0), execution(2, 10.0), execution(3, 50.0)];
        sort_by_size(&mut queue);
        let order: Vec<i32> = queue.iter().map(|e| e.id).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }
}
