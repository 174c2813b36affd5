//! Task that owns the [`IrrigationController`].
//!
//! Sensor loop, command dispatch and the safety timer all reach the state
//! machine through one bounded queue, so transitions are serialised without
//! a lock. The task sleeps until the armed deadline when nothing else
//! arrives.

use std::future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::{self, ConfigStore};
use crate::error::{Error, Result};
use crate::irrigation::{
    Actuator, IrrigationConfig, IrrigationController, StatusSnapshot, Transition,
};
use crate::sensor::SensorReading;

/// Capacity of the request queue.
pub const QUEUE_DEPTH: usize = 16;

#[derive(Debug)]
enum Op {
    CheckConditions(SensorReading),
    StartManual(Option<u32>),
    Stop,
    Pause,
    Resume,
    Fault(String),
    Reset,
}

#[derive(Debug)]
enum Request {
    Transition(Op, oneshot::Sender<Result<Transition>>),
    SetConfig(IrrigationConfig, oneshot::Sender<Result<()>>),
    ResetConfig(oneshot::Sender<Result<IrrigationConfig>>),
    Snapshot(oneshot::Sender<StatusSnapshot>),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Request>,
}

impl ControllerHandle {
    pub async fn check_conditions(&self, reading: SensorReading) -> Result<Transition> {
        self.transition(Op::CheckConditions(reading)).await
    }

    pub async fn start_manual(&self, duration_secs: Option<u32>) -> Result<Transition> {
        self.transition(Op::StartManual(duration_secs)).await
    }

    pub async fn stop(&self) -> Result<Transition> {
        self.transition(Op::Stop).await
    }

    pub async fn pause(&self) -> Result<Transition> {
        self.transition(Op::Pause).await
    }

    pub async fn resume(&self) -> Result<Transition> {
        self.transition(Op::Resume).await
    }

    pub async fn fault(&self, reason: impl Into<String>) -> Result<Transition> {
        self.transition(Op::Fault(reason.into())).await
    }

    pub async fn reset(&self) -> Result<Transition> {
        self.transition(Op::Reset).await
    }

    pub async fn set_config(&self, config: IrrigationConfig) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::SetConfig(config, reply)).await?;
        rx.await.map_err(|_| Error::ControllerClosed)?
    }

    /// Persist the stock config and apply it. Returns what is now in force.
    pub async fn reset_config(&self) -> Result<IrrigationConfig> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::ResetConfig(reply)).await?;
        rx.await.map_err(|_| Error::ControllerClosed)?
    }

    pub async fn snapshot(&self) -> Result<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Snapshot(reply)).await?;
        rx.await.map_err(|_| Error::ControllerClosed)
    }

    pub async fn config(&self) -> Result<IrrigationConfig> {
        Ok(self.snapshot().await?.config)
    }

    async fn transition(&self, op: Op) -> Result<Transition> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Transition(op, reply)).await?;
        rx.await.map_err(|_| Error::ControllerClosed)?
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::ControllerClosed)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Spawn the controller task. It runs until every handle is dropped, then
/// drives the outputs off.
pub fn spawn<A, C>(controller: IrrigationController<A>, store: C) -> (ControllerHandle, JoinHandle<()>)
where
    A: Actuator + 'static,
    C: ConfigStore + 'static,
{
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let task = tokio::spawn(run(controller, store, rx));
    (ControllerHandle { tx }, task)
}

async fn run<A: Actuator, C: ConfigStore>(
    mut controller: IrrigationController<A>,
    mut store: C,
    mut rx: mpsc::Receiver<Request>,
) {
    info!(state = %controller.state(), "irrigation controller started");

    loop {
        let deadline = controller.deadline();
        tokio::select! {
            request = rx.recv() => match request {
                Some(request) => handle(&mut controller, &mut store, request),
                None => break,
            },
            _ = sleep_until_armed(deadline) => {
                if let Err(e) = controller.tick(Instant::now()) {
                    warn!(error = %e, "safety stop failed");
                }
            }
        }
    }

    if let Err(e) = controller.stop(Instant::now()) {
        warn!(error = %e, "stop on shutdown failed");
    }
    info!("irrigation controller stopped");
}

async fn sleep_until_armed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

fn handle<A: Actuator, C: ConfigStore>(
    controller: &mut IrrigationController<A>,
    store: &mut C,
    request: Request,
) {
    let now = Instant::now();
    match request {
        Request::Transition(op, reply) => {
            debug!(op = ?op, "controller request");
            let result = match op {
                Op::CheckConditions(reading) => controller.check_conditions(&reading, now),
                Op::StartManual(duration) => controller.start_manual(duration, now),
                Op::Stop => controller.stop(now),
                Op::Pause => controller.pause(now),
                Op::Resume => controller.resume(now),
                Op::Fault(reason) => Ok(controller.fault(reason, now)),
                Op::Reset => controller.reset(now),
            };
            // Caller may have given up waiting; the transition stands.
            let _ = reply.send(result);
        }
        Request::SetConfig(config, reply) => {
            let result = controller.set_config(config);
            if result.is_ok() && !store.save(controller.config()) {
                warn!("irrigation config applied but not persisted");
            }
            let _ = reply.send(result);
        }
        Request::ResetConfig(reply) => {
            let defaults = config::reset_to_defaults(store);
            let result = controller
                .set_config(defaults)
                .map(|()| controller.config().clone());
            info!("irrigation config reset to defaults");
            let _ = reply.send(result);
        }
        Request::Snapshot(reply) => {
            let _ = reply.send(controller.snapshot(now));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfigStore, MemoryConfigStore};
    use crate::irrigation::{IrrigationState, RecordingActuator};
    use std::time::Duration;

    fn spawn_default() -> ControllerHandle {
        let ctl = IrrigationController::new(IrrigationConfig::default(), RecordingActuator::default());
        spawn(ctl, MemoryConfigStore::default()).0
    }

    fn dry() -> SensorReading {
        SensorReading {
            soil_moisture: 29.0,
            ..SensorReading::default()
        }
    }

    // -- Safety timer -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn safety_timer_fires_inside_task() {
        let handle = spawn_default();
        let t = handle.start_manual(Some(120)).await.unwrap();
        assert_eq!(t, Transition::Started { duration_secs: 120 });

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert_eq!(handle.snapshot().await.unwrap().state, IrrigationState::Watering);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, IrrigationState::Idle);
        assert_eq!(snap.cycle_count, 1);
        assert_eq!(snap.total_watering_secs, 120);

        // Explicit stop racing the timer is harmless.
        assert_eq!(handle.stop().await.unwrap(), Transition::None);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_trigger_then_pause_resume() {
        let handle = spawn_default();
        assert!(matches!(
            handle.check_conditions(dry()).await.unwrap(),
            Transition::Started { duration_secs: 600 }
        ));

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(
            handle.pause().await.unwrap(),
            Transition::Paused { remaining_secs: 500 }
        );

        // Paused: the deadline is disarmed, so nothing fires.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(handle.snapshot().await.unwrap().state, IrrigationState::Paused);

        assert_eq!(
            handle.resume().await.unwrap(),
            Transition::Resumed { remaining_secs: 500 }
        );
        tokio::time::sleep(Duration::from_secs(501)).await;
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, IrrigationState::Idle);
        assert_eq!(snap.total_watering_secs, 600);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_come_back_through_handle() {
        let handle = spawn_default();
        assert!(matches!(handle.pause().await, Err(Error::Command(_))));
        assert_eq!(handle.snapshot().await.unwrap().state, IrrigationState::Idle);
    }

    // -- Config -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn accepted_config_is_persisted() {
        let path = std::env::temp_dir().join(format!(
            "irrigation-controller-{}.toml",
            std::process::id()
        ));
        let ctl = IrrigationController::new(IrrigationConfig::default(), RecordingActuator::default());
        let (handle, _task) = spawn(ctl, FileConfigStore::new(&path));

        let cfg = IrrigationConfig {
            soil_moisture_threshold: 50.0,
            ..IrrigationConfig::default()
        };
        handle.set_config(cfg.clone()).await.unwrap();
        assert_eq!(handle.config().await.unwrap(), cfg);
        assert_eq!(FileConfigStore::new(&path).load().unwrap(), cfg);

        let bad = IrrigationConfig {
            duration_secs: 0,
            ..IrrigationConfig::default()
        };
        assert!(matches!(handle.set_config(bad).await, Err(Error::Config(_))));
        assert_eq!(handle.config().await.unwrap(), cfg);
        assert_eq!(FileConfigStore::new(&path).load().unwrap(), cfg);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_config_restores_and_persists_defaults() {
        let path = std::env::temp_dir().join(format!(
            "irrigation-controller-reset-{}.toml",
            std::process::id()
        ));
        let tuned = IrrigationConfig {
            soil_moisture_threshold: 42.0,
            auto_mode: false,
            ..IrrigationConfig::default()
        };
        let mut store = FileConfigStore::new(&path);
        assert!(store.save(&tuned));
        let ctl = IrrigationController::new(tuned, RecordingActuator::default());
        let (handle, _task) = spawn(ctl, store);

        assert_eq!(handle.reset_config().await.unwrap(), IrrigationConfig::default());
        assert_eq!(handle.config().await.unwrap(), IrrigationConfig::default());
        assert_eq!(FileConfigStore::new(&path).load().unwrap(), IrrigationConfig::default());
        let _ = std::fs::remove_file(&path);
    }

    // -- Lifecycle ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn dropping_handles_stops_watering() {
        let ctl = IrrigationController::new(IrrigationConfig::default(), RecordingActuator::default());
        let (handle, task) = spawn(ctl, MemoryConfigStore::default());
        handle.start_manual(None).await.unwrap();
        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fault_and_reset() {
        let handle = spawn_default();
        handle.start_manual(None).await.unwrap();
        assert_eq!(handle.fault("dry run").await.unwrap(), Transition::Faulted);
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, IrrigationState::Error);
        assert_eq!(snap.fault.as_deref(), Some("dry run"));
        assert!(matches!(handle.start_manual(None).await, Err(Error::Command(_))));
        assert_eq!(handle.reset().await.unwrap(), Transition::Reset);
        assert_eq!(
            handle.start_manual(Some(5)).await.unwrap(),
            Transition::Started { duration_secs: 5 }
        );
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(handle.stop().await.unwrap(), Transition::None);
    }
}
