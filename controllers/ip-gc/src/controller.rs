//! Main controller implementation.
//!
//! [`GcEngine`] wires the store, tracer, sweeper and release workers around
//! one gateway and one leader gate. [`Controller`] builds the engine from the
//! process configuration and runs it next to the Pod watcher, the lease
//! elector and the probe server.

use crate::config::GcConfig;
use crate::entry::PodEntry;
use crate::error::ControllerError;
use crate::health::{HealthReport, LoopHeartbeat};
use crate::leader::{LeaderGate, LeaseLeaderGate, StaticLeader};
use crate::probes::{self, ProbeState};
use crate::release::{release_channel, ReleaseExecutor, ReleaseExecutorPool, ReleaseRequest};
use crate::store::PodLivenessStore;
use crate::sweeper::{sweep_trigger, ClusterSweeper, SweepTrigger};
use crate::tracer::Tracer;
use crate::watcher::{PodEventHandler, PodEventWatcher};
use chrono::Utc;
use ipam_gateway::{ClusterGateway, KubeGateway};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type EngineReceivers = (mpsc::Receiver<ReleaseRequest>, mpsc::Receiver<()>);

/// The IP garbage collection engine.
pub struct GcEngine {
    config: GcConfig,
    leader: Arc<dyn LeaderGate>,
    store: Arc<PodLivenessStore>,
    tracer: Arc<Tracer>,
    sweeper: Arc<ClusterSweeper>,
    handler: Arc<PodEventHandler>,
    executor: Arc<ReleaseExecutor>,
    sweep_trigger: SweepTrigger,
    receivers: Mutex<Option<EngineReceivers>>,
    started: AtomicBool,
}

impl GcEngine {
    pub fn new(config: GcConfig, gateway: Arc<dyn ClusterGateway>, leader: Arc<dyn LeaderGate>) -> Self {
        let store = Arc::new(PodLivenessStore::new(config.max_tracked_pods));
        let (releases, release_rx) = release_channel(config.signal_channel_buffer, config.signal_timeout);
        let (sweep_trigger, trigger_rx) = sweep_trigger();
        let policy = config.tracing_policy();

        let tracer = Arc::new(Tracer::new(
            store.clone(),
            releases.clone(),
            leader.clone(),
            config.trace_interval,
        ));
        let sweeper = Arc::new(ClusterSweeper::new(
            gateway.clone(),
            store.clone(),
            leader.clone(),
            releases,
            policy.clone(),
            config.stateful_set_enabled,
            config.default_sweep_interval,
        ));
        let handler = Arc::new(PodEventHandler::new(gateway.clone(), store.clone(), tracer.clone(), policy));
        let executor = Arc::new(ReleaseExecutor::new(gateway, leader.clone()));

        Self {
            config,
            leader,
            store,
            tracer,
            sweeper,
            handler,
            executor,
            sweep_trigger,
            receivers: Mutex::new(Some((release_rx, trigger_rx))),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the tracer, the sweeper and the release workers.
    pub fn start(&self, token: CancellationToken) -> Result<Vec<JoinHandle<()>>, ControllerError> {
        let (release_rx, trigger_rx) = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ControllerError::InvalidConfig("GC engine already started".to_string()))?;

        info!(
            workers = self.config.release_workers,
            trace_interval = ?self.config.trace_interval,
            sweep_interval = ?self.config.default_sweep_interval,
            "Starting IP GC engine"
        );

        let mut tasks =
            ReleaseExecutorPool::new(self.executor.clone(), self.config.release_workers).spawn(release_rx, token.clone());

        let tracer = self.tracer.clone();
        let tracer_token = token.clone();
        tasks.push(tokio::spawn(async move { tracer.run(tracer_token).await }));

        let sweeper = self.sweeper.clone();
        tasks.push(tokio::spawn(async move { sweeper.run(trigger_rx, token).await }));

        self.started.store(true, Ordering::Release);
        Ok(tasks)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Watcher feeding this engine.
    pub fn watcher(&self) -> PodEventWatcher {
        PodEventWatcher::new(self.handler.clone(), self.config.watcher_max_retries)
    }

    /// Requests a sweep outside the schedule. Returns false when one is
    /// already pending.
    pub fn trigger_sweep_now(&self) -> bool {
        let queued = self.sweep_trigger.trigger();
        info!(queued, "Manual sweep requested");
        queued
    }

    pub fn list_tracked_pods(&self) -> Vec<PodEntry> {
        self.store.list()
    }

    pub fn store(&self) -> Arc<PodLivenessStore> {
        self.store.clone()
    }

    pub fn health(&self) -> HealthReport {
        let now = Utc::now();
        let heartbeats: [Arc<LoopHeartbeat>; 2] = [self.tracer.heartbeat(), self.sweeper.heartbeat()];
        let loops: Vec<_> = heartbeats.iter().map(|h| h.status(now)).collect();
        HealthReport {
            healthy: loops.iter().all(|l| l.healthy),
            gc_enabled: true,
            leader: self.leader.is_leader(),
            tracked_pods: self.store.len(),
            loops,
        }
    }
}

/// Main controller for IP garbage collection.
pub struct Controller {
    token: CancellationToken,
    pod_watcher: JoinHandle<Result<(), ControllerError>>,
    probe_server: JoinHandle<Result<(), ControllerError>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: GcConfig, token: CancellationToken) -> Result<Self, ControllerError> {
        info!("Initializing IP GC Controller");

        let listener = TcpListener::bind(config.probe_bind_address).await?;

        if !config.enabled {
            warn!("IP garbage collection is disabled, serving probes only");
            let probe_server = tokio::spawn(probes::serve(listener, ProbeState::default(), token.clone()));
            let idle = token.clone();
            let pod_watcher = tokio::spawn(async move {
                idle.cancelled().await;
                Ok(())
            });
            return Ok(Self {
                token,
                pod_watcher,
                probe_server,
                tasks: Vec::new(),
            });
        }

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;
        let gateway: Arc<dyn ClusterGateway> = Arc::new(KubeGateway::new(kube_client.clone()));

        let mut tasks = Vec::new();
        let leader: Arc<dyn LeaderGate> = if config.leader.enabled {
            let gate = Arc::new(LeaseLeaderGate::new(kube_client.clone(), config.leader.clone()));
            let elector = gate.clone();
            let elector_token = token.clone();
            tasks.push(tokio::spawn(async move { elector.run(elector_token).await }));
            gate
        } else {
            info!("Leader election disabled, acting as leader");
            Arc::new(StaticLeader::new(true))
        };

        let engine = Arc::new(GcEngine::new(config.clone(), gateway, leader));
        tasks.extend(engine.start(token.clone())?);

        let pods: Api<Pod> = match config.watch_namespace.as_deref() {
            Some(namespace) => Api::namespaced(kube_client, namespace),
            None => Api::all(kube_client),
        };
        let pod_watcher = tokio::spawn(engine.watcher().run(pods, token.clone()));
        let probe_server = tokio::spawn(probes::serve(listener, ProbeState::new(Some(engine)), token.clone()));

        Ok(Self {
            token,
            pod_watcher,
            probe_server,
            tasks,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("IP GC Controller running");

        let result = tokio::select! {
            _ = self.token.cancelled() => Ok(()),
            result = &mut self.pod_watcher => {
                result.unwrap_or_else(|e| Err(ControllerError::Watch(format!("Pod watcher panicked: {}", e))))
            }
            result = &mut self.probe_server => {
                result.unwrap_or_else(|e| Err(ControllerError::Watch(format!("Probe server panicked: {}", e))))
            }
        };
        if let Err(e) = &result {
            error!(error = %e, "Controller task failed, shutting down");
        }

        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }
        info!("IP GC Controller stopped");
        result
    }
}
