//! Pod event watcher.
//!
//! Watches Pods and hands every add/update/delete to [`PodEventHandler`],
//! which decides whether the Pod is a GC candidate and starts tracing it.
//! Events whose endpoint lookup fails are retried with Fibonacci backoff.

use crate::backoff::FibonacciBackoff;
use crate::entry::{node_readiness, PodEntry, TracingPolicy, TracingState};
use crate::error::ControllerError;
use crate::store::PodLivenessStore;
use crate::tracer::Tracer;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use ipam_gateway::ClusterGateway;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum delay between retries of one event.
const MAX_RETRY_BACKOFF_SECS: u64 = 30;
const RETRY_QUEUE_CAPACITY: usize = 1024;

/// A Pod change worth acting on.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Applied(Box<Pod>),
    Deleted { namespace: String, name: String },
}

impl PodEvent {
    fn describe(&self) -> String {
        match self {
            Self::Applied(pod) => format!(
                "{}/{}",
                pod.metadata.namespace.as_deref().unwrap_or("default"),
                pod.metadata.name.as_deref().unwrap_or("<unknown>")
            ),
            Self::Deleted { namespace, name } => format!("{}/{}", namespace, name),
        }
    }
}

/// Turns Pod events into store updates.
pub struct PodEventHandler {
    gateway: Arc<dyn ClusterGateway>,
    store: Arc<PodLivenessStore>,
    tracer: Arc<Tracer>,
    policy: TracingPolicy,
}

impl PodEventHandler {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        store: Arc<PodLivenessStore>,
        tracer: Arc<Tracer>,
        policy: TracingPolicy,
    ) -> Self {
        Self {
            gateway,
            store,
            tracer,
            policy,
        }
    }

    pub async fn handle(&self, event: &PodEvent, now: DateTime<Utc>) -> Result<Option<PodEntry>, ControllerError> {
        match event {
            PodEvent::Applied(pod) => self.handle_apply(pod, now).await,
            PodEvent::Deleted { namespace, name } => self.handle_delete(namespace, name, now).await,
        }
    }

    /// Observes an added or updated Pod; terminating and completed Pods start
    /// tracing for every IP in their endpoint history.
    pub async fn handle_apply(&self, pod: &Pod, now: DateTime<Utc>) -> Result<Option<PodEntry>, ControllerError> {
        let node = node_readiness(self.gateway.as_ref(), pod).await;
        let Some(observed) = PodEntry::observe(pod, &self.policy, node, now) else {
            return Ok(None);
        };
        if !observed.state.is_tracing() {
            return Ok(Some(self.store.apply(observed)?));
        }

        let (namespace, name) = (observed.namespace.clone(), observed.pod_name.clone());
        match self.gateway.list_historical_ips(&namespace, &name).await {
            Ok(history) => Ok(Some(self.tracer.track(observed, &history, now)?)),
            Err(e) if e.is_not_found() => {
                debug!(pod = %format!("{}/{}", namespace, name), "No endpoint, IPs already released");
                self.store.delete(&namespace, &name);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handles a deleted Pod. Only Pods already in the store are considered;
    /// the sweeper catches the rest.
    pub async fn handle_delete(
        &self,
        namespace: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PodEntry>, ControllerError> {
        let Ok(entry) = self.store.get(namespace, name) else {
            return Ok(None);
        };
        if entry.state == TracingState::Released {
            return Ok(None);
        }

        match self.gateway.list_historical_ips(namespace, name).await {
            Ok(history) => Ok(Some(self.tracer.track(entry, &history, now)?)),
            Err(e) if e.is_not_found() => {
                debug!(pod = %format!("{}/{}", namespace, name), "Endpoint gone, forgetting pod");
                self.store.delete(namespace, name);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Watches Pods and feeds [`PodEventHandler`].
pub struct PodEventWatcher {
    handler: Arc<PodEventHandler>,
    max_retries: u32,
}

impl PodEventWatcher {
    pub fn new(handler: Arc<PodEventHandler>, max_retries: u32) -> Self {
        Self { handler, max_retries }
    }

    /// Runs until the token is cancelled. Returns an error if the watch
    /// stream ends.
    pub async fn run(self, api: Api<Pod>, token: CancellationToken) -> Result<(), ControllerError> {
        info!("Starting Pod watcher");

        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
        let (retry_tx, mut retry_rx) = mpsc::channel::<(PodEvent, u32)>(RETRY_QUEUE_CAPACITY);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Pod watcher stopped");
                    return Ok(());
                }
                Some((event, attempt)) = retry_rx.recv() => {
                    self.process(event, attempt, &retry_tx, &token).await;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod))) => {
                            self.process(PodEvent::Applied(Box::new(pod)), 0, &retry_tx, &token).await;
                        }
                        Some(Ok(watcher::Event::Delete(pod))) => {
                            let event = PodEvent::Deleted {
                                namespace: pod.metadata.namespace.unwrap_or_default(),
                                name: pod.metadata.name.unwrap_or_default(),
                            };
                            self.process(event, 0, &retry_tx, &token).await;
                        }
                        Some(Ok(watcher::Event::Init)) => debug!("Pod watcher initializing"),
                        Some(Ok(watcher::Event::InitDone)) => info!("Pod watcher initialization complete"),
                        Some(Err(e)) => warn!(error = %e, "Pod watch error, backing off"),
                        None => return Err(ControllerError::Watch("Pod watch stream ended".to_string())),
                    }
                }
            }
        }
    }

    async fn process(
        &self,
        event: PodEvent,
        attempt: u32,
        retry_tx: &mpsc::Sender<(PodEvent, u32)>,
        token: &CancellationToken,
    ) {
        let e = match self.handler.handle(&event, Utc::now()).await {
            Ok(_) => return,
            Err(e) => e,
        };

        let pod = event.describe();
        if !e.is_transient() || attempt >= self.max_retries {
            error!(
                pod = %pod,
                attempt,
                error = %e,
                "Giving up on pod event, the next sweep will reconcile it"
            );
            return;
        }

        let delay = FibonacciBackoff::calculate_for_error_count(attempt, 1, MAX_RETRY_BACKOFF_SECS);
        warn!(pod = %pod, attempt, delay = ?delay, error = %e, "Pod event failed, retrying");
        let retry_tx = retry_tx.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if retry_tx.try_send((event, attempt + 1)).is_err() {
                        warn!(pod = %pod, "Retry queue full, dropping pod event");
                    }
                }
            }
        });
    }
}
