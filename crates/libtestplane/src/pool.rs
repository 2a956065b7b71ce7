//! A session: a fixed set of test host proxies sharing one run criteria.
//!
//! Starting a session is all or nothing. Every proxy is set up, the session is
//! registered, and only then can proxies be handed out. Each proxy has at most
//! one holder at a time between [`SessionPool::dequeue_proxy`] and
//! [`SessionPool::enqueue_proxy`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::proxy::TestHostProxy;
use crate::registry::{SessionId, SessionRegistry};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCriteria {
    pub sources: Vec<String>,
    pub run_settings: String,
    /// Upper bound on proxies. `None` means one per source.
    pub max_worker_count: Option<usize>,
}

impl SessionCriteria {
    pub fn worker_count(&self) -> usize {
        let sources = self.sources.len();
        match self.max_worker_count {
            Some(max) if max > 0 => max.min(sources),
            _ => sources,
        }
    }

    /// Drop repeated sources, keeping the first occurrence of each.
    pub fn dedup_sources(&mut self) {
        let mut seen = HashSet::new();
        self.sources.retain(|source| seen.insert(source.clone()));
    }

    /// Sources dealt round-robin over [`worker_count`](Self::worker_count) proxies.
    pub fn batches(&self) -> Vec<Vec<String>> {
        let count = self.worker_count();
        let mut batches = vec![Vec::new(); count];
        for (i, source) in self.sources.iter().enumerate() {
            batches[i % count].push(source.clone());
        }
        batches
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Starting,
    Active,
    StartFailed,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::StartFailed => "start_failed",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAvailability {
    Available,
    InUse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSessionComplete {
    pub session_id: SessionId,
    pub proxy_count: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSessionTelemetry {
    pub session_id: SessionId,
    /// State the session was in when it was stopped.
    pub final_state: SessionState,
    pub elapsed: Duration,
}

pub trait SessionEventsHandler: Send + Sync {
    fn handle_start_session_complete(&self, complete: &StartSessionComplete);
    fn handle_stop_session(&self, telemetry: &StopSessionTelemetry);
}

/// Reports session events through `tracing` only.
pub struct LoggingSessionEvents;

impl SessionEventsHandler for LoggingSessionEvents {
    fn handle_start_session_complete(&self, complete: &StartSessionComplete) {
        info!(
            session_id = %complete.session_id,
            proxies = complete.proxy_count,
            elapsed_ms = complete.elapsed.as_millis() as u64,
            "session started"
        );
    }

    fn handle_stop_session(&self, telemetry: &StopSessionTelemetry) {
        info!(
            session_id = %telemetry.session_id,
            final_state = %telemetry.final_state,
            elapsed_ms = telemetry.elapsed.as_millis() as u64,
            "session stopped"
        );
    }
}

/// A proxy handed out by [`SessionPool::dequeue_proxy`]. Give it back with
/// [`SessionPool::enqueue_proxy`] and the same `index`.
pub struct DequeuedProxy<P> {
    pub index: usize,
    pub proxy: Arc<P>,
}

struct ProxyContainer<P> {
    proxy: Arc<P>,
    sources: Vec<String>,
    availability: ProxyAvailability,
}

struct PoolState<P> {
    lifecycle: SessionState,
    containers: Vec<ProxyContainer<P>>,
    /// Source to index into `containers`.
    source_map: HashMap<String, usize>,
}

type ProxyFactory<P> = Box<dyn Fn() -> P + Send + Sync>;

pub struct SessionPool<P> {
    id: SessionId,
    criteria: SessionCriteria,
    factory: ProxyFactory<P>,
    registry: Arc<SessionRegistry<P>>,
    events: Arc<dyn SessionEventsHandler>,
    created_at: Instant,
    state: Mutex<PoolState<P>>,
}

impl<P: TestHostProxy> SessionPool<P> {
    pub fn new<F>(
        criteria: SessionCriteria,
        factory: F,
        registry: Arc<SessionRegistry<P>>,
        events: Arc<dyn SessionEventsHandler>,
    ) -> Arc<Self>
    where
        F: Fn() -> P + Send + Sync + 'static,
    {
        Self::with_id(SessionId::new(), criteria, factory, registry, events)
    }

    pub fn with_id<F>(
        id: SessionId,
        mut criteria: SessionCriteria,
        factory: F,
        registry: Arc<SessionRegistry<P>>,
        events: Arc<dyn SessionEventsHandler>,
    ) -> Arc<Self>
    where
        F: Fn() -> P + Send + Sync + 'static,
    {
        // A source maps to exactly one proxy.
        criteria.dedup_sources();
        Arc::new(Self {
            id,
            criteria,
            factory: Box::new(factory),
            registry,
            events,
            created_at: Instant::now(),
            state: Mutex::new(PoolState {
                lifecycle: SessionState::Created,
                containers: Vec::new(),
                source_map: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn criteria(&self) -> &SessionCriteria {
        &self.criteria
    }

    pub fn state(&self) -> SessionState {
        self.lock().lifecycle
    }

    pub fn proxy_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn availability(&self, index: usize) -> Option<ProxyAvailability> {
        self.lock().containers.get(index).map(|c| c.availability)
    }

    /// Sources served by the proxy at `index`.
    pub fn sources_of(&self, index: usize) -> Option<Vec<String>> {
        self.lock().containers.get(index).map(|c| c.sources.clone())
    }

    /// Create and set up every proxy, then register the session.
    ///
    /// Runs at most once. On any failure the proxies that were opened are
    /// closed again and nothing is left registered.
    pub async fn start_session(self: &Arc<Self>) -> bool {
        {
            let mut state = self.lock();
            if state.lifecycle != SessionState::Created {
                warn!(session_id = %self.id, state = %state.lifecycle, "session already started");
                return false;
            }
            state.lifecycle = SessionState::Starting;
        }

        let started = Instant::now();
        let batches = self.criteria.batches();
        if batches.is_empty() {
            warn!(session_id = %self.id, "session has no sources");
            self.lock().lifecycle = SessionState::StartFailed;
            return false;
        }

        let proxies: Vec<Arc<P>> = batches.iter().map(|_| Arc::new((self.factory)())).collect();
        let results = join_all(
            proxies
                .iter()
                .zip(&batches)
                .map(|(proxy, sources)| proxy.setup_channel(sources, &self.criteria.run_settings)),
        )
        .await;

        let mut failed = false;
        for (index, result) in results.iter().enumerate() {
            match result {
                Ok(true) => {}
                Ok(false) => {
                    warn!(session_id = %self.id, index, "proxy setup failed");
                    failed = true;
                }
                Err(e) if e.is_recognized() => {
                    warn!(session_id = %self.id, index, error = %e, "proxy setup rejected");
                    failed = true;
                }
                Err(e) => {
                    error!(session_id = %self.id, index, error = %e, "proxy setup faulted");
                    failed = true;
                }
            }
        }

        if failed {
            // Only proxies that actually came up have anything to release.
            join_all(
                proxies
                    .iter()
                    .zip(&results)
                    .filter(|(_, result)| matches!(result, Ok(true)))
                    .map(|(proxy, _)| proxy.close()),
            )
            .await;
            self.lock().lifecycle = SessionState::StartFailed;
            return false;
        }

        {
            let mut state = self.lock();
            state.containers = proxies
                .iter()
                .zip(batches)
                .map(|(proxy, sources)| ProxyContainer {
                    proxy: Arc::clone(proxy),
                    sources,
                    availability: ProxyAvailability::Available,
                })
                .collect();
            let mut source_map = HashMap::new();
            for (index, container) in state.containers.iter().enumerate() {
                for source in &container.sources {
                    if source_map.insert(source.clone(), index).is_some() {
                        warn!(session_id = %self.id, source = %source, "duplicate source in session");
                    }
                }
            }
            state.source_map = source_map;
        }

        if !self.registry.add_session(self.id, Arc::clone(self)) {
            error!(session_id = %self.id, "failed to register session");
            join_all(proxies.iter().map(|proxy| proxy.close())).await;
            let mut state = self.lock();
            state.containers.clear();
            state.source_map.clear();
            state.lifecycle = SessionState::StartFailed;
            return false;
        }

        self.lock().lifecycle = SessionState::Active;
        self.events.handle_start_session_complete(&StartSessionComplete {
            session_id: self.id,
            proxy_count: proxies.len(),
            elapsed: started.elapsed(),
        });
        true
    }

    /// Hand out the proxy serving `source`, provided it runs with exactly
    /// `run_settings` and nobody else holds it.
    pub fn dequeue_proxy(&self, source: &str, run_settings: &str) -> Result<DequeuedProxy<P>, PoolError> {
        let mut state = self.lock();
        if state.lifecycle != SessionState::Active {
            return Err(PoolError::InvalidOperation(format!(
                "session {} is {}",
                self.id, state.lifecycle
            )));
        }
        let index = *state.source_map.get(source).ok_or_else(|| {
            PoolError::InvalidOperation(format!("no proxy in session {} serves {source}", self.id))
        })?;
        if self.criteria.run_settings != run_settings {
            return Err(PoolError::InvalidOperation(format!(
                "run settings do not match session {}",
                self.id
            )));
        }

        let container = &mut state.containers[index];
        if container.availability == ProxyAvailability::InUse {
            return Err(PoolError::InvalidOperation(format!(
                "proxy {index} for {source} is already in use"
            )));
        }
        container.availability = ProxyAvailability::InUse;
        debug!(session_id = %self.id, index, source, "proxy dequeued");
        Ok(DequeuedProxy {
            index,
            proxy: Arc::clone(&container.proxy),
        })
    }

    pub fn enqueue_proxy(&self, index: usize) -> Result<(), PoolError> {
        let mut state = self.lock();
        let len = state.containers.len();
        let container = state
            .containers
            .get_mut(index)
            .ok_or(PoolError::OutOfRange { index, len })?;
        if container.availability == ProxyAvailability::Available {
            return Err(PoolError::InvalidOperation(format!(
                "proxy {index} is already available"
            )));
        }
        container.availability = ProxyAvailability::Available;
        debug!(session_id = %self.id, index, "proxy enqueued");
        Ok(())
    }

    /// Close every proxy and unregister. Only the first call does anything.
    pub async fn stop_session(&self) -> bool {
        let (final_state, proxies) = {
            let mut state = self.lock();
            match state.lifecycle {
                SessionState::Stopped => {
                    debug!(session_id = %self.id, "session already stopped");
                    return false;
                }
                SessionState::Starting => {
                    warn!(session_id = %self.id, "cannot stop a session while it starts");
                    return false;
                }
                SessionState::Created | SessionState::Active | SessionState::StartFailed => {}
            }
            let final_state = state.lifecycle;
            state.lifecycle = SessionState::Stopped;
            state.source_map.clear();
            let proxies: Vec<Arc<P>> = state
                .containers
                .drain(..)
                .map(|container| container.proxy)
                .collect();
            (final_state, proxies)
        };

        join_all(proxies.iter().map(|proxy| proxy.close())).await;
        self.registry.remove_session(&self.id);

        self.events.handle_stop_session(&StopSessionTelemetry {
            session_id: self.id,
            final_state,
            elapsed: self.created_at.elapsed(),
        });
        true
    }
}
