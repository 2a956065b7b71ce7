//! Session pool and registry behaviour against in-memory proxies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use libtestplane::error::{PoolError, ProxyError};
use libtestplane::pool::{
    ProxyAvailability, SessionCriteria, SessionEventsHandler, SessionPool, SessionState,
    StartSessionComplete, StopSessionTelemetry,
};
use libtestplane::proxy::TestHostProxy;
use libtestplane::registry::{SessionId, SessionRegistry};

#[derive(Debug, Clone, Copy)]
enum Setup {
    Succeed,
    Fail,
    Reject,
    Fault,
}

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    setups: AtomicUsize,
    closes: AtomicUsize,
}

impl Counters {
    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
    fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }
    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct MockProxy {
    setup: Setup,
    counters: Arc<Counters>,
    closed: AtomicUsize,
}

impl TestHostProxy for MockProxy {
    async fn setup_channel(&self, sources: &[String], _run_settings: &str) -> Result<bool, ProxyError> {
        assert!(!sources.is_empty());
        self.counters.setups.fetch_add(1, Ordering::SeqCst);
        match self.setup {
            Setup::Succeed => Ok(true),
            Setup::Fail => Ok(false),
            Setup::Reject => Err(ProxyError::Protocol("bad handshake".to_string())),
            Setup::Fault => Err(ProxyError::NotConnected),
        }
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingEvents {
    started: Mutex<Vec<StartSessionComplete>>,
    stopped: Mutex<Vec<StopSessionTelemetry>>,
}

impl SessionEventsHandler for RecordingEvents {
    fn handle_start_session_complete(&self, complete: &StartSessionComplete) {
        self.started.lock().unwrap().push(complete.clone());
    }

    fn handle_stop_session(&self, telemetry: &StopSessionTelemetry) {
        self.stopped.lock().unwrap().push(telemetry.clone());
    }
}

struct Fixture {
    counters: Arc<Counters>,
    events: Arc<RecordingEvents>,
    registry: Arc<SessionRegistry<MockProxy>>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            events: Arc::new(RecordingEvents::default()),
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    fn pool(&self, sources: &[&str], plan: Vec<Setup>) -> Arc<SessionPool<MockProxy>> {
        self.pool_with_id(SessionId::new(), sources, plan)
    }

    fn pool_with_id(
        &self,
        id: SessionId,
        sources: &[&str],
        plan: Vec<Setup>,
    ) -> Arc<SessionPool<MockProxy>> {
        let counters = Arc::clone(&self.counters);
        let factory = move || {
            let n = counters.created.fetch_add(1, Ordering::SeqCst);
            MockProxy {
                setup: plan.get(n).copied().unwrap_or(Setup::Succeed),
                counters: Arc::clone(&counters),
                closed: AtomicUsize::new(0),
            }
        };
        SessionPool::with_id(
            id,
            criteria(sources),
            factory,
            Arc::clone(&self.registry),
            self.events.clone(),
        )
    }

    fn started(&self) -> usize {
        self.events.started.lock().unwrap().len()
    }

    fn stopped(&self) -> Vec<StopSessionTelemetry> {
        self.events.stopped.lock().unwrap().clone()
    }
}

fn criteria(sources: &[&str]) -> SessionCriteria {
    SessionCriteria {
        sources: sources.iter().map(|s| s.to_string()).collect(),
        run_settings: r#"{"parallel":true}"#.to_string(),
        max_worker_count: None,
    }
}

const SETTINGS: &str = r#"{"parallel":true}"#;

#[tokio::test]
async fn start_sets_up_one_proxy_per_source() {
    for n in 1..=4 {
        let fx = Fixture::new();
        let sources: Vec<String> = (0..n).map(|i| format!("suite-{i}")).collect();
        let refs: Vec<&str> = sources.iter().map(String::as_str).collect();
        let pool = fx.pool(&refs, Vec::new());

        assert!(pool.start_session().await);
        assert_eq!(fx.counters.created(), n);
        assert_eq!(fx.counters.setups(), n);
        assert_eq!(fx.started(), 1, "one completion regardless of proxy count");
        assert_eq!(pool.state(), SessionState::Active);
        assert_eq!(pool.proxy_count(), n);
        assert!(fx.registry.get_session(&pool.id()).is_some());

        let complete = fx.events.started.lock().unwrap()[0].clone();
        assert_eq!(complete.session_id, pool.id());
        assert_eq!(complete.proxy_count, n);
    }
}

#[tokio::test]
async fn session_starts_at_most_once() {
    let fx = Fixture::new();
    let pool = fx.pool(&["a", "b"], Vec::new());
    assert!(pool.start_session().await);
    assert!(!pool.start_session().await);
    assert_eq!(fx.counters.setups(), 2);
    assert_eq!(fx.started(), 1);
}

#[tokio::test]
async fn failed_setup_rolls_back_opened_proxies() {
    let fx = Fixture::new();
    let pool = fx.pool(
        &["a", "b", "c"],
        vec![Setup::Succeed, Setup::Fail, Setup::Succeed],
    );

    assert!(!pool.start_session().await);
    assert_eq!(fx.counters.setups(), 3);
    assert_eq!(fx.counters.closes(), 2, "only proxies that came up are closed");
    assert_eq!(fx.started(), 0);
    assert_eq!(pool.state(), SessionState::StartFailed);
    assert_eq!(pool.proxy_count(), 0);
    assert!(fx.registry.is_empty());
}

#[tokio::test]
async fn setup_exception_closes_nothing() {
    for setup in [Setup::Fault, Setup::Reject] {
        let fx = Fixture::new();
        let pool = fx.pool(&["a"], vec![setup]);
        assert!(!pool.start_session().await);
        assert_eq!(fx.counters.closes(), 0, "{setup:?}");
        assert_eq!(fx.started(), 0);
        assert!(fx.registry.is_empty());
    }
}

#[tokio::test]
async fn registry_rejection_closes_every_proxy_once() {
    let fx = Fixture::new();
    let id = SessionId::new();
    let first = fx.pool_with_id(id, &["x"], Vec::new());
    assert!(first.start_session().await);
    assert_eq!(fx.started(), 1);

    let fx2 = Fixture {
        counters: Arc::new(Counters::default()),
        events: Arc::new(RecordingEvents::default()),
        registry: Arc::clone(&fx.registry),
    };
    let duplicate = fx2.pool_with_id(id, &["a", "b", "c"], Vec::new());
    assert!(!duplicate.start_session().await);
    assert_eq!(fx2.counters.setups(), 3);
    assert_eq!(fx2.counters.closes(), 3);
    assert_eq!(fx2.started(), 0);
    assert_eq!(duplicate.state(), SessionState::StartFailed);

    let registered = fx.registry.get_session(&id).unwrap();
    assert!(Arc::ptr_eq(&registered, &first), "no overwrite on collision");
}

#[tokio::test]
async fn stop_session_is_idempotent() {
    let fx = Fixture::new();
    let pool = fx.pool(&["a", "b", "c"], Vec::new());
    assert!(pool.start_session().await);

    assert!(pool.stop_session().await);
    assert_eq!(fx.counters.closes(), 3);
    let stopped = fx.stopped();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].session_id, pool.id());
    assert_eq!(stopped[0].final_state, SessionState::Active);
    assert!(fx.registry.get_session(&pool.id()).is_none());

    assert!(!pool.stop_session().await);
    assert!(!pool.stop_session().await);
    assert_eq!(fx.counters.closes(), 3);
    assert_eq!(fx.stopped().len(), 1);
    assert_eq!(pool.state(), SessionState::Stopped);
}

#[tokio::test]
async fn dequeue_matches_source_and_settings() {
    let fx = Fixture::new();
    let pool = fx.pool(&["a", "b"], Vec::new());
    assert!(pool.start_session().await);

    assert!(matches!(
        pool.dequeue_proxy("missing", SETTINGS),
        Err(PoolError::InvalidOperation(_))
    ));
    assert!(matches!(
        pool.dequeue_proxy("a", "{}"),
        Err(PoolError::InvalidOperation(_))
    ));

    let held = pool.dequeue_proxy("b", SETTINGS).unwrap();
    assert_eq!(pool.sources_of(held.index).unwrap(), vec!["b".to_string()]);
    assert_eq!(pool.availability(held.index), Some(ProxyAvailability::InUse));
    assert!(matches!(
        pool.dequeue_proxy("b", SETTINGS),
        Err(PoolError::InvalidOperation(_))
    ));

    pool.enqueue_proxy(held.index).unwrap();
    assert_eq!(pool.availability(held.index), Some(ProxyAvailability::Available));
    let again = pool.dequeue_proxy("b", SETTINGS).unwrap();
    assert_eq!(again.index, held.index);
    assert!(Arc::ptr_eq(&again.proxy, &held.proxy));
}

#[tokio::test]
async fn batched_sources_share_a_proxy() {
    let fx = Fixture::new();
    let counters = Arc::clone(&fx.counters);
    let pool = SessionPool::new(
        SessionCriteria {
            sources: vec!["a".into(), "b".into(), "c".into()],
            run_settings: SETTINGS.to_string(),
            max_worker_count: Some(2),
        },
        move || MockProxy {
            setup: Setup::Succeed,
            counters: Arc::clone(&counters),
            closed: AtomicUsize::new(0),
        },
        Arc::clone(&fx.registry),
        fx.events.clone(),
    );
    assert!(pool.start_session().await);
    assert_eq!(fx.counters.setups(), 2);

    let a = pool.dequeue_proxy("a", SETTINGS).unwrap();
    assert!(matches!(
        pool.dequeue_proxy("c", SETTINGS),
        Err(PoolError::InvalidOperation(_))
    ));
    assert!(pool.dequeue_proxy("b", SETTINGS).is_ok());
    pool.enqueue_proxy(a.index).unwrap();
    assert_eq!(pool.dequeue_proxy("c", SETTINGS).unwrap().index, a.index);
}

#[tokio::test]
async fn repeated_source_gets_one_proxy() {
    let fx = Fixture::new();
    let pool = fx.pool(&["a", "b", "a"], Vec::new());
    assert_eq!(pool.criteria().sources, vec!["a".to_string(), "b".to_string()]);

    assert!(pool.start_session().await);
    assert_eq!(fx.counters.created(), 2);
    assert_eq!(pool.proxy_count(), 2);

    let held = pool.dequeue_proxy("a", SETTINGS).unwrap();
    assert_eq!(pool.sources_of(held.index).unwrap(), vec!["a".to_string()]);
    assert_eq!(pool.availability(held.index), Some(ProxyAvailability::InUse));
    pool.enqueue_proxy(held.index).unwrap();
    assert_eq!(pool.dequeue_proxy("a", SETTINGS).unwrap().index, held.index);
}

#[tokio::test]
async fn enqueue_validates_index_and_state() {
    let fx = Fixture::new();
    let pool = fx.pool(&["a", "b"], Vec::new());
    assert!(pool.start_session().await);

    assert_eq!(
        pool.enqueue_proxy(2),
        Err(PoolError::OutOfRange { index: 2, len: 2 })
    );
    assert!(matches!(
        pool.enqueue_proxy(0),
        Err(PoolError::InvalidOperation(_))
    ));

    let held = pool.dequeue_proxy("a", SETTINGS).unwrap();
    assert_eq!(pool.enqueue_proxy(held.index), Ok(()));
    assert!(matches!(
        pool.enqueue_proxy(held.index),
        Err(PoolError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn dequeue_requires_a_live_session() {
    let fx = Fixture::new();
    let pool = fx.pool(&["a"], Vec::new());
    assert!(matches!(
        pool.dequeue_proxy("a", SETTINGS),
        Err(PoolError::InvalidOperation(_))
    ));
    assert!(pool.start_session().await);
    assert!(pool.stop_session().await);
    assert!(matches!(
        pool.dequeue_proxy("a", SETTINGS),
        Err(PoolError::InvalidOperation(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeue_has_one_winner() {
    let fx = Fixture::new();
    let pool = fx.pool(&["shared"], Vec::new());
    assert!(pool.start_session().await);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            pool.dequeue_proxy("shared", SETTINGS).is_ok()
        }));
    }
    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn registry_add_get_remove() {
    let fx = Fixture::new();
    let pool = fx.pool(&["a"], Vec::new());
    let id = pool.id();

    assert!(fx.registry.add_session(id, Arc::clone(&pool)));
    assert!(!fx.registry.add_session(id, Arc::clone(&pool)));
    assert_eq!(fx.registry.len(), 1);
    assert!(fx.registry.get_session(&id).is_some());

    let other = SessionId::new();
    assert!(
        !fx.registry.add_session(other, Arc::clone(&pool)),
        "pool registered under a foreign id"
    );

    assert!(fx.registry.remove_session(&id));
    assert!(!fx.registry.remove_session(&id));
    assert!(fx.registry.get_session(&id).is_none());
}

#[test]
fn session_id_round_trips_through_text() {
    let id = SessionId::new();
    let parsed: SessionId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
    assert!("not-a-uuid".parse::<SessionId>().is_err());
}
