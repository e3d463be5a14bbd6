use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kube::Client;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Meter},
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Configuration, INGRESS_SYNC_INTERVAL},
    errors::ControllerError,
    events::{EventPublisher, KubeEventPublisher},
    ingress::{IngressReconciler, IngressSync},
    provider::{
        IngressAssembler, ProviderSync, ResourceTagging, SharedRunningConfiguration, TagAssembler,
    },
    ring::{EVENT_BUFFER_CAPACITY, RingReceiver, ring_channel},
    status::{IngressStatusSyncer, StatusSync},
    store::{Event, KubeStore, Storer},
    task::{Task, TaskQueue},
    utils::metric_name,
};

const CONTROLLER: &str = "alb_controller";

const INITIAL_SYNC: &str = "initial-sync";
const CONFIGMAP_CHANGE: &str = "configmap-change";
const PERIODIC_SYNC: &str = "periodic-sync";

/// How long `start` waits for background tasks after the stop signal.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Collaborators of an [`AlbController`].
pub struct ControllerContext {
    pub store: Arc<dyn Storer>,
    pub tagging: Arc<dyn ResourceTagging>,
    pub assembler: Arc<dyn IngressAssembler>,
    pub reconciler: Arc<dyn IngressReconciler>,
    pub events: Arc<dyn EventPublisher>,
    pub status: Option<Arc<dyn StatusSync>>,
    pub running_config: SharedRunningConfiguration,
}

pub struct AlbController {
    configuration: Configuration,
    store: Arc<dyn Storer>,
    status: Option<Arc<dyn StatusSync>>,
    running_config: SharedRunningConfiguration,
    provider_sync: Arc<ProviderSync>,
    sync_queue: Arc<TaskQueue>,
    provider_sync_queue: Arc<TaskQueue>,
    events: Mutex<Option<RingReceiver<Event>>>,
    stop: CancellationToken,
    stop_lock: Mutex<()>,
    is_shutting_down: AtomicBool,
    state: Mutex<ControllerState>,
    event_count: Counter<u64>,
    dropped_events: Counter<u64>,
}

impl AlbController {
    pub fn new(
        configuration: Configuration,
        context: ControllerContext,
        events: RingReceiver<Event>,
    ) -> Self {
        let stop = CancellationToken::new();
        let provider_sync = Arc::new(ProviderSync::new(
            &configuration,
            context.store.clone(),
            context.tagging,
            context.assembler,
            context.events.clone(),
            context.running_config.clone(),
        ));
        let ingress_sync = Arc::new(IngressSync::new(
            context.store.clone(),
            context.reconciler,
            context.events,
            context.running_config.clone(),
            configuration.sync_rate_limit,
            stop.clone(),
        ));
        let sync_queue = Arc::new(TaskQueue::new(
            "ingress-sync",
            ingress_sync,
            configuration.retry_policy,
        ));
        let provider_sync_queue = Arc::new(
            TaskQueue::new(
                "provider-sync",
                provider_sync.clone(),
                configuration.retry_policy,
            )
            .with_periodic(Task::dummy(PERIODIC_SYNC)),
        );
        let meter: Meter = global::meter(CONTROLLER);
        let event_count = meter
            .u64_counter(metric_name("events"))
            .with_description("Count of store events received by the controller")
            .build();
        let dropped_events = meter
            .u64_counter(metric_name("events_dropped"))
            .with_description("Count of store events evicted from the event buffer")
            .build();
        Self {
            configuration,
            store: context.store,
            status: context.status,
            running_config: context.running_config,
            provider_sync,
            sync_queue,
            provider_sync_queue,
            events: Mutex::new(Some(events)),
            stop,
            stop_lock: Mutex::new(()),
            is_shutting_down: AtomicBool::new(false),
            state: Mutex::new(ControllerState::Created),
            event_count,
            dropped_events,
        }
    }

    /// Controller watching the cluster through kube-rs and publishing
    /// Ingress status.
    pub fn with_kube_client(
        client: Client,
        configuration: Configuration,
        tagging: Arc<dyn ResourceTagging>,
        reconciler: Arc<dyn IngressReconciler>,
    ) -> Self {
        let (sender, receiver) = ring_channel(EVENT_BUFFER_CAPACITY);
        let store: Arc<dyn Storer> =
            Arc::new(KubeStore::new(client.clone(), &configuration, sender));
        let running_config = SharedRunningConfiguration::default();
        let events: Arc<dyn EventPublisher> = Arc::new(KubeEventPublisher::new(client.clone()));
        let status: Arc<dyn StatusSync> = Arc::new(IngressStatusSyncer::new(
            client,
            &configuration,
            store.clone(),
            running_config.clone(),
        ));
        let context = ControllerContext {
            store,
            tagging,
            assembler: Arc::new(TagAssembler),
            reconciler,
            events,
            status: Some(status),
            running_config,
        };
        Self::new(configuration, context, receiver)
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    pub fn running_config(&self) -> SharedRunningConfiguration {
        self.running_config.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    fn transition(&self, from: ControllerState, to: ControllerState) {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
        }
    }

    /// Run the controller until [`AlbController::stop`] is called.
    ///
    /// The cloud inventory is synchronized once before anything else starts;
    /// if that fails the error is returned and no worker is started.
    pub async fn start(&self) -> Result<(), ControllerError> {
        let mut events = {
            let mut state = self.state.lock();
            if *state != ControllerState::Created {
                return Err(ControllerError::AlreadyStarted);
            }
            let Some(events) = self.events.lock().take() else {
                return Err(ControllerError::AlreadyStarted);
            };
            *state = ControllerState::Starting;
            events
        };
        info!(
            "starting ALB Ingress controller for cluster {}",
            self.configuration.cluster_name
        );

        if let Err(e) = self.provider_sync.synchronize().await {
            error!("unable to synchronize cloud resources: {}", e);
            *self.state.lock() = ControllerState::Stopped;
            return Err(ControllerError::StartupSync(Box::new(e)));
        }

        self.store.run(self.stop.child_token());
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        if let Some(status) = &self.status {
            let status = status.clone();
            tasks.push(tokio::spawn(async move { status.run().await }));
        }
        tasks.push(tokio::spawn(
            self.sync_queue
                .clone()
                .run(INGRESS_SYNC_INTERVAL, self.stop.clone()),
        ));
        tasks.push(tokio::spawn(self.provider_sync_queue.clone().run(
            self.configuration.provider_sync_interval,
            self.stop.clone(),
        )));
        self.sync_queue.enqueue_task(Task::dummy(INITIAL_SYNC));
        self.transition(ControllerState::Starting, ControllerState::Running);
        info!("controller is running");

        let mut dropped = 0;
        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => break,
                event = events.recv() => event,
            };
            let total_dropped = events.dropped();
            if total_dropped > dropped {
                warn!(
                    "event buffer overflowed, {} events discarded",
                    total_dropped - dropped
                );
                self.dropped_events.add(total_dropped - dropped, &[]);
                dropped = total_dropped;
            }
            match event {
                Some(event) => self.handle_event(event),
                None => {
                    warn!("event channel closed, waiting for shutdown");
                    self.stop.cancelled().await;
                    break;
                }
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                "background tasks did not stop within {:?}",
                SHUTDOWN_GRACE_PERIOD
            );
        }
        *self.state.lock() = ControllerState::Stopped;
        info!("controller stopped");
        Ok(())
    }

    fn handle_event(&self, event: Event) {
        if self.is_shutting_down() {
            debug!("discarding {:?}, controller is shutting down", event);
            return;
        }
        match event {
            Event::Configuration => {
                self.event_count
                    .add(1, &[KeyValue::new("type", "configuration")]);
                debug!("controller configuration changed");
                self.sync_queue.enqueue_task(Task::dummy(CONFIGMAP_CHANGE));
            }
            Event::Object { kind, object } => {
                self.event_count.add(1, &[KeyValue::new("type", "object")]);
                debug!("{:?} event for {} {}", kind, object.kind, object);
                self.sync_queue
                    .enqueue_skippable_task(Task::Object(object));
            }
            Event::Unrecognized { description } => {
                self.event_count
                    .add(1, &[KeyValue::new("type", "unrecognized")]);
                warn!("unexpected event: {}", description);
            }
        }
    }

    /// Signal shutdown and return without waiting for background tasks;
    /// [`AlbController::start`] returns once they have stopped. A controller
    /// stopped before it was started goes straight to `Stopped`.
    pub fn stop(&self) -> Result<(), ControllerError> {
        self.is_shutting_down.store(true, Ordering::SeqCst);
        let _guard = self.stop_lock.lock();
        if self.sync_queue.is_shutting_down() {
            return Err(ControllerError::ShutdownInProgress);
        }
        info!("shutting down controller");
        {
            let mut state = self.state.lock();
            *state = match *state {
                ControllerState::Created | ControllerState::Stopped => ControllerState::Stopped,
                _ => ControllerState::ShuttingDown,
            };
        }
        self.stop.cancel();
        self.sync_queue.shutdown();
        self.provider_sync_queue.shutdown();
        if let Some(status) = &self.status {
            status.shutdown();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventPublisher;
    use crate::provider::tests::{FakeTagging, StaticStore, ingress, inventory};
    use crate::ring::RingSender;
    use crate::task::RetryPolicy;
    use alb_ingress_controller_apis::{ObjectKey, RunningConfiguration};
    use async_trait::async_trait;
    use k8s_openapi::api::networking::v1::Ingress;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;
    use tokio::time::{Instant, sleep, timeout};

    /// Records reconciliation triggers together with the number of inventory
    /// queries seen at that point.
    struct RecordingReconciler {
        tagging: Arc<FakeTagging>,
        calls: Mutex<Vec<(String, usize)>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl RecordingReconciler {
        fn new(tagging: Arc<FakeTagging>, gate: Option<Arc<Semaphore>>) -> Self {
            Self {
                tagging,
                calls: Default::default(),
                gate,
            }
        }

        fn triggers(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(t, _)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl IngressReconciler for RecordingReconciler {
        async fn reconcile(
            &self,
            trigger: &Task,
            _ingresses: &[Arc<Ingress>],
            _running: &RunningConfiguration,
        ) -> Result<(), ControllerError> {
            let queries = self.tagging.calls.load(Ordering::SeqCst);
            self.calls.lock().push((trigger.key(), queries));
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            Ok(())
        }
    }

    struct StatusRecorder {
        runs: AtomicUsize,
        stop: CancellationToken,
    }

    #[async_trait]
    impl StatusSync for StatusRecorder {
        async fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.stop.cancelled().await;
        }

        fn shutdown(&self) {
            self.stop.cancel();
        }
    }

    struct Fixture {
        controller: Arc<AlbController>,
        tagging: Arc<FakeTagging>,
        reconciler: Arc<RecordingReconciler>,
        status: Arc<StatusRecorder>,
        events: RingSender<Event>,
    }

    fn fixture(configure: impl FnOnce(&mut Configuration), gate: Option<Arc<Semaphore>>) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut configuration = Configuration::new("my-cluster");
        configuration.sync_rate_limit = 0.0;
        configuration.retry_policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
        };
        configure(&mut configuration);
        let tagging = Arc::new(FakeTagging::default());
        *tagging.resources.lock() = inventory("my-cluster");
        let reconciler = Arc::new(RecordingReconciler::new(tagging.clone(), gate));
        let status = Arc::new(StatusRecorder {
            runs: AtomicUsize::new(0),
            stop: CancellationToken::new(),
        });
        let (events, receiver) = ring_channel(EVENT_BUFFER_CAPACITY);
        let context = ControllerContext {
            store: Arc::new(StaticStore(vec![ingress("shop", "web")])),
            tagging: tagging.clone(),
            assembler: Arc::new(TagAssembler),
            reconciler: reconciler.clone(),
            events: Arc::new(NoopEventPublisher),
            status: Some(status.clone()),
            running_config: Default::default(),
        };
        Fixture {
            controller: Arc::new(AlbController::new(configuration, context, receiver)),
            tagging,
            reconciler,
            status,
            events,
        }
    }

    fn spawn_start(
        controller: &Arc<AlbController>,
    ) -> JoinHandle<Result<(), ControllerError>> {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start().await })
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            sleep(Duration::from_millis(5)).await;
        }
    }

    async fn stopped(handle: JoinHandle<Result<(), ControllerError>>) -> Result<(), ControllerError> {
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("controller did not stop")
            .unwrap()
    }

    #[tokio::test]
    async fn initial_sync_runs_once_after_provider_sync() {
        let f = fixture(|_| (), None);
        let handle = spawn_start(&f.controller);

        wait_for(|| !f.reconciler.calls.lock().is_empty()).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *f.reconciler.calls.lock(),
            vec![(INITIAL_SYNC.to_string(), 1)]
        );
        assert_eq!(f.controller.state(), ControllerState::Running);
        assert_eq!(f.status.runs.load(Ordering::SeqCst), 1);
        assert_eq!(f.controller.running_config().read().await.ingresses.len(), 1);

        f.controller.stop().unwrap();
        stopped(handle).await.unwrap();
        assert_eq!(f.controller.state(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn failed_startup_sync_is_fatal() {
        let f = fixture(|_| (), None);
        f.tagging.fail.store(true, Ordering::SeqCst);

        let e = f.controller.start().await.unwrap_err();
        assert!(matches!(e, ControllerError::StartupSync(_)));
        assert_eq!(f.controller.state(), ControllerState::Stopped);
        sleep(Duration::from_millis(50)).await;
        assert!(f.reconciler.calls.lock().is_empty());
        assert_eq!(f.status.runs.load(Ordering::SeqCst), 0);
        assert_eq!(f.tagging.calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            f.controller.start().await,
            Err(ControllerError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn events_are_routed_to_the_ingress_queue() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(|_| (), Some(gate.clone()));
        let handle = spawn_start(&f.controller);
        // initial-sync is now blocked in the reconciler
        wait_for(|| f.reconciler.calls.lock().len() == 1).await;

        let web = ObjectKey::new("Ingress", Some("shop"), "web");
        for kind in [crate::store::EventType::Create, crate::store::EventType::Update] {
            f.events.send(Event::Object {
                kind,
                object: web.clone(),
            });
        }
        f.events.send(Event::Unrecognized {
            description: "garbage".to_string(),
        });
        f.events.send(Event::Configuration);
        sleep(Duration::from_millis(50)).await;
        gate.add_permits(100);

        wait_for(|| f.reconciler.calls.lock().len() == 3).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            f.reconciler.triggers(),
            vec![
                INITIAL_SYNC.to_string(),
                "Ingress:shop/web".to_string(),
                CONFIGMAP_CHANGE.to_string(),
            ]
        );

        f.controller.stop().unwrap();
        stopped(handle).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stop_reports_shutdown_in_progress_once() {
        let f = fixture(|_| (), None);
        let handle = spawn_start(&f.controller);
        wait_for(|| f.controller.state() == ControllerState::Running).await;

        let stops: Vec<_> = (0..4)
            .map(|_| {
                let controller = f.controller.clone();
                tokio::spawn(async move { controller.stop() })
            })
            .collect();
        let mut in_progress = 0;
        for stop in stops {
            match stop.await.unwrap() {
                Ok(()) => (),
                Err(ControllerError::ShutdownInProgress) => in_progress += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(in_progress, 3);
        assert!(f.controller.is_shutting_down());

        stopped(handle).await.unwrap();
        assert_eq!(f.controller.state(), ControllerState::Stopped);
        assert!(matches!(
            f.controller.stop(),
            Err(ControllerError::ShutdownInProgress)
        ));
    }

    #[tokio::test]
    async fn events_after_stop_are_discarded() {
        let f = fixture(|_| (), None);
        let handle = spawn_start(&f.controller);
        wait_for(|| f.reconciler.calls.lock().len() == 1).await;

        f.controller.stop().unwrap();
        f.events.send(Event::Configuration);
        stopped(handle).await.unwrap();
        assert_eq!(f.reconciler.triggers(), vec![INITIAL_SYNC.to_string()]);
    }

    #[tokio::test]
    async fn provider_inventory_is_refreshed_periodically() {
        let f = fixture(
            |c| c.provider_sync_interval = Duration::from_millis(10),
            None,
        );
        let handle = spawn_start(&f.controller);
        wait_for(|| f.tagging.calls.load(Ordering::SeqCst) >= 4).await;

        // failures after startup are retried, not fatal
        f.tagging.fail.store(true, Ordering::SeqCst);
        let calls = f.tagging.calls.load(Ordering::SeqCst);
        wait_for(|| f.tagging.calls.load(Ordering::SeqCst) >= calls + 3).await;
        assert_eq!(f.controller.state(), ControllerState::Running);
        // the last good inventory is kept
        assert_eq!(f.controller.running_config().read().await.ingresses.len(), 1);

        f.controller.stop().unwrap();
        stopped(handle).await.unwrap();
    }

    #[tokio::test]
    async fn stop_before_start_leaves_controller_stopped() {
        let f = fixture(|_| (), None);
        f.controller.stop().unwrap();
        assert_eq!(f.controller.state(), ControllerState::Stopped);
        assert!(matches!(
            f.controller.start().await,
            Err(ControllerError::AlreadyStarted)
        ));
        assert_eq!(f.tagging.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            f.controller.stop(),
            Err(ControllerError::ShutdownInProgress)
        ));
    }

    #[tokio::test]
    async fn kube_wired_controller_requires_provider_inventory() {
        crate::install_crypto_provider();
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        let tagging = Arc::new(FakeTagging::default());
        tagging.fail.store(true, Ordering::SeqCst);
        let reconciler = Arc::new(RecordingReconciler::new(tagging.clone(), None));

        let controller = AlbController::with_kube_client(
            client,
            Configuration::new("my-cluster"),
            tagging.clone(),
            reconciler.clone(),
        );
        assert_eq!(controller.state(), ControllerState::Created);

        let e = controller.start().await.unwrap_err();
        assert!(matches!(e, ControllerError::StartupSync(_)));
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert_eq!(tagging.calls.load(Ordering::SeqCst), 1);
        assert!(reconciler.calls.lock().is_empty());
    }
}
