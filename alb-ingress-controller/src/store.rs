use std::collections::HashSet;
use std::sync::Arc;

use alb_ingress_controller_apis::ObjectKey;
use futures::StreamExt;
use k8s_openapi::api::{core::v1::ConfigMap, networking::v1::Ingress};
use kube::{Api, Client, Resource};
use kube_runtime::{
    WatchStreamExt,
    reflector::{reflector, store::Writer, Store},
    watcher::{self, watcher},
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{config::Configuration, ring::RingSender};

/// Ingress class handled by this controller.
pub const INGRESS_CLASS: &str = "alb";

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

/// Change notification emitted by the object store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Object { kind: EventType, object: ObjectKey },
    /// The controller ConfigMap changed.
    Configuration,
    /// A notification the store could not interpret.
    Unrecognized { description: String },
}

/// The cluster object store.
pub trait Storer: Send + Sync {
    /// Start watching in the background until `stop` fires. Change events are
    /// published to the event channel the store was created with.
    fn run(&self, stop: CancellationToken);

    /// Ingresses of the controller's class currently known to the store.
    fn list_ingresses(&self) -> Vec<Arc<Ingress>>;
}

/// Whether `ingress` should be handled by this controller.
pub fn is_alb_ingress(ingress: &Ingress) -> bool {
    let class_name = ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_deref());
    let annotation = ingress
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION))
        .map(|v| v.as_str());
    class_name.or(annotation) == Some(INGRESS_CLASS)
}

/// Translates watcher events into [`Event`]s, telling creations from updates
/// and synthesizing deletions for objects which vanished during a relist.
///
/// Only Ingresses of the controller's class produce events. `known` holds the
/// keys which were of that class when last seen, so an Ingress moving to
/// another class yields a single deletion.
#[derive(Default)]
struct IngressEvents {
    known: HashSet<ObjectKey>,
    relisted: Option<HashSet<ObjectKey>>,
}

impl IngressEvents {
    fn key(obj: &Ingress) -> Result<ObjectKey, Event> {
        if obj.meta().name.is_none() {
            return Err(Event::Unrecognized {
                description: format!(
                    "Ingress without name in namespace {:?}",
                    obj.meta().namespace
                ),
            });
        }
        Ok(ObjectKey::from_resource(obj))
    }

    fn deleted(&mut self, key: ObjectKey) -> Option<Event> {
        self.known.remove(&key).then_some(Event::Object {
            kind: EventType::Delete,
            object: key,
        })
    }

    fn applied(&mut self, obj: &Ingress) -> Option<Event> {
        let key = match Self::key(obj) {
            Ok(key) => key,
            Err(event) => return Some(event),
        };
        if !is_alb_ingress(obj) {
            return self.deleted(key);
        }
        if let Some(relisted) = &mut self.relisted {
            relisted.insert(key.clone());
        }
        let kind = if self.known.insert(key.clone()) {
            EventType::Create
        } else {
            EventType::Update
        };
        Some(Event::Object { kind, object: key })
    }

    fn translate(&mut self, event: watcher::Event<Ingress>) -> Vec<Event> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                vec![]
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                self.applied(&obj).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let relisted = self.relisted.take().unwrap_or_default();
                let mut gone: Vec<ObjectKey> = self
                    .known
                    .iter()
                    .filter(|k| !relisted.contains(*k))
                    .cloned()
                    .collect();
                gone.sort();
                gone.into_iter().filter_map(|key| self.deleted(key)).collect()
            }
            watcher::Event::Delete(obj) => match Self::key(&obj) {
                Ok(key) => self.deleted(key).into_iter().collect(),
                Err(event) => vec![event],
            },
        }
    }
}

/// [`Storer`] backed by kube-rs watchers.
pub struct KubeStore {
    client: Client,
    watch_namespace: Option<String>,
    config_map: Option<(String, String)>,
    ingresses: Store<Ingress>,
    writer: Mutex<Option<Writer<Ingress>>>,
    events: Mutex<Option<RingSender<Event>>>,
}

impl KubeStore {
    pub fn new(client: Client, configuration: &Configuration, events: RingSender<Event>) -> Self {
        let writer: Writer<Ingress> = Default::default();
        let ingresses = writer.as_reader();
        Self {
            client,
            watch_namespace: configuration.watch_namespace.clone(),
            config_map: configuration.config_map.clone(),
            ingresses,
            writer: Mutex::new(Some(writer)),
            events: Mutex::new(Some(events)),
        }
    }

    fn ingress_api(&self) -> Api<Ingress> {
        match &self.watch_namespace {
            Some(ns) => {
                info!("Controller is only watching Ingresses in namespace {}", ns);
                Api::namespaced(self.client.clone(), ns.as_str())
            }
            None => {
                info!("Controller is watching Ingresses in all namespaces");
                Api::all(self.client.clone())
            }
        }
    }

    async fn watch_ingresses(
        api: Api<Ingress>,
        writer: Writer<Ingress>,
        events: Arc<RingSender<Event>>,
        stop: CancellationToken,
    ) {
        let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
        let mut stream = Box::pin(stream);
        let mut translator = IngressEvents::default();
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    for e in translator.translate(event) {
                        events.send(e);
                    }
                }
                Some(Err(e)) => warn!("Ingress watch failed: {}", e),
                None => break,
            }
        }
        debug!("Ingress watch stopped");
    }

    async fn watch_config_map(
        api: Api<ConfigMap>,
        name: String,
        events: Arc<RingSender<Event>>,
        stop: CancellationToken,
    ) {
        let config = watcher::Config::default().fields(format!("metadata.name={}", name).as_str());
        let mut stream = Box::pin(watcher(api, config).default_backoff());
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(
                    watcher::Event::Apply(_)
                    | watcher::Event::InitApply(_)
                    | watcher::Event::Delete(_),
                )) => {
                    debug!("ConfigMap {} changed", name);
                    events.send(Event::Configuration);
                }
                Some(Ok(_)) => (),
                Some(Err(e)) => warn!("ConfigMap watch failed: {}", e),
                None => break,
            }
        }
        debug!("ConfigMap watch stopped");
    }
}

impl Storer for KubeStore {
    fn run(&self, stop: CancellationToken) {
        let (writer, events) = match (self.writer.lock().take(), self.events.lock().take()) {
            (Some(writer), Some(events)) => (writer, Arc::new(events)),
            _ => {
                warn!("object store is already running");
                return;
            }
        };
        // The event channel closes once both watches have stopped.
        if let Some((ns, name)) = &self.config_map {
            let api = Api::<ConfigMap>::namespaced(self.client.clone(), ns.as_str());
            tokio::spawn(Self::watch_config_map(
                api,
                name.clone(),
                events.clone(),
                stop.clone(),
            ));
        }
        tokio::spawn(Self::watch_ingresses(self.ingress_api(), writer, events, stop));
    }

    fn list_ingresses(&self) -> Vec<Arc<Ingress>> {
        self.ingresses
            .state()
            .into_iter()
            .filter(|i| is_alb_ingress(i))
            .collect()
    }
}
