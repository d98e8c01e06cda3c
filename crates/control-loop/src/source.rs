//! Event sources.
//!
//! One source runs per watched kind. It consumes a `kube-runtime` watch
//! stream, keeps the kind's reflector store up to date, turns raw watch
//! events into [`ObjectEvent`]s and pushes the routed requests onto the
//! work queue.
//!
//! The store is updated before requests are queued, so a reconcile started
//! by an event always sees at least the state that produced it.

use crate::event::ObjectEvent;
use crate::filter::EventFilter;
use crate::metrics::ControllerMetrics;
use crate::queue::WorkQueue;
use crate::request::ReconcileRequest;
use crate::router::FanOutRouter;
use futures::StreamExt;
use kube::Api;
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use reconciling::{ManagedObject, ManagedObjectRef};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Watch consumer for objects of kind `K`.
pub(crate) struct EventSource<K: ManagedObject> {
    writer: Writer<K>,
    routing: Routing<K>,
}

// Kept apart from the store writer so routing only borrows what it shares
struct Routing<K> {
    kind: String,
    filter: Arc<dyn EventFilter<K>>,
    router: FanOutRouter,
    queue: WorkQueue<ReconcileRequest>,
    metrics: ControllerMetrics,
}

impl<K: ManagedObject> EventSource<K> {
    pub(crate) fn new(
        filter: Arc<dyn EventFilter<K>>,
        router: FanOutRouter,
        queue: WorkQueue<ReconcileRequest>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            writer: Writer::default(),
            routing: Routing {
                kind: K::kind_name(),
                filter,
                router,
                queue,
                metrics,
            },
        }
    }

    /// Reader side of the store this source maintains.
    pub(crate) fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    /// Watch `api` until the task is aborted.
    ///
    /// Watch errors are logged and retried with the watcher's default backoff.
    pub(crate) async fn run(mut self, api: Api<K>) {
        info!("Starting {} watcher", self.routing.kind);

        let mut stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => self.handle(event).await,
                Err(e) => warn!("{} watch error: {}", self.routing.kind, e),
            }
        }

        warn!("{} watch stream ended", self.routing.kind);
    }

    /// Apply one watch event to the store and route it.
    pub(crate) async fn handle(&mut self, event: watcher::Event<K>) {
        let classified = self.classify(&event);
        self.writer.apply_watcher_event(&event);

        if let Some(event) = classified {
            self.routing.dispatch(&event).await;
        }
    }

    /// Turns a watch event into a lifecycle event, using the store for the
    /// previous version. Re-list markers produce nothing.
    fn classify(&self, event: &watcher::Event<K>) -> Option<ObjectEvent<K>> {
        match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                let new = Arc::new(obj.clone());
                let previous = self.writer.as_reader().get(&ObjectRef::from_obj(obj));
                Some(match previous {
                    Some(old) => ObjectEvent::Update { old, new },
                    None => ObjectEvent::Create(new),
                })
            }
            watcher::Event::Delete(obj) => Some(ObjectEvent::Delete(Arc::new(obj.clone()))),
            watcher::Event::Init | watcher::Event::InitDone => None,
        }
    }
}

impl<K: ManagedObject> Routing<K> {
    async fn dispatch(&self, event: &ObjectEvent<K>) {
        let admitted = self.filter.admit(event);
        self.metrics
            .observe_event(&self.kind, event.type_name(), admitted);

        if !admitted {
            return;
        }
        debug!(
            kind = %self.kind,
            object = %ManagedObjectRef::from_object(event.object()),
            event = event.type_name(),
            "Admitted event"
        );

        let requests = self.router.requests_for(event).await;
        self.metrics.observe_fan_out(requests.len());
        for request in requests {
            self.queue.add(request);
        }
        self.metrics.set_queue_depth(self.queue.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::filter::ManagedByFilter;
    use crate::router::TargetRegistry;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use prometheus::Registry;
    use reconciling::{ManagementMarker, MANAGED_BY_LABEL};
    use std::collections::BTreeMap;

    struct Seeds(Vec<&'static str>);

    #[async_trait]
    impl TargetRegistry for Seeds {
        async fn target_names(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.0.iter().map(ToString::to_string).collect())
        }
    }

    fn source() -> (EventSource<ConfigMap>, WorkQueue<ReconcileRequest>, ControllerMetrics) {
        let queue = WorkQueue::new(ExponentialBackoff::default());
        let metrics = ControllerMetrics::new(&Registry::new(), "seed-proxy-controller").unwrap();
        let source = EventSource::new(
            Arc::new(ManagedByFilter::new(ManagementMarker::managed_by("seed-proxy-controller"))),
            FanOutRouter::new(Arc::new(Seeds(vec!["europe", "asia", "america"]))),
            queue.clone(),
            metrics.clone(),
        );
        (source, queue, metrics)
    }

    fn config_map(name: &str, managed: bool, data: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("monitoring-master".to_string()),
                labels: managed.then(|| {
                    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), "seed-proxy-controller".to_string())])
                }),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("value".to_string(), data.to_string())])),
            ..Default::default()
        }
    }

    async fn drain(queue: &WorkQueue<ReconcileRequest>) -> Vec<String> {
        let mut targets = Vec::new();
        while !queue.is_empty() {
            if let Some(request) = queue.get().await {
                queue.done(&request);
                targets.push(request.target);
            }
        }
        targets
    }

    #[tokio::test]
    async fn test_managed_event_fans_out_to_every_target() {
        let (mut source, queue, metrics) = source();

        source
            .handle(watcher::Event::Apply(config_map("grafana-seed-proxies", true, "a")))
            .await;

        assert_eq!(drain(&queue).await, vec!["europe", "asia", "america"]);
        assert_eq!(metrics.events("ConfigMap", "create", true), 1);
        assert_eq!(metrics.fan_out_requests(), 3);
    }

    #[tokio::test]
    async fn test_unmanaged_event_is_dropped_but_cached() {
        let (mut source, queue, metrics) = source();

        source
            .handle(watcher::Event::Apply(config_map("kube-root-ca.crt", false, "a")))
            .await;

        assert!(queue.is_empty());
        assert_eq!(metrics.events("ConfigMap", "create", false), 1);
        let cached = source
            .store()
            .get(&ObjectRef::new("kube-root-ca.crt").within("monitoring-master"));
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn test_update_uses_cached_version_as_old() {
        let (mut source, queue, metrics) = source();
        source
            .handle(watcher::Event::Apply(config_map("grafana-seed-proxies", true, "a")))
            .await;
        drain(&queue).await;

        // Someone strips the marker: the old version still carries it
        source
            .handle(watcher::Event::Apply(config_map("grafana-seed-proxies", false, "b")))
            .await;

        assert_eq!(metrics.events("ConfigMap", "update", true), 1);
        assert_eq!(drain(&queue).await.len(), 3);
        let cached = source
            .store()
            .get(&ObjectRef::new("grafana-seed-proxies").within("monitoring-master"))
            .unwrap();
        assert_eq!(cached.data.as_ref().unwrap()["value"], "b");
    }

    #[tokio::test]
    async fn test_bursts_collapse_in_the_queue() {
        let (mut source, queue, _metrics) = source();

        for data in ["a", "b", "c", "d"] {
            source
                .handle(watcher::Event::Apply(config_map("grafana-seed-proxies", true, data)))
                .await;
        }

        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_of_managed_object_is_routed() {
        let (mut source, queue, metrics) = source();
        let cm = config_map("seed-proxy-europe", true, "a");
        source.handle(watcher::Event::Apply(cm.clone())).await;
        drain(&queue).await;

        source.handle(watcher::Event::Delete(cm)).await;

        assert_eq!(metrics.events("ConfigMap", "delete", true), 1);
        assert_eq!(queue.len(), 3);
        assert!(source
            .store()
            .get(&ObjectRef::new("seed-proxy-europe").within("monitoring-master"))
            .is_none());
    }

    #[tokio::test]
    async fn test_relist_marks_store_ready() {
        let (mut source, queue, _metrics) = source();
        let store = source.store();

        source.handle(watcher::Event::Init).await;
        source
            .handle(watcher::Event::InitApply(config_map("grafana-seed-proxies", true, "a")))
            .await;
        source.handle(watcher::Event::InitDone).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), store.wait_until_ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.state().len(), 1);
        assert_eq!(queue.len(), 3);
    }
}
