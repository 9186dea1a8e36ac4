/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{pin_mut, Stream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::watcher::{Config, Event};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::conntrack::ConntrackReconciler;
use crate::Result;

pub const REQUEUE_DELAY: Duration = Duration::from_secs(5);
pub const MAX_ATTEMPTS: u32 = 15;

/// One object transition. `old` is unset for additions, `new` for deletions.
#[derive(Clone, Debug)]
pub struct Change<K> {
    pub old: Option<K>,
    pub new: Option<K>,
}

/// Last seen version of every object, used to turn watch events into
/// [`Change`]s.
pub struct ObjectCache<K> {
    objects: HashMap<String, K>,
}

impl<K: Resource + Clone> Default for ObjectCache<K> {
    fn default() -> Self {
        ObjectCache {
            objects: HashMap::new(),
        }
    }
}

fn cache_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

impl<K: Resource + Clone> ObjectCache<K> {
    pub fn apply(&mut self, event: Event<K>) -> Vec<Change<K>> {
        match event {
            Event::Applied(obj) => {
                let old = self.objects.insert(cache_key(&obj), obj.clone());
                vec![Change {
                    old,
                    new: Some(obj),
                }]
            }
            Event::Deleted(obj) => {
                let old = self.objects.remove(&cache_key(&obj)).or(Some(obj));
                vec![Change { old, new: None }]
            }
            Event::Restarted(objs) => {
                let mut previous = std::mem::take(&mut self.objects);
                let mut changes = Vec::with_capacity(objs.len());
                for obj in objs {
                    let key = cache_key(&obj);
                    let old = previous.remove(&key);
                    self.objects.insert(key, obj.clone());
                    changes.push(Change {
                        old,
                        new: Some(obj),
                    });
                }
                // whatever vanished while the watch was down
                changes.extend(previous.into_values().map(|old| Change {
                    old: Some(old),
                    new: None,
                }));
                changes
            }
        }
    }
}

fn change_key<K: Resource>(change: &Change<K>) -> String {
    change
        .new
        .as_ref()
        .or(change.old.as_ref())
        .map(cache_key)
        .unwrap_or_default()
}

/// Feeds every change from `stream` to `handler` until cancelled. A failed change
/// is handed back after [`REQUEUE_DELAY`], at most [`MAX_ATTEMPTS`] times in total.
/// A pending retry is dropped once a newer change for the same object arrives.
pub async fn pump<K, S, F, Fut>(stream: S, cancel: CancellationToken, handler: F)
where
    K: Resource + Clone + Send + 'static,
    S: Stream<Item = std::result::Result<Event<K>, watcher::Error>>,
    F: Fn(Option<K>, Option<K>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    pin_mut!(stream);
    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<Pending<K>>();
    let mut cache = ObjectCache::default();
    // latest generation delivered per object
    let mut generations: HashMap<String, u64> = HashMap::new();
    let mut next_generation = 0u64;

    loop {
        let batch: Vec<Pending<K>> = tokio::select! {
            _ = cancel.cancelled() => return,
            Some(pending) = retry_rx.recv() => {
                if generations.get(&change_key(&pending.change)) != Some(&pending.generation) {
                    debug!(object = %change_key(&pending.change), "dropping superseded retry");
                    continue;
                }
                vec![pending]
            }
            next = stream.next() => match next {
                Some(Ok(event)) => cache
                    .apply(event)
                    .into_iter()
                    .map(|change| {
                        next_generation += 1;
                        generations.insert(change_key(&change), next_generation);
                        Pending { change, attempt: 1, generation: next_generation }
                    })
                    .collect(),
                Some(Err(err)) => {
                    warn!("watch failed: {err}");
                    continue;
                }
                None => {
                    debug!("watch stream ended");
                    return;
                }
            },
        };

        for pending in batch {
            let Pending { change, attempt, generation } = pending;
            let Err(err) = handler(change.old.clone(), change.new.clone()).await else {
                continue;
            };
            let name = change_key(&change);
            if attempt >= MAX_ATTEMPTS {
                error!(object = %name, attempt, "giving up after repeated failures: {err}");
                continue;
            }
            warn!(object = %name, attempt, "reconcile failed, requeueing: {err}");
            let tx = retry_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(REQUEUE_DELAY) => {
                        let _ = tx.send(Pending { change, attempt: attempt + 1, generation });
                    }
                }
            });
        }
    }
}

struct Pending<K> {
    change: Change<K>,
    attempt: u32,
    generation: u64,
}

pub async fn run_namespace_watch(
    client: Client,
    reconciler: Arc<ConntrackReconciler>,
    cancel: CancellationToken,
) {
    let api: Api<Namespace> = Api::all(client);
    let stream = watcher(api, Config::default()).default_backoff();
    pump(stream, cancel, |old, new| {
        let reconciler = reconciler.clone();
        async move {
            match new {
                Some(new) => reconciler.on_namespace_update(old.as_ref(), &new).await,
                None => Ok(()),
            }
        }
    })
    .await;
}

pub async fn run_endpoint_slice_watch(
    client: Client,
    reconciler: Arc<ConntrackReconciler>,
    cancel: CancellationToken,
) {
    let api: Api<EndpointSlice> = Api::all(client);
    let stream = watcher(api, Config::default()).default_backoff();
    pump(stream, cancel, |old, new| {
        let reconciler = reconciler.clone();
        async move {
            reconciler
                .on_endpoint_slice_update(old.as_ref(), new.as_ref())
                .await
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn namespace(name: &str, gateways: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some([("gw".to_string(), gateways.to_string())].into()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        }
    }

    #[test]
    fn cache_pairs_updates_with_previous_version() {
        let mut cache = ObjectCache::default();
        let added = cache.apply(Event::Applied(namespace("a", "1.1.1.1")));
        assert!(added[0].old.is_none());

        let updated = cache.apply(Event::Applied(namespace("a", "2.2.2.2")));
        assert_eq!(updated[0].old, Some(namespace("a", "1.1.1.1")));

        let deleted = cache.apply(Event::Deleted(namespace("a", "2.2.2.2")));
        assert_eq!(deleted[0].old, Some(namespace("a", "2.2.2.2")));
        assert!(deleted[0].new.is_none());
    }

    #[test]
    fn restart_reports_objects_that_vanished() {
        let mut cache = ObjectCache::default();
        cache.apply(Event::Applied(namespace("a", "1.1.1.1")));
        cache.apply(Event::Applied(namespace("b", "1.1.1.1")));

        let changes = cache.apply(Event::Restarted(vec![namespace("b", "3.3.3.3")]));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].old, Some(namespace("b", "1.1.1.1")));
        assert_eq!(changes[1].old, Some(namespace("a", "1.1.1.1")));
        assert!(changes[1].new.is_none());
    }

    type Events = futures::channel::mpsc::UnboundedSender<
        std::result::Result<Event<Namespace>, watcher::Error>,
    >;

    /// Runs `pump` over a channel-backed stream and records the `gw` annotation of
    /// every delivered namespace. Deliveries listed in `failing` are rejected.
    fn spawn_pump(
        failing: &'static [&'static str],
        fail_once: bool,
    ) -> (Events, Arc<std::sync::Mutex<Vec<String>>>, CancellationToken, tokio::task::JoinHandle<()>) {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let seen = Arc::new(std::sync::Mutex::new(vec![]));
        let cancel = CancellationToken::new();
        let recorded = seen.clone();
        let handle = tokio::spawn(pump(rx, cancel.clone(), move |_old, new: Option<Namespace>| {
            let recorded = recorded.clone();
            async move {
                let gw = new
                    .as_ref()
                    .and_then(|ns| ns.annotations().get("gw").cloned())
                    .unwrap_or_default();
                let already = {
                    let mut seen = recorded.lock().unwrap();
                    let already = seen.contains(&gw);
                    seen.push(gw.clone());
                    already
                };
                if failing.contains(&gw.as_str()) && !(fail_once && already) {
                    return Err(crate::Error::TimeoutError(gw));
                }
                Ok(())
            }
        }));
        (tx, seen, cancel, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn failed_change_is_retried_after_delay() {
        let (tx, seen, cancel, handle) = spawn_pump(&["1.1.1.1"], true);
        tx.unbounded_send(Ok(Event::Applied(namespace("a", "1.1.1.1"))))
            .unwrap();

        tokio::time::sleep(REQUEUE_DELAY - Duration::from_millis(100)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*seen.lock().unwrap(), ["1.1.1.1", "1.1.1.1"]);

        tokio::time::sleep(REQUEUE_DELAY * 4).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_max_attempts() {
        let (tx, seen, cancel, handle) = spawn_pump(&["1.1.1.1"], false);
        tx.unbounded_send(Ok(Event::Applied(namespace("a", "1.1.1.1"))))
            .unwrap();

        tokio::time::sleep(REQUEUE_DELAY * (MAX_ATTEMPTS + 5)).await;
        assert_eq!(seen.lock().unwrap().len(), MAX_ATTEMPTS as usize);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn newer_change_supersedes_pending_retry() {
        let (tx, seen, cancel, handle) = spawn_pump(&["1.1.1.1"], false);
        tx.unbounded_send(Ok(Event::Applied(namespace("a", "1.1.1.1"))))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.unbounded_send(Ok(Event::Applied(namespace("a", "2.2.2.2"))))
            .unwrap();

        tokio::time::sleep(REQUEUE_DELAY * 4).await;
        assert_eq!(*seen.lock().unwrap(), ["1.1.1.1", "2.2.2.2"]);
        cancel.cancel();
        handle.await.unwrap();
    }
}
