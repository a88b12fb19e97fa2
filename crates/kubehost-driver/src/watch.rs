//! Waiting for a host's Pod to report an IP
//!
//! One lookup, then one watch session bounded by a hard deadline. No retries:
//! if the deadline passes or the server closes the stream first, the caller
//! gets [`Error::Timeout`] and decides what to do. The watch stream is owned
//! by the waiting future, so returning, timing out, or dropping the future
//! all close the subscription.

use std::time::Duration;

use futures::StreamExt;
use kube::api::WatchEvent;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use kubehost_common::Error;

use crate::api::ClusterApi;
use crate::state::pod_ip;

/// Default bound on waiting for an address
pub const DEFAULT_ADDRESS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Longest server-side watch timeout the API server accepts from kube-rs
const MAX_WATCH_TIMEOUT: Duration = Duration::from_secs(290);

/// Wait for the named Pod to report a non-empty IP.
///
/// Fails immediately with [`Error::NotFound`] if the Pod does not exist.
/// Never returns `Ok` with an empty string.
pub async fn await_address(
    api: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<String, Error> {
    let deadline = Instant::now() + timeout;
    let watch_timeout = timeout.min(MAX_WATCH_TIMEOUT);
    match timeout_at(deadline, wait_for_ip(api, namespace, name, watch_timeout)).await {
        Ok(Ok(Some(ip))) => Ok(ip),
        // The server ends the watch at the watch timeout, which can be
        // shorter than the caller's bound
        Ok(Ok(None)) => {
            debug!(namespace = %namespace, name = %name, ?watch_timeout, "watch closed before an IP was assigned");
            Err(Error::timeout(namespace, name, watch_timeout))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            debug!(namespace = %namespace, name = %name, ?timeout, "deadline elapsed waiting for IP");
            Err(Error::timeout(namespace, name, timeout))
        }
    }
}

/// Returns `Ok(None)` when the stream ends without an IP
async fn wait_for_ip(
    api: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    watch_timeout: Duration,
) -> Result<Option<String>, Error> {
    let pod = api
        .get_pod(namespace, name)
        .await?
        .ok_or_else(|| Error::not_found("Pod", namespace, name))?;

    // Same as the initial event of a watch started from the current state
    if let Some(ip) = pod_ip(&pod) {
        return Ok(Some(ip));
    }

    let resource_version = pod
        .metadata
        .resource_version
        .clone()
        .unwrap_or_else(|| "0".to_string());
    let mut events = api
        .watch_pod(namespace, name, &resource_version, watch_timeout)
        .await?;

    while let Some(event) = events.next().await {
        match event? {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => match pod_ip(&pod) {
                Some(ip) => {
                    debug!(namespace = %namespace, name = %name, ip = %ip, "pod IP assigned");
                    return Ok(Some(ip));
                }
                None => trace!(namespace = %namespace, name = %name, "pod event without IP"),
            },
            WatchEvent::Deleted(_) => {
                trace!(namespace = %namespace, name = %name, "pod deleted while waiting")
            }
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(e) => return Err(kube::Error::Api(e).into()),
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures::stream;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::api::MockClusterApi;
    use crate::testing::{FakeCluster, IpPlan};

    fn pod(ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("41".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_pod_is_not_found_not_timeout() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_pod().returning(|_, _| Ok(None));
        mock.expect_watch_pod().never();

        let err = await_address(&mock, "default", "ghost", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn existing_ip_returns_without_watching() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_pod()
            .returning(|_, _| Ok(Some(pod(Some("10.0.0.9")))));
        mock.expect_watch_pod().never();

        let ip = await_address(&mock, "default", "demo", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ip, "10.0.0.9");
    }

    #[tokio::test]
    async fn empty_ip_events_are_skipped_and_first_ip_wins() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_pod().returning(|_, _| Ok(Some(pod(None))));
        mock.expect_watch_pod()
            .withf(|ns, name, rv, timeout| {
                ns == "default" && name == "demo" && rv == "41" && *timeout == MAX_WATCH_TIMEOUT
            })
            .returning(|_, _, _, _| {
                Ok(stream::iter(vec![
                    Ok(WatchEvent::Added(pod(None))),
                    Ok(WatchEvent::Modified(pod(Some("")))),
                    Ok(WatchEvent::Modified(pod(Some("10.0.0.5")))),
                    Ok(WatchEvent::Modified(pod(Some("10.0.0.6")))),
                ])
                .boxed())
            });

        let ip = await_address(&mock, "default", "demo", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn deleted_pod_ip_is_not_reported() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_pod().returning(|_, _| Ok(Some(pod(None))));
        mock.expect_watch_pod().returning(|_, _, _, _| {
            Ok(stream::iter(vec![Ok(WatchEvent::Deleted(pod(Some("10.0.0.5"))))]).boxed())
        });

        let err = await_address(&mock, "default", "demo", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn stream_closing_without_ip_is_a_timeout() {
        let fake = FakeCluster::new(IpPlan::CloseEarly);
        fake.insert_pod(pod(None));

        let err = await_address(fake.as_ref(), "default", "demo", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(fake.open_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_into_timeout_and_closes_watch() {
        let fake = FakeCluster::new(IpPlan::Never);
        fake.insert_pod(pod(None));

        let err = await_address(fake.as_ref(), "default", "demo", Duration::from_secs(300))
            .await
            .unwrap_err();
        match err {
            Error::Timeout { timeout, .. } => assert_eq!(timeout, Duration::from_secs(300)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(fake.open_watches(), 0);
    }

    #[tokio::test]
    async fn watch_closed_by_server_reports_the_watch_timeout() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_pod().returning(|_, _| Ok(Some(pod(None))));
        mock.expect_watch_pod()
            .withf(|_, _, _, timeout| *timeout == MAX_WATCH_TIMEOUT)
            .returning(|_, _, _, _| {
                Ok(stream::iter(Vec::<Result<WatchEvent<Pod>, Error>>::new()).boxed())
            });

        let err = await_address(&mock, "default", "demo", Duration::from_secs(600))
            .await
            .unwrap_err();
        match err {
            Error::Timeout { timeout, .. } => assert_eq!(timeout, MAX_WATCH_TIMEOUT),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_closes_watch() {
        let fake = FakeCluster::new(IpPlan::Assign("10.0.0.5".to_string()));
        fake.insert_pod(pod(None));

        let ip = await_address(fake.as_ref(), "default", "demo", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(ip, "10.0.0.5");
        assert_eq!(fake.open_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_wait_closes_watch() {
        let fake = FakeCluster::new(IpPlan::Never);
        fake.insert_pod(pod(None));

        let api: Arc<dyn ClusterApi> = fake.clone();
        let task = tokio::spawn(async move {
            await_address(api.as_ref(), "default", "demo", Duration::from_secs(300)).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fake.open_watches(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(fake.open_watches(), 0);
    }

    #[tokio::test]
    async fn watch_error_event_is_a_backend_error() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_pod().returning(|_, _| Ok(Some(pod(None))));
        mock.expect_watch_pod().returning(|_, _, _, _| {
            Ok(stream::iter(vec![Ok(WatchEvent::Error(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "too old resource version".to_string(),
                reason: "Expired".to_string(),
                code: 410,
            }))])
            .boxed())
        });

        let err = await_address(&mock, "default", "demo", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kube { .. }));
        assert!(!err.is_timeout());
    }
}
