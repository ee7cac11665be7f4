//! Backend change notifications.
//!
//! An event only names the emitting deployment and the object key. Nothing
//! is applied incrementally: a matching event triggers a full inventory
//! resync and mirrors the home copy to every replica, so duplicated or lost
//! events converge on the next one.

use crate::{
    errors::ServiceResult,
    services::{inventory::InventoryDiff, metadata, orchestrator::Orchestrator},
};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyEvent {
    #[serde(rename = "EventName", default)]
    pub event_name: String,
    /// `<bucket>/<object key>`
    #[serde(rename = "Key", default)]
    pub key: String,
    #[serde(rename = "Records", default)]
    pub records: Vec<NotifyRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyRecord {
    #[serde(rename = "responseElements", default)]
    pub response_elements: ResponseElements,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseElements {
    #[serde(rename = "x-minio-deployment-id", default)]
    pub deployment_id: String,
}

impl NotifyEvent {
    /// Deployment identity of the emitting backend.
    pub fn deployment_id(&self) -> Option<&str> {
        self.records
            .iter()
            .rev()
            .map(|r| r.response_elements.deployment_id.as_str())
            .find(|id| !id.is_empty())
    }

    pub fn bucket_name(&self) -> Option<&str> {
        self.key.split('/').next().filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Missing bucket name or emitter.
    NotActionable,
    /// Unknown bucket, or emitted by a deployment other than its home.
    Discarded,
    Reconciled(InventoryDiff),
}

impl Orchestrator {
    /// Process one backend event in its own transaction.
    pub async fn handle_notification(&self, event: &NotifyEvent) -> ServiceResult<NotifyOutcome> {
        let (Some(bucket_name), Some(deployment_id)) = (event.bucket_name(), event.deployment_id())
        else {
            debug!(event = %event.event_name, "notification not actionable");
            return Ok(NotifyOutcome::NotActionable);
        };
        info!(bucket = bucket_name, deployment_id, event = %event.event_name, "notification received");

        let mut tx = self.begin_write().await?;

        let Some(bucket) = metadata::find_bucket_by_name(&mut tx, bucket_name).await? else {
            info!(bucket = bucket_name, "notification for unknown bucket discarded");
            return Ok(NotifyOutcome::Discarded);
        };
        let emitter = metadata::find_storage_by_deployment_id(&mut tx, deployment_id).await?;
        if emitter.map(|s| s.id) != Some(bucket.storage_id) {
            info!(bucket = bucket_name, deployment_id, "notification from a non-home deployment discarded");
            return Ok(NotifyOutcome::Discarded);
        }

        let diff = self.track_bucket_objects(&mut tx, &bucket).await?;
        self.replicate_bucket(&mut tx, &bucket).await?;
        tx.commit().await?;

        Ok(NotifyOutcome::Reconciled(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::bucket::ReplicaLocation,
        services::testing::{Harness, cluster, harness, storage},
    };
    use serde_json::json;

    fn event(key: &str, deployment_id: &str) -> NotifyEvent {
        serde_json::from_value(json!({
            "EventName": "s3:ObjectCreated:Put",
            "Key": key,
            "Records": [{"responseElements": {"x-minio-deployment-id": deployment_id}}]
        }))
        .unwrap()
    }

    /// `photos` homed on s1 with a replica on s2.
    async fn replicated() -> (Harness, i64) {
        let h = harness().await;
        let mut tx = h.pool.begin().await.unwrap();
        let a = cluster(&mut tx, "a", &[]).await;
        let b = cluster(&mut tx, "b", &[]).await;
        let s1 = storage(&mut tx, a.id, "s1").await;
        let s2 = storage(&mut tx, b.id, "s2").await;
        let bucket = metadata::insert_bucket(&mut tx, s1.id, "photos").await.unwrap();
        metadata::insert_replica_location(
            &mut tx,
            ReplicaLocation {
                bucket_id: bucket.id,
                storage_id: s2.id,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        (h, bucket.id)
    }

    #[test]
    fn payload_fields_are_extracted() {
        let e = event("photos/2024/cat.jpg", "d1");
        assert_eq!(e.bucket_name(), Some("photos"));
        assert_eq!(e.deployment_id(), Some("d1"));

        let empty: NotifyEvent = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.bucket_name(), None);
        assert_eq!(empty.deployment_id(), None);
    }

    #[tokio::test]
    async fn home_event_resyncs_and_mirrors() {
        let (h, bucket_id) = replicated().await;
        h.backend.put_object("s1", "photos", "cat.jpg");

        let outcome = h
            .orchestrator
            .handle_notification(&event("photos/cat.jpg", "s1-id"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            NotifyOutcome::Reconciled(InventoryDiff {
                inserted: 1,
                deleted: 0
            })
        );
        assert_eq!(h.backend.objects("s2", "photos"), vec!["cat.jpg"]);
        let mut conn = h.pool.acquire().await.unwrap();
        assert_eq!(metadata::list_objects(&mut conn, bucket_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replica_event_is_discarded() {
        let (h, _) = replicated().await;
        h.backend.put_object("s2", "photos", "stray.jpg");

        let outcome = h
            .orchestrator
            .handle_notification(&event("photos/stray.jpg", "s2-id"))
            .await
            .unwrap();

        assert_eq!(outcome, NotifyOutcome::Discarded);
        assert!(h.backend.calls("mirror").is_empty());
        assert!(h.backend.calls("ls-objects").is_empty());
    }

    #[tokio::test]
    async fn unknown_bucket_and_empty_payload_are_ignored() {
        let (h, _) = replicated().await;

        let outcome = h
            .orchestrator
            .handle_notification(&event("videos/a.mp4", "s1-id"))
            .await
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Discarded);

        let outcome = h
            .orchestrator
            .handle_notification(&NotifyEvent::default())
            .await
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::NotActionable);
    }
}
