//! Integration tests for the claim/process/record cycle of all three queues.
//!
//! Runs against the in-memory store, which shares the row-lock semantics of
//! the Postgres claims (SKIP LOCKED, locks released at transaction end).
//!
//! Verifies:
//! - Concurrent claimers receive pairwise disjoint rows covering the eligible set
//! - Aborted transactions make their rows claimable again
//! - Abandoned SCIM syncs are reclaimed only after the staleness threshold
//! - Threaded Slack replies are never deliverable before their initial message
//! - Terminal states stay terminal

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::Barrier;

    use dispatch_core::{
        ConnectorId, DocumentId, OrganizationId, ScimConfigurationId, Scope, SlackMessageId,
    };

    use crate::export_jobs::{
        DocumentExportArguments, ExportArguments, ExportJob, ExportJobQueue, ExportJobStatus,
        ExportOutcome, NewExportJob,
    };
    use crate::scim_bridges::{
        NewScimBridge, ScimBridge, ScimBridgeState, ScimBridgeStore, ScimBridgeType, SyncPolicy,
        SyncScheduler,
    };
    use crate::slack_messages::{NewSlackMessage, OutboxRelay, SlackMessage, SlackMessageType};
    use crate::store::{InMemoryStore, Store, StoreError};

    const STALENESS: Duration = Duration::from_secs(900);

    fn init_tracing() {
        dispatch_observability::init();
    }

    fn document_export(org: OrganizationId) -> NewExportJob {
        NewExportJob::new(
            org,
            ExportArguments::Document(DocumentExportArguments {
                document_ids: vec![DocumentId::new(), DocumentId::new()],
                with_watermark: true,
                with_signatures: false,
            }),
            "auditor@example.com",
            "Auditor",
        )
    }

    async fn enqueue_exports(store: &InMemoryStore, count: usize) -> Vec<ExportJob> {
        let queue = ExportJobQueue::new(store.clone());
        let org = OrganizationId::new();
        let mut tx = store.begin().await.unwrap();
        let mut jobs = Vec::new();
        for _ in 0..count {
            jobs.push(
                queue
                    .enqueue(&mut tx, &Scope::organization(org), document_export(org))
                    .await
                    .unwrap(),
            );
        }
        store.commit(tx).await.unwrap();
        jobs
    }

    fn new_bridge(org: OrganizationId) -> NewScimBridge {
        NewScimBridge::new(
            org,
            ScimConfigurationId::new(),
            ConnectorId::new(),
            ScimBridgeType::GoogleWorkspace,
        )
        .with_excluded_user_names(vec!["admin@example.com".to_string()])
    }

    async fn insert_bridge(store: &InMemoryStore, bridge: &ScimBridge) {
        let mut tx = store.begin().await.unwrap();
        store.insert_scim_bridge(&mut tx, bridge).await.unwrap();
        store.commit(tx).await.unwrap();
    }

    fn access_request(org: OrganizationId) -> NewSlackMessage {
        NewSlackMessage::new(
            org,
            SlackMessageType::TrustCenterAccessRequest,
            json!({ "blocks": [{ "type": "section", "text": "New access request" }] }),
        )
        .with_requester_email("visitor@example.com")
    }

    // ------------------------------------------------------------------
    // Mutual exclusion
    // ------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_export_claims_are_disjoint_and_complete() {
        const ELIGIBLE: usize = 6;
        const WORKERS: usize = 8;

        let store = InMemoryStore::new();
        let jobs = enqueue_exports(&store, ELIGIBLE).await;
        let barrier = Arc::new(Barrier::new(WORKERS));

        let mut handles = Vec::new();
        for _ in 0..WORKERS {
            let store = store.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                let queue = ExportJobQueue::new(store.clone());
                let mut tx = store.begin().await.unwrap();
                let claimed = queue.claim_next_pending(&mut tx).await;
                // Hold every claim until all workers have tried.
                barrier.wait().await;
                store.rollback(tx).await.unwrap();
                claimed
            }));
        }

        let mut claimed = Vec::new();
        let mut empty = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(job) => claimed.push(job.id),
                Err(StoreError::NoExportJobAvailable) => empty += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(unique.len(), claimed.len(), "a job was claimed twice");
        assert_eq!(unique, jobs.iter().map(|job| job.id).collect::<HashSet<_>>());
        assert_eq!(empty, WORKERS - ELIGIBLE);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_scim_and_slack_claims_are_disjoint() {
        const ELIGIBLE: usize = 4;

        let store = InMemoryStore::new();
        let scheduler = SyncScheduler::new(store.clone(), SyncPolicy::default());
        let relay = OutboxRelay::new(store.clone());
        let org = OrganizationId::new();
        let scope = Scope::organization(org);

        let mut tx = store.begin().await.unwrap();
        for _ in 0..ELIGIBLE {
            scheduler.create(&mut tx, &scope, new_bridge(org)).await.unwrap();
            relay.enqueue(&mut tx, &scope, access_request(org)).await.unwrap();
        }
        store.commit(tx).await.unwrap();

        let barrier = Arc::new(Barrier::new(ELIGIBLE));
        let mut handles = Vec::new();
        for _ in 0..ELIGIBLE {
            let store = store.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                let scheduler = SyncScheduler::new(store.clone(), SyncPolicy::default());
                let relay = OutboxRelay::new(store.clone());
                let mut tx = store.begin().await.unwrap();
                let bridge = scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap();
                let message = relay.claim_next_unsent(&mut tx).await.unwrap();
                barrier.wait().await;
                store.rollback(tx).await.unwrap();
                (bridge.id, message.id)
            }));
        }

        let mut bridges = HashSet::new();
        let mut messages = HashSet::new();
        for handle in handles {
            let (bridge, message) = handle.await.unwrap();
            assert!(bridges.insert(bridge));
            assert!(messages.insert(message));
        }
        assert_eq!(bridges.len(), ELIGIBLE);
        assert_eq!(messages.len(), ELIGIBLE);
    }

    // ------------------------------------------------------------------
    // Export job scenarios
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn single_job_goes_to_exactly_one_of_two_workers() {
        let store = InMemoryStore::new();
        let queue = ExportJobQueue::new(store.clone());
        let job = enqueue_exports(&store, 1).await.remove(0);

        let mut tx1 = store.begin().await.unwrap();
        let mut tx2 = store.begin().await.unwrap();
        let mut winner = queue.claim_next_pending(&mut tx1).await.unwrap();
        let loser = queue.claim_next_pending(&mut tx2).await;

        assert_eq!(winner.id, job.id);
        assert_eq!(loser, Err(StoreError::NoExportJobAvailable));
        store.rollback(tx2).await.unwrap();

        queue.start(&mut tx1, &mut winner).await.unwrap();
        queue
            .complete(&mut tx1, &mut winner, ExportOutcome::Succeeded { file_id: None })
            .await
            .unwrap();
        store.commit(tx1).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            queue.claim_next_pending(&mut tx).await,
            Err(StoreError::NoExportJobAvailable)
        );

        let stored = queue.load_by_id(&mut tx, &Scope::Global, job.id).await.unwrap();
        assert_eq!(stored.status, ExportJobStatus::Completed);
    }

    #[tokio::test]
    async fn aborted_worker_releases_its_claim() {
        let store = InMemoryStore::new();
        let queue = ExportJobQueue::new(store.clone());
        let job = enqueue_exports(&store, 1).await.remove(0);

        let mut crashed = store.begin().await.unwrap();
        let mut claimed = queue.claim_next_pending(&mut crashed).await.unwrap();
        queue.start(&mut crashed, &mut claimed).await.unwrap();

        let mut other = store.begin().await.unwrap();
        assert!(queue.claim_next_pending(&mut other).await.unwrap_err().is_empty_queue());
        store.rollback(other).await.unwrap();

        // The worker dies without committing.
        drop(crashed);

        let mut tx = store.begin().await.unwrap();
        let reclaimed = queue.claim_next_pending(&mut tx).await.unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.status, ExportJobStatus::Pending);
        assert!(reclaimed.started_at.is_none());
    }

    #[tokio::test]
    async fn export_jobs_are_claimed_oldest_first() {
        let store = InMemoryStore::new();
        let queue = ExportJobQueue::new(store.clone());
        let jobs = enqueue_exports(&store, 3).await;

        let mut tx = store.begin().await.unwrap();
        for expected in &jobs {
            let mut job = queue.claim_next_pending(&mut tx).await.unwrap();
            assert_eq!(job.id, expected.id);
            queue.start(&mut tx, &mut job).await.unwrap();
        }
        store.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn failed_export_is_terminal() {
        let store = InMemoryStore::new();
        let queue = ExportJobQueue::new(store.clone());
        enqueue_exports(&store, 1).await;

        let mut tx = store.begin().await.unwrap();
        let mut job = queue.claim_next_pending(&mut tx).await.unwrap();
        queue.start(&mut tx, &mut job).await.unwrap();
        queue
            .complete(
                &mut tx,
                &mut job,
                ExportOutcome::Failed {
                    error: "renderer crashed".to_string(),
                },
            )
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(queue.claim_next_pending(&mut tx).await.unwrap_err().is_empty_queue());
        let err = queue.start(&mut tx, &mut job).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn export_jobs_are_tenant_scoped() {
        let store = InMemoryStore::new();
        let queue = ExportJobQueue::new(store.clone());
        let job = enqueue_exports(&store, 1).await.remove(0);

        let mut tx = store.begin().await.unwrap();
        let other_tenant = Scope::organization(OrganizationId::new());
        assert!(
            queue
                .load_by_id(&mut tx, &other_tenant, job.id)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            queue
                .enqueue(&mut tx, &other_tenant, document_export(job.organization_id))
                .await
                .unwrap_err()
                .is_not_found()
        );
        let own = Scope::organization(job.organization_id);
        assert_eq!(queue.load_by_id(&mut tx, &own, job.id).await.unwrap(), job);
    }

    // ------------------------------------------------------------------
    // SCIM bridge scheduling
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn abandoned_sync_is_reclaimed_only_after_staleness_threshold() {
        init_tracing();
        let store = InMemoryStore::new();
        let scheduler = SyncScheduler::new(store.clone(), SyncPolicy::default());
        let threshold = chrono::Duration::from_std(STALENESS).unwrap();

        let mut fresh = new_bridge(OrganizationId::new()).into_bridge(Utc::now());
        fresh.state = ScimBridgeState::Syncing;
        fresh.updated_at = Utc::now() - threshold + chrono::Duration::seconds(1);
        insert_bridge(&store, &fresh).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            scheduler.claim_next_due(&mut tx, STALENESS).await,
            Err(StoreError::NoScimBridgeAvailable)
        );
        store.rollback(tx).await.unwrap();

        let mut stale = new_bridge(OrganizationId::new()).into_bridge(Utc::now());
        stale.state = ScimBridgeState::Syncing;
        stale.updated_at = Utc::now() - threshold - chrono::Duration::seconds(1);
        insert_bridge(&store, &stale).await;

        let mut tx = store.begin().await.unwrap();
        let mut reclaimed = scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap();
        assert_eq!(reclaimed.id, stale.id);

        // Re-entering Syncing refreshes the liveness timestamp.
        scheduler.begin_sync(&mut tx, &mut reclaimed).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap_err().is_empty_queue());
    }

    #[tokio::test]
    async fn two_phase_sync_cycle_with_backoff() {
        let store = InMemoryStore::new();
        let scheduler = SyncScheduler::new(store.clone(), SyncPolicy::default());
        let org = OrganizationId::new();

        let mut tx = store.begin().await.unwrap();
        let created = scheduler
            .create(&mut tx, &Scope::organization(org), new_bridge(org))
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        // tx1: claim and commit Syncing.
        let mut tx = store.begin().await.unwrap();
        let mut bridge = scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap();
        scheduler.begin_sync(&mut tx, &mut bridge).await.unwrap();
        store.commit(tx).await.unwrap();
        assert_eq!(store.held_locks(), 0);

        // While the sync runs nobody else picks the bridge up.
        let mut tx = store.begin().await.unwrap();
        assert!(scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap_err().is_empty_queue());
        store.rollback(tx).await.unwrap();

        // tx2: record the failure.
        let mut tx = store.begin().await.unwrap();
        let failed = scheduler
            .record_failure(&mut tx, &bridge, "invalid_grant")
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(failed.id, created.id);
        assert_eq!(failed.state, ScimBridgeState::Failed);
        assert_eq!(failed.consecutive_failures, 1);
        assert_eq!(failed.total_failure_count, 1);
        assert_eq!(failed.total_sync_count, 0);
        assert_eq!(failed.excluded_user_names, vec!["admin@example.com".to_string()]);
        assert!(failed.next_sync_at.unwrap() > Utc::now());

        // Backing off: not due yet, and a repeated outcome is rejected.
        let mut tx = store.begin().await.unwrap();
        assert!(scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap_err().is_empty_queue());
        let err = scheduler.record_success(&mut tx, &bridge).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
        store.rollback(tx).await.unwrap();

        // Let the backoff lapse and run the next cycle.
        let mut lapsed = failed.clone();
        lapsed.next_sync_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let mut tx = store.begin().await.unwrap();
        store
            .update_scim_bridge(&mut tx, &Scope::organization(org), &lapsed)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut bridge = scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap();
        scheduler.begin_sync(&mut tx, &mut bridge).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let succeeded = scheduler.record_success(&mut tx, &bridge).await.unwrap();
        store.commit(tx).await.unwrap();
        assert_eq!(succeeded.state, ScimBridgeState::Active);
        assert_eq!(succeeded.consecutive_failures, 0);
        assert_eq!(succeeded.total_sync_count, 1);
        assert_eq!(succeeded.total_failure_count, 1);
        assert!(succeeded.sync_error.is_none());
    }

    #[tokio::test]
    async fn disabled_bridge_is_never_due() {
        let store = InMemoryStore::new();
        let scheduler = SyncScheduler::new(store.clone(), SyncPolicy::default());
        let org = OrganizationId::new();
        let scope = Scope::organization(org);

        let mut tx = store.begin().await.unwrap();
        let bridge = scheduler.create(&mut tx, &scope, new_bridge(org)).await.unwrap();
        scheduler.disable(&mut tx, &scope, bridge.id).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap_err().is_empty_queue());
        scheduler.enable(&mut tx, &scope, bridge.id).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap().id,
            bridge.id
        );
    }

    #[tokio::test]
    async fn disabling_during_a_sync_wins_over_its_outcome() {
        let store = InMemoryStore::new();
        let scheduler = SyncScheduler::new(store.clone(), SyncPolicy::default());
        let org = OrganizationId::new();
        let scope = Scope::organization(org);

        let mut tx = store.begin().await.unwrap();
        scheduler.create(&mut tx, &scope, new_bridge(org)).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut bridge = scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap();
        scheduler.begin_sync(&mut tx, &mut bridge).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        scheduler.disable(&mut tx, &scope, bridge.id).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = scheduler.record_success(&mut tx, &bridge).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
        let err = scheduler
            .record_failure(&mut tx, &bridge, "timeout")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
        store.rollback(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let stored = scheduler.load_by_id(&mut tx, &scope, bridge.id).await.unwrap();
        assert_eq!(stored.state, ScimBridgeState::Disabled);
        assert_eq!(stored.total_sync_count, 0);
        assert_eq!(stored.total_failure_count, 0);
        assert!(scheduler.claim_next_due(&mut tx, STALENESS).await.unwrap_err().is_empty_queue());
    }

    #[tokio::test]
    async fn one_bridge_per_scim_configuration() {
        let store = InMemoryStore::new();
        let scheduler = SyncScheduler::new(store.clone(), SyncPolicy::default());
        let org = OrganizationId::new();
        let scope = Scope::organization(org);
        let first = new_bridge(org);
        let mut duplicate = new_bridge(org);
        duplicate.scim_configuration_id = first.scim_configuration_id;

        let mut tx = store.begin().await.unwrap();
        let bridge = scheduler.create(&mut tx, &scope, first).await.unwrap();
        let err = scheduler.create(&mut tx, &scope, duplicate).await.unwrap_err();
        assert!(matches!(err, StoreError::ResourceAlreadyExists { .. }));

        let loaded = scheduler
            .load_by_scim_configuration_id(&mut tx, &scope, bridge.scim_configuration_id)
            .await
            .unwrap();
        assert_eq!(loaded.id, bridge.id);

        let updated = scheduler
            .update_excluded_user_names(&mut tx, &scope, bridge.id, vec![])
            .await
            .unwrap();
        assert!(updated.excluded_user_names.is_empty());

        scheduler.delete(&mut tx, &scope, bridge.id).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(
            scheduler
                .load_by_id(&mut tx, &scope, bridge.id)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    // ------------------------------------------------------------------
    // Slack outbox ordering
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn reply_waits_for_its_initial_message() {
        let store = InMemoryStore::new();
        let relay = OutboxRelay::new(store.clone());
        let org = OrganizationId::new();
        let scope = Scope::organization(org);

        let mut tx = store.begin().await.unwrap();
        let initial = relay.enqueue(&mut tx, &scope, access_request(org)).await.unwrap();
        let update = relay
            .enqueue(&mut tx, &scope, access_request(org).in_reply_to(initial.id))
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut claimed = relay.claim_next_initial_unsent(&mut tx).await.unwrap();
        assert_eq!(claimed.id, initial.id);
        assert_eq!(
            relay.claim_next_update_unsent(&mut tx).await,
            Err(StoreError::NoUnsentSlackMessage)
        );

        relay
            .mark_sent(&mut tx, &mut claimed, "1700000000.000100", "C0123")
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let reply = relay.claim_next_update_unsent(&mut tx).await.unwrap();
        assert_eq!(reply.id, update.id);
        // Location back-filled from the initial.
        assert_eq!(reply.channel_id.as_deref(), Some("C0123"));
        assert_eq!(reply.message_ts.as_deref(), Some("1700000000.000100"));

        let found = relay
            .load_initial_by_channel_and_ts(&mut tx, &scope, "C0123", "1700000000.000100")
            .await
            .unwrap();
        assert_eq!(found.id, initial.id);
    }

    #[tokio::test]
    async fn reply_to_a_failed_initial_is_never_deliverable() {
        let store = InMemoryStore::new();
        let relay = OutboxRelay::new(store.clone());
        let org = OrganizationId::new();
        let scope = Scope::organization(org);

        let mut tx = store.begin().await.unwrap();
        let initial = relay.enqueue(&mut tx, &scope, access_request(org)).await.unwrap();
        let update = relay
            .enqueue(&mut tx, &scope, access_request(org).in_reply_to(initial.id))
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut claimed = relay.claim_next_initial_unsent(&mut tx).await.unwrap();
        relay
            .mark_failed(&mut tx, &mut claimed, "channel_not_found")
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            relay.claim_next_update_unsent(&mut tx).await,
            Err(StoreError::NoUnsentSlackMessage)
        );
        assert_eq!(
            relay.claim_next_initial_unsent(&mut tx).await,
            Err(StoreError::NoUnsentSlackMessage)
        );

        let pending = relay.load_by_id(&mut tx, &scope, update.id).await.unwrap();
        assert!(pending.is_pending());
        assert!(pending.channel_id.is_none());
        assert!(pending.message_ts.is_none());
    }

    #[tokio::test]
    async fn unknown_thread_location_is_reported_as_missing() {
        let store = InMemoryStore::new();
        let relay = OutboxRelay::new(store.clone());
        let org = OrganizationId::new();
        let scope = Scope::organization(org);

        let mut tx = store.begin().await.unwrap();
        let mut initial = relay.enqueue(&mut tx, &scope, access_request(org)).await.unwrap();
        relay
            .mark_sent(&mut tx, &mut initial, "1700000000.000300", "C0789")
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = relay
            .load_initial_by_channel_and_ts(&mut tx, &scope, "C0789", "1700000000.999999")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::slack_thread_not_found("C0789", "1700000000.999999")
        );
        assert!(err.is_not_found());

        let foreign = Scope::organization(OrganizationId::new());
        let err = relay
            .load_initial_by_channel_and_ts(&mut tx, &foreign, "C0789", "1700000000.000300")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SlackThreadNotFound { .. }));
    }

    #[tokio::test]
    async fn reply_to_a_sent_initial_inherits_its_location() {
        let store = InMemoryStore::new();
        let relay = OutboxRelay::new(store.clone());
        let org = OrganizationId::new();
        let scope = Scope::organization(org);

        let mut tx = store.begin().await.unwrap();
        let mut initial = relay.enqueue(&mut tx, &scope, access_request(org)).await.unwrap();
        relay
            .mark_sent(&mut tx, &mut initial, "1700000000.000200", "C0456")
            .await
            .unwrap();
        let reply = relay
            .enqueue(&mut tx, &scope, access_request(org).in_reply_to(initial.id))
            .await
            .unwrap();

        assert_eq!(reply.channel_id.as_deref(), Some("C0456"));
        assert_eq!(reply.message_ts.as_deref(), Some("1700000000.000200"));
    }

    #[tokio::test]
    async fn reply_to_unknown_or_foreign_initial_is_rejected() {
        let store = InMemoryStore::new();
        let relay = OutboxRelay::new(store.clone());
        let org = OrganizationId::new();
        let other = OrganizationId::new();

        let mut tx = store.begin().await.unwrap();
        let missing = SlackMessageId::new();
        assert_eq!(
            relay
                .enqueue(
                    &mut tx,
                    &Scope::organization(org),
                    access_request(org).in_reply_to(missing),
                )
                .await,
            Err(StoreError::SlackMessageNotFound(missing))
        );

        let foreign = relay
            .enqueue(&mut tx, &Scope::organization(other), access_request(other))
            .await
            .unwrap();
        assert_eq!(
            relay
                .enqueue(
                    &mut tx,
                    &Scope::organization(org),
                    access_request(org).in_reply_to(foreign.id)
                )
                .await,
            Err(StoreError::SlackMessageNotFound(foreign.id))
        );
    }

    #[tokio::test]
    async fn terminal_slack_states_are_final() {
        let store = InMemoryStore::new();
        let relay = OutboxRelay::new(store.clone());
        let org = OrganizationId::new();
        let scope = Scope::organization(org);

        let mut tx = store.begin().await.unwrap();
        let mut failed = relay.enqueue(&mut tx, &scope, access_request(org)).await.unwrap();
        let mut sent = relay.enqueue(&mut tx, &scope, access_request(org)).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        relay.mark_failed(&mut tx, &mut failed, "not_in_channel").await.unwrap();
        let err = relay
            .mark_sent(&mut tx, &mut failed, "1700000000.000300", "C0789")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));

        relay
            .mark_sent(&mut tx, &mut sent, "1700000000.000400", "C0789")
            .await
            .unwrap();
        assert!(relay.mark_failed(&mut tx, &mut sent, "late").await.is_err());
        store.commit(tx).await.unwrap();

        for message in store.slack_messages() {
            assert!(
                message.sent_at.is_none() || message.error.is_none(),
                "both terminal markers set on {}",
                message.id
            );
        }
        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            relay.claim_next_unsent(&mut tx).await,
            Err(StoreError::NoUnsentSlackMessage)
        );
        let stored_failed = relay.load_by_id(&mut tx, &scope, failed.id).await.unwrap();
        assert_eq!(stored_failed.error.as_deref(), Some("not_in_channel"));
    }

    #[tokio::test]
    async fn latest_message_by_requester_supports_dedupe() {
        let store = InMemoryStore::new();
        let relay = OutboxRelay::new(store.clone());
        let org = OrganizationId::new();
        let scope = Scope::organization(org);
        let window_start = Utc::now() - chrono::Duration::hours(1);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            relay
                .load_latest_by_requester_email_and_type(
                    &mut tx,
                    &scope,
                    "visitor@example.com",
                    SlackMessageType::TrustCenterAccessRequest,
                    window_start,
                )
                .await
                .unwrap(),
            None
        );

        relay.enqueue(&mut tx, &scope, access_request(org)).await.unwrap();
        let latest: SlackMessage =
            relay.enqueue(&mut tx, &scope, access_request(org)).await.unwrap();

        let found = relay
            .load_latest_by_requester_email_and_type(
                &mut tx,
                &scope,
                "visitor@example.com",
                SlackMessageType::TrustCenterAccessRequest,
                window_start,
            )
            .await
            .unwrap();
        assert_eq!(found.map(|message| message.id), Some(latest.id));

        let other_type = relay
            .load_latest_by_requester_email_and_type(
                &mut tx,
                &scope,
                "visitor@example.com",
                SlackMessageType::TrustCenterDocumentAccessRequest,
                window_start,
            )
            .await
            .unwrap();
        assert!(other_type.is_none());
    }

    // ------------------------------------------------------------------
    // Worker lifecycle
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn spawned_worker_stops_on_shutdown() {
        use crate::export_jobs::ExportJob;
        use crate::workers::{ExportProcessor, ExportWorker, PollConfig, WorkerHandle};

        struct NoopProcessor;

        #[async_trait::async_trait]
        impl ExportProcessor for NoopProcessor {
            async fn process(
                &self,
                _job: &ExportJob,
            ) -> anyhow::Result<Option<dispatch_core::FileId>> {
                Ok(None)
            }
        }

        init_tracing();
        let store = InMemoryStore::new();
        enqueue_exports(&store, 2).await;
        let handle = WorkerHandle::spawn(ExportWorker::new(
            ExportJobQueue::new(store.clone()),
            NoopProcessor,
            PollConfig {
                poll_interval: Duration::from_millis(10),
                jitter: Duration::from_millis(5),
                shutdown_when_queue_empty: false,
            },
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store
                .export_jobs()
                .iter()
                .any(|job| job.status != ExportJobStatus::Completed)
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker did not drain the queue");

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("worker did not stop");
    }
}
