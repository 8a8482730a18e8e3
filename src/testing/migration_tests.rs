//! Chunk migration end-to-end tests.
//!
//! Each test runs `moveChunk` between real shard nodes over the in-process
//! network. Step failpoints hold a donor or recipient at a known step so the
//! test can observe or interfere with the migration.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::command::{Command, CommandDispatcher, ReplyBody, ADMIN_DB};
    use crate::doc;
    use crate::error::{Error, ErrorCode};
    use crate::keys::{ShardKey, ShardKeyPattern, Value};
    use crate::sharding::{MoveChunkRequest, MIGRATE_THREAD_DESC, MOVE_CHUNK_DESC};
    use crate::testing::{key_range, shard_name, wait_until, TestCluster};
    use crate::types::Namespace;
    use test_log::test;

    const PAUSE_WAIT: Duration = Duration::from_secs(5);

    fn ns() -> Namespace {
        Namespace::new("foo.bar")
    }

    /// Two shards, `foo.bar` sharded on `_id` and split at 0, ids -10..10
    /// inserted. Everything starts on shard 0.
    async fn setup() -> TestCluster {
        let cluster = TestCluster::new(2);
        cluster
            .shard_collection(&ns(), ShardKeyPattern::ascending(&["_id"]).unwrap())
            .await
            .unwrap();
        cluster.split(&ns(), ShardKey::single(0)).await.unwrap();
        cluster
            .insert_many(&ns(), (-10..10).map(|i| doc! { "_id" => i }))
            .await
            .unwrap();
        cluster
    }

    fn upper_half() -> MoveChunkRequest {
        MoveChunkRequest::with_bounds(ns(), key_range(0, Value::MaxKey), shard_name(1))
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_move_chunk_moves_documents_and_versions() {
        let cluster = setup().await;
        cluster
            .move_chunk(&ns(), key_range(0, Value::MaxKey), 0, 1)
            .await
            .unwrap();

        let shard0 = cluster.shard(0);
        let shard1 = cluster.shard(1);
        assert_eq!(shard0.count(&ns()), 10);
        assert_eq!(shard1.count(&ns()), 10);
        assert!(shard0.get(&ns(), &5.into()).is_none());
        assert!(shard1.get(&ns(), &5.into()).is_some());

        let donor_md = shard0.collection_metadata(&ns()).unwrap();
        assert_eq!(donor_md.num_chunks(), 1);
        assert_eq!(
            (donor_md.shard_version().major, donor_md.shard_version().minor),
            (2, 1)
        );
        assert!(!donor_md.key_belongs_to_me(&ShardKey::single(5)));

        let promoted = wait_until(
            || {
                shard1
                    .collection_metadata(&ns())
                    .map_or(false, |md| md.key_belongs_to_me(&ShardKey::single(5)))
            },
            PAUSE_WAIT,
        )
        .await;
        assert!(promoted, "recipient never promoted its pending range");
        let recipient_md = shard1.collection_metadata(&ns()).unwrap();
        assert_eq!(recipient_md.num_pending(), 0);
        assert_eq!(recipient_md.shard_version().major, 2);

        assert_eq!(cluster.router.count(&ns()).await.unwrap(), 20);
        assert!(cluster.locks.holder(&ns()).is_none());
        assert!(!shard0.donor().is_migrating(&ns()));
        assert!(shard0.active_ops().list().is_empty());

        let donor_metrics = shard0.metrics().snapshot();
        assert_eq!(donor_metrics.migrations_started, 1);
        assert_eq!(donor_metrics.migrations_committed, 1);
        assert_eq!(donor_metrics.migrations_active, 0);
        assert_eq!(donor_metrics.post_move_deleted, 10);
        assert_eq!(shard1.metrics().snapshot().docs_cloned, 10);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_move_chunk_by_find() {
        let cluster = setup().await;
        cluster
            .shard(0)
            .move_chunk(MoveChunkRequest::with_find(ns(), doc! { "_id" => -3 }, shard_name(1)).wait_for_delete(true))
            .await
            .unwrap();

        assert_eq!(cluster.shard(0).count(&ns()), 10);
        assert!(cluster.shard(1).get(&ns(), &(-3).into()).is_some());
        let routing = cluster.config.routing(&ns()).unwrap();
        let moved = routing.chunk_with_bounds(&key_range(Value::MinKey, 0)).unwrap();
        assert_eq!(moved.owner, shard_name(1));
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_invalid_requests_rejected() {
        let cluster = setup().await;
        let shard0 = cluster.shard(0);

        let to_self = MoveChunkRequest::with_bounds(ns(), key_range(0, Value::MaxKey), shard_name(0));
        assert!(matches!(
            shard0.move_chunk(to_self).await,
            Err(Error::InvalidArgument(_))
        ));

        let not_a_chunk = MoveChunkRequest::with_bounds(ns(), key_range(0, 5), shard_name(1));
        assert!(matches!(
            shard0.move_chunk(not_a_chunk).await,
            Err(Error::InvalidArgument(_))
        ));

        let mut both = upper_half();
        both.find = Some(doc! { "_id" => 1 });
        assert!(matches!(shard0.move_chunk(both).await, Err(Error::InvalidArgument(_))));

        let unsharded = MoveChunkRequest::with_find(Namespace::new("foo.plain"), doc! { "_id" => 1 }, shard_name(1));
        assert!(matches!(shard0.move_chunk(unsharded).await, Err(Error::Unsharded(_))));

        assert!(cluster.locks.holder(&ns()).is_none());
        assert_eq!(shard0.count(&ns()), 20);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_writes_during_migration_reach_recipient() {
        let cluster = setup().await;
        let shard0 = cluster.shard(0).clone();
        let shard1 = cluster.shard(1).clone();
        shard1.failpoints().enable("migrateThreadHangAtStep3").unwrap();

        let donor = shard0.clone();
        let migration = tokio::spawn(async move { donor.move_chunk(upper_half().wait_for_delete(true)).await });
        shard1
            .active_ops()
            .wait_for_msg(MIGRATE_THREAD_DESC, "step 3 of 5", PAUSE_WAIT)
            .await
            .unwrap();
        assert!(shard0.donor().is_migrating(&ns()));

        // Cloned already; these must travel as mods.
        for id in 10..15 {
            cluster.router.insert(&ns(), doc! { "_id" => id }).await.unwrap();
        }
        cluster
            .router
            .insert(&ns(), doc! { "_id" => 1, "updated" => true })
            .await
            .unwrap();
        shard0.delete(&ns(), &3.into()).unwrap();

        // Keep writing while the migration commits.
        let router = cluster.router.clone();
        let writer = tokio::spawn(async move {
            for id in 100..150 {
                router.insert(&ns(), doc! { "_id" => id }).await?;
            }
            Ok::<_, Error>(())
        });

        shard1.failpoints().disable("migrateThreadHangAtStep3");
        migration.await.unwrap().unwrap();
        writer.await.unwrap().unwrap();

        assert!(shard1.get(&ns(), &3.into()).is_none());
        assert!(shard1.get(&ns(), &12.into()).is_some());
        assert_eq!(
            shard1.get(&ns(), &1.into()).and_then(|d| d.get("updated").cloned()),
            Some(Value::Bool(true))
        );
        // 10 below zero, 9 original, 5 during the pause, 50 during the commit.
        assert_eq!(cluster.router.count(&ns()).await.unwrap(), 74);
        assert!(shard1.metrics().snapshot().mods_applied >= 7);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_lock_contention() {
        let cluster = setup().await;
        let shard0 = cluster.shard(0).clone();
        shard0.failpoints().enable("moveChunkHangAtStep1").unwrap();

        let donor = shard0.clone();
        let first = tokio::spawn(async move { donor.move_chunk(upper_half()).await });
        shard0
            .active_ops()
            .wait_for_msg(MOVE_CHUNK_DESC, "step 1 of 6", PAUSE_WAIT)
            .await
            .unwrap();
        let holder = cluster.locks.holder(&ns()).unwrap();
        assert_eq!(holder.holder, shard_name(0).as_str());

        let lower = MoveChunkRequest::with_bounds(ns(), key_range(Value::MinKey, 0), shard_name(1));
        let err = shard0.move_chunk(lower).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockContention);

        shard0.failpoints().disable("moveChunkHangAtStep1");
        first.await.unwrap().unwrap();

        // A lock taken by someone else blocks the same way.
        let _guard = cluster.locks.try_lock(&ns(), "balancer", "testing").unwrap();
        let err = shard0
            .move_chunk(MoveChunkRequest::with_bounds(ns(), key_range(Value::MinKey, 0), shard_name(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
        assert_eq!(shard0.metrics().snapshot().migrations_committed, 1);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_lock_contention_in_critical_section() {
        let cluster = setup().await;
        let shard0 = cluster.shard(0).clone();
        shard0.failpoints().enable("moveChunkHangAtStep4").unwrap();

        let donor = shard0.clone();
        let first = tokio::spawn(async move { donor.move_chunk(upper_half()).await });
        shard0
            .active_ops()
            .wait_for_msg(MOVE_CHUNK_DESC, "step 4 of 6", PAUSE_WAIT)
            .await
            .unwrap();
        assert!(shard0.donor().is_migrating(&ns()));

        let lower = || MoveChunkRequest::with_bounds(ns(), key_range(Value::MinKey, 0), shard_name(1));
        let err = shard0.move_chunk(lower()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockContention, "{}", err);
        assert_eq!(cluster.locks.holder(&ns()).unwrap().holder, shard_name(0).as_str());

        // Without the lock, the running session still keeps a second one out.
        assert!(cluster.locks.force_unlock(&ns()));
        let err = shard0.move_chunk(lower()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConflictingOperationInProgress, "{}", err);
        assert!(cluster.locks.holder(&ns()).is_none());

        shard0.failpoints().disable("moveChunkHangAtStep4");
        first.await.unwrap().unwrap();
        assert_eq!(cluster.shard(1).count(&ns()), 10);
        assert_eq!(shard0.metrics().snapshot().migrations_committed, 1);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_abort_when_recipient_unreachable() {
        let cluster = setup().await;
        let shard0 = cluster.shard(0);
        cluster.network.set_unreachable(&shard_name(1), true);

        let err = shard0.move_chunk(upper_half()).await.unwrap_err();
        assert!(matches!(err, Error::ShardUnreachable(_)), "unexpected error: {}", err);

        let routing = cluster.config.routing(&ns()).unwrap();
        assert!(routing.chunks.iter().all(|c| c.owner == shard_name(0)));
        assert!(shard0
            .collection_metadata(&ns())
            .unwrap()
            .key_belongs_to_me(&ShardKey::single(5)));
        assert!(cluster.locks.holder(&ns()).is_none());
        assert!(!shard0.donor().is_migrating(&ns()));
        assert_eq!(shard0.count(&ns()), 20);
        assert_eq!(shard0.metrics().snapshot().migrations_aborted, 1);

        cluster.network.set_unreachable(&shard_name(1), false);
        shard0.move_chunk(upper_half().wait_for_delete(true)).await.unwrap();
        assert_eq!(cluster.shard(1).count(&ns()), 10);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_abort_discards_recipient_pending_range() {
        let cluster = TestCluster::with_config(2, |config| {
            config.with_migration_config(
                crate::config::MigrationConfig::for_tests().with_clone_timeout(Duration::from_millis(300)),
            )
        });
        cluster
            .shard_collection(&ns(), ShardKeyPattern::ascending(&["_id"]).unwrap())
            .await
            .unwrap();
        cluster.split(&ns(), ShardKey::single(0)).await.unwrap();
        cluster
            .insert_many(&ns(), (-10..10).map(|i| doc! { "_id" => i }))
            .await
            .unwrap();
        let shard1 = cluster.shard(1).clone();
        shard1.failpoints().enable("migrateThreadHangAtStep3").unwrap();

        // The donor gives up waiting for the paused recipient.
        let err = cluster.shard(0).move_chunk(upper_half()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "unexpected error: {}", err);
        assert!(shard1
            .collection_metadata(&ns())
            .unwrap()
            .key_is_pending(&ShardKey::single(5)));

        shard1.failpoints().disable("migrateThreadHangAtStep3");
        let discarded = wait_until(
            || {
                shard1
                    .collection_metadata(&ns())
                    .map_or(false, |md| md.num_pending() == 0)
            },
            PAUSE_WAIT,
        )
        .await;
        assert!(discarded, "aborted receive kept its pending range");

        // The cloned documents are now orphans on the recipient.
        let (_, deleted) = cluster.cleanup_fully(&ns(), 1).await.unwrap();
        assert_eq!(deleted, 10);
        assert_eq!(cluster.router.count(&ns()).await.unwrap(), 20);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_pending_range_reported_then_promoted() {
        let cluster = setup().await;
        let shard0 = cluster.shard(0).clone();
        let shard1 = cluster.shard(1).clone();
        shard1.failpoints().enable("migrateThreadHangAtStep3").unwrap();

        let donor = shard0.clone();
        let migration = tokio::spawn(async move { donor.move_chunk(upper_half().wait_for_delete(true)).await });
        shard1
            .active_ops()
            .wait_for_msg(MIGRATE_THREAD_DESC, "step 3 of 5", PAUSE_WAIT)
            .await
            .unwrap();

        let reply = shard1
            .run_command(
                ADMIN_DB,
                Command::GetShardVersion {
                    ns: ns(),
                    full_metadata: true,
                },
            )
            .await;
        let ReplyBody::ShardVersion(info) = reply.into_result().unwrap() else {
            panic!("expected a shard version reply");
        };
        assert!(info.shard_version.is_zero());
        assert!(!info.coll_version.is_zero());
        assert_eq!(info.chunks, Some(vec![]));
        assert_eq!(info.pending, Some(vec![key_range(0, Value::MaxKey)]));

        // Cloned documents in the pending range are not orphans.
        let (_, deleted) = cluster.cleanup_fully(&ns(), 1).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(shard1.count(&ns()), 10);

        shard1.failpoints().disable("migrateThreadHangAtStep3");
        migration.await.unwrap().unwrap();

        let promoted = wait_until(
            || {
                let info = shard1.shard_version_info(&ns(), true);
                info.chunks == Some(vec![key_range(0, Value::MaxKey)]) && info.pending == Some(vec![])
            },
            PAUSE_WAIT,
        )
        .await;
        assert!(promoted);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_donor_without_chunks_reports_zero_shard_version() {
        let cluster = setup().await;
        cluster
            .move_chunk(&ns(), key_range(0, Value::MaxKey), 0, 1)
            .await
            .unwrap();
        cluster
            .move_chunk(&ns(), key_range(Value::MinKey, 0), 0, 1)
            .await
            .unwrap();

        let info = cluster.shard(0).shard_version_info(&ns(), true);
        assert!(info.shard_version.is_zero());
        assert_eq!(info.coll_version.major, 3);
        assert_eq!(info.chunks, Some(vec![]));
        assert_eq!(cluster.shard(0).count(&ns()), 0);
        assert_eq!(cluster.router.count(&ns()).await.unwrap(), 20);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_recipient_rejects_second_receive() {
        let cluster = TestCluster::new(3);
        cluster
            .shard_collection(&ns(), ShardKeyPattern::ascending(&["_id"]).unwrap())
            .await
            .unwrap();
        let other = Namespace::new("foo.baz");
        cluster
            .config
            .shard_collection(&other, ShardKeyPattern::ascending(&["_id"]).unwrap(), &shard_name(2))
            .unwrap();
        cluster.reload_all(&other).await.unwrap();
        cluster.split(&ns(), ShardKey::single(0)).await.unwrap();
        cluster.config.split_chunk(&other, ShardKey::single(0)).unwrap();
        cluster.reload_all(&other).await.unwrap();

        let shard1 = cluster.shard(1).clone();
        shard1.failpoints().enable("migrateThreadHangAtStep3").unwrap();
        let donor = cluster.shard(0).clone();
        let first = tokio::spawn(async move { donor.move_chunk(upper_half()).await });
        shard1
            .active_ops()
            .wait_for_msg(MIGRATE_THREAD_DESC, "step 3 of 5", PAUSE_WAIT)
            .await
            .unwrap();

        let err = cluster
            .shard(2)
            .move_chunk(MoveChunkRequest::with_bounds(
                other.clone(),
                key_range(0, Value::MaxKey),
                shard_name(1),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConflictingOperationInProgress, "{}", err);
        assert!(cluster.locks.holder(&other).is_none());

        shard1.failpoints().disable("migrateThreadHangAtStep3");
        first.await.unwrap().unwrap();
        let recipients: Vec<_> = cluster
            .config
            .routing(&ns())
            .unwrap()
            .chunks
            .iter()
            .map(|c| c.owner.clone())
            .collect();
        assert_eq!(recipients, vec![shard_name(0), shard_name(1)]);
    }
}
