use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::tempdir;

use crate::error::{AppError, AppResult, StoreError};
use crate::membership::{GroupMembership, Member, StaticMembership};
use crate::system::shutdown_channel;
use crate::test_support::run_async_test;

use super::replicator::backoff_delay;
use super::wire::{MAX_MESSAGE_BYTES, ReplicationMessage, read_message};
use super::{
    DurableStore, MemoryStore, Replicator, ReplicatorConfig, StateStore, StoreEntry, get_all_json,
    get_json, put_json,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Sample {
    value: u32,
}

#[test]
fn put_increments_version_per_key() -> AppResult<()> {
    run_async_test(async {
        let store = MemoryStore::new("a");
        let first = store.put("status/a", "1".to_owned()).await?;
        let second = store.put("status/a", "2".to_owned()).await?;
        let other = store.put("status/b", "3".to_owned()).await?;
        if (first.version, second.version, other.version) != (1, 2, 1) {
            return Err(AppError::validation(format!(
                "Unexpected versions {} {} {}",
                first.version, second.version, other.version
            )));
        }
        if second.writer != "a" {
            return Err(AppError::validation("Writer must be stamped"));
        }
        Ok(())
    })
}

#[test]
fn apply_keeps_highest_version() -> AppResult<()> {
    run_async_test(async {
        let store = MemoryStore::new("b");
        let newer = StoreEntry {
            key: "leader/target".to_owned(),
            value: "\"new\"".to_owned(),
            version: 5,
            term: 1,
            writer: "a".to_owned(),
            written_at_ms: 10,
        };
        let older = StoreEntry {
            value: "\"old\"".to_owned(),
            version: 4,
            ..newer.clone()
        };
        if !store.apply(newer.clone()).await? {
            return Err(AppError::validation("Newer entry must apply"));
        }
        if store.apply(older).await? {
            return Err(AppError::validation("Older entry must be ignored"));
        }
        if store.apply(newer).await? {
            return Err(AppError::validation("Same version must be ignored"));
        }
        let current = store
            .get("leader/target")
            .await
            .ok_or_else(|| AppError::validation("Missing entry"))?;
        if current.value != "\"new\"" {
            return Err(AppError::validation("Older entry overwrote newer"));
        }
        Ok(())
    })
}

#[test]
fn newer_term_replaces_deposed_leader_target() -> AppResult<()> {
    run_async_test(async {
        let a = MemoryStore::new("a");
        let b = MemoryStore::new("b");
        let c = MemoryStore::new("c");

        let prepared = a.put_in_term("leader/target", "\"prepared\"".to_owned(), 1).await?;
        b.apply(prepared.clone()).await?;
        c.apply(prepared).await?;
        // a's next write reaches c only, then a goes away.
        let running = a.put_in_term("leader/target", "\"running\"".to_owned(), 1).await?;
        c.apply(running.clone()).await?;

        // b takes over from its older view and lands on the same version.
        let stopped = b.put_in_term("leader/target", "\"stopped\"".to_owned(), 2).await?;
        if stopped.version != running.version {
            return Err(AppError::validation("Scenario needs colliding versions"));
        }
        if !c.apply(stopped.clone()).await? {
            return Err(AppError::validation("c must take the new leader's target"));
        }
        if c.apply(running.clone()).await? || b.apply(running).await? {
            return Err(AppError::validation("Re-pushed deposed target must lose"));
        }
        for (name, store) in [("b", &b), ("c", &c)] {
            let current = store
                .get("leader/target")
                .await
                .ok_or_else(|| AppError::validation("Missing target"))?;
            if current != stopped {
                return Err(AppError::validation(format!(
                    "{} diverged: {:?}",
                    name, current
                )));
            }
        }
        Ok(())
    })
}

#[test]
fn writes_from_an_older_term_are_fenced() -> AppResult<()> {
    run_async_test(async {
        let store = MemoryStore::new("a");
        store
            .apply(StoreEntry {
                key: "leader/target".to_owned(),
                value: "{}".to_owned(),
                version: 3,
                term: 4,
                writer: "b".to_owned(),
                written_at_ms: 1,
            })
            .await?;
        match store.put_in_term("leader/target", "{}".to_owned(), 3).await {
            Err(AppError::Store(StoreError::StaleTerm { term: 3, current: 4, .. })) => {}
            other => {
                return Err(AppError::validation(format!(
                    "Expected stale term rejection, got {:?}",
                    other
                )));
            }
        }
        let accepted = store.put_in_term("leader/target", "{}".to_owned(), 4).await?;
        if (accepted.version, accepted.term) != (4, 4) {
            return Err(AppError::validation(format!("Unexpected entry {:?}", accepted)));
        }
        Ok(())
    })
}

#[test]
fn equal_term_and_version_resolve_by_writer() -> AppResult<()> {
    run_async_test(async {
        let from_a = StoreEntry {
            key: "leader/target".to_owned(),
            value: "\"a\"".to_owned(),
            version: 2,
            term: 1,
            writer: "a".to_owned(),
            written_at_ms: 1,
        };
        let from_b = StoreEntry {
            value: "\"b\"".to_owned(),
            writer: "b".to_owned(),
            ..from_a.clone()
        };
        let first = MemoryStore::new("x");
        let second = MemoryStore::new("y");
        first.apply(from_a.clone()).await?;
        first.apply(from_b.clone()).await?;
        second.apply(from_b).await?;
        second.apply(from_a).await?;
        let left = first.get("leader/target").await.map(|entry| entry.value);
        let right = second.get("leader/target").await.map(|entry| entry.value);
        if left != right || left.as_deref() != Some("\"b\"") {
            return Err(AppError::validation(format!(
                "Replicas disagree: {:?} vs {:?}",
                left, right
            )));
        }
        Ok(())
    })
}

#[test]
fn prefix_reads_and_undecodable_entries_are_skipped() -> AppResult<()> {
    run_async_test(async {
        let store = MemoryStore::new("a");
        put_json(&store, "status/a", &Sample { value: 1 }).await?;
        store.put("status/b", "not json".to_owned()).await?;
        put_json(&store, "statusx", &Sample { value: 9 }).await?;
        put_json(&store, "metrics/a", &Sample { value: 2 }).await?;

        let statuses: Vec<(Sample, StoreEntry)> = get_all_json(&store, "status/").await;
        if statuses.len() != 1 {
            return Err(AppError::validation(format!(
                "Expected one decodable status, got {}",
                statuses.len()
            )));
        }
        if get_json::<Sample>(&store, "status/b").await.is_some() {
            return Err(AppError::validation("Undecodable entry must read as missing"));
        }
        Ok(())
    })
}

#[test]
fn shared_handles_see_each_other() -> AppResult<()> {
    run_async_test(async {
        let store = MemoryStore::new("a");
        let other = store.handle_for("b");
        let mut feed = other.subscribe();
        store.put("leader/target", "{}".to_owned()).await?;
        let seen = tokio::time::timeout(Duration::from_secs(1), feed.recv())
            .await
            .map_err(|err| AppError::validation(err.to_string()))?
            .map_err(|err| AppError::validation(err.to_string()))?;
        if seen.writer != "a" || other.get("leader/target").await.is_none() {
            return Err(AppError::validation("Handle did not observe write"));
        }
        Ok(())
    })
}

#[test]
fn journal_replay_keeps_versions_monotonic() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        {
            let store = DurableStore::open(dir.path(), "a").await?;
            store.put("status/a", "1".to_owned()).await?;
            store.put("status/a", "2".to_owned()).await?;
            store
                .apply(StoreEntry {
                    key: "leader/target".to_owned(),
                    value: "{}".to_owned(),
                    version: 7,
                    term: 3,
                    writer: "b".to_owned(),
                    written_at_ms: 1,
                })
                .await?;
        }
        let reopened = DurableStore::open(dir.path(), "a").await?;
        let next = reopened.put("status/a", "3".to_owned()).await?;
        if next.version != 3 {
            return Err(AppError::validation(format!(
                "Expected version 3 after replay, got {}",
                next.version
            )));
        }
        let target = reopened
            .get("leader/target")
            .await
            .ok_or_else(|| AppError::validation("Replicated entry lost on replay"))?;
        if (target.version, target.term) != (7, 3) {
            return Err(AppError::validation("Replicated version lost on replay"));
        }
        let stale = StoreEntry {
            value: "\"stale\"".to_owned(),
            version: 9,
            term: 2,
            ..target
        };
        if reopened.apply(stale).await? {
            return Err(AppError::validation("An older term must not replace a newer one"));
        }
        Ok(())
    })
}

#[test]
fn backoff_grows_and_is_capped() -> AppResult<()> {
    let first = backoff_delay(1);
    if first < Duration::from_millis(200) || first > Duration::from_millis(300) {
        return Err(AppError::validation(format!("Unexpected first backoff {:?}", first)));
    }
    let capped = backoff_delay(40);
    if capped < Duration::from_secs(10) || capped > Duration::from_secs(15) {
        return Err(AppError::validation(format!("Unexpected capped backoff {:?}", capped)));
    }
    Ok(())
}

async fn wait_for_key(store: &dyn StateStore, key: &str, version: u64) -> AppResult<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if store
            .get(key)
            .await
            .is_some_and(|entry| entry.version >= version)
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(AppError::validation(format!("Timed out waiting for {}", key)));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test]
fn replicator_pushes_local_writes_to_peers() -> AppResult<()> {
    run_async_test(async {
        let listener_a = Replicator::bind("127.0.0.1:0").await?;
        let listener_b = Replicator::bind("127.0.0.1:0").await?;
        let addr_a = listener_a.local_addr()?.to_string();
        let addr_b = listener_b.local_addr()?.to_string();
        let member = |id: &str, gossip: &str| Member {
            id: id.to_owned(),
            control_addr: "127.0.0.1:1".to_owned(),
            gossip_addr: gossip.to_owned(),
        };
        let membership_a: Arc<dyn GroupMembership> = Arc::new(StaticMembership::new(
            member("a", &addr_a),
            vec![member("b", &addr_b)],
            None,
        )?);
        let membership_b: Arc<dyn GroupMembership> = Arc::new(StaticMembership::new(
            member("b", &addr_b),
            vec![member("a", &addr_a)],
            None,
        )?);
        let store_a: Arc<dyn StateStore> = Arc::new(MemoryStore::new("a"));
        let store_b: Arc<dyn StateStore> = Arc::new(MemoryStore::new("b"));
        let config = ReplicatorConfig {
            sync_interval: Duration::from_millis(200),
            push_timeout: Duration::from_secs(1),
        };

        let (shutdown_tx, _) = shutdown_channel();
        let task_a = tokio::spawn(
            Replicator::new(Arc::clone(&store_a), membership_a, config)
                .run(listener_a, shutdown_tx.subscribe()),
        );
        let task_b = tokio::spawn(
            Replicator::new(Arc::clone(&store_b), membership_b, config)
                .run(listener_b, shutdown_tx.subscribe()),
        );

        store_a.put("leader/target", "{\"v\":1}".to_owned()).await?;
        store_b.put("status/b", "{\"v\":2}".to_owned()).await?;
        wait_for_key(store_b.as_ref(), "leader/target", 1).await?;
        wait_for_key(store_a.as_ref(), "status/b", 1).await?;

        store_a.put("leader/target", "{\"v\":3}".to_owned()).await?;
        wait_for_key(store_b.as_ref(), "leader/target", 2).await?;

        drop(shutdown_tx.send(()));
        task_a.await??;
        task_b.await??;
        Ok(())
    })
}

#[test]
fn oversized_wire_line_is_rejected_at_the_cap() -> AppResult<()> {
    run_async_test(async {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            let flood = vec![b'x'; MAX_MESSAGE_BYTES.saturating_mul(2)];
            tokio::io::AsyncWriteExt::write_all(&mut client, &flood).await
        });
        let mut reader = tokio::io::BufReader::new(server);

        match read_message(&mut reader).await {
            Err(AppError::Store(StoreError::WireMessageTooLarge { max_bytes }))
                if max_bytes == MAX_MESSAGE_BYTES => {}
            other => return Err(AppError::validation(format!("Unexpected read {:?}", other))),
        }
        drop(reader);
        if writer.await?.is_ok() {
            return Err(AppError::validation("Reader must stop before the flood ends"));
        }
        Ok(())
    })
}

#[test]
fn wire_line_within_cap_decodes() -> AppResult<()> {
    run_async_test(async {
        let line = b"{\"type\":\"ack\",\"applied\":3}\r\n".to_vec();
        let mut reader = tokio::io::BufReader::new(line.as_slice());
        match read_message(&mut reader).await? {
            ReplicationMessage::Ack { applied: 3 } => {}
            other => return Err(AppError::validation(format!("Unexpected message {:?}", other))),
        }
        match read_message(&mut reader).await {
            Err(AppError::Store(StoreError::ConnectionClosed)) => Ok(()),
            other => Err(AppError::validation(format!("Unexpected read {:?}", other))),
        }
    })
}
