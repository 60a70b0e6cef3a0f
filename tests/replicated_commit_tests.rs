//! Replicated Commit Tests
//!
//! Writes routed through the table manager and the two-phase commit
//! coordinator against real instances: full commits, aborts, eviction of
//! unreachable and out-of-order replicas, and quorum commits.

mod common;

use common::{table, TestCluster};
use ringdb_core::*;
use std::time::Duration;

const CREATE_ORDERS: &str = "CREATE TABLE PUBLIC.ORDERS (ID INT, TOTAL INT)";
const INSERT_ORDER: &str = "INSERT INTO PUBLIC.ORDERS VALUES (1, 10)";

/// Three-node cluster with ORDERS created on node 0 and replicated on all nodes
async fn replicated_orders(configure: impl Fn(&mut InstanceConfig)) -> (TestCluster, TableInfo) {
    let cluster = TestCluster::start_with(3, configure).await;
    let orders = table("ORDERS");
    let created = cluster
        .node(0)
        .create_table(&orders, CREATE_ORDERS)
        .await
        .unwrap();
    assert!(created.committed);
    for i in 1..3 {
        assert!(cluster.node(i).register_replica(&orders).await.unwrap());
    }
    (cluster, orders)
}

fn committed_insert(executor: &MemoryQueryExecutor) -> bool {
    executor
        .committed_statements()
        .iter()
        .any(|s| s == INSERT_ORDER)
}

#[tokio::test]
async fn test_update_commits_on_every_replica() {
    let (cluster, orders) = replicated_orders(|_| {}).await;
    let a = cluster.node(0);

    let outcome = a.execute_update(&orders, INSERT_ORDER).await.unwrap();
    assert!(outcome.committed);
    assert!(!outcome.is_async);
    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.disagreeing.is_empty());
    for executor in &cluster.executors {
        assert!(committed_insert(executor));
    }

    assert_eq!(a.get_active_replicas(&orders).await.unwrap().len(), 3);
    for node in &cluster.nodes {
        assert_eq!(
            node.instance().last_applied_update_id(&orders),
            Some(outcome.update_id)
        );
    }

    let stats = a.get_statistics();
    assert_eq!(stats.commit.committed_transactions, 2);
    assert_eq!(stats.commit.aborted_transactions, 0);
}

#[tokio::test]
async fn test_update_from_instance_without_manager() {
    let (cluster, orders) = replicated_orders(|_| {}).await;
    let b = cluster.node(1);
    assert!(b.reference().local_table_manager(&orders).is_none());

    let outcome = b.execute_update(&orders, INSERT_ORDER).await.unwrap();
    assert!(outcome.committed);
    assert!(outcome.transaction_name.starts_with("TXN_node_"));
    for executor in &cluster.executors {
        assert!(committed_insert(executor));
    }

    // The lock was released, so the next writer is not blocked
    let next = cluster
        .node(2)
        .execute_update(&orders, "INSERT INTO PUBLIC.ORDERS VALUES (2, 20)")
        .await
        .unwrap();
    assert!(next.committed);
    assert!(next.update_id > outcome.update_id);
}

/// Scenario: one replica always fails at the RPC layer; after one round it
/// is still known but no longer active
#[tokio::test]
async fn test_unreachable_replica_evicted() {
    let (cluster, orders) = replicated_orders(|_| {}).await;
    let (a, c) = (cluster.node(0), cluster.node(2));
    cluster
        .network
        .set_unreachable(&c.database_id().address(), true);

    let outcome = a.execute_update(&orders, INSERT_ORDER).await.unwrap();
    assert!(outcome.committed);
    assert_eq!(outcome.disagreeing, vec![c.database_id().clone()]);

    let all = a.get_all_replicas(&orders).await.unwrap();
    let active = a.get_active_replicas(&orders).await.unwrap();
    assert!(all.contains(c.database_id()));
    assert!(!active.contains(c.database_id()));
    assert_eq!(active.len(), 2);
    assert!(!committed_insert(&cluster.executors[2]));
}

#[tokio::test]
async fn test_rejected_statement_aborts_everywhere() {
    let (cluster, orders) = replicated_orders(|_| {}).await;
    let a = cluster.node(0);
    cluster.executors[1].fail_statements_matching("999");

    let outcome = a
        .execute_update(&orders, "INSERT INTO PUBLIC.ORDERS VALUES (999, 0)")
        .await
        .unwrap();
    assert!(!outcome.committed);
    assert!(outcome.results.iter().all(|r| !r.commit));
    assert!(a
        .commit_coordinator()
        .tracker()
        .wait_for_quiescence(Duration::from_secs(5))
        .await);

    for executor in &cluster.executors {
        assert!(!executor
            .committed_statements()
            .iter()
            .any(|s| s.contains("999")));
    }
    // An application fault does not cost anyone their place in the set
    assert_eq!(a.get_active_replicas(&orders).await.unwrap().len(), 3);
    assert_eq!(a.get_statistics().commit.aborted_transactions, 1);

    cluster.executors[1].clear_faults();
    assert!(a.execute_update(&orders, INSERT_ORDER).await.unwrap().committed);
}

/// With k = 2 of 3, an unreachable replica does not stop the commit
#[tokio::test]
async fn test_quorum_commit_with_unreachable_replica() {
    let (cluster, orders) = replicated_orders(|config| {
        config.commit.asynchronous_replication_factor = Some(2);
    })
    .await;
    let (a, c) = (cluster.node(0), cluster.node(2));
    cluster
        .network
        .set_unreachable(&c.database_id().address(), true);

    let outcome = a.execute_update(&orders, INSERT_ORDER).await.unwrap();
    assert!(outcome.committed);
    assert!(a
        .commit_coordinator()
        .tracker()
        .wait_for_quiescence(Duration::from_secs(5))
        .await);

    let active = a.get_active_replicas(&orders).await.unwrap();
    assert_eq!(active.len(), 2);
    assert!(!active.contains(c.database_id()));
    assert!(committed_insert(&cluster.executors[0]));
    assert!(committed_insert(&cluster.executors[1]));
}

/// A replica acknowledging the wrong previous update is rolled back and
/// leaves the active set after an asynchronous commit
#[tokio::test]
async fn test_out_of_order_replica_evicted() {
    let (cluster, orders) = replicated_orders(|config| {
        config.commit.asynchronous_replication_factor = Some(2);
    })
    .await;
    let (a, c) = (cluster.node(0), cluster.node(2));
    c.instance().set_applied_update_id(orders.clone(), 999);

    let outcome = a.execute_update(&orders, INSERT_ORDER).await.unwrap();
    assert!(outcome.committed);
    assert!(a
        .commit_coordinator()
        .tracker()
        .wait_for_quiescence(Duration::from_secs(5))
        .await);

    let all = a.get_all_replicas(&orders).await.unwrap();
    let active = a.get_active_replicas(&orders).await.unwrap();
    assert!(all.contains(c.database_id()));
    assert!(!active.contains(c.database_id()));
    assert!(!committed_insert(&cluster.executors[2]));
    assert_eq!(c.instance().last_applied_update_id(&orders), Some(999));
}

#[tokio::test]
async fn test_evicted_replica_not_asked_again() {
    let (cluster, orders) = replicated_orders(|_| {}).await;
    let (a, c) = (cluster.node(0), cluster.node(2));
    cluster
        .network
        .set_unreachable(&c.database_id().address(), true);
    assert!(a.execute_update(&orders, INSERT_ORDER).await.unwrap().committed);

    cluster
        .network
        .set_unreachable(&c.database_id().address(), false);
    let outcome = a
        .execute_update(&orders, "INSERT INTO PUBLIC.ORDERS VALUES (2, 20)")
        .await
        .unwrap();
    assert!(outcome.committed);
    assert_eq!(outcome.results.len(), 2);
    assert!(!outcome
        .results
        .iter()
        .any(|r| r.replica == *c.database_id()));
}

/// A participant that prepared but never heard the decision rolls back once
/// the prepared timeout passes
#[tokio::test]
async fn test_undecided_prepare_rolled_back_after_timeout() {
    let cluster = TestCluster::start_with(1, |config| config.commit.prepared_timeout_ms = 50).await;
    let a = cluster.node(0);
    let orders = table("ORDERS");
    a.create_table(&orders, CREATE_ORDERS).await.unwrap();

    let stamp = UpdateStamp {
        table: orders.clone(),
        update_id: 99,
        previous_update_id: 98,
    };
    a.instance()
        .execute_update(
            "INSERT INTO PUBLIC.ORDERS VALUES (7, 70)".to_string(),
            "TXN_lost_1".to_string(),
            Some(stamp),
        )
        .await
        .unwrap();
    assert_eq!(a.instance().pending_count(), 1);
    assert!(cluster.executors[0]
        .prepared_transactions()
        .contains(&"TXN_lost_1".to_string()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.instance().expire_pending(), 1);
    assert_eq!(a.instance().pending_count(), 0);
    assert!(cluster.executors[0].prepared_transactions().is_empty());
    assert!(!cluster.executors[0]
        .committed_statements()
        .iter()
        .any(|s| s.contains("(7, 70)")));

    let outcome = a.execute_update(&orders, INSERT_ORDER).await.unwrap();
    assert!(outcome.committed);
    assert!(committed_insert(&cluster.executors[0]));
}
