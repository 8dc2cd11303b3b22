//! Table lifecycle procedures driven through the master surface.

mod common;

use pretty_assertions::assert_eq;
use std::sync::Arc;

use cluster_procedures::{
    ActionError, ColumnFamilyDescriptor, FailureKind, MemoryCluster, MemoryProcedureStore,
    ProcedureState, ProcedureType, RegionState, TableName, TableState,
};
use common::{descriptor, finish, start, start_memory};

#[tokio::test]
async fn test_create_table_runs_every_step() {
    let cluster = MemoryCluster::new();
    let system = start_memory(&cluster).await;
    let master = system.master();

    let proc_id = master
        .create_table(descriptor("orders"), Some(vec![b"m".to_vec()]), 1, 1)
        .await
        .unwrap();
    let summary = finish(&system, proc_id).await;

    assert_eq!(summary.state, ProcedureState::Success);
    assert_eq!(summary.proc_type, ProcedureType::CreateTable);
    assert_eq!(summary.result.as_deref(), Some("created default:orders with 2 regions"));

    let table = TableName::parse("orders");
    assert_eq!(cluster.table_state(&table), Some(TableState::Enabled));
    assert!(cluster.has_table_layout(&table));
    let regions = cluster.live_regions(&table);
    assert_eq!(regions.len(), 2);
    for region in &regions {
        assert_eq!(cluster.region_state(&region.id), Some(RegionState::Open));
    }
    assert_eq!(
        cluster.action_names(),
        vec!["create-table-layout", "add-table-to-meta", "assign-regions", "set-table-state"]
    );
    assert!(master.list_locks().is_empty());
}

#[tokio::test]
async fn test_create_table_nonce_deduplicates() {
    let cluster = MemoryCluster::new();
    let store = MemoryProcedureStore::new();
    let system = start(&cluster, Arc::new(store.clone())).await;
    let master = system.master();

    let (first, second) = tokio::join!(
        master.create_table(descriptor("t1"), None, 7, 42),
        master.create_table(descriptor("t1"), None, 7, 42),
    );
    let first = first.unwrap();
    assert_eq!(second.unwrap(), first);
    finish(&system, first).await;

    // the table exists now, but the nonce still maps to the original procedure
    let retried = master.create_table(descriptor("t1"), None, 7, 42).await.unwrap();
    assert_eq!(retried, first);
    assert_eq!(cluster.attempts("create-table-layout"), 1);
    assert_eq!(master.list_procedures().len(), 1);
    assert_eq!(system.metrics().deduplicated, 2);

    // a fresh nonce is validated and rejected
    let err = master.create_table(descriptor("t1"), None, 7, 43).await.unwrap_err();
    assert!(err.is_invalid_request());
    assert!(store.record_ids().iter().all(|id| *id == first));
}

#[tokio::test]
async fn test_failed_step_compensates_in_reverse() {
    let cluster = MemoryCluster::new();
    let offline = ActionError::fatal("set-table-state", "meta offline");
    cluster.inject_failure("set-table-state", offline, 1);
    let system = start_memory(&cluster).await;

    let proc_id = system.master().create_table(descriptor("t1"), None, 0, 0).await.unwrap();
    let summary = finish(&system, proc_id).await;

    assert_eq!(summary.state, ProcedureState::RolledBack);
    let exception = summary.exception.unwrap();
    assert_eq!(exception.kind, FailureKind::StepFailed);
    assert_eq!(exception.step.as_deref(), Some("mark-enabled"));
    assert_eq!(
        cluster.action_names(),
        vec![
            "create-table-layout",
            "add-table-to-meta",
            "assign-regions",
            "unassign-regions",
            "remove-table-from-meta",
            "delete-table-layout",
        ]
    );
    let table = TableName::parse("t1");
    assert_eq!(cluster.table_state(&table), None);
    assert!(!cluster.has_table_layout(&table));
}

#[tokio::test]
async fn test_transient_failures_retry_then_give_up() {
    let cluster = MemoryCluster::new();
    let busy = ActionError::transient("assign-regions", "server busy");
    cluster.inject_failure("assign-regions", busy, 2);
    let system = start_memory(&cluster).await;

    let proc_id = system.master().create_table(descriptor("t1"), None, 0, 0).await.unwrap();
    assert_eq!(finish(&system, proc_id).await.state, ProcedureState::Success);
    assert_eq!(cluster.attempts("assign-regions"), 3);

    // more failures than retries: the step gives up and the table is rolled back
    let retries = system.executor().config().max_step_retries;
    let gone = ActionError::transient("assign-regions", "server gone");
    cluster.inject_failure("assign-regions", gone, retries + 5);
    let proc_id = system.master().create_table(descriptor("t2"), None, 0, 0).await.unwrap();
    let summary = finish(&system, proc_id).await;
    assert_eq!(summary.state, ProcedureState::RolledBack);
    assert_eq!(summary.exception.unwrap().kind, FailureKind::RetriesExhausted);
    assert_eq!(cluster.table_state(&TableName::parse("t2")), None);
}

#[tokio::test]
async fn test_disable_truncate_enable_delete() {
    let table = TableName::parse("events");
    let cluster = MemoryCluster::new().with_table(
        descriptor("events"),
        &[b"g".as_slice(), b"p".as_slice()],
        TableState::Enabled,
    );
    let system = start_memory(&cluster).await;
    let master = system.master();

    let disabled = master.disable_table(table.clone(), 0, 0).await.unwrap();
    assert_eq!(finish(&system, disabled).await.state, ProcedureState::Success);
    assert_eq!(cluster.table_state(&table), Some(TableState::Disabled));
    assert!(cluster
        .live_regions(&table)
        .iter()
        .all(|r| cluster.region_state(&r.id) == Some(RegionState::Closed)));

    let truncated = master.truncate_table(table.clone(), true, 0, 0).await.unwrap();
    let summary = finish(&system, truncated).await;
    assert_eq!(summary.state, ProcedureState::Success);
    assert_eq!(summary.result.as_deref(), Some("truncated default:events into 3 regions"));
    assert_eq!(cluster.table_state(&table), Some(TableState::Enabled));

    let disabled = master.disable_table(table.clone(), 0, 0).await.unwrap();
    finish(&system, disabled).await;
    let enabled = master.enable_table(table.clone(), 0, 0).await.unwrap();
    assert_eq!(finish(&system, enabled).await.state, ProcedureState::Success);
    assert_eq!(cluster.table_state(&table), Some(TableState::Enabled));

    // delete needs the table offline
    let err = master.delete_table(table.clone(), 0, 0).await.unwrap_err();
    assert!(err.is_invalid_request());
    let disabled = master.disable_table(table.clone(), 0, 0).await.unwrap();
    finish(&system, disabled).await;
    master.check_table_modifiable(&table).await.unwrap();
    let deleted = master.delete_table(table.clone(), 0, 0).await.unwrap();
    assert_eq!(finish(&system, deleted).await.state, ProcedureState::Success);
    assert_eq!(cluster.table_state(&table), None);
    assert!(!cluster.has_table_layout(&table));
}

#[tokio::test]
async fn test_modify_table_reopens_regions_as_children() {
    let table = TableName::parse("users");
    let cluster = MemoryCluster::new().with_table(
        descriptor("users"),
        &[b"f".as_slice(), b"p".as_slice()],
        TableState::Enabled,
    );
    let system = start_memory(&cluster).await;
    let master = system.master();

    let proc_id = master
        .add_column(table.clone(), ColumnFamilyDescriptor::new("meta"), 3, 1)
        .await
        .unwrap();
    let summary = finish(&system, proc_id).await;
    assert_eq!(summary.state, ProcedureState::Success);
    assert_eq!(summary.children.len(), 3);

    for child in &summary.children {
        let child = master.get_procedure(*child).unwrap();
        assert_eq!(child.proc_type, ProcedureType::ReopenRegion);
        assert_eq!(child.parent_id, Some(proc_id));
        assert_eq!(child.state, ProcedureState::Success);
    }
    assert_eq!(cluster.attempts("reopen-region"), 3);
    let families = cluster.actions().into_iter().find_map(|a| match a {
        cluster_procedures::ClusterAction::UpdateTableDescriptor { descriptor } => {
            Some(descriptor.families)
        }
        _ => None,
    });
    assert_eq!(families.map(|f| f.len()), Some(2));
}

#[tokio::test]
async fn test_column_changes_on_disabled_table_spawn_nothing() {
    let table = TableName::parse("archive");
    let cluster = MemoryCluster::new().with_table(
        descriptor("archive").with_family(ColumnFamilyDescriptor::new("old")),
        &[],
        TableState::Disabled,
    );
    let system = start_memory(&cluster).await;
    let master = system.master();

    let mut family = ColumnFamilyDescriptor::new("cf");
    family.max_versions = 5;
    let modified = master.modify_column(table.clone(), family, 0, 0).await.unwrap();
    let summary = finish(&system, modified).await;
    assert_eq!(summary.state, ProcedureState::Success);
    assert!(summary.children.is_empty());

    let deleted = master.delete_column(table.clone(), "old", 0, 0).await.unwrap();
    assert_eq!(finish(&system, deleted).await.state, ProcedureState::Success);

    let err = master.delete_column(table.clone(), "cf", 0, 0).await.unwrap_err();
    assert!(err.is_invalid_request());
    let err = master.delete_column(table, "missing", 0, 0).await.unwrap_err();
    assert!(err.is_invalid_request());
    assert_eq!(cluster.attempts("reopen-region"), 0);
}
