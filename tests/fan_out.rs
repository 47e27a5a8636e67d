//! Fan-out and fan-in through the shard request tracker

use overseer::overseer::cluster_state::{ClusterState, Member, MemberState, ResourceState, SubUnit};
use overseer::overseer::mock::MockMemberClient;
use overseer::overseer::store::InMemoryStore;
use overseer::overseer::transport::{Params, RemoteError, ACTION, CORE};
use overseer::overseer::{ClusterStateCache, OperationResult, OverseerContext};
use overseer::{Error, OverseerConfig};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn member(name: &str, node: &str, state: MemberState) -> Member {
    Member {
        name: name.to_string(),
        core: format!("books_{}", name),
        node_name: node.to_string(),
        base_url: format!("http://{}/solr", node),
        state,
        leader: false,
    }
}

fn context(cluster: ClusterState, client: Arc<MockMemberClient>) -> OverseerContext {
    OverseerContext::new(
        OverseerConfig::default(),
        Arc::new(InMemoryStore::new()),
        Arc::new(ClusterStateCache::new(cluster)),
        client,
    )
}

#[tokio::test]
async fn test_fan_out_skips_filtered_and_unreachable_members() {
    let cluster = ClusterState::new().with_live_node("n1").with_live_node("n2");
    let shard = SubUnit::new("shard1")
        .with_member(member("m1", "n1", MemberState::Active))
        .with_member(member("m2", "n2", MemberState::Down))
        .with_member(member("m3", "n3", MemberState::Active));
    let client = Arc::new(MockMemberClient::ok());
    let ctx = context(cluster.clone(), client.clone());

    let mut tracker = ctx.sync_tracker();
    let fan_out = tracker.target_members(
        &cluster,
        &Params::new().with(ACTION, "RELOAD"),
        Some(MemberState::Active),
        &shard,
    );

    assert_eq!(fan_out.dispatched, 1);
    assert_eq!(
        fan_out.filtered.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
        vec!["m2"]
    );
    assert_eq!(
        fan_out.unreachable.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
        vec!["m3"]
    );

    let mut results = OperationResult::new();
    tracker
        .drain(&mut results, false, None, &HashSet::new())
        .await
        .unwrap();

    let sent = client.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].node_name, "n1");
    assert_eq!(sent[0].params.get(CORE), Some("books_m1"));
    assert_eq!(results.success_count(), 1);
}

#[tokio::test]
async fn test_fan_out_without_filter_reaches_every_live_member() {
    let cluster = ClusterState::new().with_live_node("n1").with_live_node("n2");
    let shard = SubUnit::new("shard1")
        .with_member(member("m1", "n1", MemberState::Active))
        .with_member(member("m2", "n2", MemberState::Recovering));
    let client = Arc::new(MockMemberClient::ok());
    let ctx = context(cluster.clone(), client.clone());

    let mut tracker = ctx.sync_tracker();
    let fan_out = tracker.target_members(&cluster, &Params::new(), None, &shard);
    assert_eq!(fan_out.dispatched, 2);
    assert!(fan_out.filtered.is_empty());
    assert!(fan_out.unreachable.is_empty());
}

#[tokio::test]
async fn test_drain_records_every_response() {
    let nodes = ["n1", "n2", "n3", "n4", "n5"];
    let client = Arc::new(MockMemberClient::new(|req| match req.node_name.as_str() {
        "n2" | "n4" => Err(RemoteError::remote(500, format!("{} is sad", req.node_name))),
        _ => Ok(json!({"status": 0})),
    }));
    let ctx = context(ClusterState::new(), client);

    let mut tracker = ctx.sync_tracker();
    for node in nodes {
        tracker.send_shard_request(node, &format!("http://{}", node), Some("shard1"), Params::new());
    }

    let mut results = OperationResult::new();
    tracker
        .drain(&mut results, false, None, &HashSet::new())
        .await
        .unwrap();

    assert_eq!(results.success_count(), 3);
    assert_eq!(results.failure_count(), 2);
    let failure = results.failure().unwrap();
    assert_eq!(failure["n2"], json!({"message": "n2 is sad", "code": 500}));
    assert!(failure.contains_key("n4"));
    assert!(results.check("reload", true).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_abort_on_first_error_discards_the_rest() {
    let client = Arc::new(
        MockMemberClient::new(|req| match req.node_name.as_str() {
            "bad" => Err(RemoteError::remote(500, "core is gone").with_root_cause("SolrException")),
            _ => Ok(json!({"status": 0})),
        })
        .with_delay("slow1", Duration::from_secs(1))
        .with_delay("slow2", Duration::from_secs(2)),
    );
    let ctx = context(ClusterState::new(), client.clone());

    let mut tracker = ctx.sync_tracker();
    for node in ["slow1", "bad", "slow2"] {
        tracker.send_shard_request(node, &format!("http://{}", node), None, Params::new());
    }

    let mut results = OperationResult::new();
    let err = tracker
        .drain(&mut results, true, Some("Could not reload"), &HashSet::new())
        .await
        .unwrap_err();

    match err {
        Error::ShardRequestFailed { message, cause } => {
            assert_eq!(message, "Could not reload");
            assert_eq!(cause, "core is gone");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(results.success_count(), 0);
    assert_eq!(results.failure_count(), 1);
    // the slow requests were still sent and awaited
    assert_eq!(client.requests().len(), 3);
}

#[tokio::test]
async fn test_allow_listed_root_cause_is_not_a_failure() {
    let client = Arc::new(MockMemberClient::new(|req| match req.node_name.as_str() {
        "n1" => Err(RemoteError::remote(400, "already unloaded").with_root_cause("NoSuchCore")),
        _ => Err(RemoteError::remote(500, "disk full").with_root_cause("IOException")),
    }));
    let ctx = context(ClusterState::new(), client);

    let mut tracker = ctx.sync_tracker();
    tracker.send_shard_request("n1", "http://n1", None, Params::new());
    tracker.send_shard_request("n2", "http://n2", None, Params::new());

    let okay: HashSet<String> = ["NoSuchCore".to_string()].into_iter().collect();
    let mut results = OperationResult::new();
    tracker.drain(&mut results, false, None, &okay).await.unwrap();

    assert!(results.success().unwrap().contains_key("n1"));
    assert!(results.failure().unwrap().contains_key("n2"));
}

#[tokio::test]
async fn test_unreachable_member_error_has_no_code() {
    let client = Arc::new(MockMemberClient::new(|_| {
        Err(RemoteError::unreachable("connection refused"))
    }));
    let ctx = context(ClusterState::new(), client);

    let mut tracker = ctx.sync_tracker();
    tracker.send_shard_request("n1", "http://n1", None, Params::new());
    let mut results = OperationResult::new();
    tracker
        .drain(&mut results, false, None, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(results.failure().unwrap()["n1"]["code"], json!(-1));
}

#[tokio::test]
async fn test_members_sharing_a_node_are_recorded_separately() {
    let cluster = ClusterState::new().with_live_node("n1").with_resource(
        ResourceState::new("books")
            .with_sub_unit(SubUnit::new("shard1").with_member(member("r1", "n1", MemberState::Active)))
            .with_sub_unit(SubUnit::new("shard2").with_member(member("r2", "n1", MemberState::Active)))
            .with_sub_unit(SubUnit::new("shard3").with_member(member("r3", "n1", MemberState::Active))),
    );
    let client = Arc::new(MockMemberClient::new(|req| match req.params.get(CORE) {
        Some("books_r2") => Err(RemoteError::remote(500, "r2 failed")),
        core => Ok(json!({"core": core})),
    }));
    let ctx = context(cluster, client.clone());

    let mut results = OperationResult::new();
    let fan_out = ctx
        .collection_cmd(
            "books",
            &Params::new().with(ACTION, "RELOAD"),
            &mut results,
            None,
            None,
            &HashSet::new(),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(fan_out.dispatched, 3);
    assert_eq!(client.requests().len(), 3);
    assert_eq!(results.success_count() + results.failure_count(), 3);
    assert_eq!(results.failure_count(), 1);

    let success = results.success().unwrap();
    assert_eq!(success["n1/books_r1"], json!({"core": "books_r1"}));
    assert_eq!(success["n1/books_r3"], json!({"core": "books_r3"}));
    assert_eq!(results.failure().unwrap()["n1/books_r2"]["code"], json!(500));
}
