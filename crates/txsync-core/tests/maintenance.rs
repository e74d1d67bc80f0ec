//! Per-cycle maintenance and the remaining round-trip task kinds

mod common;

use std::collections::BTreeMap;

use common::{unit_definition, Harness};
use txsync_core::{
    NymId, NymRecord, OperationRequest, PeerBox, PeerReply, PeerRequest, PeerRequestKind,
    Repository, ServerId, SyncConfig, Task, ThreadStatus, UnitId,
};

fn bailment(id: &str) -> PeerRequest {
    PeerRequest {
        id: id.to_string(),
        initiator: NymId::new("bob"),
        recipient: NymId::new("alice"),
        kind: PeerRequestKind::Bailment,
        body: "deposit instructions please".into(),
    }
}

#[tokio::test]
async fn test_endpoint_rename_updates_the_contract() {
    let mut h = Harness::with_config(SyncConfig {
        name_check_interval: 1,
        ..SyncConfig::fast()
    });
    let context = h.ready_context("alice", "notary");
    h.world.publish_nym("notary-nym", "Notary Prime");

    let id = h.manager.start_task(&context, Task::DownloadNymbox);
    assert!(h.completion(id).await);

    let contract = h
        .repository
        .server_contract(&ServerId::new("notary"))
        .unwrap();
    assert_eq!(contract.name, "Notary Prime");

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_newer_revision_is_republished() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    h.repository.store_nym(NymRecord {
        id: NymId::new("alice"),
        name: "alice".into(),
        revision: 3,
    });

    let id = h.manager.start_task(&context, Task::DownloadNymbox);
    assert!(h.completion(id).await);
    h.eventually(|| h.repository.consensus(&context).published_revision == 3)
        .await;

    assert!(h
        .world
        .requests()
        .iter()
        .any(|(_, request)| *request == OperationRequest::RegisterNym { resync: true }));

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_admin_is_requested_once_granted() {
    let mut passwords = BTreeMap::new();
    passwords.insert(ServerId::new("notary"), "hunter2".to_string());
    let mut h = Harness::with_config(SyncConfig {
        admin_passwords: passwords,
        ..SyncConfig::fast()
    });
    let context = h.ready_context("alice", "notary");

    for _ in 0..3 {
        let id = h.manager.start_task(&context, Task::DownloadNymbox);
        assert!(h.completion(id).await);
    }

    assert!(h.repository.consensus(&context).admin);
    assert_eq!(h.world.count("request_admin"), 1);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_issued_unit_is_claimed_when_advertised() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    let definition = unit_definition("shells");

    let id = h.manager.start_task(
        &context,
        Task::IssueUnitDefinition {
            definition: definition.clone(),
            label: "issuer".into(),
            advertise: true,
        },
    );

    assert!(h.completion(id).await);
    assert_eq!(
        h.repository.unit_definition(&definition.id),
        Some(definition)
    );
    assert_eq!(
        h.repository.claims(&NymId::new("alice")),
        vec![UnitId::new("shells")]
    );
    assert_eq!(h.repository.accounts(&context).len(), 1);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_rejected_issue_is_surfaced() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    h.world.reject_next("issue_unit_definition", 1);

    let id = h.manager.start_task(
        &context,
        Task::IssueUnitDefinition {
            definition: unit_definition("shells"),
            label: String::new(),
            advertise: true,
        },
    );

    assert!(!h.completion(id).await);
    assert!(h.repository.claims(&NymId::new("alice")).is_empty());

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_nymbox_schedules_registration() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    h.world.reject_next("download_nymbox", 1);

    let id = h.manager.start_task(&context, Task::DownloadNymbox);
    assert!(!h.completion(id).await);
    h.eventually(|| h.world.count("register_nym") == 1).await;

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_dropped_replies_are_resent() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    h.world.drop_next("download_nymbox", 2);

    let id = h.manager.start_task(&context, Task::DownloadNymbox);
    assert!(h.completion(id).await);
    assert_eq!(h.world.count("download_nymbox"), 3);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_peer_reply_files_the_request() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    h.world.publish_nym("bob", "Bob");
    let alice = NymId::new("alice");
    let request = bailment("req-1");
    h.repository
        .store_peer_request(&alice, PeerBox::Incoming, request.clone());

    let id = h.manager.start_task(
        &context,
        Task::PeerReply {
            target: "bob".into(),
            reply: PeerReply {
                id: "rep-1".into(),
                request: "req-1".into(),
                body: "send it to vault 7".into(),
            },
            request: request.clone(),
        },
    );

    assert!(h.completion(id).await);
    assert!(h.manager.message_status(id).is_some());
    assert!(h
        .repository
        .peer_requests(&alice, PeerBox::Incoming)
        .is_empty());
    assert_eq!(
        h.repository.peer_requests(&alice, PeerBox::Processed),
        vec![request]
    );
    assert_eq!(h.repository.peer_replies(&alice, PeerBox::Sent).len(), 1);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_sent_peer_request_is_kept() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    h.world.publish_nym("bob", "Bob");
    let request = PeerRequest {
        initiator: NymId::new("alice"),
        recipient: NymId::new("bob"),
        ..bailment("req-2")
    };

    let id = h.manager.start_task(
        &context,
        Task::PeerRequest {
            target: "bob".into(),
            request: request.clone(),
        },
    );

    assert!(h.completion(id).await);
    assert_eq!(
        h.repository
            .peer_requests(&NymId::new("alice"), PeerBox::Sent),
        vec![request]
    );

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_publishing_unknown_contract_fails_locally() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");

    let id = h.manager.start_task(
        &context,
        Task::PublishServerContract {
            server: "unknown".into(),
        },
    );

    assert!(!h.completion(id).await);
    assert_eq!(h.world.count("publish_server_contract"), 0);

    let id = h.manager.start_task(
        &context,
        Task::PublishServerContract {
            server: "notary".into(),
        },
    );
    assert!(h.completion(id).await);
    assert_eq!(h.world.count("publish_server_contract"), 1);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_panicking_handler_fails_only_its_task() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    h.world.publish_nym("bob", "Bob");
    h.world.panic_on("send_message");

    let id = h.manager.start_task(
        &context,
        Task::SendMessage {
            recipient: "bob".into(),
            body: "hello".into(),
        },
    );

    assert!(!h.completion(id).await);
    assert_eq!(h.manager.status(id), ThreadStatus::FinishedFailed);

    // The worker keeps serving the context
    let next = h.manager.start_task(&context, Task::DownloadNymbox);
    assert!(h.completion(next).await);

    h.manager.shutdown().await;
}
