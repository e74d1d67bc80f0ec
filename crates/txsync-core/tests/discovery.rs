//! Contract, nym and unit discovery with backoff

mod common;

use common::{server_contract, Harness};
use txsync_core::{
    ContextId, Messagability, NymId, OperationRequest, Repository, ServerId, Task, TaskId, TaskKind,
    ThreadStatus, UnitId, WorkerState,
};

fn contract_requests(h: &Harness, server: &str) -> usize {
    h.world
        .requests()
        .into_iter()
        .filter(|(_, request)| {
            matches!(request, OperationRequest::DownloadContract { server: s } if s.as_str() == server)
        })
        .count()
}

#[tokio::test]
async fn test_equal_contract_downloads_collapse() {
    let mut h = Harness::new();
    h.local_nym("alice");
    h.world.publish_server("remote", "Remote");
    // Bootstrapping blocks draining until the endpoint contract is stored
    let context = ContextId::new("alice", "nowhere");
    let task = Task::DownloadContract {
        server: "remote".into(),
    };

    let first = h.manager.start_task(&context, task.clone());
    let second = h.manager.start_task(&context, task.clone());
    assert!(first.is_valid());
    assert_eq!(second, TaskId::invalid());
    assert_eq!(
        h.manager.pending_tasks(&context),
        Some(vec![(TaskKind::DownloadContract, 1)])
    );

    h.repository
        .store_server_contract(server_contract("nowhere", "Nowhere"));
    assert!(h.completion(first).await);
    assert_eq!(contract_requests(&h, "remote"), 1);

    let remote = ServerId::new("remote");
    assert!(h.repository.server_contract(&remote).is_some());
    let worker = h.manager.worker_handle(&context).unwrap();
    assert_eq!(worker.server_backoff(&remote), None);

    // A later independent download is attempted straight away
    let again = h.manager.start_task(&context, task);
    assert!(h.completion(again).await);
    assert_eq!(contract_requests(&h, "remote"), 2);
    assert_eq!(worker.server_backoff(&remote), None);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_download_is_backed_off() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    let ghost = ServerId::new("ghost");

    let id = h.manager.start_task(
        &context,
        Task::DownloadContract {
            server: ghost.clone(),
        },
    );
    assert!(!h.completion(id).await);
    let worker = h.manager.worker_handle(&context).unwrap();
    assert_eq!(worker.server_backoff(&ghost), Some(1));

    // A retry that is not due yet waits in the queue instead of failing unattempted
    let mut last = 1;
    for attempt in 2..=6 {
        let id = h.manager.start_task(
            &context,
            Task::DownloadContract {
                server: ghost.clone(),
            },
        );
        assert!(!h.completion(id).await);
        assert_eq!(contract_requests(&h, "ghost"), attempt);
        let multiplier = worker.server_backoff(&ghost).unwrap();
        assert_eq!(multiplier, last * 2);
        last = multiplier;
    }
    assert_eq!(last, 2u64.pow(5));

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_global_discovery_backs_off_then_resolves() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    let warmup = h.manager.start_task(&context, Task::DownloadNymbox);
    assert!(h.completion(warmup).await);
    let worker = h.manager.worker_handle(&context).unwrap();

    let ghost = ServerId::new("ghost");
    let id = h.manager.find_server(&ghost);
    assert!(id.is_valid());
    assert_eq!(h.manager.find_server(&ghost), TaskId::invalid());

    for _ in 0..12 {
        worker.idle().await;
        worker.trigger();
    }
    worker.idle().await;

    // Every scan attempt that failed doubled the multiplier, skipped cycles sent nothing
    let attempts = contract_requests(&h, "ghost") as u32;
    assert!(attempts >= 2);
    assert!(u64::from(attempts) < worker.cycles());
    assert_eq!(worker.server_backoff(&ghost), Some(2u64.pow(attempts)));
    assert_eq!(h.manager.status(id), ThreadStatus::Error);

    h.world.publish_server("ghost", "Ghost");
    let resolved = async {
        loop {
            worker.trigger();
            worker.idle().await;
            if h.repository.server_contract(&ghost).is_some() {
                break;
            }
        }
    };
    tokio::time::timeout(common::TIMEOUT, resolved).await.unwrap();

    assert!(h.completion(id).await);
    assert_eq!(worker.server_backoff(&ghost), None);
    // Known ids are never queued again
    assert_eq!(h.manager.find_server(&ghost), TaskId::invalid());

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_every_ready_worker_helps_with_discovery() {
    let mut h = Harness::new();
    let a = h.ready_context("alice", "notary");
    let b = h.ready_context("bob", "notary");
    for context in [&a, &b] {
        let id = h.manager.start_task(context, Task::DownloadNymbox);
        assert!(h.completion(id).await);
    }

    h.world.publish_unit("gold");
    let id = h.manager.find_unit_definition(&UnitId::new("gold"));
    assert!(h.completion(id).await);
    assert!(h
        .repository
        .unit_definition(&UnitId::new("gold"))
        .is_some());

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_can_message_queues_what_is_missing() {
    let h = Harness::new();
    let context = h.ready_context("alice", "notary");
    h.manager.start_task(&context, Task::DownloadNymbox);
    h.manager.context_idle(&context).unwrap().await;

    let alice = NymId::new("alice");
    let carol = NymId::new("carol");
    let notary = ServerId::new("notary");

    assert_eq!(
        h.manager.can_message(&carol, &alice, &notary),
        Messagability::MissingSender
    );

    h.world.publish_nym("carol", "Carol");
    assert_eq!(
        h.manager.can_message(&alice, &carol, &notary),
        Messagability::MissingRecipient
    );
    h.eventually(|| h.repository.nym(&carol).is_some()).await;

    assert_eq!(
        h.manager.can_message(&alice, &carol, &ServerId::new("elsewhere")),
        Messagability::MissingServer
    );
    assert_eq!(
        h.manager.can_message(&alice, &carol, &notary),
        Messagability::Ready
    );

    h.local_nym("dave");
    assert_eq!(
        h.manager.can_message(&NymId::new("dave"), &carol, &notary),
        Messagability::Unregistered
    );
    let dave = ContextId::new("dave", "notary");
    h.eventually(|| h.manager.worker_state(&dave) == Some(WorkerState::Ready))
        .await;
    assert_eq!(
        h.manager.can_message(&NymId::new("dave"), &carol, &notary),
        Messagability::Ready
    );

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_message_to_unpublished_nym_fails() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");

    let id = h.manager.start_task(
        &context,
        Task::SendMessage {
            recipient: "nobody".into(),
            body: "hello?".into(),
        },
    );

    assert!(!h.completion(id).await);
    assert_eq!(h.world.count("send_message"), 0);
    let worker = h.manager.worker_handle(&context).unwrap();
    assert_eq!(worker.nym_backoff(&NymId::new("nobody")), Some(1));

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_account_registration_fetches_the_unit() {
    let mut h = Harness::new();
    let context = h.ready_context("alice", "notary");
    h.world.publish_unit("gold");

    let id = h.manager.start_task(
        &context,
        Task::RegisterAccount {
            unit: "gold".into(),
            label: "savings".into(),
        },
    );

    assert!(h.completion(id).await);
    assert!(h.repository.unit_definition(&UnitId::new("gold")).is_some());
    let accounts = h.repository.accounts(&context);
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].label, "savings");
    assert_eq!(
        h.world.request_names()[..2],
        ["download_unit_definition", "register_account"]
    );

    h.manager.shutdown().await;
}
