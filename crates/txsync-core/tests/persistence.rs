//! Worker progress survives a restart when the repository is backed by redb

mod common;

use common::{server_contract, Harness};
use tempfile::TempDir;
use txsync_core::{
    ContextId, MemoryRepository, NymId, NymRecord, PeerBox, Repository, Storage, SyncConfig, Task,
};

#[tokio::test]
async fn test_registration_and_accounts_are_persisted() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("txsync.redb");
    let context = ContextId::new("alice", "notary");

    {
        let repository = MemoryRepository::from_storage(Storage::new(&path).unwrap()).unwrap();
        repository.add_local_nym(NymRecord {
            id: NymId::new("alice"),
            name: "Alice".into(),
            revision: 1,
        });
        repository.store_server_contract(server_contract("notary", "Notary"));

        let mut h = Harness::with_repository(SyncConfig::fast(), repository);
        h.world.publish_server("notary", "Notary");
        h.world.publish_unit("gold");

        let id = h.manager.start_task(
            &context,
            Task::RegisterAccount {
                unit: "gold".into(),
                label: "main".into(),
            },
        );
        assert!(h.completion(id).await);
        h.manager.shutdown().await;
    }

    let storage = Storage::new(&path).unwrap();
    let consensus = storage.load_consensus(&context).unwrap().unwrap();
    assert!(consensus.is_registered());

    let repository = MemoryRepository::from_storage(storage).unwrap();
    assert_eq!(repository.local_nyms(), vec![NymId::new("alice")]);
    assert_eq!(repository.registered_contexts(), vec![context.clone()]);
    let accounts = repository.accounts(&context);
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].label, "main");
    assert!(repository.unit_definition(&"gold".into()).is_some());
}

#[tokio::test]
async fn test_peer_boxes_are_reloaded() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("txsync.redb");
    let alice = NymId::new("alice");
    let request = txsync_core::PeerRequest {
        id: "req-1".into(),
        initiator: NymId::new("bob"),
        recipient: alice.clone(),
        kind: txsync_core::PeerRequestKind::ConnectionInfo,
        body: String::new(),
    };

    {
        let repository = MemoryRepository::from_storage(Storage::new(&path).unwrap()).unwrap();
        repository.add_local_nym(NymRecord {
            id: alice.clone(),
            name: "Alice".into(),
            revision: 1,
        });
        repository.store_peer_request(&alice, PeerBox::Incoming, request.clone());
        assert!(repository.move_peer_request(&alice, "req-1", PeerBox::Incoming, PeerBox::Processed));
    }

    let repository = MemoryRepository::from_storage(Storage::new(&path).unwrap()).unwrap();
    assert!(repository.peer_requests(&alice, PeerBox::Incoming).is_empty());
    assert_eq!(repository.peer_requests(&alice, PeerBox::Processed), vec![request]);
}
