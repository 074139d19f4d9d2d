// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod common;

use common::*;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::{PaddedPieceSize, UnpaddedPieceSize};
use fvm_shared::sector::{RegisteredSealProof, SectorSize};
use grove::actor::market::{ClientDealProposal, DealProposal};
use grove::db::MemoryDB;
use grove::market::network::{read_frame, write_frame, Proposal, SignedResponse};
use grove::market::{
    DataRef, Error, Events, PeerInfo, StorageClient, StorageClientConfig, StorageDealStatus,
    StorageProvider, StorageProviderConfig, StorageProviderInfo,
};
use grove::sector_storage::LocalStore;
use num_traits::Zero;
use std::sync::Arc;
use std::time::Duration;

const PROOF: RegisteredSealProof = RegisteredSealProof::StackedDRG2KiBV1;
const MINER: u64 = 1000;
const CLIENT: u64 = 500;

struct TestSetup {
    provider: Arc<StorageProvider<MemoryDB>>,
    api: Arc<TestApi>,
    events: Arc<Events>,
    db: MemoryDB,
    // tempdirs live as long as the setup
    _storage_root: tempfile::TempDir,
    _staging: tempfile::TempDir,
}

fn new_provider(
    api: Arc<TestApi>,
    events: Arc<Events>,
    db: MemoryDB,
    storage_root: &std::path::Path,
    staging: &std::path::Path,
) -> Arc<StorageProvider<MemoryDB>> {
    let sectors = Arc::new(
        LocalStore::new(
            Box::new(TestLocalStorage::new(vec![storage_root.to_path_buf()])),
            vec![],
        )
        .expect("open local store"),
    );
    Arc::new(
        StorageProvider::new(
            StorageProviderConfig::new(PROOF, Address::new_id(MINER), staging.to_path_buf()),
            api,
            Arc::new(TestSigner),
            Arc::new(TestPieceIo),
            Arc::new(TestTransfer),
            Arc::new(NullHost),
            events,
            sectors,
            db,
        )
        .expect("construct provider"),
    )
}

async fn setup() -> TestSetup {
    let storage_root = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    write_storage_meta(storage_root.path(), "s1", 10, true, true);

    let api = TestApi::new();
    let events = Events::new(api.clone());
    let db = MemoryDB::default();
    let provider = new_provider(
        api.clone(),
        events.clone(),
        db.clone(),
        storage_root.path(),
        staging.path(),
    );
    provider.start().await.expect("start provider");

    TestSetup {
        provider,
        api,
        events,
        db,
        _storage_root: storage_root,
        _staging: staging,
    }
}

fn piece_bytes() -> Vec<u8> {
    vec![7u8; 2048]
}

fn test_proposal(data: &[u8], provider: Address) -> ClientDealProposal {
    sign_proposal(DealProposal {
        piece_cid: test_commp(data),
        piece_size: PaddedPieceSize(2048),
        verified_deal: false,
        client: Address::new_id(CLIENT),
        provider,
        start_epoch: 200,
        end_epoch: 10_000,
        storage_price_per_epoch: TokenAmount::from_atto(1),
        provider_collateral: TokenAmount::from_atto(1),
        client_collateral: TokenAmount::zero(),
    })
}

fn manual_ref(data: &[u8]) -> DataRef {
    DataRef::manual(test_commp(data), UnpaddedPieceSize(2032))
}

async fn wait_for_provider_state(
    provider: &StorageProvider<MemoryDB>,
    proposal_cid: &Cid,
    expected: StorageDealStatus,
) {
    let mut last = None;
    for _ in 0..250 {
        if let Ok(deal) = provider.get_deal(proposal_cid).await {
            if deal.state == expected {
                return;
            }
            last = Some(deal.state);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("provider deal never reached {expected}, last seen {last:?}");
}

async fn wait_for_client_state(
    client: &StorageClient<MemoryDB>,
    proposal_cid: &Cid,
    expected: StorageDealStatus,
) {
    let mut last = None;
    for _ in 0..250 {
        if let Ok(deal) = client.get_local_deal(proposal_cid).await {
            if deal.state == expected {
                return;
            }
            last = Some(deal.state);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("client deal never reached {expected}, last seen {last:?}");
}

/// Opens a deal stream against the provider and writes the proposal,
/// returning the client end of the stream and the proposal CID.
async fn open_deal(
    setup: &TestSetup,
    proposal: ClientDealProposal,
    piece: DataRef,
) -> (tokio::io::DuplexStream, Cid) {
    let (mut client_end, server_end) = tokio::io::duplex(1 << 20);
    let provider = setup.provider.clone();
    let handle = tokio::spawn(async move {
        provider
            .handle_deal_stream(
                Box::new(server_end),
                PeerInfo {
                    peer_id: "client".into(),
                    addresses: vec![],
                },
            )
            .await
    });
    write_frame(
        &mut client_end,
        &Proposal {
            deal_proposal: proposal,
            piece,
        },
    )
    .await
    .expect("write proposal");
    let proposal_cid = handle
        .await
        .expect("deal stream task")
        .expect("deal stream accepted");
    (client_end, proposal_cid)
}

#[tokio::test]
async fn provider_happy_path_manual_transfer() {
    let setup = setup().await;
    let data = piece_bytes();
    let actor = Address::new_id(MINER);
    let (mut client_end, proposal_cid) =
        open_deal(&setup, test_proposal(&data, actor), manual_ref(&data)).await;

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::WaitingForData)
        .await;

    setup
        .provider
        .import_data_for_deal(&proposal_cid, &data)
        .await
        .expect("import matching piece");

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::Sealing).await;

    // the sector carrying deal 42 lands on chain
    setup
        .api
        .apply(full_tipset(11, vec![pre_commit_message(actor, vec![42], 13)]));
    setup
        .api
        .apply(full_tipset(12, vec![prove_commit_message(actor, 13)]));

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::Completed).await;

    let deal = setup.provider.get_deal(&proposal_cid).await.unwrap();
    assert_eq!(deal.deal_id, Some(42));
    assert!(deal.piece_path.exists());
    assert!(deal
        .piece_path
        .to_string_lossy()
        .contains("unsealed/s-t01000-1"));

    // the client observed a signed acceptance carrying the publish message
    let response: SignedResponse = read_frame(&mut client_end).await.unwrap();
    assert_eq!(response.response.state, StorageDealStatus::ProposalAccepted);
    assert_eq!(response.response.proposal, proposal_cid);
    assert!(response.response.publish_message.is_some());
}

#[tokio::test]
async fn import_with_wrong_piece_fails_deal() {
    let setup = setup().await;
    let data = piece_bytes();
    let actor = Address::new_id(MINER);
    let (_client_end, proposal_cid) =
        open_deal(&setup, test_proposal(&data, actor), manual_ref(&data)).await;

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::WaitingForData)
        .await;

    let zeros = vec![0u8; 2048];
    let err = setup
        .provider
        .import_data_for_deal(&proposal_cid, &zeros)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PieceCidDoesNotMatch { .. }));

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::Error).await;
    let deal = setup.provider.get_deal(&proposal_cid).await.unwrap();
    assert!(deal.message.contains("PieceCidDoesNotMatch"));
}

#[tokio::test]
async fn wrong_miner_is_rejected_with_response() {
    let setup = setup().await;
    let data = piece_bytes();
    let (mut client_end, proposal_cid) = open_deal(
        &setup,
        test_proposal(&data, Address::new_id(2000)),
        manual_ref(&data),
    )
    .await;

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::Rejected).await;
    let deal = setup.provider.get_deal(&proposal_cid).await.unwrap();
    assert!(deal.message.contains("WRONG_MINER"));

    let response: SignedResponse = read_frame(&mut client_end).await.unwrap();
    assert_eq!(response.response.state, StorageDealStatus::Rejected);
    assert!(response.response.message.contains("WRONG_MINER"));
}

#[tokio::test]
async fn oversized_piece_fails_deal() {
    let setup = setup().await;
    let data = piece_bytes();
    let proposal = DealProposal {
        piece_cid: test_commp(&data),
        piece_size: PaddedPieceSize(4096),
        verified_deal: false,
        client: Address::new_id(CLIENT),
        provider: Address::new_id(MINER),
        start_epoch: 200,
        end_epoch: 10_000,
        storage_price_per_epoch: TokenAmount::from_atto(1),
        provider_collateral: TokenAmount::from_atto(1),
        client_collateral: TokenAmount::zero(),
    };
    let (_client_end, proposal_cid) =
        open_deal(&setup, sign_proposal(proposal), manual_ref(&data)).await;

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::Error).await;
    let deal = setup.provider.get_deal(&proposal_cid).await.unwrap();
    assert!(deal.message.contains("PieceSizeGreaterSectorSize"));
}

#[tokio::test]
async fn tampered_signature_fails_deal() {
    let setup = setup().await;
    let data = piece_bytes();
    let mut proposal = test_proposal(&data, Address::new_id(MINER));
    proposal.client_signature.bytes[0] ^= 0xff;
    let (_client_end, proposal_cid) = open_deal(&setup, proposal, manual_ref(&data)).await;

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::Error).await;
    let deal = setup.provider.get_deal(&proposal_cid).await.unwrap();
    assert!(deal.message.contains("InvalidSignature"));
}

#[tokio::test]
async fn deals_survive_provider_restart() {
    let storage_root = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    write_storage_meta(storage_root.path(), "s1", 10, true, true);
    let api = TestApi::new();
    let events = Events::new(api.clone());
    let db = MemoryDB::default();
    let provider = new_provider(
        api.clone(),
        events.clone(),
        db.clone(),
        storage_root.path(),
        staging.path(),
    );
    provider.start().await.unwrap();

    let data = piece_bytes();
    let actor = Address::new_id(MINER);
    let (mut client_end, server_end) = tokio::io::duplex(1 << 20);
    let p = provider.clone();
    let handle = tokio::spawn(async move {
        p.handle_deal_stream(
            Box::new(server_end),
            PeerInfo {
                peer_id: "client".into(),
                addresses: vec![],
            },
        )
        .await
    });
    write_frame(
        &mut client_end,
        &Proposal {
            deal_proposal: test_proposal(&data, actor),
            piece: manual_ref(&data),
        },
    )
    .await
    .unwrap();
    let proposal_cid = handle.await.unwrap().unwrap();
    wait_for_provider_state(&provider, &proposal_cid, StorageDealStatus::WaitingForData).await;
    drop(provider);

    let restarted = new_provider(
        api.clone(),
        Events::new(api.clone()),
        db,
        storage_root.path(),
        staging.path(),
    );
    restarted.start().await.unwrap();
    let deal = restarted.get_deal(&proposal_cid).await.unwrap();
    assert_eq!(deal.state, StorageDealStatus::WaitingForData);
    assert_eq!(
        restarted.list_incomplete_deals().await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn stored_ask_sequence_and_persistence() {
    let setup = setup().await;
    let actor = Address::new_id(MINER);

    setup
        .provider
        .add_ask(TokenAmount::from_atto(500), 1000)
        .await
        .unwrap();
    let asks = setup.provider.list_asks(&actor).await.unwrap();
    assert_eq!(asks[0].ask.seq_no, 0);
    assert_eq!(asks[0].ask.price, TokenAmount::from_atto(500));
    assert_eq!(asks[0].ask.expiry, 10 + 1000);

    setup
        .provider
        .add_ask(TokenAmount::from_atto(500), 1000)
        .await
        .unwrap();
    let asks = setup.provider.list_asks(&actor).await.unwrap();
    assert_eq!(asks[0].ask.seq_no, 1);

    let err = setup
        .provider
        .list_asks(&Address::new_id(2000))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AskNotFound(_)));

    // a provider over the same datastore continues the sequence
    let storage_root = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    write_storage_meta(storage_root.path(), "s2", 10, true, true);
    let restarted = new_provider(
        setup.api.clone(),
        Events::new(setup.api.clone()),
        setup.db.clone(),
        storage_root.path(),
        staging.path(),
    );
    let asks = restarted.list_asks(&actor).await.unwrap();
    assert_eq!(asks[0].ask.seq_no, 1);
}

#[tokio::test]
async fn client_and_provider_complete_a_deal_end_to_end() {
    let setup = setup().await;
    let actor = Address::new_id(MINER);
    let data = piece_bytes();

    let provider_info = StorageProviderInfo {
        address: actor,
        owner: setup.api.miner_owner,
        worker: setup.api.miner_worker,
        sector_size: SectorSize::_2KiB,
        peer_info: PeerInfo {
            peer_id: "provider".into(),
            addresses: vec![],
        },
    };

    let client = StorageClient::new(
        StorageClientConfig::default(),
        setup.api.clone(),
        Arc::new(TestSigner),
        Arc::new(TestPieceIo),
        Arc::new(TestTransfer),
        Arc::new(ProviderHost {
            provider: setup.provider.clone(),
            peer: PeerInfo {
                peer_id: "client".into(),
                addresses: vec![],
            },
        }),
        setup.events.clone(),
        MemoryDB::default(),
    );
    client.run().await.unwrap();

    setup
        .provider
        .add_ask(TokenAmount::from_atto(500), 1000)
        .await
        .unwrap();
    let ask = client.get_ask(&provider_info).await.unwrap();
    assert_eq!(ask.ask.miner, actor);

    // chain state for the published deal
    let proposal_record = test_proposal(&data, actor).proposal;
    setup
        .api
        .deal_states
        .lock()
        .insert(42, market_deal(proposal_record));

    let proposal_cid = client
        .propose_storage_deal(
            Address::new_id(CLIENT),
            &provider_info,
            manual_ref(&data),
            200,
            10_000,
            TokenAmount::from_atto(1),
            TokenAmount::from_atto(1),
            PROOF,
        )
        .await
        .unwrap();

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::WaitingForData)
        .await;
    wait_for_client_state(&client, &proposal_cid, StorageDealStatus::CheckForAcceptance).await;

    setup
        .provider
        .import_data_for_deal(&proposal_cid, &data)
        .await
        .unwrap();

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::Sealing).await;
    wait_for_client_state(&client, &proposal_cid, StorageDealStatus::Sealing).await;

    setup
        .api
        .apply(full_tipset(11, vec![pre_commit_message(actor, vec![42], 13)]));
    setup
        .api
        .apply(full_tipset(12, vec![prove_commit_message(actor, 13)]));

    wait_for_provider_state(&setup.provider, &proposal_cid, StorageDealStatus::Completed).await;
    wait_for_client_state(&client, &proposal_cid, StorageDealStatus::Completed).await;

    let deal = client.get_local_deal(&proposal_cid).await.unwrap();
    assert_eq!(deal.deal_id, Some(42));
    assert!(deal.publish_message.is_some());

    let status = client.query_deal_status(&proposal_cid).await.unwrap();
    assert_eq!(status.state, StorageDealStatus::Completed);
}
