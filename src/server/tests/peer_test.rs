//! Peer tests across three servers.

use super::*;
use crate::context::RouterStatus;
use crate::server::peer_test::PeerTestRecord;

#[tokio::test]
async fn test_reachable_router_passes_peer_test() {
    let mut alice = start_router(test_config(None)).await;
    let mut bob = start_router(test_config(Some(false))).await;
    let mut charlie = start_router(test_config(Some(false))).await;
    assert_eq!(alice.server.context.status(), RouterStatus::Testing);

    connect_pair(&mut alice, &mut bob).await;
    connect_pair(&mut charlie, &mut bob).await;
    assert!(alice.session_with(&bob).unwrap().peer_test_capable);

    // Testing status starts a test on the refresh tick
    alice.server.refresh_introducers(Instant::now()).await;
    assert_eq!(alice.server.peer_test_count(), 1);

    let done = pump_until(&mut [&mut alice, &mut bob, &mut charlie], |r| {
        r[0].server.context.status() == RouterStatus::Ok
    })
    .await;
    assert!(done, "peer test did not complete");

    // Bob and Charlie each tracked their part
    assert_eq!(bob.server.peer_test_count(), 1);
    assert_eq!(charlie.server.peer_test_count(), 1);
    // Alice never opened a session to Charlie
    assert!(alice.session_with(&charlie).is_none());
}

#[tokio::test]
async fn test_only_one_test_at_a_time() {
    let mut alice = start_router(test_config(None)).await;
    let mut bob = start_router(test_config(Some(false))).await;
    connect_pair(&mut alice, &mut bob).await;

    assert!(alice.server.start_peer_test(Instant::now()).await);
    assert!(!alice.server.start_peer_test(Instant::now()).await);
}

#[tokio::test]
async fn test_no_bob_no_test() {
    let mut alice = start_router(test_config(None)).await;
    assert!(!alice.server.start_peer_test(Instant::now()).await);
    assert_eq!(alice.server.peer_test_count(), 0);
}

#[tokio::test]
async fn test_expired_test_with_bob_reply_means_firewalled() {
    let mut alice = start_router(test_config(None)).await;
    let now = Instant::now();
    let bob: SocketAddr = "127.0.0.1:9".parse().unwrap();

    let mut answered = PeerTestRecord {
        role: PeerTestRole::Alice1,
        created: now,
        peer: bob,
        charlie: None,
        bob_replied: false,
    };
    alice.server.peer_tests.insert(1, answered.clone());
    alice.server.cleanup_peer_tests(now + Duration::from_secs(61));
    // No reply at all says nothing about reachability
    assert_eq!(alice.server.context.status(), RouterStatus::Testing);

    answered.bob_replied = true;
    alice.server.peer_tests.insert(2, answered);
    alice.server.cleanup_peer_tests(now + Duration::from_secs(61));
    assert_eq!(alice.server.context.status(), RouterStatus::Firewalled);
    assert_eq!(alice.server.peer_test_count(), 0);
}
