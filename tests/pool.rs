mod common;

use std::sync::Arc;
use std::time::Duration;

use filament::{CloseCause, SessionConfig, SessionPool, SessionStatus, Transport};
use futures::future::join_all;
use pretty_assertions::assert_eq;

use common::{origin, settle, MockTransport};

fn pool_over(transport: &Arc<MockTransport>) -> SessionPool {
    SessionPool::new(
        Arc::clone(transport) as Arc<dyn Transport>,
        SessionConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_connect() {
    let transport = Arc::new(MockTransport::new());
    transport.set_connect_delay(Duration::from_millis(50));
    let pool = pool_over(&transport);
    let target = origin("http://one.example.com:8000");

    let callers = (0..10).map(|_| {
        let pool = pool.clone();
        let target = target.clone();
        tokio::spawn(async move { pool.get_session(&target, None).await.unwrap() })
    });
    let sessions: Vec<_> = join_all(callers)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(transport.connects(), 1);
    for session in &sessions[1..] {
        assert!(Arc::ptr_eq(&sessions[0], session));
    }
}

#[tokio::test(start_paused = true)]
async fn origins_get_independent_sessions() {
    let transport = Arc::new(MockTransport::new());
    let pool = pool_over(&transport);

    let a = pool
        .get_session(&origin("http://a.example.com:8000"), None)
        .await
        .unwrap();
    let b = pool
        .get_session(&origin("http://b.example.com:8000"), None)
        .await
        .unwrap();

    assert_eq!(transport.connects(), 2);
    assert!(!Arc::ptr_eq(&a, &b));

    // closing a's session must not affect b's
    a.end();
    a.closed().await;
    settle().await;

    assert!(a.status().is_terminal());
    assert_eq!(b.status(), SessionStatus::Connected);
    assert_eq!(pool.active_sessions(), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_close_evicts_the_entry() {
    let transport = Arc::new(MockTransport::new());
    let pool = pool_over(&transport);
    let target = origin("http://one.example.com:8000");

    let first = pool.get_session(&target, None).await.unwrap();
    transport.connections()[0].trigger_close(CloseCause::Closed);
    first.closed().await;
    settle().await;

    assert_eq!(pool.active_sessions(), 0);

    // the next caller gets a fresh connection, not the dead session
    let second = pool.get_session(&target, None).await.unwrap();
    assert_eq!(transport.connects(), 2);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.status(), SessionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn goaway_close_evicts_the_entry() {
    let transport = Arc::new(MockTransport::new());
    let pool = pool_over(&transport);
    let target = origin("http://one.example.com:8000");

    let session = pool.get_session(&target, None).await.unwrap();
    transport.connections()[0].trigger_close(CloseCause::GoAway);
    session.closed().await;
    settle().await;

    assert!(session.status().is_terminal());
    assert_eq!(pool.active_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_failure_is_not_cached() {
    let transport = Arc::new(MockTransport::new());
    let pool = pool_over(&transport);
    let target = origin("http://one.example.com:8000");

    transport.fail_next_connect();
    let err = pool.get_session(&target, None).await.unwrap_err();
    assert!(err.to_string().contains("connection refused"));
    assert_eq!(pool.active_sessions(), 0);

    // the failed attempt must not be replayed
    let session = pool.get_session(&target, None).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn end_clears_the_pool_and_allows_reconnects() {
    let transport = Arc::new(MockTransport::new());
    let pool = pool_over(&transport);
    let target_a = origin("http://a.example.com:8000");
    let target_b = origin("http://b.example.com:8000");

    let a = pool.get_session(&target_a, None).await.unwrap();
    let b = pool.get_session(&target_b, None).await.unwrap();

    pool.end().await;

    assert!(a.status().is_terminal());
    assert!(b.status().is_terminal());
    assert_eq!(pool.active_sessions(), 0);

    // a previously used origin connects afresh
    let connects_before = transport.connects();
    let again = pool.get_session(&target_a, None).await.unwrap();
    assert_eq!(transport.connects(), connects_before + 1);
    assert_eq!(again.status(), SessionStatus::Connected);
}
