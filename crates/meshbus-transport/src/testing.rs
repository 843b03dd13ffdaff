//! Conformance assertions shared by every [`Connection`] implementation.
//!
//! Each helper takes two connected ends. Transports call them from their
//! own test suites:
//!
//! ```rust,ignore
//! let (a, b) = MemoryConnection::pair("a", "b");
//! testing::assert_connection_conformance(&a, &b).await;
//! ```

use crate::error::TransportError;
use crate::traits::Connection;

/// Frames travel both ways unchanged, including empty ones.
pub async fn assert_bidirectional(a: &impl Connection, b: &impl Connection) {
    a.send(b"ping").await.expect("send a->b");
    assert_eq!(b.receive().await.expect("receive at b"), b"ping");
    b.send(b"").await.expect("send empty b->a");
    assert_eq!(a.receive().await.expect("receive at a"), Vec::<u8>::new());
}

/// Frame boundaries and order are preserved across a burst.
pub async fn assert_ordered_boundaries(a: &impl Connection, b: &impl Connection) {
    let frames: Vec<Vec<u8>> = (0u8..32).map(|i| vec![i; usize::from(i) * 7]).collect();
    for frame in &frames {
        a.send(frame).await.expect("send burst frame");
    }
    for expected in &frames {
        assert_eq!(&b.receive().await.expect("receive burst frame"), expected);
    }
}

/// After one side disconnects, the other side's `receive` ends in `Disconnected`.
pub async fn assert_disconnect_is_observed(a: &impl Connection, b: &impl Connection) {
    a.disconnect().await.expect("disconnect");
    assert!(!a.is_connected(), "disconnected end must report it");
    match b.receive().await {
        Err(TransportError::Disconnected) => {}
        other => panic!("expected Disconnected after peer left, got {other:?}"),
    }
}

/// Sending on a closed connection fails and a second disconnect is harmless.
pub async fn assert_closed_connection_rejects_sends(a: &impl Connection) {
    a.disconnect().await.expect("disconnect");
    assert!(a.send(b"late").await.is_err(), "send after disconnect must fail");
    a.disconnect().await.expect("second disconnect must be idempotent");
}

/// Peer description and transport bit are populated.
pub fn assert_describes_itself(conn: &impl Connection) {
    assert!(!conn.peer().is_empty(), "peer description must not be empty");
    assert!(!conn.transport().is_empty(), "transport mask must name a transport");
}

/// Run every check on one freshly connected pair.
///
/// The pair is consumed: the final check disconnects it.
pub async fn assert_connection_conformance(a: &impl Connection, b: &impl Connection) {
    assert_describes_itself(a);
    assert_describes_itself(b);
    assert_bidirectional(a, b).await;
    assert_ordered_boundaries(a, b).await;
    assert_disconnect_is_observed(a, b).await;
    assert_closed_connection_rejects_sends(a).await;
}
