//! Tests for the storage queue transport.

use super::*;
use crate::backend::LeaseMessage;
use crate::events::ChannelObserver;
use crate::providers::InMemoryQueueBackend;
use mockall::mock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

type EventReceiver = UnboundedReceiver<(TransportUri, TransportEvent)>;

// ============================================================================
// Test Backends
// ============================================================================

mock! {
    pub Backend {}

    #[async_trait]
    impl QueueBackend for Backend {
        async fn create_if_not_exists(&self) -> Result<(), TransportError>;
        async fn delete_if_exists(&self) -> Result<(), TransportError>;
        async fn clear(&self) -> Result<(), TransportError>;
        async fn approximate_message_count(&self) -> Result<u64, TransportError>;
        async fn send(&self, text: &str, ttl: MessageTimeToLive) -> Result<(), TransportError>;
        async fn receive_batch(
            &self,
            max_count: u32,
            visibility_timeout: Option<std::time::Duration>,
        ) -> Result<Vec<LeaseMessage>, TransportError>;
        async fn delete(&self, id: &str, lease_receipt: &str) -> Result<(), TransportError>;
    }
}

/// In-memory backend whose calls can be made to hang until cancelled
#[derive(Default)]
struct StallingBackend {
    inner: InMemoryQueueBackend,
    stall_receive: AtomicBool,
    stall_send: AtomicBool,
    stall_delete: AtomicBool,
}

impl StallingBackend {
    async fn stall_if(flag: &AtomicBool) {
        if flag.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl QueueBackend for StallingBackend {
    async fn create_if_not_exists(&self) -> Result<(), TransportError> {
        self.inner.create_if_not_exists().await
    }

    async fn delete_if_exists(&self) -> Result<(), TransportError> {
        self.inner.delete_if_exists().await
    }

    async fn clear(&self) -> Result<(), TransportError> {
        self.inner.clear().await
    }

    async fn approximate_message_count(&self) -> Result<u64, TransportError> {
        self.inner.approximate_message_count().await
    }

    async fn send(&self, text: &str, ttl: MessageTimeToLive) -> Result<(), TransportError> {
        Self::stall_if(&self.stall_send).await;
        self.inner.send(text, ttl).await
    }

    async fn receive_batch(
        &self,
        max_count: u32,
        visibility_timeout: Option<Duration>,
    ) -> Result<Vec<LeaseMessage>, TransportError> {
        Self::stall_if(&self.stall_receive).await;
        self.inner.receive_batch(max_count, visibility_timeout).await
    }

    async fn delete(&self, id: &str, lease_receipt: &str) -> Result<(), TransportError> {
        Self::stall_if(&self.stall_delete).await;
        self.inner.delete(id, lease_receipt).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_uri() -> TransportUri {
    TransportUri::parse("azuresq://test/work-queue").unwrap()
}

fn transport_over(backend: Arc<dyn QueueBackend>) -> (StorageQueueTransport, EventReceiver) {
    let (observer, events) = ChannelObserver::new();
    let transport = StorageQueueTransport::new(
        test_uri(),
        backend,
        ReceiveOptions::default(),
        ObserverSet::new().with_observer(Arc::new(observer)),
    );
    (transport, events)
}

async fn memory_transport() -> (StorageQueueTransport, Arc<InMemoryQueueBackend>, EventReceiver) {
    let backend = Arc::new(InMemoryQueueBackend::default());
    backend.create_if_not_exists().await.unwrap();
    let (transport, events) = transport_over(backend.clone());
    (transport, backend, events)
}

fn drain(events: &mut EventReceiver) -> Vec<TransportEvent> {
    let mut drained = Vec::new();
    while let Ok((_, event)) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn stages(events: &mut EventReceiver) -> Vec<String> {
    drain(events).iter().map(ToString::to_string).collect()
}

fn message() -> TransportMessage {
    TransportMessage::new("test-message")
}

fn cancel_after(millis: u64) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        trigger.cancel();
    });
    cancel
}

fn lease_message(id: &str, text: &str) -> LeaseMessage {
    LeaseMessage {
        id: id.to_string(),
        text: text.to_string(),
        lease_receipt: format!("receipt-{}", id),
        dequeue_count: 1,
    }
}

// ============================================================================
// Queue Operations
// ============================================================================

mod queue_operation_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_emits_lifecycle_events() {
        let backend = Arc::new(InMemoryQueueBackend::default());
        let (transport, mut events) = transport_over(backend.clone());

        transport.create(&CancellationToken::new()).await.unwrap();

        assert!(backend.exists());
        assert_eq!(
            stages(&mut events),
            vec!["create/starting", "create/completed"]
        );
    }

    #[tokio::test]
    async fn test_drop_removes_queue() {
        let (transport, backend, mut events) = memory_transport().await;

        transport.drop_queue(&CancellationToken::new()).await.unwrap();
        transport.drop_queue(&CancellationToken::new()).await.unwrap();

        assert!(!backend.exists());
        assert_eq!(
            stages(&mut events),
            vec![
                "drop/starting",
                "drop/completed",
                "drop/starting",
                "drop/completed"
            ]
        );
    }

    /// Purge clears the backend but leaves locally held leases alone.
    #[tokio::test]
    async fn test_purge_keeps_local_leases() {
        let (transport, backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        transport.send(&message(), Bytes::from("a"), &cancel).await.unwrap();
        let received = transport.receive(&cancel).await.unwrap().unwrap();
        drain(&mut events);

        transport.purge(&cancel).await.unwrap();

        assert_eq!(backend.message_count(), 0);
        assert_eq!(transport.outstanding_leases().await, 1);
        assert_eq!(
            stages(&mut events),
            vec!["purge/starting", "purge/completed"]
        );

        // The purged message is gone from the backend, so acknowledging fails
        let result = transport.acknowledge(&received.token, &cancel).await;
        assert!(matches!(result, Err(TransportError::MessageNotFound { .. })));
        assert_eq!(transport.outstanding_leases().await, 0);
    }

    #[tokio::test]
    async fn test_create_failure_skips_completed_event() {
        let mut backend = MockBackend::new();
        backend
            .expect_create_if_not_exists()
            .times(1)
            .returning(|| {
                Err(TransportError::AuthenticationFailed {
                    message: "denied".to_string(),
                })
            });
        let (transport, mut events) = transport_over(Arc::new(backend));

        let result = transport.create(&CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(TransportError::AuthenticationFailed { .. })
        ));
        assert_eq!(stages(&mut events), vec!["create/starting"]);
    }

    #[tokio::test]
    async fn test_create_with_cancelled_token() {
        let backend = Arc::new(InMemoryQueueBackend::default());
        let (transport, mut events) = transport_over(backend.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        transport.create(&cancel).await.unwrap();

        assert!(!backend.exists());
        assert_eq!(
            stages(&mut events),
            vec!["create/starting", "create/cancelled", "create/completed"]
        );
    }

    #[tokio::test]
    async fn test_has_pending_reports_result() {
        let (transport, _backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();

        assert!(!transport.has_pending(&cancel).await.unwrap());
        transport.send(&message(), Bytes::from("a"), &cancel).await.unwrap();
        drain(&mut events);

        assert!(transport.has_pending(&cancel).await.unwrap());

        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].to_string(), "has-pending/starting");
        assert!(matches!(events[1], TransportEvent::HasPending { result: true }));
    }

    #[tokio::test]
    async fn test_has_pending_cancelled_reports_true() {
        let (transport, _backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(transport.has_pending(&cancel).await.unwrap());

        let events = drain(&mut events);
        assert!(matches!(
            events.last(),
            Some(TransportEvent::HasPendingCancelled { result: true })
        ));
    }

    #[tokio::test]
    async fn test_has_pending_propagates_backend_errors() {
        let backend = Arc::new(InMemoryQueueBackend::default());
        let (transport, mut events) = transport_over(backend);

        let result = transport.has_pending(&CancellationToken::new()).await;

        assert!(matches!(result, Err(TransportError::QueueNotFound { .. })));
        assert_eq!(stages(&mut events), vec!["has-pending/starting"]);
    }
}

// ============================================================================
// Send and Receive
// ============================================================================

mod send_receive_tests {
    use super::*;

    #[tokio::test]
    async fn test_send_encodes_payload_and_emits_event() {
        let (transport, backend, mut events) = memory_transport().await;
        let envelope = message().with_correlation_id("corr-1".to_string());

        transport
            .send(&envelope, Bytes::from("hello"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backend.message_texts(), vec!["aGVsbG8=".to_string()]);
        match drain(&mut events).as_slice() {
            [TransportEvent::MessageSent { message, payload }] => {
                assert_eq!(message, &envelope);
                assert_eq!(payload.as_ref(), b"hello");
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_from_empty_queue() {
        let (transport, _backend, mut events) = memory_transport().await;

        let received = transport.receive(&CancellationToken::new()).await.unwrap();

        assert!(received.is_none());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_receive_round_trips_binary_payloads() {
        let (transport, _backend, _events) = memory_transport().await;
        let cancel = CancellationToken::new();
        let payloads = vec![
            Bytes::new(),
            Bytes::from_static(&[0, 255, 10, 13, 0, 1]),
            Bytes::from("line one\nline two\n"),
        ];

        for payload in &payloads {
            transport.send(&message(), payload.clone(), &cancel).await.unwrap();
        }

        let mut received = Vec::new();
        while let Some(message) = transport.receive(&cancel).await.unwrap() {
            received.push(message.payload.clone());
            transport.acknowledge(&message.token, &cancel).await.unwrap();
        }

        assert_eq!(received, payloads);
    }

    /// One fetch fills the buffer; later receives are served locally in order.
    #[tokio::test]
    async fn test_receive_buffers_whole_batch_in_order() {
        let (transport, backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        for text in ["1", "2", "3"] {
            transport.send(&message(), Bytes::from(text), &cancel).await.unwrap();
        }
        drain(&mut events);

        let first = transport.receive(&cancel).await.unwrap().unwrap();

        assert_eq!(first.payload.as_ref(), b"1");
        assert_eq!(backend.in_flight_count(), 3);
        assert_eq!(transport.outstanding_leases().await, 3);
        assert_eq!(transport.buffered_messages().await, 2);

        let second = transport.receive(&cancel).await.unwrap().unwrap();
        let third = transport.receive(&cancel).await.unwrap().unwrap();
        assert_eq!(second.payload.as_ref(), b"2");
        assert_eq!(third.payload.as_ref(), b"3");
        assert!(transport.receive(&cancel).await.unwrap().is_none());

        assert_eq!(
            stages(&mut events),
            vec!["message-received", "message-received", "message-received"]
        );
    }

    #[tokio::test]
    async fn test_receive_respects_batch_size() {
        let backend = Arc::new(InMemoryQueueBackend::default());
        backend.create_if_not_exists().await.unwrap();
        let transport = StorageQueueTransport::new(
            test_uri(),
            backend.clone(),
            ReceiveOptions::new().with_max_messages(2),
            ObserverSet::new(),
        );
        let cancel = CancellationToken::new();
        for text in ["1", "2", "3"] {
            transport.send(&message(), Bytes::from(text), &cancel).await.unwrap();
        }

        transport.receive(&cancel).await.unwrap();

        assert_eq!(transport.outstanding_leases().await, 2);
        assert_eq!(backend.in_flight_count(), 2);
    }

    /// A malformed message in a batch does not hold back the messages fetched with it.
    #[tokio::test]
    async fn test_undecodable_message_is_skipped() {
        let (transport, backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        for text in ["%%not-base64%%", "Z29vZA==", "bW9yZQ=="] {
            backend.send(text, MessageTimeToLive::Infinite).await.unwrap();
        }

        let first = transport.receive(&cancel).await.unwrap().unwrap();
        let second = transport.receive(&cancel).await.unwrap().unwrap();

        assert_eq!(first.payload.as_ref(), b"good");
        assert_eq!(second.payload.as_ref(), b"more");
        assert_eq!(transport.outstanding_leases().await, 2);
        assert_eq!(
            stages(&mut events),
            vec!["message-received", "message-received"]
        );

        // The malformed message stays leased by the backend only
        assert!(transport.receive(&cancel).await.unwrap().is_none());
        assert_eq!(backend.in_flight_count(), 3);

        transport.acknowledge(&first.token, &cancel).await.unwrap();
        transport.acknowledge(&second.token, &cancel).await.unwrap();
        assert_eq!(transport.outstanding_leases().await, 0);

        // Once its visibility lapses it is fetched and skipped again
        backend.expire_visibility();
        assert!(transport.receive(&cancel).await.unwrap().is_none());
        assert_eq!(backend.message_texts(), vec!["%%not-base64%%".to_string()]);
        assert_eq!(transport.outstanding_leases().await, 0);
    }

    /// A message redelivered after its visibility expired replaces the stale lease.
    #[tokio::test]
    async fn test_redelivery_refreshes_lease() {
        let (transport, backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        transport.send(&message(), Bytes::from("a"), &cancel).await.unwrap();

        let first = transport.receive(&cancel).await.unwrap().unwrap();
        backend.expire_visibility();
        drain(&mut events);
        let second = transport.receive(&cancel).await.unwrap().unwrap();

        let first_lease = first.token.lease().unwrap();
        let second_lease = second.token.lease().unwrap();
        assert_eq!(first_lease.id(), second_lease.id());
        assert_ne!(first_lease.lease_receipt(), second_lease.lease_receipt());

        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        match &events[0] {
            TransportEvent::Refreshed { message_id } => assert_eq!(message_id, first_lease.id()),
            other => panic!("expected refreshed event, got {}", other),
        }
        assert_eq!(events[1].to_string(), "message-received");
        assert_eq!(transport.outstanding_leases().await, 1);

        // The stale token no longer refers to a held lease
        transport.acknowledge(&first.token, &cancel).await.unwrap();
        assert_eq!(transport.outstanding_leases().await, 1);
        assert_eq!(backend.message_count(), 1);

        transport.acknowledge(&second.token, &cancel).await.unwrap();
        assert_eq!(backend.message_count(), 0);
    }
}

// ============================================================================
// Acknowledge and Release
// ============================================================================

mod settlement_tests {
    use super::*;

    #[tokio::test]
    async fn test_acknowledge_deletes_message() {
        let (transport, backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        transport.send(&message(), Bytes::from("a"), &cancel).await.unwrap();
        let received = transport.receive(&cancel).await.unwrap().unwrap();
        drain(&mut events);

        transport.acknowledge(&received.token, &cancel).await.unwrap();

        assert_eq!(backend.message_count(), 0);
        assert_eq!(transport.outstanding_leases().await, 0);
        assert_eq!(stages(&mut events), vec!["message-acknowledged"]);
    }

    #[tokio::test]
    async fn test_second_acknowledge_is_a_no_op() {
        let (transport, _backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        transport.send(&message(), Bytes::from("a"), &cancel).await.unwrap();
        let received = transport.receive(&cancel).await.unwrap().unwrap();
        transport.acknowledge(&received.token, &cancel).await.unwrap();
        drain(&mut events);

        transport.acknowledge(&received.token, &cancel).await.unwrap();
        transport.release(&received.token, &cancel).await.unwrap();

        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_foreign_token_is_ignored() {
        let (transport, _backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        let token = AcknowledgementToken::new(42_u32);

        transport.acknowledge(&token, &cancel).await.unwrap();
        transport.release(&token, &cancel).await.unwrap();

        assert!(drain(&mut events).is_empty());
    }

    /// Tokens minted by another transport are not honoured even if they wrap a lease.
    #[tokio::test]
    async fn test_lease_from_other_transport_is_ignored() {
        let (transport, backend, _events) = memory_transport().await;
        let (other, _other_events) = transport_over(backend.clone());
        let cancel = CancellationToken::new();
        transport.send(&message(), Bytes::from("a"), &cancel).await.unwrap();
        let received = transport.receive(&cancel).await.unwrap().unwrap();

        other.acknowledge(&received.token, &cancel).await.unwrap();

        assert_eq!(backend.message_count(), 1);
        assert_eq!(transport.outstanding_leases().await, 1);
    }

    #[tokio::test]
    async fn test_acknowledge_failure_still_forgets_lease() {
        let mut backend = MockBackend::new();
        backend
            .expect_receive_batch()
            .times(1)
            .returning(|_, _| Ok(vec![lease_message("id-1", "YQ==")]));
        backend.expect_delete().times(1).returning(|_, _| {
            Err(TransportError::ConnectionFailed {
                message: "reset".to_string(),
            })
        });
        let (transport, mut events) = transport_over(Arc::new(backend));
        let cancel = CancellationToken::new();
        let received = transport.receive(&cancel).await.unwrap().unwrap();
        drain(&mut events);

        let result = transport.acknowledge(&received.token, &cancel).await;

        assert!(matches!(result, Err(TransportError::ConnectionFailed { .. })));
        assert_eq!(transport.outstanding_leases().await, 0);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_release_redelivers_payload_with_new_token() {
        let (transport, backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        transport.send(&message(), Bytes::from("again"), &cancel).await.unwrap();
        let first = transport.receive(&cancel).await.unwrap().unwrap();
        drain(&mut events);

        transport.release(&first.token, &cancel).await.unwrap();

        assert_eq!(stages(&mut events), vec!["message-released"]);
        assert_eq!(transport.outstanding_leases().await, 0);
        assert_eq!(backend.message_count(), 1);

        let second = transport.receive(&cancel).await.unwrap().unwrap();
        assert_eq!(second.payload, first.payload);
        assert_ne!(second.message_id(), first.message_id());
    }

    #[tokio::test]
    async fn test_release_send_failure_skips_delete() {
        let mut backend = MockBackend::new();
        backend
            .expect_receive_batch()
            .times(1)
            .returning(|_, _| Ok(vec![lease_message("id-1", "YQ==")]));
        backend.expect_send().times(1).returning(|_, _| {
            Err(TransportError::Timeout {
                duration: Duration::from_secs(30),
            })
        });
        backend.expect_delete().times(0);
        let (transport, _events) = transport_over(Arc::new(backend));
        let cancel = CancellationToken::new();
        let received = transport.receive(&cancel).await.unwrap().unwrap();

        let result = transport.release(&received.token, &cancel).await;

        assert!(matches!(result, Err(TransportError::Timeout { .. })));
        assert_eq!(transport.outstanding_leases().await, 0);
    }
}

// ============================================================================
// Cancellation
// ============================================================================

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_with_cancelled_token() {
        let (transport, _backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(transport.receive(&cancel).await.unwrap().is_none());
        assert_eq!(stages(&mut events), vec!["receive/cancelled"]);
    }

    #[tokio::test]
    async fn test_receive_cancelled_during_fetch() {
        let backend = Arc::new(StallingBackend::default());
        backend.inner.create_if_not_exists().await.unwrap();
        backend
            .inner
            .send("YQ==", MessageTimeToLive::Infinite)
            .await
            .unwrap();
        backend.stall_receive.store(true, Ordering::SeqCst);
        let (transport, mut events) = transport_over(backend.clone());

        let received = transport.receive(&cancel_after(20)).await.unwrap();

        assert!(received.is_none());
        assert_eq!(stages(&mut events), vec!["receive/cancelled"]);
        assert_eq!(transport.outstanding_leases().await, 0);
        assert_eq!(transport.buffered_messages().await, 0);
        assert_eq!(backend.inner.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_send_cancelled_during_call() {
        let backend = Arc::new(StallingBackend::default());
        backend.inner.create_if_not_exists().await.unwrap();
        backend.stall_send.store(true, Ordering::SeqCst);
        let (transport, mut events) = transport_over(backend.clone());

        transport
            .send(&message(), Bytes::from("a"), &cancel_after(20))
            .await
            .unwrap();

        assert_eq!(stages(&mut events), vec!["enqueue/cancelled"]);
        assert_eq!(backend.inner.message_count(), 0);
    }

    /// A cancelled acknowledge still forgets the lease.
    #[tokio::test]
    async fn test_acknowledge_cancelled_during_delete() {
        let backend = Arc::new(StallingBackend::default());
        backend.inner.create_if_not_exists().await.unwrap();
        let (transport, mut events) = transport_over(backend.clone());
        let cancel = CancellationToken::new();
        transport.send(&message(), Bytes::from("a"), &cancel).await.unwrap();
        let received = transport.receive(&cancel).await.unwrap().unwrap();
        backend.stall_delete.store(true, Ordering::SeqCst);
        drain(&mut events);

        transport
            .acknowledge(&received.token, &cancel_after(20))
            .await
            .unwrap();

        assert_eq!(stages(&mut events), vec!["acknowledge/cancelled"]);
        assert_eq!(transport.outstanding_leases().await, 0);
        assert_eq!(backend.inner.message_count(), 1);
    }

    #[tokio::test]
    async fn test_release_cancelled_during_requeue() {
        let backend = Arc::new(StallingBackend::default());
        backend.inner.create_if_not_exists().await.unwrap();
        let (transport, mut events) = transport_over(backend.clone());
        let cancel = CancellationToken::new();
        transport.send(&message(), Bytes::from("a"), &cancel).await.unwrap();
        let received = transport.receive(&cancel).await.unwrap().unwrap();
        backend.stall_send.store(true, Ordering::SeqCst);
        drain(&mut events);

        transport
            .release(&received.token, &cancel_after(20))
            .await
            .unwrap();

        assert_eq!(stages(&mut events), vec!["release/cancelled"]);
        assert_eq!(transport.outstanding_leases().await, 0);
    }

    /// An operation waiting for the gate gives up when cancelled.
    #[tokio::test]
    async fn test_cancelled_while_waiting_for_gate() {
        let backend = Arc::new(StallingBackend::default());
        backend.inner.create_if_not_exists().await.unwrap();
        backend.stall_receive.store(true, Ordering::SeqCst);
        let (transport, mut events) = transport_over(backend.clone());
        let transport = Arc::new(transport);

        let holder_cancel = CancellationToken::new();
        let holder = {
            let transport = transport.clone();
            let cancel = holder_cancel.clone();
            tokio::spawn(async move { transport.receive(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.purge(&cancel_after(20)).await.unwrap();

        assert_eq!(
            stages(&mut events),
            vec!["purge/starting", "purge/cancelled", "purge/completed"]
        );

        holder_cancel.cancel();
        assert!(holder.await.unwrap().unwrap().is_none());
    }
}

// ============================================================================
// Dispose
// ============================================================================

mod dispose_tests {
    use super::*;

    #[tokio::test]
    async fn test_dispose_returns_outstanding_leases() {
        let (transport, backend, mut events) = memory_transport().await;
        let cancel = CancellationToken::new();
        transport.send(&message(), Bytes::from("a"), &cancel).await.unwrap();
        transport.send(&message(), Bytes::from("b"), &cancel).await.unwrap();
        let received = transport.receive(&cancel).await.unwrap().unwrap();
        let original_id = received.message_id().unwrap().to_string();
        drain(&mut events);

        transport.dispose().await;

        assert_eq!(transport.outstanding_leases().await, 0);
        assert_eq!(transport.buffered_messages().await, 0);
        assert!(transport.is_disposed().await);
        assert_eq!(backend.message_count(), 2);
        assert_eq!(backend.in_flight_count(), 0);
        assert_eq!(backend.dequeue_count(&original_id), None);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_operations_after_dispose_fail() {
        let (transport, _backend, _events) = memory_transport().await;
        let cancel = CancellationToken::new();

        transport.dispose().await;
        transport.dispose().await;

        assert!(matches!(
            transport.receive(&cancel).await,
            Err(TransportError::Disposed { .. })
        ));
        assert!(matches!(
            transport.send(&message(), Bytes::new(), &cancel).await,
            Err(TransportError::Disposed { .. })
        ));
        assert!(matches!(
            transport.create(&cancel).await,
            Err(TransportError::Disposed { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispose_swallows_backend_errors() {
        let mut backend = MockBackend::new();
        backend.expect_receive_batch().times(1).returning(|_, _| {
            Ok(vec![lease_message("id-1", "YQ=="), lease_message("id-2", "Yg==")])
        });
        let mut sends = 0;
        backend.expect_send().times(2).returning(move |_, _| {
            sends += 1;
            if sends == 1 {
                Err(TransportError::ConnectionFailed {
                    message: "reset".to_string(),
                })
            } else {
                Ok(())
            }
        });
        backend.expect_delete().times(1).returning(|_, _| {
            Err(TransportError::LeaseLost {
                message_id: "id".to_string(),
            })
        });
        let (transport, _events) = transport_over(Arc::new(backend));
        let cancel = CancellationToken::new();
        transport.receive(&cancel).await.unwrap();

        transport.dispose().await;

        assert_eq!(transport.outstanding_leases().await, 0);
    }
}
