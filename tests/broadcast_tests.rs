//! End-to-end broadcast tests over an in-process cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clustercast::{
    BroadcastMode, BroadcastRegistry, CommandDispatcherFactory, FactoryConfig, MemoryCluster, Node,
};

fn node(name: &str) -> Node {
    Node::new(name, "127.0.0.1", 7600)
}

fn join_registry(cluster: &MemoryCluster, name: &str) -> BroadcastRegistry {
    let member = cluster.join(node(name));
    let factory = CommandDispatcherFactory::new(
        Arc::new(member.clone()),
        Arc::new(member),
        FactoryConfig::default(),
    )
    .unwrap();
    BroadcastRegistry::new(Arc::new(factory))
}

#[tokio::test]
async fn test_broadcast_reaches_remote_receiver_then_times_out_empty() {
    let cluster = MemoryCluster::new();
    let registry_a = join_registry(&cluster, "a");
    let registry_b = join_registry(&cluster, "b");

    let sender = registry_a.endpoint("discovery");
    let receiver = registry_b.endpoint("discovery");
    receiver.open_client().await.unwrap();
    sender.open_broadcaster().await.unwrap();

    sender.broadcast(Bytes::from_static(b"hello")).await.unwrap();

    let payload = receiver.receive_timeout(Duration::from_secs(5)).await;
    assert_eq!(payload, Some(Bytes::from_static(b"hello")));

    // No further sends: the bounded receive comes back empty, within its
    // deadline, without raising.
    let start = Instant::now();
    let payload = receiver.receive_timeout(Duration::from_millis(300)).await;
    assert_eq!(payload, None);
    assert!(start.elapsed() < Duration::from_secs(5));

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn test_single_broadcaster_delivery_is_fifo() {
    let cluster = MemoryCluster::new();
    let registry_a = join_registry(&cluster, "a");
    let registry_b = join_registry(&cluster, "b");

    let sender = registry_a.endpoint("feed");
    let receiver = registry_b.endpoint("feed");
    receiver.open_client().await.unwrap();
    sender.open_broadcaster().await.unwrap();

    for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        sender.broadcast(Bytes::from_static(payload)).await.unwrap();
    }

    assert_eq!(receiver.receive().await, Some(Bytes::from_static(b"one")));
    assert_eq!(receiver.receive().await, Some(Bytes::from_static(b"two")));
    assert_eq!(receiver.receive().await, Some(Bytes::from_static(b"three")));

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn test_receivers_on_one_node_share_the_queue() {
    let cluster = MemoryCluster::new();
    let registry_a = join_registry(&cluster, "a");
    let registry_b = join_registry(&cluster, "b");

    let sender = registry_a.endpoint("feed");
    let first = registry_b.endpoint("feed");
    let second = registry_b.endpoint("feed");
    first.open_client().await.unwrap();
    second.open_client().await.unwrap();
    sender.open_broadcaster().await.unwrap();

    sender.broadcast(Bytes::from_static(b"only-once")).await.unwrap();

    // One of the two endpoints drains the payload; the other sees an empty
    // queue because they share it.
    let from_first = first.receive_timeout(Duration::from_millis(200)).await;
    let from_second = second.receive_timeout(Duration::from_millis(200)).await;
    let delivered: Vec<_> = [from_first, from_second].into_iter().flatten().collect();
    assert_eq!(delivered, vec![Bytes::from_static(b"only-once")]);

    sender.close().await;
    first.close().await;
}

#[tokio::test]
async fn test_broadcast_skips_members_without_the_channel() {
    let cluster = MemoryCluster::new();
    let registry_a = join_registry(&cluster, "a");
    let registry_b = join_registry(&cluster, "b");
    // c joins the group but never opens the channel.
    cluster.join(node("c"));

    let sender = registry_a.endpoint("feed");
    let receiver = registry_b.endpoint("feed");
    receiver.open_client().await.unwrap();
    sender.open_broadcaster().await.unwrap();

    // Delivery to c fails node-locally and is swallowed; b still receives.
    sender.broadcast(Bytes::from_static(b"partial")).await.unwrap();
    assert_eq!(
        receiver.receive_timeout(Duration::from_secs(5)).await,
        Some(Bytes::from_static(b"partial"))
    );

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn test_endpoint_close_twice_matches_single_close() {
    let cluster = MemoryCluster::new();
    let registry = join_registry(&cluster, "a");

    let endpoint = registry.endpoint("feed");
    endpoint.open_broadcaster().await.unwrap();

    endpoint.close().await;
    let mode_after_first = endpoint.mode();
    endpoint.close().await;
    assert_eq!(endpoint.mode(), mode_after_first);
    assert_eq!(endpoint.mode(), BroadcastMode::Closed);

    // Broadcasting on a closed endpoint is a no-op, not an error.
    endpoint.broadcast(Bytes::from_static(b"late")).await.unwrap();
}

#[tokio::test]
async fn test_closed_channel_name_supports_a_fresh_cycle() {
    let cluster = MemoryCluster::new();
    let registry_a = join_registry(&cluster, "a");
    let registry_b = join_registry(&cluster, "b");

    let sender = registry_a.endpoint("feed");
    sender.open_broadcaster().await.unwrap();
    sender.close().await;

    // The same name opens again, in a different role, with a clean queue.
    let receiver_a = registry_a.endpoint("feed");
    receiver_a.open_client().await.unwrap();
    assert_eq!(receiver_a.mode(), BroadcastMode::Receiver);

    let sender_b = registry_b.endpoint("feed");
    sender_b.open_broadcaster().await.unwrap();
    sender_b.broadcast(Bytes::from_static(b"second-cycle")).await.unwrap();

    assert_eq!(
        receiver_a.receive_timeout(Duration::from_secs(5)).await,
        Some(Bytes::from_static(b"second-cycle"))
    );

    sender_b.close().await;
    receiver_a.close().await;
}
