use std::time::Duration;

use meshbus_transport::testing;
use meshbus_transport::{
    Connection, MemoryConnection, MemoryTransport, TcpConfig, TcpTransport, Transport, TransportError,
};

#[tokio::test]
async fn memory_pair_conforms() {
    let (a, b) = MemoryConnection::pair("a", "b");
    testing::assert_connection_conformance(&a, &b).await;
}

#[tokio::test]
async fn memory_transport_connections_conform() {
    let transport = MemoryTransport::new("local");
    let client = transport.connector().connect().await.unwrap();
    let server = transport.accept().await.unwrap();
    testing::assert_connection_conformance(&client, &server).await;
}

#[tokio::test]
async fn tcp_connections_conform() {
    let transport = TcpTransport::bind(TcpConfig::new("tcp", "127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();
    let target = transport.local_addr().to_string();
    let (client, server) = tokio::join!(transport.connect(&target), transport.accept());
    testing::assert_connection_conformance(&client.unwrap(), &server.unwrap()).await;
}

#[tokio::test]
async fn tcp_carries_a_large_frame() {
    let transport = TcpTransport::bind(TcpConfig::new("tcp", "127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();
    let target = transport.local_addr().to_string();
    let (client, server) = tokio::join!(transport.connect(&target), transport.accept());
    let (client, server) = (client.unwrap(), server.unwrap());

    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let receiver = tokio::spawn(async move { server.receive().await });
    client.send(&big).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got, big);
}

#[tokio::test]
async fn stopped_transports_refuse_accept() {
    let memory = MemoryTransport::new("local");
    memory.stop().await.unwrap();
    assert!(matches!(memory.accept().await, Err(TransportError::Stopped)));

    let tcp = TcpTransport::bind(TcpConfig::new("tcp", "127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();
    tcp.stop().await.unwrap();
    assert!(matches!(tcp.accept().await, Err(TransportError::Stopped)));
}
