use balpool_dns::StaticResolver;
use balpool_error::cause_ref;
use balpool_pool::{HostConfig, NoServiceNodes, Pool, ServiceConfig};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UnixListener},
};

/// Serves echo connections, counting accepts. With `hang_up`, each
/// connection is closed as soon as it is accepted.
async fn echo_server(hang_up: bool) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let count = accepts.clone();
    tokio::spawn(async move {
        loop {
            let (mut io, _) = listener.accept().await.unwrap();
            count.fetch_add(1, Ordering::SeqCst);
            if hang_up {
                drop(io);
                continue;
            }
            tokio::spawn(async move {
                let (mut r, mut w) = io.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    (addr, accepts)
}

fn mk_pool() -> Pool<balpool_pool::Io> {
    Pool::builder()
        .with_resolver(StaticResolver::default())
        .build()
        .unwrap()
}

fn host(addr: SocketAddr) -> HostConfig {
    HostConfig {
        name: addr.ip().to_string(),
        ..Default::default()
    }
    .with_port("port", addr.port())
}

#[tokio::test]
async fn reuses_tcp_connections() {
    let _trace = balpool_tracing::test::trace_init();
    let (addr, accepts) = echo_server(false).await;
    let pool = mk_pool();
    pool.add_config(ServiceConfig::new("echo").with_host("1", host(addr)))
        .await
        .unwrap();

    for _ in 0..3 {
        let mut handle = pool.new_conn("echo", "port", "").await.unwrap();
        assert_eq!(handle.conn().unwrap().peer_addr(), Some(addr));
        handle.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        handle.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        handle.put();
    }
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn redials_connections_closed_by_the_peer() {
    let (addr, accepts) = echo_server(true).await;
    let pool = mk_pool();
    pool.add_config(ServiceConfig::new("echo").with_host("1", host(addr)))
        .await
        .unwrap();

    let mut handle = pool.new_conn("echo", "port", "").await.unwrap();
    handle.put();
    // Let the peer's FIN arrive.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.get_node_ports("echo").unwrap()[0].idle, 1);

    let handle = pool.new_conn("echo", "port", "").await.unwrap();
    assert!(handle.conn().is_some());
    assert_eq!(pool.get_node_ports("echo").unwrap()[0].idle, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn skips_refused_endpoints() {
    let (addr, _) = echo_server(false).await;
    let refused = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let pool = mk_pool();
    let cfg = ServiceConfig::new("echo")
        .with_host("1", host(refused))
        .with_host("2", host(addr));
    pool.add_config(cfg).await.unwrap();

    let handle = pool.new_conn("echo", "port", "").await.unwrap();
    assert_eq!(handle.node_key(), Some("2"));
    drop(handle);

    let cfg = ServiceConfig::new("down").with_host("1", host(refused));
    pool.add_config(cfg).await.unwrap();
    let error = pool.new_conn("down", "port", "").await.unwrap_err();
    let no_nodes = cause_ref::<NoServiceNodes>(&*error).unwrap();
    assert_eq!(
        no_nodes.last_error().map(|e| e.kind()),
        Some(io::ErrorKind::ConnectionRefused)
    );
}

#[tokio::test]
async fn unix_sockets() {
    let path = std::env::temp_dir().join(format!("balpool-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        loop {
            let (mut io, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut r, mut w) = io.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    let pool = mk_pool();
    let path = path.to_str().unwrap();
    pool.add_single("local", "unix", path, 0, Duration::from_secs(1))
        .unwrap();

    let mut handle = pool.new_conn("local", "port", "").await.unwrap();
    assert_eq!(handle.conn().unwrap().peer_addr(), None);
    handle.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    handle.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    handle.close();

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn unsupported_networks() {
    let pool = mk_pool();
    pool.add_single("udp", "udp", "127.0.0.1:53", 0, Duration::from_secs(1))
        .unwrap();
    let error = pool.new_conn("udp", "port", "").await.unwrap_err();
    let no_nodes = cause_ref::<NoServiceNodes>(&*error).unwrap();
    assert_eq!(
        no_nodes.last_error().map(|e| e.kind()),
        Some(io::ErrorKind::InvalidInput)
    );
}
