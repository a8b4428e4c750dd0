//! End-to-end tests over real sockets: boot an ephemeral server, drive it
//! with raw line-oriented clients, and check the wire contract.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use pkgindex::server::{serve, ServerConfig};
use pkgindex::store::SharedIndex;

async fn start_server_ephemeral(workers: usize) -> (JoinHandle<()>, watch::Sender<bool>, u16) {
    // Grab a free port, release it, and bind the server there.
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind 127.0.0.1:0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let index = SharedIndex::new();
    let config = ServerConfig { host: "127.0.0.1".to_string(), port, workers };
    let handle = tokio::spawn(async move {
        if let Err(e) = serve(index, config, shutdown_rx).await {
            eprintln!("server task error: {e:?}");
        }
    });
    wait_until_connectable("127.0.0.1", port, 5_000).await.expect("server did not come up");
    (handle, shutdown_tx, port)
}

async fn wait_until_connectable(host: &str, port: u16, timeout_ms: u64) -> Result<(), String> {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if TcpStream::connect((host, port)).await.is_ok() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            return Err(format!("timeout connecting to {host}:{port}"));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.expect("connect to test server")
}

async fn read_reply(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.expect("read reply");
        if n == 0 {
            break;
        }
        out.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    String::from_utf8(out).expect("ascii reply")
}

async fn send_line(stream: &mut TcpStream, line: &str) -> String {
    stream.write_all(line.as_bytes()).await.expect("send request");
    stream.write_all(b"\n").await.expect("send newline");
    read_reply(stream).await
}

/// Run a script of (request, expected reply) pairs on one connection.
async fn run_script(stream: &mut TcpStream, script: &[(&str, &str)]) {
    for (request, expected) in script {
        let reply = send_line(stream, request).await;
        assert_eq!(&reply.trim_end(), expected, "unexpected reply to {:?}", request);
    }
}

#[tokio::test]
async fn dependency_chain_round_trip() {
    let (_handle, _shutdown, port) = start_server_ephemeral(4).await;
    let mut conn = connect(port).await;
    run_script(
        &mut conn,
        &[
            ("INDEX|gmp|", "OK"),
            ("INDEX|isl|gmp", "OK"),
            ("INDEX|cloog|gmp,isl", "OK"),
            ("QUERY|cloog|", "OK"),
        ],
    )
    .await;
}

#[tokio::test]
async fn index_with_missing_dependencies_fails() {
    let (_handle, _shutdown, port) = start_server_ephemeral(4).await;
    let mut conn = connect(port).await;
    run_script(
        &mut conn,
        &[("INDEX|cloog|gmp,isl", "FAIL"), ("QUERY|cloog|", "FAIL")],
    )
    .await;
}

#[tokio::test]
async fn removal_is_blocked_while_dependents_remain() {
    let (_handle, _shutdown, port) = start_server_ephemeral(4).await;
    let mut conn = connect(port).await;
    run_script(
        &mut conn,
        &[
            ("INDEX|gmp|", "OK"),
            ("INDEX|isl|gmp", "OK"),
            ("INDEX|cloog|gmp,isl", "OK"),
            ("REMOVE|gmp|", "FAIL"),
            ("REMOVE|cloog|", "OK"),
            ("REMOVE|isl|", "OK"),
            ("REMOVE|gmp|", "OK"),
        ],
    )
    .await;
}

#[tokio::test]
async fn removing_an_unknown_package_is_ok() {
    let (_handle, _shutdown, port) = start_server_ephemeral(4).await;
    let mut conn = connect(port).await;
    run_script(&mut conn, &[("REMOVE|neverseen|", "OK")]).await;
}

#[tokio::test]
async fn malformed_requests_answer_error_without_killing_the_connection() {
    let (_handle, _shutdown, port) = start_server_ephemeral(4).await;
    let mut conn = connect(port).await;
    run_script(
        &mut conn,
        &[
            ("INDeX|ceylon|", "ERROR"),
            ("QUERY,cloog|", "ERROR"),
            ("REMOVE|clooper", "ERROR"),
            ("", "ERROR"),
            ("INDEX|ceylon|", "OK"),
            ("QUERY|ceylon|", "OK"),
        ],
    )
    .await;
}

#[tokio::test]
async fn reindex_drops_the_stale_dependency_edge() {
    let (_handle, _shutdown, port) = start_server_ephemeral(4).await;
    let mut conn = connect(port).await;
    run_script(
        &mut conn,
        &[
            ("INDEX|a|", "OK"),
            ("INDEX|b|a", "OK"),
            ("INDEX|b|", "OK"),
            ("REMOVE|a|", "OK"),
            ("QUERY|b|", "OK"),
        ],
    )
    .await;
}

/// A telnet-style session exercising the whole command surface in one go.
#[tokio::test]
async fn mixed_command_script_end_to_end() {
    let (_handle, _shutdown, port) = start_server_ephemeral(4).await;
    let mut conn = connect(port).await;
    run_script(
        &mut conn,
        &[
            ("INDEX|cloog|gmp,isl,pkg-config", "FAIL"),
            ("INDEX|ceylon|", "OK"),
            ("QUERY|cloog|", "FAIL"),
            ("REMOVE|cloog|", "OK"),
            ("QUERY|cloog|", "FAIL"),
            ("QUERY|ceylon|", "OK"),
            ("INDEX|clooper|ceylon", "OK"),
            ("REMOVE|ceylon|", "FAIL"),
            ("REMOVE|clooper|", "OK"),
            ("REMOVE|ceylon|", "OK"),
        ],
    )
    .await;
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let (_handle, _shutdown, port) = start_server_ephemeral(4).await;
    let mut conn = connect(port).await;

    conn.write_all(b"INDEX|a|\nINDEX|b|a\nQUERY|b|\nREMOVE|b|\nREMOVE|a|\n")
        .await
        .unwrap();
    let mut replies = Vec::new();
    for _ in 0..5 {
        replies.push(read_reply(&mut conn).await);
    }
    assert_eq!(replies, vec!["OK\n", "OK\n", "OK\n", "OK\n", "OK\n"]);
}

#[tokio::test]
async fn trailing_partial_frame_is_dropped_on_close() {
    let (_handle, _shutdown, port) = start_server_ephemeral(4).await;

    let mut conn = connect(port).await;
    conn.write_all(b"INDEX|gmp|\nINDEX|partial").await.unwrap();
    assert_eq!(read_reply(&mut conn).await, "OK\n");
    conn.shutdown().await.unwrap();
    // Exactly one reply was sent; the unterminated frame got none.
    assert_eq!(read_reply(&mut conn).await, "");
    drop(conn);

    // The store kept the completed frame and nothing else.
    let mut conn = connect(port).await;
    run_script(&mut conn, &[("QUERY|gmp|", "OK"), ("QUERY|partial|", "FAIL")]).await;
}

/// Two connections race an INDEX against a QUERY for the same name. The
/// query must answer exactly one well-formed OK or FAIL, nothing else.
#[tokio::test]
async fn racing_index_and_query_yield_a_single_clean_answer() {
    let (_handle, _shutdown, port) = start_server_ephemeral(8).await;

    for round in 0..20 {
        let name = format!("race{}", round);
        let index_line = format!("INDEX|{}|", name);
        let query_line = format!("QUERY|{}|", name);

        let indexer = tokio::spawn({
            let line = index_line.clone();
            async move {
                let mut conn = connect(port).await;
                send_line(&mut conn, &line).await
            }
        });
        let querier = tokio::spawn(async move {
            let mut conn = connect(port).await;
            send_line(&mut conn, &query_line).await
        });

        let (index_reply, query_reply) = tokio::join!(indexer, querier);
        assert_eq!(index_reply.unwrap(), "OK\n");
        let query_reply = query_reply.unwrap();
        assert!(
            query_reply == "OK\n" || query_reply == "FAIL\n",
            "query answered {:?}",
            query_reply
        );
    }
}

/// More clients than workers, each hammering its own namespace: every
/// connection must eventually be served and every operation must succeed.
#[tokio::test]
async fn disjoint_namespaces_survive_a_worker_pool_smaller_than_the_clients() {
    let (_handle, _shutdown, port) = start_server_ephemeral(4).await;

    let clients = 8usize;
    let per_client = 25usize;
    let tasks: Vec<_> = (0..clients)
        .map(|c| {
            tokio::spawn(async move {
                let mut conn = connect(port).await;
                let mut prev: Option<String> = None;
                for i in 0..per_client {
                    let name = format!("c{}_{}", c, i);
                    let line = match &prev {
                        Some(dep) => format!("INDEX|{}|{}", name, dep),
                        None => format!("INDEX|{}|", name),
                    };
                    assert_eq!(send_line(&mut conn, &line).await, "OK\n", "indexing {}", name);
                    prev = Some(name);
                }
                for i in (0..per_client).rev() {
                    let name = format!("c{}_{}", c, i);
                    let line = format!("REMOVE|{}|", name);
                    assert_eq!(send_line(&mut conn, &line).await, "OK\n", "removing {}", name);
                }
            })
        })
        .collect();

    for outcome in futures::future::join_all(tasks).await {
        outcome.expect("client task completed");
    }
}

#[tokio::test]
async fn shutdown_stops_accepting_new_connections() {
    let (handle, shutdown_tx, port) = start_server_ephemeral(2).await;

    shutdown_tx.send(true).expect("signal shutdown");
    handle.await.expect("server exits cleanly");

    // The listener is gone, so fresh connects must fail.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "server kept accepting after shutdown"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
