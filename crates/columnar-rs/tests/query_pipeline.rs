//! End-to-end tests for `execute_query`.
//!
//! These tests start a real TCP listener on a random port, serve
//! canned HTTP/1.1 analytics responses, and drive the full pipeline:
//! request dispatch, streaming parse, retry, classification, and
//! cancellation.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use columnar_rs::{
    AbortSignal, AnalyticsClient, ClusterOptions, Credential, Error, QueryOptions,
};

/// Behavior of the fake server for one accepted connection.
enum Canned {
    /// Read the request, send a complete response, close.
    Respond { status: &'static str, body: String },
    /// Same, but dribble the body a few bytes at a time.
    RespondSlowly { status: &'static str, body: String },
    /// Read the request, then never answer.
    Stall,
    /// Send headers claiming `full_len` bytes, write only `prefix`,
    /// then hold the connection open.
    StallAfter { prefix: String, full_len: usize },
}

/// Spawn a server that plays the canned behaviors in order, one per
/// connection. Returns the bound address and the captured requests.
async fn spawn_server(canned: Vec<Canned>) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let captured = requests.clone();

    tokio::spawn(async move {
        for behavior in canned {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let request = read_request(&mut socket).await;
            captured.lock().unwrap().push(request);

            match behavior {
                Canned::Respond { status, body } => {
                    let response = format_response(status, body.len(), &body);
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
                Canned::RespondSlowly { status, body } => {
                    let head = format_response(status, body.len(), "");
                    let _ = socket.write_all(head.as_bytes()).await;
                    for piece in body.as_bytes().chunks(7) {
                        let _ = socket.write_all(piece).await;
                        let _ = socket.flush().await;
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    let _ = socket.shutdown().await;
                }
                Canned::Stall => {
                    // Keep the socket alive without responding.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Canned::StallAfter { prefix, full_len } => {
                    let head = format_response("200 OK", full_len, "");
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(prefix.as_bytes()).await;
                    let _ = socket.flush().await;
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
            }
        }
    });

    (addr, requests)
}

fn format_response(status: &str, content_length: usize, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
         Content-Length: {content_length}\r\nConnection: close\r\n\r\n{body}"
    )
}

/// Read one HTTP request (head plus `Content-Length` body) as text.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let Ok(n) = socket.read(&mut tmp).await else {
            break;
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);

        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        let total = head_end + 4 + content_length;
        if buf.len() >= total {
            return String::from_utf8_lossy(&buf[..total]).into_owned();
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn client(addr: SocketAddr, max_retry_attempts: u32) -> AnalyticsClient {
    AnalyticsClient::new(
        "127.0.0.1",
        addr.port(),
        false,
        Credential::new("reader", "secret"),
        ClusterOptions::default()
            .with_max_retry_attempts(max_retry_attempts)
            .with_query_timeout(Duration::from_secs(10)),
    )
    .unwrap()
}

fn happy_body() -> String {
    r#"{"requestID":"94c7f89f-9b53-45d2-b2ad-64a4d0e7a121","signature":{"*":"*"},"results":[{"id":1},{"id":2}],"plans":{},"status":"success","metrics":{"elapsedTime":"14.927542ms","executionTime":"13.212562ms","compileTime":"1.401ms","queueWaitTime":"0","resultCount":2,"resultSize":18,"processedObjects":2}}"#
        .to_string()
}

#[tokio::test]
async fn happy_path_streams_rows_then_metadata() {
    let (addr, requests) = spawn_server(vec![Canned::RespondSlowly {
        status: "200 OK",
        body: happy_body(),
    }])
    .await;

    let mut result = client(addr, 3)
        .execute_query("SELECT RAW r FROM routes r LIMIT 2", QueryOptions::default())
        .await
        .unwrap();

    assert!(result.metadata().is_err(), "metadata gated until drain");
    assert_eq!(result.next_row().await.unwrap().unwrap(), r#"{"id":1}"#);
    assert_eq!(result.next_row().await.unwrap().unwrap(), r#"{"id":2}"#);
    assert!(result.next_row().await.is_none());

    let metadata = result.metadata().unwrap();
    assert_eq!(metadata.request_id, "94c7f89f-9b53-45d2-b2ad-64a4d0e7a121");
    assert!(metadata.warnings.is_empty());
    assert_eq!(metadata.metrics.elapsed_time, 14.927542);
    assert_eq!(metadata.metrics.result_count, 2);
    assert_eq!(metadata.status.as_deref(), Some("success"));

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("POST /api/v1/request HTTP/1.1"));
}

#[tokio::test]
async fn request_carries_auth_headers_and_body_fields() {
    let (addr, requests) = spawn_server(vec![Canned::Respond {
        status: "200 OK",
        body: r#"{"requestID":"r1","results":[],"status":"success"}"#.into(),
    }])
    .await;

    let mut named = serde_json::Map::new();
    named.insert("airline".into(), serde_json::json!("KL"));
    let options = QueryOptions::default()
        .with_named_parameters(named)
        .with_priority(true)
        .with_context("travel", "inventory");

    client(addr, 0)
        .execute_query("SELECT 1", options)
        .await
        .unwrap();

    let requests = requests.lock().unwrap();
    let request = &requests[0];
    assert!(request.contains("content-type: application/json")
        || request.contains("Content-Type: application/json"));
    assert!(request.contains("authorization: Basic") || request.contains("Authorization: Basic"));
    assert!(request.contains("analytics-priority: -1") || request.contains("Analytics-Priority: -1"));

    let body_start = request.find("\r\n\r\n").unwrap() + 4;
    let body: serde_json::Value = serde_json::from_str(&request[body_start..]).unwrap();
    assert_eq!(body["statement"], "SELECT 1");
    assert_eq!(body["$airline"], "KL");
    assert_eq!(body["query_context"], "default:`travel`.`inventory`");
    // Cluster timeout of 10s plus the fixed server-side margin.
    assert_eq!(body["timeout"], "15000ms");
    assert!(body["client_context_id"].as_str().is_some());
}

#[tokio::test]
async fn zero_rows_completes_with_metadata() {
    let (addr, _) = spawn_server(vec![Canned::Respond {
        status: "200 OK",
        body: r#"{"requestID":"r2","results":[],"status":"success"}"#.into(),
    }])
    .await;

    let mut result = client(addr, 0)
        .execute_query("SELECT 1 WHERE false", QueryOptions::default())
        .await
        .unwrap();

    assert!(result.next_row().await.is_none());
    assert_eq!(result.metadata().unwrap().request_id, "r2");
}

#[tokio::test]
async fn mid_stream_errors_fail_the_row_iterator() {
    let (addr, requests) = spawn_server(vec![Canned::Respond {
        status: "200 OK",
        body: r#"{"requestID":"r3","results":[{"id":1},{"id":2}],"errors":[{"code":232,"message":"error1"}],"status":"fatal"}"#.into(),
    }])
    .await;

    let mut result = client(addr, 3)
        .execute_query("SELECT 1", QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(result.next_row().await.unwrap().unwrap(), r#"{"id":1}"#);
    assert_eq!(result.next_row().await.unwrap().unwrap(), r#"{"id":2}"#);
    let error = result.next_row().await.unwrap().unwrap_err();
    match &error {
        Error::Query { message, code } => {
            assert_eq!(*code, 232);
            assert!(message.contains("error1"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // The stream never ended cleanly, so metadata stays unavailable.
    assert!(result.metadata().is_err());
    // A failure observed mid-stream is not retried.
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn server_error_before_rows_fails_the_query() {
    let (addr, requests) = spawn_server(vec![Canned::Respond {
        status: "200 OK",
        body: r#"{"requestID":"r4","errors":[{"code":24000,"msg":"syntax error"}],"status":"fatal"}"#
            .into(),
    }])
    .await;

    let error = client(addr, 3)
        .execute_query("SELEKT 1", QueryOptions::default())
        .await
        .unwrap_err();

    match &error {
        Error::Query { message, code } => {
            assert_eq!(*code, 24000);
            assert!(message.contains("syntax error"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn server_code_20000_is_invalid_credential_without_retry() {
    let (addr, requests) = spawn_server(vec![Canned::Respond {
        status: "200 OK",
        body: r#"{"requestID":"r5","errors":[{"code":20000,"msg":"Unauthorized user"}],"status":"fatal"}"#
            .into(),
    }])
    .await;

    let error = client(addr, 7)
        .execute_query("SELECT 1", QueryOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(error, Error::InvalidCredential(_)), "got {error:?}");
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn http_401_is_invalid_credential_without_retry() {
    let (addr, requests) = spawn_server(vec![Canned::Respond {
        status: "401 Unauthorized",
        body: String::new(),
    }])
    .await;

    let error = client(addr, 7)
        .execute_query("SELECT 1", QueryOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(error, Error::InvalidCredential(_)), "got {error:?}");
    // The context render rides along on the message.
    assert!(error.to_string().contains("status_code=401"));
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn http_503_retries_until_the_pool_is_exhausted() {
    // One A record: the 503 attempt consumes it, the retry finds the
    // pool exhausted and the query fails rather than refreshing.
    let (addr, requests) = spawn_server(vec![Canned::Respond {
        status: "503 Service Unavailable",
        body: String::new(),
    }])
    .await;

    let error = client(addr, 3)
        .execute_query("SELECT 1", QueryOptions::default())
        .await
        .unwrap_err();

    match &error {
        Error::Analytics(message) => {
            assert!(message.contains("DNS records"), "got {message}");
            // The 503 wrap from the failed attempt is preserved.
            assert!(message.contains("503"), "got {message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn oversized_error_body_still_classifies_the_server_errors() {
    // A failed response well past any diagnostic snippet limit: the
    // errors array sits behind several kilobytes of other fields and
    // must still drive the precise classification.
    let padding = "x".repeat(4096);
    let body = format!(
        r#"{{"requestID":"r7","padding":"{padding}","errors":[{{"code":24000,"msg":"syntax error near EOF"}}],"status":"fatal"}}"#
    );
    let (addr, requests) = spawn_server(vec![Canned::Respond {
        status: "400 Bad Request",
        body,
    }])
    .await;

    let error = client(addr, 3)
        .execute_query("SELEKT 1", QueryOptions::default())
        .await
        .unwrap_err();

    match &error {
        Error::Query { message, code } => {
            assert_eq!(*code, 24000);
            assert!(message.contains("syntax error"), "got {message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_response_body_fails_without_retry() {
    let (addr, requests) = spawn_server(vec![Canned::Respond {
        status: "200 OK",
        body: "<html>gateway</html>".into(),
    }])
    .await;

    let error = client(addr, 3)
        .execute_query("SELECT 1", QueryOptions::default())
        .await
        .unwrap_err();

    match &error {
        Error::Analytics(message) => {
            assert!(message.contains("Unknown error"), "got {message}")
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn stalled_server_times_out_at_the_deadline() {
    let (addr, _) = spawn_server(vec![Canned::Stall]).await;

    let started = tokio::time::Instant::now();
    let error = AnalyticsClient::new(
        "127.0.0.1",
        addr.port(),
        false,
        Credential::new("reader", "secret"),
        ClusterOptions::default().with_max_retry_attempts(0),
    )
    .unwrap()
    .execute_query(
        "SELECT 1",
        QueryOptions::default().with_timeout(Duration::from_millis(300)),
    )
    .await
    .unwrap_err();

    assert!(matches!(error, Error::Timeout(_)), "got {error:?}");
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn cancel_tears_down_a_streaming_result() {
    let prefix = r#"{"requestID":"r6","results":[{"id":1},"#;
    let (addr, _) = spawn_server(vec![Canned::StallAfter {
        prefix: prefix.into(),
        full_len: prefix.len() + 1000,
    }])
    .await;

    let mut result = client(addr, 0)
        .execute_query("SELECT 1", QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(result.next_row().await.unwrap().unwrap(), r#"{"id":1}"#);

    result.cancel();
    // Idempotent.
    result.cancel();

    let error = result.next_row().await.unwrap().unwrap_err();
    assert!(matches!(error, Error::Aborted), "got {error:?}");
    assert!(result.metadata().is_err());
}

#[tokio::test]
async fn external_abort_signal_cancels_before_dispatch() {
    let (addr, requests) = spawn_server(vec![]).await;

    let signal = AbortSignal::new();
    signal.abort();

    let error = client(addr, 3)
        .execute_query(
            "SELECT 1",
            QueryOptions::default().with_abort_signal(signal),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Aborted), "got {error:?}");
    assert!(requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rows_deserialize_into_caller_types() {
    #[derive(serde::Deserialize)]
    struct Route {
        id: u32,
    }

    let (addr, _) = spawn_server(vec![Canned::Respond {
        status: "200 OK",
        body: happy_body(),
    }])
    .await;

    let mut result = client(addr, 0)
        .execute_query("SELECT 1", QueryOptions::default())
        .await
        .unwrap();

    let first: Route = result.next_row_as().await.unwrap().unwrap();
    let second: Route = result.next_row_as().await.unwrap().unwrap();
    assert_eq!(first.id, 1);
    assert_eq!(second.id, 2);
}
