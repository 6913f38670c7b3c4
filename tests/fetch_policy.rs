use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chan_tui::chan::{Client, ClientConfig, FetchError, FetchPolicy, ProxyEndpoint};

const BOARDS_JSON: &str =
    r#"{"boards":[{"board":"g","title":"Technology","meta_description":"tech"}]}"#;

fn quick_policy(max_retries: u32) -> FetchPolicy {
    FetchPolicy {
        max_retries,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(2),
        jitter: Duration::ZERO,
        timeout: Duration::from_secs(5),
        proxies: Vec::new(),
    }
}

fn client_for(api_base: &str, policy: FetchPolicy) -> Client {
    Client::new(ClientConfig {
        user_agent: "chan-tui integration tests".to_string(),
        api_base: Some(api_base.to_string()),
        media_base: None,
        policy,
        http_client: None,
    })
    .expect("build client")
}

fn json_response(body: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let header =
        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap();
    tiny_http::Response::from_string(body).with_header(header)
}

#[test]
fn retries_transient_errors_until_success() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let base = format!("http://{}/", server.server_addr());
    {
        let hits = hits.clone();
        thread::spawn(move || {
            for request in server.incoming_requests() {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                let _ = if n < 2 {
                    request.respond(json_response("whoops").with_status_code(500))
                } else {
                    request.respond(json_response(BOARDS_JSON))
                };
            }
        });
    }

    let client = client_for(&base, quick_policy(3));
    let boards = client.boards().expect("third attempt succeeds");
    assert_eq!(boards.len(), 1);
    assert_eq!(boards[0].board, "g");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn gives_up_after_the_retry_budget() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let base = format!("http://{}/", server.server_addr());
    {
        let hits = hits.clone();
        thread::spawn(move || {
            for request in server.incoming_requests() {
                hits.fetch_add(1, Ordering::SeqCst);
                let _ = request.respond(json_response("busy").with_status_code(503));
            }
        });
    }

    let client = client_for(&base, quick_policy(2));
    let err = client.boards().expect_err("every attempt fails");
    assert!(matches!(err, FetchError::Http { status: 503 }));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn client_errors_fail_without_retry() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let base = format!("http://{}/", server.server_addr());
    {
        let hits = hits.clone();
        thread::spawn(move || {
            for request in server.incoming_requests() {
                hits.fetch_add(1, Ordering::SeqCst);
                let _ = request.respond(json_response("no such board").with_status_code(404));
            }
        });
    }

    let client = client_for(&base, quick_policy(3));
    let err = client.boards().expect_err("404 is terminal");
    assert!(matches!(err, FetchError::Http { status: 404 }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn bad_payloads_fail_without_retry() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let base = format!("http://{}/", server.server_addr());
    {
        let hits = hits.clone();
        thread::spawn(move || {
            for request in server.incoming_requests() {
                hits.fetch_add(1, Ordering::SeqCst);
                let _ = request.respond(json_response("<html>not json</html>"));
            }
        });
    }

    let client = client_for(&base, quick_policy(3));
    let err = client.boards().expect_err("garbage body is terminal");
    assert!(matches!(err, FetchError::Decode(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn attempts_rotate_through_configured_proxies() {
    let paths = Arc::new(Mutex::new(Vec::new()));
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_string();
    {
        let paths = paths.clone();
        thread::spawn(move || {
            for request in server.incoming_requests() {
                let url = request.url().to_string();
                let dead = url.starts_with("/one/");
                paths.lock().unwrap().push(url);
                let _ = if dead {
                    request.respond(json_response("proxy down").with_status_code(502))
                } else {
                    request.respond(json_response(BOARDS_JSON))
                };
            }
        });
    }

    let mut policy = quick_policy(3);
    policy.proxies = vec![
        ProxyEndpoint::Prefix(format!("http://{addr}/one/")),
        ProxyEndpoint::Prefix(format!("http://{addr}/two/")),
    ];
    // The origin is never dialed directly once proxies are configured.
    let client = client_for("http://origin.invalid/", policy);

    let boards = client.boards().expect("second proxy serves the request");
    assert_eq!(boards.len(), 1);

    let seen = paths.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].starts_with("/one/"));
    assert!(seen[1].starts_with("/two/"));
    assert!(seen[1].contains("boards.json"));
}
