use std::sync::Arc;
use std::time::{Duration, Instant};

use careers_core::{PageviewWindow, PeriodCount};
use careers_sources::{
    ClassHierarchy, DiscoveryError, OccupationGraph, PageviewSource, WikidataConfig,
    WikidataGraph, WikimediaConfig, WikimediaPageviews,
};
use careers_storage::{HttpClientConfig, HttpFetcher};
use chrono::NaiveDate;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// Answer every connection with the same canned response.
async fn canned_server(status: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                read_request(&mut stream).await;
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

/// Accept connections and never answer them.
async fn silent_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    format!("http://{addr}")
}

/// Consume the request head and any declared body.
async fn read_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let Ok(n) = stream.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
        let declared = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= head_end + 4 + declared {
            return;
        }
    }
}

fn fetcher() -> Arc<HttpFetcher> {
    Arc::new(HttpFetcher::for_run(Uuid::new_v4(), HttpClientConfig::default()).unwrap())
}

fn graph(endpoint: String, query_timeout: Duration) -> WikidataGraph {
    WikidataGraph::new(
        fetcher(),
        WikidataConfig {
            endpoint,
            query_timeout,
            ..WikidataConfig::default()
        },
    )
}

fn pageviews(base: &str) -> WikimediaPageviews {
    WikimediaPageviews::new(
        fetcher(),
        WikimediaConfig {
            wiki_project: "en.wikipedia.org".to_string(),
            metrics_base: format!("{base}/metrics/pageviews"),
        },
    )
}

fn window() -> PageviewWindow {
    PageviewWindow {
        start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        end: NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
    }
}

#[tokio::test]
async fn silent_endpoint_times_out_within_one_deadline() {
    let endpoint = silent_server().await;
    let graph = graph(endpoint, Duration::from_millis(500));

    let started = Instant::now();
    let err = graph
        .occupation_candidates(&["Q28640".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DiscoveryError::QueryTimeout { after } if after == Duration::from_millis(500)
    ));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn rejected_query_is_a_query_error() {
    let endpoint = canned_server("400 Bad Request", r#"{"error": "parse"}"#).await;
    let graph = graph(endpoint, Duration::from_secs(5));

    let err = graph
        .occupation_candidates(&["Q28640".to_string()])
        .await
        .unwrap_err();
    match err {
        DiscoveryError::QueryError(message) => assert!(message.contains("400")),
        other => panic!("expected a query error, got {other:?}"),
    }
}

#[tokio::test]
async fn sparql_results_come_back_as_rows() {
    let body = r#"{"results": {"bindings": [
        {"item": {"value": "http://www.wikidata.org/entity/Q186360"},
         "itemLabel": {"value": "nurse"},
         "class": {"value": "http://www.wikidata.org/entity/Q28640"},
         "article": {"value": "https://en.wikipedia.org/wiki/Nurse"}}
    ]}}"#;
    let endpoint = canned_server("200 OK", body).await;
    let graph = graph(endpoint, Duration::from_secs(5));

    let rows = graph
        .occupation_candidates(&["Q28640".to_string()])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].entity_id, "Q186360");
    assert_eq!(rows[0].type_id, "Q28640");

    let classes = graph
        .subclasses_with_articles("Q28640", &["Q515".to_string()])
        .await
        .unwrap();
    assert_eq!(classes, vec!["Q28640"]);
}

#[tokio::test]
async fn article_without_metrics_has_no_periods() {
    let base = canned_server("404 Not Found", r#"{"title": "Not found."}"#).await;
    let periods = pageviews(&base)
        .monthly_views("Obscure trade", &window())
        .await
        .unwrap();
    assert!(periods.is_empty());
}

#[tokio::test]
async fn metrics_items_are_returned_as_periods() {
    let body = r#"{"items": [
        {"timestamp": "2025010100", "views": 310},
        {"timestamp": "2025020100", "views": 280}
    ]}"#;
    let base = canned_server("200 OK", body).await;
    let periods = pageviews(&base)
        .monthly_views("Nurse", &window())
        .await
        .unwrap();
    assert_eq!(
        periods,
        vec![
            PeriodCount {
                period_start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                views: 310,
            },
            PeriodCount {
                period_start: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
                views: 280,
            },
        ]
    );
}

#[tokio::test]
async fn forbidden_metrics_request_is_an_error() {
    let base = canned_server("403 Forbidden", "{}").await;
    let err = pageviews(&base)
        .monthly_views("Nurse", &window())
        .await
        .unwrap_err();
    assert!(!err.is_not_found());
    assert!(err.to_string().contains("403"));
}
