//! End-to-end tests against a local mock server.

use std::time::Duration;

use adaptive_crawler::{
    AdaptiveCrawler, CrawlerConfig, FetchError, FetchRequest, FetchTier, Fetcher, IterativeOptions,
    LinkFilter, ReqwestFetcher,
};
use http::HeaderMap;
use http::header::{HeaderValue, USER_AGENT};
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn page(title: &str, links: &[&str]) -> String {
    let mut body = format!("<html><head><title>{title}</title></head><body><h1>{title}</h1>");
    for link in links {
        body.push_str(&format!("<a href=\"{link}\">{link}</a>"));
    }
    for n in 0..12 {
        body.push_str(&format!(
            "<p>Paragraph {n} of the {title} page describes opening hours and delivery areas.</p>"
        ));
    }
    body.push_str("</body></html>");
    body
}

async fn mount_page(server: &MockServer, route: &str, title: &str, links: &[&str]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(page(title, links), "text/html"))
        .mount(server)
        .await;
}

fn local_config() -> CrawlerConfig {
    CrawlerConfig {
        warmup_resources: Vec::new(),
        min_delay_secs: 0.0,
        max_delay_secs: 0.0,
        request_timeout_secs: 5.0,
        ..CrawlerConfig::default()
    }
}

#[tokio::test]
async fn reqwest_fetcher_returns_status_body_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/inventory"))
        .and(header("user-agent", "inventory-check/1.0"))
        .respond_with(
            ResponseTemplate::new(404)
                .insert_header("x-shop", "north")
                .set_body_string("missing"),
        )
        .mount(&server)
        .await;

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("inventory-check/1.0"));
    let url = Url::parse(&format!("{}/inventory", server.uri())).unwrap();
    let request = FetchRequest::new(url.clone(), Duration::from_secs(5)).with_headers(headers);

    let fetcher = ReqwestFetcher::new();
    assert_eq!(fetcher.tier(), FetchTier::Http);
    let response = fetcher.fetch(&request).await.unwrap();

    assert_eq!(response.status, 404);
    assert_eq!(response.text(), "missing");
    assert_eq!(response.headers.get("x-shop").unwrap(), "north");
    assert_eq!(response.url, url);
}

#[tokio::test]
async fn reqwest_fetcher_maps_slow_responses_to_timeouts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
    let request = FetchRequest::new(url, Duration::from_millis(200));
    let err = ReqwestFetcher::new().fetch(&request).await.unwrap_err();
    assert!(matches!(err, FetchError::Timeout(_)), "{err}");
}

#[tokio::test]
async fn crawler_serves_page_through_reqwest() {
    let server = MockServer::start().await;
    mount_page(&server, "/", "Home", &[]).await;

    let crawler = AdaptiveCrawler::builder()
        .with_config(local_config())
        .build()
        .unwrap();
    let result = crawler.crawl(&format!("{}/", server.uri())).await.unwrap();

    assert_eq!(result.status, 200);
    assert!(!result.blocked);
    assert!(result.text().contains("<h1>Home</h1>"));
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn iterative_crawl_follows_same_domain_links_to_depth() {
    let server = MockServer::start().await;
    mount_page(&server, "/", "Home", &["/a", "/b", "/a#reviews", "https://other.org/x"]).await;
    mount_page(&server, "/a", "Aisle A", &["/c"]).await;
    mount_page(&server, "/b", "Aisle B", &[]).await;
    mount_page(&server, "/c", "Aisle C", &[]).await;

    let crawler = AdaptiveCrawler::builder()
        .with_config(local_config())
        .build()
        .unwrap();
    let start = format!("{}/", server.uri());
    let results = crawler
        .crawl_iterative(
            &start,
            IterativeOptions {
                max_depth: 1,
                max_urls: 10,
                filter: None,
            },
        )
        .await;

    let paths: Vec<String> = results
        .iter()
        .map(|result| result.as_ref().unwrap().url.path().to_string())
        .collect();
    assert_eq!(paths, vec!["/", "/a", "/b"]);
}

#[tokio::test]
async fn iterative_crawl_respects_url_budget_and_filter() {
    let server = MockServer::start().await;
    mount_page(&server, "/", "Home", &["/a", "/b", "/c"]).await;
    mount_page(&server, "/a", "Aisle A", &[]).await;
    mount_page(&server, "/b", "Aisle B", &[]).await;
    mount_page(&server, "/c", "Aisle C", &[]).await;

    let crawler = AdaptiveCrawler::builder()
        .with_config(local_config())
        .build()
        .unwrap();
    let start = format!("{}/", server.uri());
    let filter = LinkFilter::same_domain(&Url::parse(&start).unwrap())
        .exclude(["/a$"])
        .unwrap();
    let results = crawler
        .crawl_iterative(
            &start,
            IterativeOptions {
                max_depth: 3,
                max_urls: 2,
                filter: Some(filter),
            },
        )
        .await;

    let paths: Vec<String> = results
        .iter()
        .map(|result| result.as_ref().unwrap().url.path().to_string())
        .collect();
    assert_eq!(paths, vec!["/", "/b"]);
}
