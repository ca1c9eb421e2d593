use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adaptive_crawler::modules::AttemptRecord;
use adaptive_crawler::{
    AdaptiveCrawler, BehaviorPattern, BlockSignal, CrawlError, CrawlEvent, CrawlerConfig,
    EventHandler, FetchError, FetchRequest, FetchResponse, FetchTier, Fetcher, RiskPerceptionModel,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::header::{CONTENT_TYPE, HeaderValue};
use tokio_util::sync::CancellationToken;
use url::Url;

type Responder = dyn Fn(&FetchRequest, usize) -> Result<FetchResponse, FetchError> + Send + Sync;

/// Fetcher answering from a closure. Only requests to the target host are
/// counted and passed the call index; any other host is refused.
struct ScriptedFetcher {
    tier: FetchTier,
    target_host: &'static str,
    calls: AtomicUsize,
    requests: Mutex<Vec<FetchRequest>>,
    respond: Box<Responder>,
}

impl ScriptedFetcher {
    fn new<F>(tier: FetchTier, respond: F) -> Arc<Self>
    where
        F: Fn(&FetchRequest, usize) -> Result<FetchResponse, FetchError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            tier,
            target_host: "shop.test",
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn statuses(tier: FetchTier, statuses: &'static [u16]) -> Arc<Self> {
        Self::new(tier, move |request, call| {
            let status = statuses[call.min(statuses.len() - 1)];
            Ok(response(request, status))
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn tier(&self) -> FetchTier {
        self.tier
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        if request.url.host_str() != Some(self.target_host) {
            return Err(FetchError::Connection("connection refused".into()));
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(request, call)
    }
}

/// Never answers.
struct HangingFetcher;

#[async_trait]
impl Fetcher for HangingFetcher {
    fn tier(&self) -> FetchTier {
        FetchTier::Http
    }

    async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        std::future::pending().await
    }
}

/// Answers 403 for the first `blocked` calls, then never answers.
struct BlockThenHangFetcher {
    blocked: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for BlockThenHangFetcher {
    fn tier(&self) -> FetchTier {
        FetchTier::Http
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.blocked {
            return Ok(response(request, 403));
        }
        std::future::pending().await
    }
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<String>>,
    risks: Mutex<Vec<f64>>,
}

impl RecordingHandler {
    fn count(&self, label: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == label).count()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: &CrawlEvent) {
        let label = match event {
            CrawlEvent::Attempt(_) => "attempt",
            CrawlEvent::Outcome(outcome) => {
                self.risks.lock().unwrap().push(outcome.risk);
                "outcome"
            }
            CrawlEvent::Retry(_) => "retry",
            CrawlEvent::Escalation(_) => "escalation",
            CrawlEvent::IdentityRotation(_) => "rotation",
            CrawlEvent::PatternChanged(_) => "pattern",
            CrawlEvent::WarmupFailed { .. } => "warmup_failed",
            CrawlEvent::SessionReset { .. } => "reset",
            CrawlEvent::AnalysisSkipped(_) => "skipped",
            CrawlEvent::Adaptation(_) => "adaptation",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

fn catalog_page() -> String {
    let mut page = String::from("<html><head><title>Catalog</title></head><body>");
    for n in 0..20 {
        page.push_str(&format!(
            "<p>Seasonal catalog entry {n} lists garden tools, kitchen goods and reading lamps.</p>"
        ));
    }
    page.push_str("</body></html>");
    page
}

fn response(request: &FetchRequest, status: u16) -> FetchResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    let body = if status == 200 {
        catalog_page()
    } else {
        format!("<html><body>status {status}</body></html>")
    };
    FetchResponse {
        status,
        headers,
        body: Bytes::from(body),
        elapsed: Duration::from_millis(200),
        url: request.url.clone(),
    }
}

fn quiet_config() -> CrawlerConfig {
    CrawlerConfig {
        warmup_resources: Vec::new(),
        ..CrawlerConfig::default()
    }
}

const TARGET: &str = "https://shop.test/catalog";

#[tokio::test(start_paused = true)]
async fn persistent_block_exhausts_retries_and_returns_blocked_result() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[403]);
    let recorder = Arc::new(RecordingHandler::default());
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(fetcher.clone())
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    assert_eq!(crawler.risk_model().risk(), 0.0);
    let result = crawler.crawl(TARGET).await.unwrap();

    assert!(result.blocked);
    assert_eq!(result.status, 403);
    assert_eq!(result.block_signal, Some(BlockSignal::Forbidden));
    assert_eq!(result.attempts, 4);
    assert_eq!(result.retries, 3);
    assert_eq!(fetcher.calls(), 4);

    let risks = recorder.risks.lock().unwrap().clone();
    let expected = [0.35, 0.70, 1.0, 1.0];
    assert_eq!(risks.len(), expected.len());
    for (risk, want) in risks.iter().zip(expected) {
        assert!((risk - want).abs() < 1e-9, "risk {risk} != {want}");
    }
    assert_eq!(recorder.count("retry"), 3);
    assert_eq!(recorder.count("escalation"), 0);

    let session = crawler.session().await;
    assert_eq!(session.consecutive_failures, 4);
    assert_eq!(session.retry_round, 3);
    assert_eq!(crawler.history().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn success_streak_tracks_alternating_outcomes() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[200, 503, 200, 503]);
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_max_retry_rounds(0)
        .with_fetcher(fetcher.clone())
        .build()
        .unwrap();

    let mut streaks = Vec::new();
    let mut blocked = Vec::new();
    for _ in 0..4 {
        let result = crawler.crawl(TARGET).await.unwrap();
        blocked.push(result.blocked);
        streaks.push(crawler.session().await.success_streak);
    }

    assert_eq!(streaks, vec![1, 0, 1, 0]);
    assert_eq!(blocked, vec![false, true, false, true]);
    assert_eq!(fetcher.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_attempts_recover_within_budget() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[429, 429, 429, 200]);
    let recorder = Arc::new(RecordingHandler::default());
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(fetcher.clone())
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    let result = crawler.crawl(TARGET).await.unwrap();

    assert!(!result.blocked);
    assert_eq!(result.status, 200);
    assert_eq!(result.retries, 3);
    assert_eq!(result.attempts, 4);
    assert_eq!(result.tier, FetchTier::Http);
    assert_eq!(recorder.count("retry"), 3);

    let session = crawler.session().await;
    assert_eq!(session.retry_round, 0);
    assert_eq!(session.success_streak, 1);
    assert_eq!(session.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn block_escalates_to_browser_without_consuming_a_retry() {
    let http = ScriptedFetcher::statuses(FetchTier::Http, &[403]);
    let browser = ScriptedFetcher::statuses(FetchTier::Browser, &[200]);
    let recorder = Arc::new(RecordingHandler::default());
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(http.clone())
        .with_browser_fetcher(browser.clone())
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    let result = crawler.crawl(TARGET).await.unwrap();

    assert_eq!(result.tier, FetchTier::Browser);
    assert_eq!(result.retries, 0);
    assert_eq!(result.attempts, 2);
    assert_eq!(http.calls(), 1);
    assert_eq!(browser.calls(), 1);
    assert_eq!(recorder.count("escalation"), 1);
}

#[tokio::test(start_paused = true)]
async fn high_risk_goes_straight_to_browser() {
    let risk = RiskPerceptionModel::new();
    let url = Url::parse(TARGET).unwrap();
    for _ in 0..2 {
        let record = AttemptRecord::blocked(url.clone(), 403, 0.2, FetchTier::Http);
        risk.update(&record, Some(BlockSignal::Forbidden), 0);
    }
    assert!(risk.risk() > 0.6);

    let http = ScriptedFetcher::statuses(FetchTier::Http, &[200]);
    let browser = ScriptedFetcher::statuses(FetchTier::Browser, &[200]);
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(http.clone())
        .with_browser_fetcher(browser.clone())
        .with_risk_model(risk)
        .build()
        .unwrap();

    let result = crawler.crawl(TARGET).await.unwrap();
    assert_eq!(result.tier, FetchTier::Browser);
    assert_eq!(result.attempts, 1);
    assert_eq!(http.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_timeouts_raise_timeout_then_fail() {
    let fetcher = ScriptedFetcher::new(FetchTier::Http, |request, _| {
        Err(FetchError::Timeout(request.timeout))
    });
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(fetcher.clone())
        .build()
        .unwrap();

    let err = crawler.crawl(TARGET).await.unwrap_err();
    match err {
        CrawlError::EscalationExhausted { attempts, status, .. } => {
            assert_eq!(attempts, 4);
            assert_eq!(status, None);
        }
        other => panic!("unexpected error: {other}"),
    }

    let timeouts: Vec<u64> = fetcher
        .requests()
        .iter()
        .map(|request| request.timeout.as_secs())
        .collect();
    assert_eq!(timeouts, vec![30, 40, 50, 60]);
    assert_eq!(crawler.session().await.request_timeout, Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_in_flight_fetch() {
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(Arc::new(HangingFetcher))
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = crawler.crawl_with_cancel(TARGET, &token).await.unwrap_err();
    assert!(matches!(err, CrawlError::Cancelled(_)));
    assert!(!crawler.analysis_guard().is_active());
    assert_eq!(crawler.history().len(), 0);
    assert_eq!(crawler.risk_model().risk(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn busy_guard_skips_analysis_but_keeps_history() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[403]);
    let recorder = Arc::new(RecordingHandler::default());
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_max_retry_rounds(0)
        .with_fetcher(fetcher)
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    let permit = crawler.analysis_guard().try_enter().unwrap();
    let result = crawler.crawl(TARGET).await.unwrap();
    drop(permit);

    assert!(result.blocked);
    assert_eq!(crawler.risk_model().risk(), 0.0);
    assert_eq!(crawler.history().len(), 1);
    assert_eq!(recorder.count("skipped"), 1);

    let stats = crawler.stats().await;
    assert_eq!(stats.session.skipped_analyses, 1);
    assert_eq!(stats.skipped_analyses, 1);
    assert_eq!(stats.session.consecutive_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_urls_fail_fast() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[200]);
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(fetcher.clone())
        .build()
        .unwrap();

    for raw in ["ftp://shop.test/file", "not a url", "javascript:alert(1)"] {
        let err = crawler.crawl(raw).await.unwrap_err();
        assert!(matches!(err, CrawlError::InvalidUrl { .. }), "{raw}: {err}");
    }
    assert_eq!(fetcher.calls(), 0);
    assert!(crawler.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_warmups_do_not_fail_the_crawl() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[200]);
    let config = CrawlerConfig {
        warmup_resources: vec![
            "https://cdn.test/app.js".into(),
            "https://cdn.test/site.css".into(),
            "https://cdn.test/logo.png".into(),
        ],
        ..CrawlerConfig::default()
    };
    let recorder = Arc::new(RecordingHandler::default());
    let crawler = AdaptiveCrawler::builder()
        .with_config(config)
        .with_fetcher(fetcher.clone())
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    let result = crawler.crawl(TARGET).await.unwrap();
    assert!(!result.blocked);
    assert_eq!(result.attempts, 1);
    assert_eq!(fetcher.calls(), 1);

    let requests = fetcher.requests();
    let (warmups, targets): (Vec<_>, Vec<_>) = requests
        .iter()
        .partition(|request| request.url.host_str() == Some("cdn.test"));
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].timeout, Duration::from_secs(30));
    assert!(warmups.iter().all(|request| request.timeout == Duration::from_secs(4)));
    assert_eq!(result.metadata["warmups"], warmups.len());
    assert_eq!(recorder.count("warmup_failed"), warmups.len());
    assert_eq!(crawler.history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_batch_keeps_input_order() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[200]);
    let crawler = Arc::new(
        AdaptiveCrawler::builder()
            .with_config(quiet_config())
            .with_fetcher(fetcher.clone())
            .build()
            .unwrap(),
    );

    let urls: Vec<String> = (0..6).map(|i| format!("https://shop.test/item/{i}")).collect();
    let results = crawler.crawl_batch_concurrent(urls.clone(), 3).await;

    assert_eq!(results.len(), urls.len());
    for (result, url) in results.iter().zip(&urls) {
        let page = result.as_ref().unwrap();
        assert_eq!(page.url.as_str(), url);
    }
    assert_eq!(fetcher.calls(), 6);
    assert_eq!(crawler.history().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn sequential_batch_pauses_between_requests() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[200]);
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(fetcher.clone())
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let results = crawler
        .crawl_batch([
            "https://shop.test/a",
            "not a url",
            "https://shop.test/b",
            "https://shop.test/c",
        ])
        .await;

    assert_eq!(results.len(), 4);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(CrawlError::InvalidUrl { .. })));
    assert!(results[3].is_ok());
    // Two human delays of at least 1s plus one chunk pause of at least 5s.
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_later_calls() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[200]);
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(fetcher.clone())
        .build()
        .unwrap();

    crawler.shutdown();
    let err = crawler.crawl(TARGET).await.unwrap_err();
    assert!(matches!(err, CrawlError::Cancelled(_)));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn stats_serialize_to_json() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[200, 403]);
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_max_retry_rounds(0)
        .with_fetcher(fetcher)
        .with_proxies(["http://10.0.0.1:8080", "http://10.0.0.2:8080"])
        .build()
        .unwrap();

    crawler.crawl(TARGET).await.unwrap();
    crawler.crawl(TARGET).await.unwrap();

    let stats = crawler.stats().await;
    assert_eq!(stats.history_len, 2);
    assert!((stats.failure_rate - 0.5).abs() < 1e-9);
    assert_eq!(stats.proxies.as_ref().map(|p| p.total_proxies), Some(2));

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["history_len"], 2);
    let summary: HashMap<String, serde_json::Value> =
        serde_json::from_value(json["session"].clone()).unwrap();
    assert_eq!(summary["total_attempts"], 2);
}

#[tokio::test(start_paused = true)]
async fn hourly_session_reset_starts_a_fresh_session() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[200]);
    let recorder = Arc::new(RecordingHandler::default());
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(fetcher.clone())
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    crawler.crawl(TARGET).await.unwrap();
    crawler.crawl(TARGET).await.unwrap();
    let before = crawler.session().await;
    assert_eq!(before.success_streak, 2);
    assert_eq!(recorder.count("reset"), 0);

    tokio::time::advance(Duration::from_secs(3601)).await;
    crawler.crawl(TARGET).await.unwrap();

    let after = crawler.session().await;
    assert_eq!(recorder.count("reset"), 1);
    assert_ne!(after.session_id, before.session_id);
    assert_eq!(after.resets, 1);
    assert_eq!(after.success_streak, 1);
    assert_eq!(after.retry_round, 0);
}

#[tokio::test(start_paused = true)]
async fn high_failure_rate_rotates_identity_before_each_call() {
    let fetcher = ScriptedFetcher::statuses(FetchTier::Http, &[403]);
    let recorder = Arc::new(RecordingHandler::default());
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_max_retry_rounds(0)
        .with_fetcher(fetcher.clone())
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    crawler.crawl(TARGET).await.unwrap();
    assert_eq!(recorder.count("rotation"), 0);

    for _ in 0..3 {
        let result = crawler.crawl(TARGET).await.unwrap();
        assert!(result.blocked);
    }
    assert_eq!(recorder.count("rotation"), 3);
    assert_eq!(recorder.count("retry"), 0);
    assert_eq!(fetcher.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn network_errors_escalate_once_retries_run_out() {
    let http = ScriptedFetcher::new(FetchTier::Http, |_, _| {
        Err(FetchError::Connection("connection reset by peer".into()))
    });
    let browser = ScriptedFetcher::statuses(FetchTier::Browser, &[200]);
    let recorder = Arc::new(RecordingHandler::default());
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(http.clone())
        .with_browser_fetcher(browser.clone())
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    let result = crawler.crawl(TARGET).await.unwrap();

    assert_eq!(result.tier, FetchTier::Browser);
    assert_eq!(result.status, 200);
    assert_eq!(result.attempts, 5);
    assert_eq!(result.retries, 3);
    assert_eq!(http.calls(), 4);
    assert_eq!(browser.calls(), 1);
    assert_eq!(recorder.count("retry"), 3);
    assert_eq!(recorder.count("escalation"), 1);
}

#[tokio::test(start_paused = true)]
async fn pattern_cooldown_follows_the_crawl_clock() {
    let config = CrawlerConfig {
        shift_after_failures: 100,
        ..quiet_config()
    };
    let recorder = Arc::new(RecordingHandler::default());
    let crawler = AdaptiveCrawler::builder()
        .with_config(config)
        .with_max_retry_rounds(0)
        .with_fetcher(ScriptedFetcher::statuses(FetchTier::Http, &[403]))
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    crawler.crawl(TARGET).await.unwrap();
    assert_eq!(crawler.current_pattern().await, BehaviorPattern::Careful);
    assert_eq!(recorder.count("pattern"), 1);

    crawler.crawl(TARGET).await.unwrap();
    crawler.crawl(TARGET).await.unwrap();
    assert!(crawler.risk_model().risk() > 0.7);
    assert_eq!(crawler.current_pattern().await, BehaviorPattern::Careful);
    assert_eq!(recorder.count("pattern"), 1);

    tokio::time::advance(Duration::from_secs(301)).await;
    crawler.crawl(TARGET).await.unwrap();
    assert_eq!(crawler.current_pattern().await, BehaviorPattern::Stealth);
    assert_eq!(recorder.count("pattern"), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelled_call_keeps_the_last_scheduled_retry_round() {
    let crawler = AdaptiveCrawler::builder()
        .with_config(quiet_config())
        .with_fetcher(Arc::new(BlockThenHangFetcher {
            blocked: 4,
            calls: AtomicUsize::new(0),
        }))
        .build()
        .unwrap();

    let result = crawler.crawl(TARGET).await.unwrap();
    assert!(result.blocked);
    assert_eq!(crawler.session().await.retry_round, 3);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let err = crawler.crawl_with_cancel(TARGET, &token).await.unwrap_err();
    assert!(matches!(err, CrawlError::Cancelled(_)));

    let session = crawler.session().await;
    assert_eq!(session.retry_round, 3);
    assert_eq!(session.consecutive_failures, 4);
}
