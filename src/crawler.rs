//! Crawl orchestration.
//!
//! Wires the risk model, history, behavior controller, strategy synthesizer
//! and learner around a pair of fetch tiers. A single [`AdaptiveCrawler::crawl`]
//! call runs an explicit retry loop: synthesize a plan, warm up, fetch,
//! classify, feed the outcome back, then retry, escalate or return.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::HeaderMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{CrawlerConfig, secs};
use crate::detection::{BlockDetector, BlockSignal, DefaultBlockDetector};
use crate::external_deps::{
	FingerprintProvider, HeaderIdentityProvider, LinkExtractor, LinkFilter, ProxyProvider,
	ScraperLinkExtractor,
};
use crate::fetch::{FetchError, FetchErrorKind, FetchRequest, FetchResponse, FetchTier, Fetcher, ReqwestFetcher};
use crate::modules::behavior::{BehaviorPattern, BehaviorPatternController, PatternTransition};
use crate::modules::events::{
	AnalysisSkippedEvent, AttemptEvent, CrawlEvent, EscalationEvent, EventDispatcher,
	EventHandler, IdentityRotationEvent, LoggingHandler, OutcomeEvent, RetryEvent,
};
use crate::modules::history::{AttemptRecord, HistoryStore};
use crate::modules::learner::{
	AdaptationLearner, LearnerAction, LearnerSummary, PerformanceObservation, PerformancePattern,
	Priority,
};
use crate::modules::monitor::{ResourceSampler, spawn_resource_monitor};
use crate::modules::proxy::{ProxyConfig, ProxyHealthReport, ProxyManager};
use crate::modules::risk::{RiskPerceptionModel, RiskState};
use crate::modules::session::{AnalysisGuard, CrawlSession, SessionSnapshot};
use crate::modules::strategy::{
	FingerprintIntensity, ProxyPolicy, StrategyProfile, StrategySynthesizer, SynthesisInput,
};

/// Result alias used across the orchestration layer.
pub type CrawlResultOf<T> = Result<T, CrawlError>;

/// Errors surfaced by a crawl call. Blocked pages are not errors: they come
/// back as a [`CrawlResult`] with `blocked` set.
#[derive(Debug, Clone, Error)]
pub enum CrawlError {
	#[error("invalid url {url:?}: {reason}")]
	InvalidUrl { url: String, reason: String },
	#[error("gave up on {url} after {attempts} attempts (last status {status:?}): {error}")]
	EscalationExhausted {
		url: String,
		status: Option<u16>,
		error: String,
		attempts: u32,
	},
	#[error("crawl of {0} cancelled")]
	Cancelled(String),
	#[error("configuration error: {0}")]
	Configuration(String),
	#[error("crawl worker failed: {0}")]
	Worker(String),
}

/// Outcome of one logical crawl call.
#[derive(Debug, Clone)]
pub struct CrawlResult {
	pub url: Url,
	pub final_url: Url,
	pub status: u16,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub response_time: Duration,
	pub blocked: bool,
	pub block_signal: Option<BlockSignal>,
	pub tier: FetchTier,
	pub attempts: u32,
	pub retries: u32,
	pub metadata: Value,
}

impl CrawlResult {
	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}

	pub fn is_success(&self) -> bool {
		!self.blocked
	}
}

/// Read-only snapshot for monitoring and export.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlerStats {
	pub session: SessionSnapshot,
	pub risk: RiskState,
	pub pattern: BehaviorPattern,
	pub recent_transitions: Vec<PatternTransition>,
	pub history_len: usize,
	pub history_capacity: usize,
	pub failure_rate: f64,
	pub skipped_analyses: u64,
	pub learner: LearnerSummary,
	pub proxies: Option<ProxyHealthReport>,
}

/// Bounds for [`AdaptiveCrawler::crawl_iterative`].
#[derive(Debug, Clone)]
pub struct IterativeOptions {
	pub max_depth: usize,
	pub max_urls: usize,
	/// `None` restricts the crawl to the start URL's domain.
	pub filter: Option<LinkFilter>,
}

impl Default for IterativeOptions {
	fn default() -> Self {
		Self {
			max_depth: 2,
			max_urls: 50,
			filter: None,
		}
	}
}

/// Fluent builder for [`AdaptiveCrawler`].
pub struct AdaptiveCrawlerBuilder {
	config: CrawlerConfig,
	fetcher: Option<Arc<dyn Fetcher>>,
	browser: Option<Arc<dyn Fetcher>>,
	detector: Option<Arc<dyn BlockDetector>>,
	identity: Option<Box<dyn FingerprintProvider>>,
	proxies: Option<Box<dyn ProxyProvider>>,
	proxy_config: ProxyConfig,
	links: Option<Arc<dyn LinkExtractor>>,
	risk: Option<RiskPerceptionModel>,
	history: Option<HistoryStore>,
	handlers: Vec<Arc<dyn EventHandler>>,
	logging: bool,
	seed: Option<u64>,
}

impl AdaptiveCrawlerBuilder {
	pub fn new() -> Self {
		Self {
			config: CrawlerConfig::default(),
			fetcher: None,
			browser: None,
			detector: None,
			identity: None,
			proxies: None,
			proxy_config: ProxyConfig::default(),
			links: None,
			risk: None,
			history: None,
			handlers: Vec::new(),
			logging: true,
			seed: None,
		}
	}

	pub fn with_config(mut self, config: CrawlerConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_max_retry_rounds(mut self, rounds: u32) -> Self {
		self.config.max_retry_rounds = rounds;
		self
	}

	pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
		self.fetcher = Some(fetcher);
		self
	}

	/// Heavier tier used for escalation.
	pub fn with_browser_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
		self.browser = Some(fetcher);
		self
	}

	pub fn with_block_detector(mut self, detector: Arc<dyn BlockDetector>) -> Self {
		self.detector = Some(detector);
		self
	}

	pub fn with_fingerprint_provider(mut self, provider: Box<dyn FingerprintProvider>) -> Self {
		self.identity = Some(provider);
		self
	}

	pub fn with_proxy_provider(mut self, provider: Box<dyn ProxyProvider>) -> Self {
		self.proxies = Some(provider);
		self
	}

	pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.proxies = proxies.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_proxy_config(mut self, config: ProxyConfig) -> Self {
		self.proxy_config = config;
		self
	}

	pub fn with_link_extractor(mut self, extractor: Arc<dyn LinkExtractor>) -> Self {
		self.links = Some(extractor);
		self
	}

	/// Shares an existing risk model, e.g. across several crawlers.
	pub fn with_risk_model(mut self, model: RiskPerceptionModel) -> Self {
		self.risk = Some(model);
		self
	}

	pub fn with_history(mut self, history: HistoryStore) -> Self {
		self.history = Some(history);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_logging(mut self) -> Self {
		self.logging = false;
		self
	}

	/// Seeds the strategy/learner RNG for reproducible runs.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}

	pub fn build(self) -> CrawlResultOf<AdaptiveCrawler> {
		AdaptiveCrawler::from_builder(self)
	}
}

impl Default for AdaptiveCrawlerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Mutable state shared between concurrent calls. Locked only for short
/// synchronous sections, never across a fetch or a sleep.
struct CrawlerInner {
	session: CrawlSession,
	behavior: BehaviorPatternController,
	learner: AdaptationLearner,
	identity: Box<dyn FingerprintProvider>,
	proxies: Box<dyn ProxyProvider>,
	rng: StdRng,
}

impl CrawlerInner {
	fn rotate_identity(&mut self, now: Instant) -> Option<String> {
		self.identity.refresh_identity();
		self.session.mark_rotation(now);
		self.proxies.rotate()
	}
}

/// Per-attempt plan produced under the inner lock.
struct AttemptPlan {
	tier: FetchTier,
	profile: Option<StrategyProfile>,
	headers: HeaderMap,
	proxies: Vec<String>,
	timeout: Duration,
	learner: Option<(usize, LearnerAction)>,
}

enum Classified {
	Served(FetchResponse),
	Blocked(FetchResponse, Option<BlockSignal>),
	Failed(FetchError, Duration),
}

/// Risk-aware crawl orchestrator.
pub struct AdaptiveCrawler {
	config: CrawlerConfig,
	fetcher: Arc<dyn Fetcher>,
	browser: Option<Arc<dyn Fetcher>>,
	detector: Arc<dyn BlockDetector>,
	links: Arc<dyn LinkExtractor>,
	risk: RiskPerceptionModel,
	history: HistoryStore,
	synthesizer: StrategySynthesizer,
	guard: AnalysisGuard,
	events: Arc<EventDispatcher>,
	warmup_pool: Vec<Url>,
	cancel: CancellationToken,
	inner: Mutex<CrawlerInner>,
}

impl AdaptiveCrawler {
	/// Crawler with default configuration and collaborators.
	pub fn new() -> CrawlResultOf<Self> {
		AdaptiveCrawlerBuilder::new().build()
	}

	pub fn builder() -> AdaptiveCrawlerBuilder {
		AdaptiveCrawlerBuilder::new()
	}

	fn from_builder(builder: AdaptiveCrawlerBuilder) -> CrawlResultOf<Self> {
		let AdaptiveCrawlerBuilder {
			config,
			fetcher,
			browser,
			detector,
			identity,
			proxies,
			proxy_config,
			links,
			risk,
			history,
			handlers,
			logging,
			seed,
		} = builder;

		config.validate().map_err(CrawlError::Configuration)?;

		let warmup_pool = config
			.warmup_resources
			.iter()
			.filter_map(|raw| match Url::parse(raw) {
				Ok(url) => Some(url),
				Err(err) => {
					log::warn!("ignoring warm-up resource {raw:?}: {err}");
					None
				}
			})
			.collect();

		let proxies = proxies.unwrap_or_else(|| {
			let mut manager = ProxyManager::new(proxy_config);
			manager.load(config.proxies.iter().cloned());
			Box::new(manager)
		});

		let mut events = EventDispatcher::new();
		if logging {
			events.register_handler(Arc::new(LoggingHandler));
		}
		for handler in handlers {
			events.register_handler(handler);
		}

		let rng = match seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_entropy(),
		};

		let inner = CrawlerInner {
			session: CrawlSession::new(config.max_retry_rounds, config.request_timeout()),
			behavior: BehaviorPatternController::new(config.pattern_cooldown()),
			learner: AdaptationLearner::new(config.learner.clone()),
			identity: identity.unwrap_or_else(|| Box::new(HeaderIdentityProvider::new())),
			proxies,
			rng,
		};

		Ok(Self {
			fetcher: fetcher.unwrap_or_else(|| Arc::new(ReqwestFetcher::new())),
			browser,
			detector: detector.unwrap_or_else(|| Arc::new(DefaultBlockDetector::new())),
			links: links.unwrap_or_else(|| Arc::new(ScraperLinkExtractor::new())),
			risk: risk.unwrap_or_default(),
			history: history.unwrap_or_else(|| HistoryStore::new(config.history_capacity)),
			synthesizer: StrategySynthesizer::new(),
			guard: AnalysisGuard::new(config.analysis_max_depth),
			events: Arc::new(events),
			warmup_pool,
			cancel: CancellationToken::new(),
			inner: Mutex::new(inner),
			config,
		})
	}

	pub fn config(&self) -> &CrawlerConfig {
		&self.config
	}

	pub fn risk_model(&self) -> &RiskPerceptionModel {
		&self.risk
	}

	pub fn history(&self) -> &HistoryStore {
		&self.history
	}

	pub fn analysis_guard(&self) -> &AnalysisGuard {
		&self.guard
	}

	pub async fn session(&self) -> CrawlSession {
		self.inner.lock().await.session.clone()
	}

	pub async fn current_pattern(&self) -> BehaviorPattern {
		self.inner.lock().await.behavior.current()
	}

	/// Cancels every in-flight and future call made through [`crawl`](Self::crawl).
	pub fn shutdown(&self) {
		self.cancel.cancel();
	}

	/// Starts a background task feeding host pressure into the risk model.
	/// The task stops on [`shutdown`](Self::shutdown).
	pub fn start_resource_monitor(
		&self,
		sampler: Arc<dyn ResourceSampler>,
		every: Duration,
	) -> JoinHandle<()> {
		spawn_resource_monitor(self.risk.clone(), sampler, every, self.cancel.child_token())
	}

	pub async fn crawl(&self, url: &str) -> CrawlResultOf<CrawlResult> {
		self.crawl_with_cancel(url, &self.cancel).await
	}

	/// Runs one logical crawl: bounded retries, rotation and tier escalation.
	pub async fn crawl_with_cancel(
		&self,
		url: &str,
		cancel: &CancellationToken,
	) -> CrawlResultOf<CrawlResult> {
		let target = parse_target(url)?;
		self.begin_call().await;

		let max_retries = self.config.max_retry_rounds;
		let mut retries = 0u32;
		let mut attempts = 0u32;
		let mut escalated = false;
		let mut last_status = None;

		loop {
			if cancel.is_cancelled() {
				return Err(CrawlError::Cancelled(target.to_string()));
			}
			attempts += 1;

			let browser = self.browser.as_ref();
			if !escalated
				&& browser.is_some()
				&& self.risk.risk() > self.config.escalation_risk_threshold
			{
				escalated = true;
				self.escalate(&target, "risk above escalation threshold");
			}

			let tier = if escalated { FetchTier::Browser } else { FetchTier::Http };
			let fetcher = match (tier, browser) {
				(FetchTier::Browser, Some(browser)) => browser,
				_ => &self.fetcher,
			};

			let plan = self.plan_attempt(&target, tier).await;
			if let Some(profile) = &plan.profile {
				self.run_warmups(profile, &plan, cancel).await?;
			}

			self.events.dispatch(CrawlEvent::Attempt(AttemptEvent {
				url: target.clone(),
				tier,
				attempt: attempts,
				timestamp: Utc::now(),
			}));

			let request = FetchRequest::new(target.clone(), plan.timeout)
				.with_headers(plan.headers.clone())
				.with_proxies(plan.proxies.clone());
			let started = Instant::now();
			let fetched = tokio::select! {
				_ = cancel.cancelled() => return Err(CrawlError::Cancelled(target.to_string())),
				result = fetcher.fetch(&request) => result,
			};

			let classified = match fetched {
				Ok(response) => {
					let body = response.text();
					let verdict = self.detector.classify(
						response.status,
						&body,
						response.content_type(),
						&response.url,
					);
					if verdict.blocked {
						Classified::Blocked(response, verdict.signal)
					} else {
						Classified::Served(response)
					}
				}
				Err(err) => Classified::Failed(err, started.elapsed()),
			};

			match classified {
				Classified::Served(response) => {
					let record = AttemptRecord::success(
						target.clone(),
						response.status,
						response.elapsed.as_secs_f64(),
						tier,
					);
					self.conclude_attempt(&target, &record, None, &plan).await;
					return Ok(self.build_result(&target, response, None, tier, attempts, retries, &plan));
				}
				Classified::Blocked(response, signal) => {
					last_status = Some(response.status);
					let record = AttemptRecord::blocked(
						target.clone(),
						response.status,
						response.elapsed.as_secs_f64(),
						tier,
					);
					self.conclude_attempt(&target, &record, signal, &plan).await;

					if !escalated && browser.is_some() {
						escalated = true;
						self.escalate(&target, "blocked on the http tier");
						continue;
					}
					if retries < max_retries {
						retries += 1;
						self.rotate_after_block(&plan).await;
						self.backoff(&target, retries, blocked_reason(signal), cancel).await?;
						continue;
					}
					return Ok(self.build_result(&target, response, signal, tier, attempts, retries, &plan));
				}
				Classified::Failed(err, elapsed) => {
					let kind = err.kind();
					let record = AttemptRecord::error(target.clone(), kind, elapsed.as_secs_f64(), tier);
					self.conclude_attempt(&target, &record, None, &plan).await;
					self.recover_from_error(kind, &plan).await;

					if retries < max_retries {
						retries += 1;
						self.backoff(&target, retries, format!("{kind} error: {err}"), cancel).await?;
						continue;
					}
					if !escalated && browser.is_some() {
						escalated = true;
						self.escalate(&target, "retries exhausted on the http tier");
						continue;
					}
					return Err(CrawlError::EscalationExhausted {
						url: target.to_string(),
						status: last_status,
						error: err.to_string(),
						attempts,
					});
				}
			}
		}
	}

	/// Crawls URLs one after another with human-like pauses between them and
	/// a longer break after every chunk.
	pub async fn crawl_batch<I, S>(&self, urls: I) -> Vec<CrawlResultOf<CrawlResult>>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let chunk = self.config.batch_chunk_size.max(1);
		let mut results = Vec::new();
		for (index, url) in urls.into_iter().enumerate() {
			if index > 0 {
				let pause = if index % chunk == 0 {
					random_duration(self.config.batch_pause_secs)
				} else {
					self.human_delay()
				};
				if !self.pause(pause, &self.cancel).await {
					results.push(Err(CrawlError::Cancelled(url.as_ref().to_string())));
					continue;
				}
			}
			results.push(self.crawl(url.as_ref()).await);
		}
		results
	}

	/// Crawls URLs on a bounded worker pool. Results keep input order.
	pub async fn crawl_batch_concurrent<I, S>(
		self: &Arc<Self>,
		urls: I,
		max_concurrency: usize,
	) -> Vec<CrawlResultOf<CrawlResult>>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let urls: Vec<String> = urls.into_iter().map(Into::into).collect();
		let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
		let mut tasks = JoinSet::new();

		for (index, url) in urls.iter().cloned().enumerate() {
			let crawler = Arc::clone(self);
			let semaphore = Arc::clone(&semaphore);
			tasks.spawn(async move {
				let result = match semaphore.acquire_owned().await {
					Ok(_permit) => crawler.crawl(&url).await,
					Err(_) => Err(CrawlError::Cancelled(url)),
				};
				(index, result)
			});
		}

		let mut slots: Vec<Option<CrawlResultOf<CrawlResult>>> = vec![None; urls.len()];
		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok((index, result)) => slots[index] = Some(result),
				Err(err) => log::error!("crawl worker failed: {err}"),
			}
		}

		slots
			.into_iter()
			.zip(urls)
			.map(|(slot, url)| {
				slot.unwrap_or_else(|| Err(CrawlError::Worker(format!("no result for {url}"))))
			})
			.collect()
	}

	/// Breadth-first crawl from `start`, following links the filter allows.
	pub async fn crawl_iterative(
		&self,
		start: &str,
		options: IterativeOptions,
	) -> Vec<CrawlResultOf<CrawlResult>> {
		let start = match parse_target(start) {
			Ok(url) => url,
			Err(err) => return vec![Err(err)],
		};
		let filter = options
			.filter
			.unwrap_or_else(|| LinkFilter::same_domain(&start));

		let mut queue = VecDeque::from([(start.clone(), 0usize)]);
		let mut visited = HashSet::from([start.to_string()]);
		let mut results = Vec::new();

		while let Some((url, depth)) = queue.pop_front() {
			if results.len() >= options.max_urls {
				break;
			}
			if !results.is_empty() && !self.pause(self.human_delay(), &self.cancel).await {
				results.push(Err(CrawlError::Cancelled(url.to_string())));
				break;
			}

			let result = self.crawl(url.as_str()).await;
			if let Ok(page) = &result
				&& !page.blocked
				&& depth < options.max_depth
				&& is_html(page)
			{
				for link in self.links.extract_links(&page.text(), &page.final_url) {
					if filter.allows(&link) && visited.insert(link.to_string()) {
						queue.push_back((link, depth + 1));
					}
				}
			}
			results.push(result);
		}

		results
	}

	pub async fn stats(&self) -> CrawlerStats {
		let inner = self.inner.lock().await;
		CrawlerStats {
			session: inner.session.snapshot(),
			risk: self.risk.snapshot(),
			pattern: inner.behavior.current(),
			recent_transitions: inner.behavior.transitions().rev().take(10).cloned().collect(),
			history_len: self.history.len(),
			history_capacity: self.history.capacity(),
			failure_rate: self.history.failure_rate(self.config.failure_window),
			skipped_analyses: self.guard.skipped(),
			learner: inner.learner.summary(),
			proxies: inner.proxies.health_report(),
		}
	}

	/// Session reset and identity rotation checks run once per call.
	async fn begin_call(&self) {
		let now = Instant::now();
		let failure_rate = self.history.failure_rate(self.config.failure_window);
		let mut events = Vec::new();
		let reset = {
			let mut inner = self.inner.lock().await;
			if inner.session.needs_reset(now, self.config.reset_interval()) {
				inner.session.reset(now);
				inner.identity.refresh_identity();
				inner.proxies.rotate();
				events.push(CrawlEvent::SessionReset {
					session_id: inner.session.session_id.clone(),
				});
				true
			} else {
				let reason = if failure_rate > self.config.failure_rotation_threshold {
					Some(format!("failure rate {:.2}", failure_rate))
				} else if inner
					.session
					.rotation_due(now, self.config.fingerprint_rotation_interval())
				{
					Some("rotation interval elapsed".to_string())
				} else {
					None
				};
				if let Some(reason) = reason {
					let proxy = inner.rotate_identity(now);
					events.push(CrawlEvent::IdentityRotation(IdentityRotationEvent {
						reason,
						proxy,
						timestamp: Utc::now(),
					}));
				}
				false
			}
		};

		if reset {
			self.fetcher.reset().await;
			if let Some(browser) = &self.browser {
				browser.reset().await;
			}
		}
		for event in events {
			self.events.dispatch(event);
		}
	}

	async fn plan_attempt(&self, target: &Url, tier: FetchTier) -> AttemptPlan {
		let risk_state = self.risk.snapshot();
		let difficulty = target
			.host_str()
			.and_then(|host| self.history.host_block_rate(host, self.config.failure_window));

		let mut guard = self.inner.lock().await;
		let inner = &mut *guard;
		let timeout = inner.session.request_timeout;

		if tier == FetchTier::Browser {
			return AttemptPlan {
				tier,
				profile: None,
				headers: inner.identity.generate_identity(FingerprintIntensity::Advanced),
				proxies: inner.proxies.next_proxy().into_iter().collect(),
				timeout,
				learner: None,
			};
		}

		let observation = self.observe(&risk_state, inner.session.consecutive_failures);
		let state = inner.learner.encode_state(&observation);
		let action = inner.learner.select_action_with_rng(&mut inner.rng, state);

		let input = SynthesisInput {
			pattern: inner.behavior.current(),
			risk: &risk_state,
			target_difficulty: difficulty,
			target,
			warmup_pool: &self.warmup_pool,
			available_proxies: inner.proxies.proxy_count(),
			exploration_rate: inner.learner.exploration_rate(),
		};
		let profile = self.synthesizer.synthesize_with_rng(&mut inner.rng, &input);
		let adjustment = action.adjustment();
		let profile = self
			.synthesizer
			.adjust(&mut inner.rng, profile, &adjustment, &input);

		if adjustment.rotate_proxy {
			inner.proxies.rotate();
		}
		let proxies = match profile.proxy_policy {
			ProxyPolicy::None => Vec::new(),
			ProxyPolicy::Single => inner.proxies.next_proxy().into_iter().collect(),
			ProxyPolicy::Chain => {
				let len = inner.rng.gen_range(2..=3);
				inner.proxies.chain(len)
			}
		};
		let headers = inner.identity.generate_identity(profile.fingerprint_intensity);

		AttemptPlan {
			tier,
			profile: Some(profile),
			headers,
			proxies,
			timeout,
			learner: Some((state, action)),
		}
	}

	async fn run_warmups(
		&self,
		profile: &StrategyProfile,
		plan: &AttemptPlan,
		cancel: &CancellationToken,
	) -> CrawlResultOf<()> {
		for url in profile.warmups() {
			let request = FetchRequest::new(url.clone(), self.config.warmup_timeout())
				.with_headers(plan.headers.clone())
				.with_proxies(plan.proxies.clone());
			let outcome = tokio::select! {
				_ = cancel.cancelled() => return Err(CrawlError::Cancelled(url.to_string())),
				result = self.fetcher.fetch(&request) => result,
			};
			if let Err(err) = outcome {
				self.events.dispatch(CrawlEvent::WarmupFailed {
					url: url.clone(),
					error: err.to_string(),
				});
			}
			if !self.pause(profile.base_delay, cancel).await {
				return Err(CrawlError::Cancelled(url.to_string()));
			}
		}
		Ok(())
	}

	/// Records the attempt, then runs the guarded analysis: risk update,
	/// pattern evaluation and learner feedback.
	async fn conclude_attempt(
		&self,
		target: &Url,
		record: &AttemptRecord,
		signal: Option<BlockSignal>,
		plan: &AttemptPlan,
	) {
		self.history.append(record.clone());
		let success = record.is_success();
		let mut events = Vec::new();

		{
			let mut guard = self.inner.lock().await;
			let inner = &mut *guard;
			if success {
				inner.session.record_success();
			} else {
				inner.session.record_failure();
			}
			let streak = inner.session.success_streak;

			match self.guard.try_enter() {
				None => {
					inner.session.skipped_analyses += 1;
					events.push(CrawlEvent::AnalysisSkipped(AnalysisSkippedEvent {
						url: target.clone(),
						depth: self.guard.depth(),
						timestamp: Utc::now(),
					}));
				}
				Some(_permit) => {
					let risk = self.risk.update(record, signal, streak);
					let success_rate = self.history.success_rate(self.config.failure_window);

					if let Some(transition) = inner.behavior.evaluate(risk, success_rate) {
						events.push(CrawlEvent::PatternChanged(transition));
					}
					let threshold = self.config.shift_after_failures;
					if threshold > 0
						&& inner.session.consecutive_failures >= threshold
						&& inner.session.consecutive_failures % threshold == 0
					{
						let transition = inner.behavior.shift_pattern(&mut inner.rng, risk);
						events.push(CrawlEvent::PatternChanged(transition));
					}

					if let Some((state, action)) = plan.learner {
						let risk_state = self.risk.snapshot();
						let observation =
							self.observe(&risk_state, inner.session.consecutive_failures);
						let next_state = inner.learner.encode_state(&observation);
						let reward = inner.learner.reward(
							success,
							record.response_time_secs,
							risk_state.resource_pressure.overall(),
							streak,
						);
						inner.learner.learn(state, action, reward, next_state);
						inner
							.learner
							.update_strategy_performance(action.strategy_type(), success, reward);
						inner.learner.replay_if_due(&mut inner.rng);
						if !success {
							let adaptation = inner.learner.suggest_adaptation(&observation);
							if adaptation.top().is_some_and(|top| top.priority >= Priority::High) {
								events.push(CrawlEvent::Adaptation(adaptation));
							}
						}
					}
				}
			}

			for proxy in &plan.proxies {
				if success {
					inner.proxies.report_success(proxy);
				} else if signal.is_some() || record.status_code.is_some() {
					inner.proxies.report_failure(proxy);
				}
			}
		}

		self.events.dispatch(CrawlEvent::Outcome(OutcomeEvent {
			url: target.clone(),
			tier: record.tier,
			outcome: record.outcome,
			status: record.status_code,
			latency: secs(record.response_time_secs),
			risk: self.risk.risk(),
			detail: signal.map(|s| s.as_str().to_string()),
			timestamp: record.timestamp,
		}));
		for event in events {
			self.events.dispatch(event);
		}
	}

	async fn rotate_after_block(&self, plan: &AttemptPlan) {
		let proxy = {
			let mut inner = self.inner.lock().await;
			inner.rotate_identity(Instant::now())
		};
		self.events.dispatch(CrawlEvent::IdentityRotation(IdentityRotationEvent {
			reason: format!("blocked on the {} tier", plan.tier),
			proxy,
			timestamp: Utc::now(),
		}));
	}

	async fn recover_from_error(&self, kind: FetchErrorKind, plan: &AttemptPlan) {
		let mut inner = self.inner.lock().await;
		match kind {
			FetchErrorKind::Timeout => {
				let step = secs(self.config.backoff.timeout_step_secs);
				let raised = inner
					.session
					.raise_timeout(step, self.config.timeout_ceiling());
				log::info!("request timeout raised to {:?}", raised);
			}
			FetchErrorKind::Connection => {
				for proxy in &plan.proxies {
					inner.proxies.report_failure(proxy);
				}
				if let Some(proxy) = inner.proxies.rotate() {
					drop(inner);
					self.events.dispatch(CrawlEvent::IdentityRotation(IdentityRotationEvent {
						reason: "connection error".into(),
						proxy: Some(proxy),
						timestamp: Utc::now(),
					}));
				}
			}
			FetchErrorKind::Other => {}
		}
	}

	async fn backoff(
		&self,
		target: &Url,
		retries: u32,
		reason: String,
		cancel: &CancellationToken,
	) -> CrawlResultOf<()> {
		let jitter = random_unit() * self.config.backoff.max_jitter.max(0.0);
		let delay = self.config.backoff.delay_for(retries, jitter);
		self.mirror_retry_round(retries).await;
		self.events.dispatch(CrawlEvent::Retry(RetryEvent {
			url: target.clone(),
			retry_round: retries,
			reason,
			scheduled_after: delay,
			timestamp: Utc::now(),
		}));
		if self.pause(delay, cancel).await {
			Ok(())
		} else {
			Err(CrawlError::Cancelled(target.to_string()))
		}
	}

	async fn mirror_retry_round(&self, retries: u32) {
		self.inner.lock().await.session.retry_round = retries;
	}

	fn escalate(&self, target: &Url, reason: &str) {
		self.events.dispatch(CrawlEvent::Escalation(EscalationEvent {
			url: target.clone(),
			from: FetchTier::Http,
			to: FetchTier::Browser,
			reason: reason.to_string(),
			timestamp: Utc::now(),
		}));
	}

	/// Sleeps unless cancelled first. Returns `false` on cancellation.
	async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
		if cancel.is_cancelled() {
			return false;
		}
		if duration.is_zero() {
			return true;
		}
		tokio::select! {
			_ = cancel.cancelled() => false,
			_ = tokio::time::sleep(duration) => true,
		}
	}

	fn human_delay(&self) -> Duration {
		random_duration((self.config.min_delay_secs, self.config.max_delay_secs))
	}

	fn observe(&self, risk: &RiskState, consecutive_failures: u32) -> PerformanceObservation {
		let window = self.config.failure_window;
		let pattern = if consecutive_failures >= self.config.shift_after_failures.max(1)
			|| risk.detection_risk > 0.7
		{
			PerformancePattern::Blocked
		} else if risk.detection_risk > 0.4 {
			PerformancePattern::Suspicious
		} else {
			PerformancePattern::Normal
		};
		PerformanceObservation {
			success_rate: self.history.success_rate(window),
			avg_response_time: self
				.history
				.avg_response_time(window)
				.unwrap_or(risk.efficiency.avg_response_time),
			error_rate: self.history.error_rate(window),
			resource_pressure: risk.resource_pressure.overall(),
			pattern,
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn build_result(
		&self,
		target: &Url,
		response: FetchResponse,
		signal: Option<BlockSignal>,
		tier: FetchTier,
		attempts: u32,
		retries: u32,
		plan: &AttemptPlan,
	) -> CrawlResult {
		let mut metadata = json!({
			"risk": self.risk.risk(),
			"tier": tier,
			"proxies": plan.proxies.len(),
		});
		if let Some(profile) = &plan.profile {
			metadata["pattern"] = json!(profile.pattern);
			metadata["fingerprint_intensity"] = json!(profile.fingerprint_intensity);
			metadata["proxy_policy"] = json!(profile.proxy_policy);
			metadata["evasion_level"] = json!(profile.evasion_level);
			metadata["warmups"] = json!(profile.warmups().len());
			metadata["explored"] = json!(profile.explored);
		}
		if let Some((_, action)) = plan.learner {
			metadata["learner_action"] = json!(action);
		}
		if let Some(signal) = signal {
			metadata["block_signal"] = json!(signal);
		}

		CrawlResult {
			url: target.clone(),
			final_url: response.url,
			status: response.status,
			headers: response.headers,
			body: response.body,
			response_time: response.elapsed,
			blocked: signal.is_some(),
			block_signal: signal,
			tier,
			attempts,
			retries,
			metadata,
		}
	}
}

fn parse_target(raw: &str) -> CrawlResultOf<Url> {
	let url = Url::parse(raw.trim()).map_err(|err| CrawlError::InvalidUrl {
		url: raw.to_string(),
		reason: err.to_string(),
	})?;
	match url.scheme() {
		"http" | "https" if url.host_str().is_some() => Ok(url),
		scheme => Err(CrawlError::InvalidUrl {
			url: raw.to_string(),
			reason: format!("unsupported scheme {scheme:?} or missing host"),
		}),
	}
}

fn blocked_reason(signal: Option<BlockSignal>) -> String {
	match signal {
		Some(signal) => format!("blocked ({})", signal.as_str()),
		None => "blocked".to_string(),
	}
}

fn is_html(page: &CrawlResult) -> bool {
	page.headers
		.get(http::header::CONTENT_TYPE)
		.and_then(|value| value.to_str().ok())
		.is_none_or(|value| value.to_ascii_lowercase().contains("html"))
}

fn random_unit() -> f64 {
	rand::thread_rng().r#gen::<f64>()
}

fn random_duration((low, high): (f64, f64)) -> Duration {
	let value = if high > low {
		rand::thread_rng().gen_range(low..=high)
	} else {
		low
	};
	secs(value)
}
