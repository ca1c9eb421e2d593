//! # adaptive-crawler
//!
//! A risk-aware crawl orchestrator. Every request outcome feeds a detection
//! risk score, a behavior pattern controller and a small Q-learner, which in
//! turn shape the next request: pacing, warm-up chains, header identity,
//! proxy routing and whether to escalate to a heavier fetch tier.
//!
//! ## Features
//!
//! - Bounded retries with backoff, identity rotation and tier escalation
//! - Block classification from status codes, content signatures and challenge URLs
//! - Pattern switching (normal, careful, hurried, stealth) with cooldowns
//! - Sequential, concurrent and breadth-first batch crawling
//! - Pluggable fetchers, identities, proxies, detectors and link extraction
//!
//! ## Example
//!
//! ```no_run
//! use adaptive_crawler::AdaptiveCrawler;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let crawler = AdaptiveCrawler::builder().with_max_retry_rounds(2).build()?;
//!     let page = crawler.crawl("https://example.com").await?;
//!     println!("{} blocked={} ({} bytes)", page.status, page.blocked, page.body.len());
//!     Ok(())
//! }
//! ```

mod crawler;

pub mod config;
pub mod detection;
pub mod external_deps;
pub mod fetch;
pub mod modules;

pub use crate::crawler::{
	AdaptiveCrawler,
	AdaptiveCrawlerBuilder,
	CrawlError,
	CrawlResult,
	CrawlResultOf,
	CrawlerStats,
	IterativeOptions,
};

pub use crate::config::{BackoffConfig, CrawlerConfig, LearnerConfig};

pub use crate::detection::{BlockDetector, BlockSignal, BlockVerdict, DefaultBlockDetector};

pub use crate::external_deps::{
	FingerprintProvider,
	HeaderIdentityProvider,
	LinkExtractor,
	LinkFilter,
	ProxyProvider,
	ScraperLinkExtractor,
};

pub use crate::fetch::{
	FetchError,
	FetchErrorKind,
	FetchRequest,
	FetchResponse,
	FetchTier,
	Fetcher,
	ReqwestFetcher,
};

pub use crate::modules::{
	AnalysisGuard,
	BehaviorPattern,
	CrawlEvent,
	EventHandler,
	HistoryStore,
	ResourcePressure,
	ResourceSampler,
	RiskPerceptionModel,
	StrategyProfile,
};
