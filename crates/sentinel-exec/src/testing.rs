//! In-memory collaborators and a wired-up engine for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use sentinel_core::breaker::{BreakerConfig, BreakerRegistry};
use sentinel_core::config::{FeedConfig, SchedulerConfig};
use sentinel_core::health::{ChannelHealthSink, HealthEvent};
use sentinel_core::store::MemoryStore;
use sentinel_core::types::{FeedKey, OrderSpec, Settlement, TradeAction};
use sentinel_feed::transport::{FeedReaderBox, FeedWriterBox};
use sentinel_feed::{FeedReader, FeedTransport, FeedWriter, Frame, PriceFeedSupervisor};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::context::{Engine, EngineContext};
use crate::event::{ExecEvent, ExecEventReceiver};
use crate::{Broker, PriceQuote, TradeRequest, Wallets};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MockBroker {
    requests: Mutex<Vec<TradeRequest>>,
    fail_all: AtomicBool,
    failing_tokens: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockBroker {
    pub fn requests(&self) -> Vec<TradeRequest> {
        lock(&self.requests).clone()
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn fail_token(&self, token: &str) {
        lock(&self.failing_tokens).push(token.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn execute_trade(&self, request: &TradeRequest) -> Result<Settlement> {
        let n = {
            let mut requests = lock(&self.requests);
            requests.push(request.clone());
            requests.len()
        };
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_all.load(Ordering::SeqCst) || lock(&self.failing_tokens).contains(&request.token_address) {
            bail!("broker rejected trade #{n}");
        }
        Ok(Settlement {
            tx_hash: format!("0xtx{n}"),
            price: request.options.expected_price.unwrap_or_default(),
            gas_cost: 0.001,
        })
    }
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

pub(crate) struct MockQuotes {
    price: Mutex<f64>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl Default for MockQuotes {
    fn default() -> Self {
        Self { price: Mutex::new(1.0), fail: AtomicBool::new(false), calls: AtomicUsize::new(0) }
    }
}

impl MockQuotes {
    pub fn set_price(&self, price: f64) {
        *lock(&self.price) = price;
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceQuote for MockQuotes {
    async fn current_price(&self, _network: &str, _token_address: &str) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("quote service down");
        }
        Ok(*lock(&self.price))
    }
}

// ---------------------------------------------------------------------------
// Wallets
// ---------------------------------------------------------------------------

pub(crate) struct MockWallets {
    balance: Mutex<f64>,
    approve: AtomicBool,
    fail_balance: AtomicBool,
    approvals: Mutex<Vec<(String, String, f64)>>,
}

impl Default for MockWallets {
    fn default() -> Self {
        Self {
            balance: Mutex::new(0.0),
            approve: AtomicBool::new(true),
            fail_balance: AtomicBool::new(false),
            approvals: Mutex::new(Vec::new()),
        }
    }
}

impl MockWallets {
    pub fn set_balance(&self, balance: f64) {
        *lock(&self.balance) = balance;
    }

    pub fn set_approve(&self, approve: bool) {
        self.approve.store(approve, Ordering::SeqCst);
    }

    pub fn fail_balance(&self, fail: bool) {
        self.fail_balance.store(fail, Ordering::SeqCst);
    }

    pub fn approvals(&self) -> Vec<(String, String, f64)> {
        lock(&self.approvals).clone()
    }
}

#[async_trait]
impl Wallets for MockWallets {
    async fn balance(&self, _network: &str, _token_address: &str, _wallet_address: &str) -> Result<f64> {
        if self.fail_balance.load(Ordering::SeqCst) {
            return Err(anyhow!("rpc unavailable"));
        }
        Ok(*lock(&self.balance))
    }

    async fn check_and_request_approval(&self, token_address: &str, wallet_address: &str, amount: f64) -> Result<bool> {
        lock(&self.approvals).push((token_address.to_string(), wallet_address.to_string(), amount));
        Ok(self.approve.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

/// Accepts every connect unless told to refuse; tests push ticks into the
/// live session of a key.
#[derive(Default)]
pub(crate) struct MockFeed {
    sessions: Mutex<AHashMap<FeedKey, UnboundedSender<Frame>>>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl MockFeed {
    pub fn refuse_connects(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connect attempts so far, refused ones included.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The server closes the key's live session.
    pub fn close_session(&self, key: &FeedKey) {
        if let Some(tx) = self.live_session(key) {
            let _ = tx.send(Frame::Close(Some("going away".to_string())));
        }
    }

    fn live_session(&self, key: &FeedKey) -> Option<UnboundedSender<Frame>> {
        lock(&self.sessions).get(key).filter(|tx| !tx.is_closed()).cloned()
    }

    /// Send a tick on the key's connection, waiting for it to connect first.
    pub async fn push(&self, key: &FeedKey, price: f64) {
        let mut waited = 0;
        let session = loop {
            if let Some(tx) = self.live_session(key) {
                break tx;
            }
            assert!(waited < 10_000, "feed {key} never connected");
            waited += 1;
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        session
            .send(Frame::Text(format!(r#"{{"type":"price","price":{price}}}"#)))
            .unwrap();
    }
}

struct MockWriter(UnboundedSender<Frame>);
struct MockReader(UnboundedReceiver<Frame>);

#[async_trait]
impl FeedWriter for MockWriter {
    async fn send_text(&mut self, _text: String) -> Result<()> {
        Ok(())
    }

    /// The fake server answers every heartbeat.
    async fn send_ping(&mut self) -> Result<()> {
        let _ = self.0.send(Frame::Pong);
        Ok(())
    }

    async fn send_pong(&mut self, _payload: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FeedReader for MockReader {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.0.recv().await.map(Ok)
    }
}

#[async_trait]
impl FeedTransport for MockFeed {
    async fn connect(&self, key: &FeedKey) -> Result<(FeedWriterBox, FeedReaderBox)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.sessions).insert(key.clone(), tx.clone());
        Ok((Box::new(MockWriter(tx)), Box::new(MockReader(rx))))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub(crate) fn standard_spec() -> OrderSpec {
    OrderSpec::standard("u1", "wallet1", "solana", "TokenA", TradeAction::Buy, 10.0)
}

pub(crate) fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        coalesce_window: Duration::from_secs(1),
        execution_retries: 3,
        retry_backoff: Duration::from_millis(10),
    }
}

pub(crate) struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MockBroker>,
    pub quotes: Arc<MockQuotes>,
    pub wallets: Arc<MockWallets>,
    pub feed: Arc<MockFeed>,
    pub events: ExecEventReceiver,
    pub health: UnboundedReceiver<HealthEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let (sink, health) = ChannelHealthSink::new();
        let sink = Arc::new(sink);
        let broker = Arc::new(MockBroker::default());
        let quotes = Arc::new(MockQuotes::default());
        let wallets = Arc::new(MockWallets::default());
        let feed = Arc::new(MockFeed::default());
        let (events_tx, events) = mpsc::unbounded_channel();

        let ctx = EngineContext {
            store: store.clone(),
            breakers: Arc::new(BreakerRegistry::new(BreakerConfig::default(), sink.clone())),
            feeds: PriceFeedSupervisor::new(FeedConfig::default(), feed.clone(), sink),
            broker: broker.clone(),
            quotes: quotes.clone(),
            wallets: wallets.clone(),
            events: events_tx,
        };
        Self {
            engine: Engine::new(ctx, scheduler_config()),
            store,
            broker,
            quotes,
            wallets,
            feed,
            events,
            health,
        }
    }

    /// Fail calls through `name` until its breaker opens.
    pub async fn trip_breaker(&self, name: &str) {
        let breakers = &self.engine.context().breakers;
        let threshold = breakers.breaker(name).config().failure_threshold;
        for _ in 0..threshold {
            let _ = breakers.run(name, || async { Err::<(), _>(anyhow!("injected outage")) }).await;
        }
        assert!(breakers.retry_after(name).is_some(), "breaker {name} did not open");
    }

    /// Skip health events until the supervisor gives up on `key`.
    pub async fn wait_unreachable(&mut self, key: &FeedKey) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(3_600), self.health.recv())
                .await
                .expect("timed out waiting for a health event")
                .expect("health channel closed");
            if matches!(&event, HealthEvent::FeedUnreachable { key: k, .. } if *k == key.to_string()) {
                return;
            }
        }
    }

    pub async fn next_event(&mut self) -> ExecEvent {
        tokio::time::timeout(Duration::from_secs(3_600 * 24), self.events.recv())
            .await
            .expect("timed out waiting for an engine event")
            .expect("event channel closed")
    }

    /// Skip events until one matches.
    pub async fn wait_for(&mut self, pred: impl Fn(&ExecEvent) -> bool) -> ExecEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }
}
