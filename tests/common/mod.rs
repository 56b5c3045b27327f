//! Mock collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use ethers::abi::{Abi, Token};
use ethers::types::{Address, Log, U256, U64};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use v3_pool_extractor::factory::FactoryV3;
use v3_pool_extractor::log_filter::{LogDelivery, LogFilter};
use v3_pool_extractor::multicall::{BatchCaller, CallError};
use v3_pool_extractor::permanent_cache::PoolStore;
use v3_pool_extractor::pools::{PoolCacheRecord, PoolCode, TokenInfo};
use v3_pool_extractor::quality::{PoolSyncState, ProbeOutcome, StateProbe};
use v3_pool_extractor::types::conversions::{string_to_address, string_to_h256};
use v3_pool_extractor::{Collaborators, Orchestrator, OrchestratorConfig, PoolWatcher, WatcherFactory, WatcherParams};

pub const UNISWAP_FACTORY: &str = "0x1F98431c8aD98523631AE4a59f267346ea31F984";
pub const UNISWAP_INIT_CODE_HASH: &str = "0xe34f199b19b2b4f47f68442619d555527d244f78a3297ea89325f843f87b8b54";
/// USDC/WETH 0.3% on mainnet
pub const POOL_3000: &str = "0x8ad599c3A0ff1De082011EFDDc58f1908eb6e6D8";
/// USDC/WETH 0.05% on mainnet
pub const POOL_500: &str = "0x88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640";

pub fn addr(s: &str) -> Address {
    string_to_address(s).unwrap()
}

/// Token A (USDC) sorts before token B (WETH).
pub fn token_a() -> TokenInfo {
    TokenInfo::new(addr("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"), Some("USDC".into()), 6)
}

pub fn token_b() -> TokenInfo {
    TokenInfo::new(addr("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2"), Some("WETH".into()), 18)
}

/// Uniswap mainnet factory restricted to the 500 and 3000 fee tiers.
pub fn factory() -> FactoryV3 {
    FactoryV3::new(
        addr(UNISWAP_FACTORY),
        "UniswapV3",
        string_to_h256(UNISWAP_INIT_CODE_HASH).unwrap(),
    )
    .with_fee_spacing(BTreeMap::from([(500, 10), (3_000, 60)]))
}

pub fn log_at(address: Address, block: u64) -> Log {
    Log {
        address,
        block_number: Some(U64::from(block)),
        ..Default::default()
    }
}

#[derive(Clone)]
pub enum Reply {
    Value(Token),
    Revert,
    Offline,
}

/// Batch caller answering from a (target, method) script. Unscripted calls
/// behave like an unreachable node.
#[derive(Default)]
pub struct MockCaller {
    replies: Mutex<HashMap<(Address, String), Reply>>,
    calls: Mutex<Vec<(Address, String)>>,
}

impl MockCaller {
    pub fn reply(&self, target: Address, method: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert((target, method.to_string()), reply);
    }

    /// Scripts `pool` as a genuine pool of `factory`.
    pub fn pool(&self, pool: Address, factory: Address, token0: Address, token1: Address, fee: u32) {
        self.reply(pool, "factory", Reply::Value(Token::Address(factory)));
        self.reply(pool, "token0", Reply::Value(Token::Address(token0)));
        self.reply(pool, "token1", Reply::Value(Token::Address(token1)));
        self.reply(pool, "fee", Reply::Value(Token::Uint(U256::from(fee))));
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| m == method)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl BatchCaller for MockCaller {
    async fn call_value(&self, target: Address, _abi: &Abi, method: &str, _args: Vec<Token>) -> anyhow::Result<Token> {
        self.calls.lock().unwrap().push((target, method.to_string()));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&(target, method.to_string()))
            .cloned()
            .unwrap_or(Reply::Offline);
        match reply {
            Reply::Value(token) => Ok(token),
            Reply::Revert => Err(CallError::Reverted(target).into()),
            Reply::Offline => Err(anyhow::anyhow!("connection refused")),
        }
    }

    fn chain_id(&self) -> u64 {
        1
    }
}

/// Resolves only the tokens it was seeded with.
#[derive(Default)]
pub struct MockTokens {
    resolvable: Mutex<HashMap<Address, TokenInfo>>,
    known: Mutex<HashMap<Address, TokenInfo>>,
    cached: Mutex<Vec<TokenInfo>>,
    pub lookups: AtomicUsize,
}

impl MockTokens {
    pub fn with_resolvable(tokens: &[TokenInfo]) -> Self {
        let mock = Self::default();
        for t in tokens {
            mock.resolvable.lock().unwrap().insert(t.address, t.clone());
        }
        mock
    }

    /// Tokens that only become known through `add_cached_tokens`.
    pub fn with_cached(tokens: &[TokenInfo]) -> Self {
        let mock = Self::with_resolvable(tokens);
        *mock.cached.lock().unwrap() = tokens.to_vec();
        mock
    }
}

#[async_trait]
impl v3_pool_extractor::token_manager::TokenResolver for MockTokens {
    async fn find_token(&self, address: Address) -> anyhow::Result<Option<TokenInfo>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let Some(token) = self.resolvable.lock().unwrap().get(&address).cloned() else {
            return Ok(None);
        };
        self.known.lock().unwrap().insert(address, token.clone());
        Ok(Some(token))
    }

    fn get_known_token(&self, address: &Address) -> Option<TokenInfo> {
        self.known.lock().unwrap().get(address).cloned()
    }

    async fn add_cached_tokens(&self) -> anyhow::Result<usize> {
        let cached = self.cached.lock().unwrap().clone();
        let mut known = self.known.lock().unwrap();
        for t in &cached {
            known.insert(t.address, t.clone());
        }
        Ok(cached.len())
    }

    fn known_tokens(&self) -> usize {
        self.known.lock().unwrap().len()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub records: Mutex<Vec<PoolCacheRecord>>,
}

impl MemoryStore {
    pub fn with_records(records: Vec<PoolCacheRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn add(&self, record: PoolCacheRecord) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    async fn get_all_records(&self) -> anyhow::Result<Vec<PoolCacheRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct MockLogFilter {
    pub sinks: Mutex<Vec<mpsc::UnboundedSender<LogDelivery>>>,
}

impl LogFilter for MockLogFilter {
    fn add_filter(&self, _topics: Vec<ethers::types::H256>, sink: mpsc::UnboundedSender<LogDelivery>) {
        self.sinks.lock().unwrap().push(sink);
    }
}

/// Watcher that only counts what is asked of it.
pub struct CountingWatcher {
    pub address: Address,
    pub code: Option<PoolCode>,
    pub updates: AtomicUsize,
    pub logs: AtomicUsize,
    pub fail_logs: AtomicBool,
    updated: watch::Sender<bool>,
}

impl CountingWatcher {
    pub fn standalone(address: Address) -> Arc<Self> {
        let (updated, _) = watch::channel(false);
        Arc::new(Self {
            address,
            code: None,
            updates: AtomicUsize::new(0),
            logs: AtomicUsize::new(0),
            fail_logs: AtomicBool::new(false),
            updated,
        })
    }

    fn from_params(params: &WatcherParams) -> Arc<Self> {
        let (updated, _) = watch::channel(false);
        Arc::new(Self {
            address: params.address,
            code: Some(PoolCode {
                address: params.address,
                provider: params.provider.clone(),
                token0: params.token0.clone(),
                token1: params.token1.clone(),
                fee: params.fee,
                tick_spacing: params.tick_spacing,
                reserve0: U256::zero(),
                reserve1: U256::zero(),
            }),
            updates: AtomicUsize::new(0),
            logs: AtomicUsize::new(0),
            fail_logs: AtomicBool::new(false),
            updated,
        })
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolWatcher for CountingWatcher {
    fn address(&self) -> Address {
        self.address
    }

    async fn update_pool_state(&self) -> anyhow::Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.updated.send_replace(true);
        Ok(())
    }

    fn process_log(&self, _log: &Log) -> anyhow::Result<String> {
        self.logs.fetch_add(1, Ordering::SeqCst);
        if self.fail_logs.load(Ordering::SeqCst) {
            anyhow::bail!("undecodable log");
        }
        Ok("Swap".to_string())
    }

    fn pool_code(&self) -> Option<PoolCode> {
        self.code.clone()
    }

    fn is_stable(&self) -> bool {
        self.code.as_ref().map(|c| c.fee == 500).unwrap_or(false)
    }

    async fn first_update(&self) {
        let mut rx = self.updated.subscribe();
        let _ = rx.wait_for(|updated| *updated).await;
    }
}

#[derive(Default)]
pub struct MockWatchers {
    pub created: Mutex<Vec<Arc<CountingWatcher>>>,
}

impl MockWatchers {
    pub fn created_for(&self, address: Address) -> Vec<Arc<CountingWatcher>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.address == address)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl WatcherFactory for MockWatchers {
    fn create(&self, params: WatcherParams) -> Arc<dyn PoolWatcher> {
        let watcher = CountingWatcher::from_params(&params);
        self.created.lock().unwrap().push(watcher.clone());
        watcher
    }
}

/// Watcher factory that looks at the registry while building each watcher.
#[derive(Default)]
pub struct RegistryReadingWatchers {
    orchestrator: Mutex<Option<Weak<Orchestrator>>>,
    pub seen: Mutex<Vec<usize>>,
}

impl RegistryReadingWatchers {
    pub fn attach(&self, orchestrator: &Arc<Orchestrator>) {
        *self.orchestrator.lock().unwrap() = Some(Arc::downgrade(orchestrator));
    }
}

impl WatcherFactory for RegistryReadingWatchers {
    fn create(&self, params: WatcherParams) -> Arc<dyn PoolWatcher> {
        let orchestrator = self.orchestrator.lock().unwrap().clone();
        if let Some(orchestrator) = orchestrator.and_then(|w| w.upgrade()) {
            let codes = orchestrator.get_current_pool_codes();
            self.seen.lock().unwrap().push(codes.len());
        }
        CountingWatcher::from_params(&params)
    }
}

pub fn orchestrator_with_watchers(
    caller: Arc<MockCaller>,
    tokens: Arc<dyn v3_pool_extractor::token_manager::TokenResolver>,
    watchers: Arc<dyn WatcherFactory>,
) -> Arc<Orchestrator> {
    build_orchestrator(caller, tokens, watchers, Duration::from_secs(3600))
}

/// Orchestrator over the given caller and resolver, with a short transient
/// cooldown so retries can be observed.
pub fn orchestrator_over(
    caller: Arc<MockCaller>,
    tokens: Arc<dyn v3_pool_extractor::token_manager::TokenResolver>,
    transient_retry: Duration,
) -> (Arc<Orchestrator>, Arc<MockWatchers>) {
    let watchers = Arc::new(MockWatchers::default());
    let orchestrator = build_orchestrator(caller, tokens, watchers.clone(), transient_retry);
    (orchestrator, watchers)
}

fn build_orchestrator(
    caller: Arc<MockCaller>,
    tokens: Arc<dyn v3_pool_extractor::token_manager::TokenResolver>,
    watchers: Arc<dyn WatcherFactory>,
    transient_retry: Duration,
) -> Arc<Orchestrator> {
    Orchestrator::new(
        vec![factory()],
        OrchestratorConfig {
            tick_helper: Address::random(),
            quality_check_concurrency: 4,
            quality_check_interval: Duration::from_secs(3600),
            transient_retry,
        },
        Collaborators {
            client: caller,
            tokens,
            store: Arc::new(MemoryStore::default()),
            watchers,
            probe: Arc::new(AlwaysMatch),
        },
        &MockLogFilter::default(),
    )
}

pub struct AlwaysMatch;

#[async_trait]
impl StateProbe for AlwaysMatch {
    async fn check(&self, _watcher: Arc<dyn PoolWatcher>) -> anyhow::Result<ProbeOutcome> {
        Ok(ProbeOutcome {
            status: PoolSyncState::Match,
            replacement: None,
        })
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub caller: Arc<MockCaller>,
    pub tokens: Arc<MockTokens>,
    pub store: Arc<MemoryStore>,
    pub watchers: Arc<MockWatchers>,
    pub log_filter: MockLogFilter,
}

pub fn harness_with(tokens: MockTokens, store: MemoryStore) -> Harness {
    let caller = Arc::new(MockCaller::default());
    let tokens = Arc::new(tokens);
    let store = Arc::new(store);
    let watchers = Arc::new(MockWatchers::default());
    let log_filter = MockLogFilter::default();

    let orchestrator = Orchestrator::new(
        vec![factory()],
        OrchestratorConfig {
            tick_helper: Address::random(),
            quality_check_concurrency: 4,
            quality_check_interval: Duration::from_secs(3600),
            transient_retry: Duration::from_secs(3600),
        },
        Collaborators {
            client: caller.clone(),
            tokens: tokens.clone(),
            store: store.clone(),
            watchers: watchers.clone(),
            probe: Arc::new(AlwaysMatch),
        },
        &log_filter,
    );

    Harness {
        orchestrator,
        caller,
        tokens,
        store,
        watchers,
        log_filter,
    }
}

pub fn harness() -> Harness {
    harness_with(MockTokens::with_resolvable(&[token_a(), token_b()]), MemoryStore::default())
}

/// Polls `condition` for up to a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}
