use crate::metrics;
pub use anyhow::Result;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::abi::{Abi, Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Canonical Multicall3 deployment, identical on every major EVM chain.
pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

/// Batched contract reads, as consumed by the extractor and the watchers.
#[async_trait]
pub trait BatchCaller: Send + Sync {
    /// Calls `method` of `abi` on `target` and returns the decoded output.
    /// A single return value is returned bare, several as a `Token::Tuple`.
    async fn call_value(
        &self,
        target: Address,
        abi: &Abi,
        method: &str,
        args: Vec<Token>,
    ) -> Result<Token>;

    fn chain_id(&self) -> u64;
}

/// Deterministic call failures: retrying the same call returns the same result.
/// Anything else coming out of a [`BatchCaller`] is a transport problem.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("call to {0:?} reverted")]
    Reverted(Address),
    #[error("{method} returned undecodable data: {reason}")]
    Undecodable { method: String, reason: String },
}

impl CallError {
    pub fn is_deterministic(err: &anyhow::Error) -> bool {
        err.downcast_ref::<CallError>().is_some()
    }
}

/// A single RPC call to be batched in a multicall.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Call {
    /// Target contract address
    pub target: Address,
    /// Encoded function call data
    pub call_data: Bytes,
}

/// Multicall batch executor for optimized RPC calls.
///
/// Batches multiple contract calls into a single `aggregate3` request to reduce
/// latency and RPC provider load. Every sub-call is sent with
/// `allowFailure = true`; the per-call success flag is returned alongside the
/// data so callers can tell a revert from an empty return.
///
/// ## Example
///
/// ```ignore
/// let multicall = Multicall::new(provider, multicall_address, 100);
/// let calls = vec![
///     Call { target: pool_address, call_data: token0_call },
///     // ... more calls
/// ];
/// let results = multicall.run(calls, None).await?;
/// ```
pub struct Multicall<M: Middleware> {
    pub provider: Arc<M>,
    multicall_address: Address,
    batch_size: usize,
    timeout_seconds: u64,
}

impl<M: Middleware> Clone for Multicall<M> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            multicall_address: self.multicall_address,
            batch_size: self.batch_size,
            timeout_seconds: self.timeout_seconds,
        }
    }
}

impl<M: Middleware + 'static> Multicall<M> {
    pub fn new(provider: Arc<M>, multicall_address: Address, batch_size: usize) -> Self {
        // Limit to 200 calls per batch, larger payloads get rejected by public RPC providers
        let validated_batch_size = batch_size.clamp(1, 200);

        if batch_size > 200 {
            log::warn!(
                "⚠️ Batch size {} exceeds recommended maximum (200), capping to 200",
                batch_size
            );
        }

        Self {
            provider,
            multicall_address,
            batch_size: validated_batch_size,
            timeout_seconds: 10,
        }
    }

    /// Set custom timeout for multicall operations
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Runs a batch of calls, optionally at a specific block.
    ///
    /// Results are `(success, return_data)` in the order of `calls`.
    pub async fn run(&self, calls: Vec<Call>, block: Option<BlockId>) -> Result<Vec<(bool, Bytes)>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        // Coalesce identical calls to reduce load
        let mut unique_calls = indexmap::IndexMap::new();
        let mut original_indices = vec![0; calls.len()];
        for (i, call) in calls.iter().enumerate() {
            let (index, _) = unique_calls.insert_full((call.target, call.call_data.clone()), ());
            original_indices[i] = index;
        }

        let unique_call_vec: Vec<_> = unique_calls
            .into_keys()
            .map(|(target, call_data)| Call { target, call_data })
            .collect();
        debug!(
            "Multicall coalesced {} calls into {}",
            calls.len(),
            unique_call_vec.len()
        );

        let mut all_results_unique: Vec<(bool, Bytes)> = Vec::with_capacity(unique_call_vec.len());

        for call_chunk in unique_call_vec.chunks(self.batch_size) {
            metrics::record_multicall_batch_size(call_chunk.len() as f64);
            let return_data = self.execute_multicall3(call_chunk, block).await?;
            if return_data.len() != call_chunk.len() {
                return Err(anyhow!(
                    "aggregate3 returned {} results for {} calls",
                    return_data.len(),
                    call_chunk.len()
                ));
            }
            all_results_unique.extend(return_data);
        }

        // Reconstruct the full result set in the original order
        let final_results = original_indices
            .into_iter()
            .map(|index| all_results_unique[index].clone())
            .collect();

        Ok(final_results)
    }

    async fn execute_multicall3(
        &self,
        calls: &[Call],
        block: Option<BlockId>,
    ) -> Result<Vec<(bool, Bytes)>> {
        // Call3 struct: (address target, bool allowFailure, bytes callData)
        let call_tokens = calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(true),
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect();

        let calldata = aggregate3_function().encode_input(&[Token::Array(call_tokens)])?;

        let tx_request = ethers::types::TransactionRequest::new()
            .to(self.multicall_address)
            .data(calldata);
        let typed_tx: ethers::types::transaction::eip2718::TypedTransaction = tx_request.into();

        let response = tokio::time::timeout(
            Duration::from_secs(self.timeout_seconds),
            self.provider.call(&typed_tx, block),
        )
        .await
        .map_err(|_| anyhow!("aggregate3 timed out after {}s", self.timeout_seconds))?
        .map_err(|e| anyhow!("aggregate3 call failed: {}", e))?;

        decode_aggregate3(&response)
    }
}

// function aggregate3(Call3[] calldata calls) public payable returns (Result[] memory returnData)
#[allow(deprecated)]
fn aggregate3_function() -> Function {
    Function {
        name: "aggregate3".to_string(),
        inputs: vec![Param {
            name: "calls".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Address,
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "returnData".to_string(),
            kind: aggregate3_result_type(),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::Payable,
    }
}

fn aggregate3_result_type() -> ParamType {
    // Result struct: (bool success, bytes returnData)
    ParamType::Array(Box::new(ParamType::Tuple(vec![
        ParamType::Bool,
        ParamType::Bytes,
    ])))
}

fn decode_aggregate3(response: &[u8]) -> Result<Vec<(bool, Bytes)>> {
    let decoded = ethers::abi::decode(&[aggregate3_result_type()], response)?;

    let results_array = decoded
        .into_iter()
        .next()
        .and_then(|t| t.into_array())
        .ok_or_else(|| anyhow!("Invalid multicall response format"))?;

    let mut return_data = Vec::with_capacity(results_array.len());
    for result_token in results_array {
        match result_token {
            Token::Tuple(tuple) => match tuple.as_slice() {
                [Token::Bool(success), Token::Bytes(data)] => {
                    return_data.push((*success, Bytes::from(data.clone())))
                }
                _ => return Err(anyhow!("Invalid multicall result tuple")),
            },
            _ => return Err(anyhow!("Invalid multicall result entry")),
        }
    }
    Ok(return_data)
}

/// Decodes a call's return data with its ABI function.
pub fn decode_output(function: &Function, data: &[u8]) -> Result<Token> {
    let mut tokens = function
        .decode_output(data)
        .map_err(|e| CallError::Undecodable {
            method: function.name.clone(),
            reason: e.to_string(),
        })?;
    if tokens.len() == 1 {
        Ok(tokens.remove(0))
    } else {
        Ok(Token::Tuple(tokens))
    }
}

struct QueuedCall {
    call: Call,
    reply: oneshot::Sender<Result<Bytes>>,
}

/// [`BatchCaller`] that gathers concurrent `call_value` requests into shared
/// Multicall3 batches.
///
/// A batch is flushed when it reaches the executor's batch size or when the
/// collection window since its first call has elapsed. Batches execute
/// concurrently; a reverted sub-call fails only its own request.
pub struct MultiCallAggregator {
    queue: mpsc::UnboundedSender<QueuedCall>,
    chain_id: u64,
}

impl MultiCallAggregator {
    /// Must be called inside a tokio runtime: spawns the collection loop.
    pub fn new<M: Middleware + 'static>(executor: Multicall<M>, chain_id: u64, window: Duration) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(collect_batches(executor, rx, window));
        Self { queue, chain_id }
    }

    async fn enqueue(&self, call: Call) -> Result<Bytes> {
        let target = call.target;
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(QueuedCall { call, reply })
            .map_err(|_| anyhow!("multicall aggregator stopped"))?;
        rx.await
            .map_err(|_| anyhow!("multicall batch dropped call to {:?}", target))?
    }
}

#[async_trait]
impl BatchCaller for MultiCallAggregator {
    async fn call_value(
        &self,
        target: Address,
        abi: &Abi,
        method: &str,
        args: Vec<Token>,
    ) -> Result<Token> {
        let function = abi
            .function(method)
            .with_context(|| format!("method {} not in ABI", method))?;
        let call_data = function.encode_input(&args)?;
        let raw = self
            .enqueue(Call {
                target,
                call_data: call_data.into(),
            })
            .await?;
        decode_output(function, &raw)
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

async fn collect_batches<M: Middleware + 'static>(
    executor: Multicall<M>,
    mut rx: mpsc::UnboundedReceiver<QueuedCall>,
    window: Duration,
) {
    let max_batch = executor.batch_size();
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        while batch.len() < max_batch {
            tokio::select! {
                _ = &mut deadline => break,
                next = rx.recv() => match next {
                    Some(call) => batch.push(call),
                    None => break,
                },
            }
        }

        let executor = executor.clone();
        tokio::spawn(async move {
            let calls = batch.iter().map(|q| q.call.clone()).collect();
            match executor.run(calls, None).await {
                Ok(results) => {
                    for (queued, (success, data)) in batch.into_iter().zip(results) {
                        let outcome = if success {
                            Ok(data)
                        } else {
                            Err(CallError::Reverted(queued.call.target).into())
                        };
                        let _ = queued.reply.send(outcome);
                    }
                }
                Err(e) => {
                    metrics::increment_multicall_failed();
                    warn!("⚠️ Multicall batch of {} calls failed: {}", batch.len(), e);
                    let reason = e.to_string();
                    for queued in batch {
                        let _ = queued.reply.send(Err(anyhow!("multicall failed: {}", reason)));
                    }
                }
            }
        });
    }
    debug!("Multicall aggregator queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ERC20_ABI;
    use ethers::abi::encode;

    #[test]
    fn test_decode_aggregate3_keeps_success_flags() {
        let response = encode(&[Token::Array(vec![
            Token::Tuple(vec![Token::Bool(true), Token::Bytes(vec![1, 2, 3])]),
            Token::Tuple(vec![Token::Bool(false), Token::Bytes(vec![])]),
        ])]);
        let decoded = decode_aggregate3(&response).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].0);
        assert_eq!(decoded[0].1, Bytes::from(vec![1u8, 2, 3]));
        assert!(!decoded[1].0);
    }

    #[test]
    fn test_single_output_is_returned_bare() {
        let decimals = ERC20_ABI.function("decimals").unwrap();
        let raw = encode(&[Token::Uint(U256::from(6u8))]);
        assert_eq!(decode_output(decimals, &raw).unwrap(), Token::Uint(U256::from(6u8)));
    }

    fn aggregate3_response(results: Vec<(bool, Vec<u8>)>) -> Bytes {
        encode(&[Token::Array(
            results
                .into_iter()
                .map(|(ok, data)| Token::Tuple(vec![Token::Bool(ok), Token::Bytes(data)]))
                .collect(),
        )])
        .into()
    }

    fn uint(value: u64) -> Vec<u8> {
        encode(&[Token::Uint(U256::from(value))])
    }

    #[tokio::test]
    async fn test_window_gathers_concurrent_calls_into_one_batch() {
        let (provider, mock) = Provider::mocked();
        // a second eth_call would find no response left and fail
        mock.push::<Bytes, _>(aggregate3_response(vec![(true, uint(6)), (false, vec![]), (true, uint(18))]))
            .unwrap();
        let executor = Multicall::new(Arc::new(provider), Address::random(), 100);
        let aggregator = MultiCallAggregator::new(executor, 1, Duration::from_millis(50));

        let (usdc, broken, weth) = (Address::random(), Address::random(), Address::random());
        let (a, b, c) = tokio::join!(
            aggregator.call_value(usdc, &ERC20_ABI, "decimals", vec![]),
            aggregator.call_value(broken, &ERC20_ABI, "decimals", vec![]),
            aggregator.call_value(weth, &ERC20_ABI, "decimals", vec![]),
        );

        assert_eq!(a.unwrap(), Token::Uint(U256::from(6u8)));
        assert_eq!(c.unwrap(), Token::Uint(U256::from(18u8)));
        let err = b.unwrap_err();
        assert!(CallError::is_deterministic(&err));
        assert!(matches!(err.downcast_ref::<CallError>(), Some(CallError::Reverted(t)) if *t == broken));
        assert_eq!(aggregator.chain_id(), 1);
    }

    #[tokio::test]
    async fn test_full_batch_flushes_before_window_ends() {
        let (provider, mock) = Provider::mocked();
        mock.push::<Bytes, _>(aggregate3_response(vec![(true, uint(6)), (true, uint(8))]))
            .unwrap();
        let executor = Multicall::new(Arc::new(provider), Address::random(), 2);
        let aggregator = MultiCallAggregator::new(executor, 1, Duration::from_secs(30));

        let both = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(
                aggregator.call_value(Address::random(), &ERC20_ABI, "decimals", vec![]),
                aggregator.call_value(Address::random(), &ERC20_ABI, "decimals", vec![]),
            )
        })
        .await
        .expect("batch flushed at size cap");
        assert_eq!(both.0.unwrap(), Token::Uint(U256::from(6u8)));
        assert_eq!(both.1.unwrap(), Token::Uint(U256::from(8u8)));
    }

    #[tokio::test]
    async fn test_failed_batch_is_a_transport_error() {
        // no response queued: the eth_call itself fails
        let (provider, _mock) = Provider::mocked();
        let executor = Multicall::new(Arc::new(provider), Address::random(), 100);
        let aggregator = MultiCallAggregator::new(executor, 1, Duration::from_millis(5));

        let err = aggregator
            .call_value(Address::random(), &ERC20_ABI, "decimals", vec![])
            .await
            .unwrap_err();
        assert!(!CallError::is_deterministic(&err));
    }

    #[test]
    fn test_empty_return_data_is_a_deterministic_error() {
        let decimals = ERC20_ABI.function("decimals").unwrap();
        let err = decode_output(decimals, &[]).unwrap_err();
        assert!(CallError::is_deterministic(&err));
        assert!(!CallError::is_deterministic(&anyhow!("connection reset")));
    }
}
