use ethers::contract::EthEvent;
use ethers::prelude::*;

// ═══════════════════════════════════════════════════════════════════════════
// UNISWAP V3 POOL ABI - immutables + the events a watcher consumes
// ═══════════════════════════════════════════════════════════════════════════
//
// Types follow the Solidity contract exactly:
// - uint24 for fee, int24 for tick / tickSpacing
// - uint160 for sqrtPriceX96, uint128 for liquidity
//
// A wrong width decodes silently into garbage, so keep them in sync.
// ═══════════════════════════════════════════════════════════════════════════

abigen!(
    IUniswapV3Pool,
    r#"[
        function factory() external view returns (address)
        function token0() external view returns (address)
        function token1() external view returns (address)
        function fee() external view returns (uint24)
        function tickSpacing() external view returns (int24)
        event Initialize(uint160 sqrtPriceX96, int24 tick)
        event Mint(address sender, address indexed owner, int24 indexed tickLower, int24 indexed tickUpper, uint128 amount, uint256 amount0, uint256 amount1)
        event Burn(address indexed owner, int24 indexed tickLower, int24 indexed tickUpper, uint128 amount, uint256 amount0, uint256 amount1)
        event Collect(address indexed owner, address recipient, int24 indexed tickLower, int24 indexed tickUpper, uint128 amount0, uint128 amount1)
        event Swap(address indexed sender, address indexed recipient, int256 amount0, int256 amount1, uint160 sqrtPriceX96, uint128 liquidity, int24 tick)
        event Flash(address indexed sender, address indexed recipient, uint256 amount0, uint256 amount1, uint256 paid0, uint256 paid1)
    ]"#
);

/// topic0 of every pool event that can change reserves or ticks.
pub fn uni_v3_event_topics() -> Vec<H256> {
    vec![
        InitializeFilter::signature(),
        MintFilter::signature(),
        BurnFilter::signature(),
        CollectFilter::signature(),
        SwapFilter::signature(),
        FlashFilter::signature(),
    ]
}
