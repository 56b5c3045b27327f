use ethers::prelude::*;

// Pools are looked up with `getPool`; a zero address means not deployed.
abigen!(
    IUniswapV3Factory,
    r#"[
        function getPool(address tokenA, address tokenB, uint24 fee) external view returns (address pool)
    ]"#
);
