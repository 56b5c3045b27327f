// Contracts Module - Public ABIs Only

pub mod erc20;
pub mod i_uniswap_v3_factory;
pub mod i_uniswap_v3_pool;

pub use erc20::ERC20_ABI;
pub use i_uniswap_v3_factory::IUNISWAPV3FACTORY_ABI;
pub use i_uniswap_v3_pool::{uni_v3_event_topics, IUNISWAPV3POOL_ABI};
