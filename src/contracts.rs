//! Solidity interfaces the scanner reads from.
//!
//! Defined with alloy's `sol!` macro. The scanner is read-only: only the
//! factory lookup and pair reserve views are ever called, via `eth_call`.

use alloy::sol;

sol! {
    #[sol(rpc)]
    interface IUniswapV2Factory {
        function getPair(address tokenA, address tokenB) external view returns (address pair);
    }
}

sol! {
    #[sol(rpc)]
    interface IUniswapV2Pair {
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
        function token0() external view returns (address);
        function token1() external view returns (address);
    }
}
