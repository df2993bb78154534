pub mod cometbft;
