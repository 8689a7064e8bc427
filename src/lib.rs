pub mod clock;
pub mod config;
pub mod duration;
pub mod market_data;
