pub mod book;
pub mod config;
pub mod engine;
pub mod feed;
pub mod grid;
pub mod payout;
pub mod round;
pub mod selection;
pub mod settlement;
pub mod stats;
pub mod types;
