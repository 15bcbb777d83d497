pub mod allocation;
pub mod audit;
pub mod balance;
pub mod config;
pub mod lift;
pub mod power;
pub mod quality;
pub mod stats;
pub mod stratified;
