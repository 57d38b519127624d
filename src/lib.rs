pub mod api;
pub mod cli;
pub mod driver;
pub mod engine;
pub mod gates;
pub mod storage;
