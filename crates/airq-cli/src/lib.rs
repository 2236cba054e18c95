pub mod cache;
pub mod config;
pub mod error;
pub mod geo;
pub mod lineage;
pub mod model;
pub mod normalize;
pub mod pollutant;
pub mod providers;
pub mod service;
pub mod units;
