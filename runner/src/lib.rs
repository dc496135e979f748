pub mod config;
pub mod controller;
pub mod executors;
pub mod hooks;
pub mod ledger;
pub mod params;
pub mod partition;
pub mod runner;

#[cfg(test)]
mod partition_test;
