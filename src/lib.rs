pub mod api;
pub mod config;
pub mod db;
pub mod directory;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod types;

#[cfg(test)]
mod testutil;
