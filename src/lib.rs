pub mod activity;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod headless;
pub mod identity;
pub mod model;
pub mod outcome;
pub mod reconcile;
pub mod scheduler;
pub mod trigger;
