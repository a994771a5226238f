//! Base architecture modules

pub mod attention;
pub mod config;
pub mod data;
pub mod encoders;
pub mod loss_utils;
pub mod metrics;
pub mod mlp;
pub mod train;
pub mod transformer;
