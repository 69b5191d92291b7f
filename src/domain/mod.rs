pub mod errors;
pub mod ids;
pub mod plan;
pub mod portfolio;
pub mod ports;
pub mod symbols;
pub mod types;
