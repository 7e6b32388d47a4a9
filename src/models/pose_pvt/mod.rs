pub mod config;
pub mod convert;
pub mod generate;
pub mod model;
pub mod weights;
