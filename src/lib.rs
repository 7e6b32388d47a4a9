pub mod exec;
pub mod models;
pub mod utils;
