pub mod config;
pub mod fetch;
pub mod gbfs;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod replicate;
pub mod sink;
