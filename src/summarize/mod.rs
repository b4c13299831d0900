pub mod audit;
pub mod checkpoint;
pub mod chunker;
pub mod config;
pub mod dispatcher;
pub mod job;
pub mod paths;
pub mod postprocess;
pub mod prompts;
pub mod provider;
pub mod rate_limit;
pub mod retry;
#[cfg(test)]
pub mod testing;
pub mod tokenizer;
pub mod usage;
pub mod util;
