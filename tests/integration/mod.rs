//! Integration tests for request admission, leasing and the chunked generation pipeline

mod cli_commands;
mod config_integration;
mod lease_contract;
mod pipeline_run;
