//! Shared configuration for the wiresteward server and agent.

pub mod config;
