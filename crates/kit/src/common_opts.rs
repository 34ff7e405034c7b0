//! Common CLI options shared across commands

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_MEMORY_USER_STR: &str = "2G";

/// Memory size options
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct MemoryOpts {
    #[clap(
        long,
        default_value = DEFAULT_MEMORY_USER_STR,
        help = "Size of the VM memory (e.g. 256M, 2G, or plain number for MB)"
    )]
    pub memory: String,
}

impl Default for MemoryOpts {
    fn default() -> Self {
        Self {
            memory: DEFAULT_MEMORY_USER_STR.to_owned(),
        }
    }
}

impl fmt::Display for MemoryOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.memory)
    }
}
