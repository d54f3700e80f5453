mod claude;
mod config;
mod copilot;
mod jsonl;
mod opencode;
mod processes;
mod registry;

pub use claude::*;
pub use config::*;
pub use copilot::*;
pub use jsonl::*;
pub use opencode::*;
pub use processes::*;
pub use registry::*;
