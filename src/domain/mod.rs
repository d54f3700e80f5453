mod active_order;
mod external;
mod paths;
mod preview;
mod records;
mod timestamps;
mod types;

pub use active_order::*;
pub use external::*;
pub use paths::*;
pub use preview::*;
pub use records::*;
pub use timestamps::*;
pub use types::*;
