mod attribute_value;
mod bucketing;
mod config;
mod context;
mod decision;
mod eval;
mod list_cache;
mod meg;
mod operand;
mod processing;
mod segment;
mod services;
mod settings;
mod store;
mod test_common;
mod util;

pub use attribute_value::*;
pub use bucketing::*;
pub use config::*;
pub use context::*;
pub use decision::*;
pub use eval::*;
pub use operand::*;
pub use processing::*;
pub use segment::*;
pub use services::*;
pub use settings::*;
pub use store::*;
