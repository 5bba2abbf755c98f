pub mod api;
pub mod buffer_pool;
pub mod config;
pub mod errors;
pub mod mr_cache;
pub mod port;
pub mod registry;
pub mod ring;
pub mod rss;
pub mod rxq;
#[cfg(feature = "sim")]
pub mod sim;

pub use config::RxFlags;
pub use port::{PortState, RxPort};
pub use rxq::{RxQueue, RxStats};
