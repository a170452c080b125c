pub mod client;
pub mod multi_tier;
pub mod types;

pub use client::FdcClient;
pub use multi_tier::search_multi_tier_comprehensive;
pub use types::{Candidate, FoodDetails, SearchFood};
