//! Subscription sources: fetching, caching and parsing node lists

pub mod cache;
pub mod loader;
pub mod parse;

pub use cache::SubscriptionCache;
pub use loader::{NodeSource, SubscriptionLoader};
pub use parse::{parse_subscription, parse_uri, ParsedSubscription, SubscriptionFormat};
