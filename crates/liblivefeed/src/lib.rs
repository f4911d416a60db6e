pub mod aggregator;
pub mod broker;
pub mod error;
pub mod identity;
pub mod poll;
pub mod registry;
pub mod tail;

pub use aggregator::UserAggregator;
pub use broker::{FeedBroker, Subscription};
pub use error::LiveFeedError;
pub use identity::{IdentityStore, SqliteIdentityStore, lookup_user};
pub use poll::{PollConfig, PollSource};
pub use registry::{PollAttachment, PollRegistry};
pub use tail::{FileTailSource, TailConfig};
