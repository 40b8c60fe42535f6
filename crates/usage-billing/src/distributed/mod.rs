pub mod subscription_lock;

pub use subscription_lock::{LockKey, SubscriptionGuard, SubscriptionLocks};
