pub mod import_repo;
pub mod subscriber_repo;

pub use import_repo::ImportRepository;
pub use subscriber_repo::SubscriberRepository;
