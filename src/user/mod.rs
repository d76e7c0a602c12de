pub mod user_models;
pub mod user_repository;

pub use user_models::UserProfile;
pub use user_repository::{IdentityLookup, InMemoryUserDirectory, UserRepository};
