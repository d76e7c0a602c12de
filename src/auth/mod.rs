pub mod jwt;

pub use jwt::verify_jwt;

#[cfg(test)]
pub use jwt::create_jwt;
