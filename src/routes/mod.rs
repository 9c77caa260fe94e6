pub mod authorize;
pub mod pages;
pub mod token;
