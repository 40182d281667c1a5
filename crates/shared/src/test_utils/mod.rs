pub mod helpers;
pub mod repository;
