pub mod models;
pub mod redis_repository;
pub mod repositories;
