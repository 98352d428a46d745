pub mod database;
pub mod kubernetes;
pub mod repositories;
pub mod storage;
