pub mod job_info_repository;

pub use job_info_repository::{InMemoryJobInfoStore, MongoJobInfoRepository};
