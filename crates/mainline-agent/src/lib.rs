pub mod claude;
pub mod executor;
pub mod models;
pub mod stream;
pub mod tools;
