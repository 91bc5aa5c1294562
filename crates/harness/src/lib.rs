pub mod client;
pub mod db;

pub use client::TestClient;
pub use db::TestDb;
