pub mod db;
pub mod review;
