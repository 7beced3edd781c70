pub mod analyze;
pub mod health;
pub mod providers;
pub mod results;
pub mod route_files;
