pub mod apps;
pub mod catalog;
pub mod settings;
