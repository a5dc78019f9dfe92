pub mod build;
pub mod config;
pub mod inspect;
pub mod run;
