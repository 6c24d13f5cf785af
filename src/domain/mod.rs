pub mod controller;
pub mod cursor;
pub mod extension;
pub mod imu;
pub mod models;
pub mod settings;
pub mod sys_config;
