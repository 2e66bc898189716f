pub mod bridge;
pub mod channel;
pub mod command_group;
pub mod config;
pub mod controller;
pub mod ctx;
pub mod declaration;
pub mod error;
pub mod ids;
pub mod jobscript;
pub mod key_val_fs;
pub mod load_config_file;
pub mod lockable_file;
pub mod resolver;
pub mod serde;
pub mod store;
pub mod template;
pub mod utillib;
pub mod variable;
