pub mod as_key;
pub mod key_val;
pub mod queue;
