pub mod date_and_time;
