pub mod log_dir;
