pub mod helpers;
mod tests_concurrent;
mod tests_recovery;
mod tests_version;
mod tests_write_read;
