mod tests_local;
mod tests_throttle;
