mod helpers;
mod tests_control;
mod tests_split;
