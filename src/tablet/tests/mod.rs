mod helpers;
mod tests_cellkey;
mod tests_tablet;
