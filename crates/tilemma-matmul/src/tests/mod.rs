mod dense;
mod faults;
mod test_utils;
