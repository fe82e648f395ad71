pub(crate) mod timer;

#[cfg(test)]
pub(crate) mod test_utils;
