mod tests_compare;
