mod tests_rebuild;
