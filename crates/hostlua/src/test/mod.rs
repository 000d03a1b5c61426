pub mod test_exporter;
pub mod test_protocol;
