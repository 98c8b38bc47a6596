use force_stage::logging::{self, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn init_is_idempotent() {
    let config = TracingConfig::new(Level::ERROR).with_ansi(false);
    assert!(logging::init(config.clone()).is_ok());
    assert!(logging::init(config.with_format(OutputFormat::Json)).is_ok());
}
