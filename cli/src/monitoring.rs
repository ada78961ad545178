use tracing_subscriber::EnvFilter;

pub fn init_logger() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
  tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
